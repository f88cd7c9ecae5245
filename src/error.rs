//! Error types shared by the worker components.

use mq_engine_types::{ErrorCause, ErrorKind};
use thiserror::Error;

use crate::engine::EngineError;
use crate::worker::channels::TransportError;

/// Errors that unwind the engine loop.
///
/// Anything that escapes a component as a `WorkerError` is fatal: it is
/// recorded in the sticky error state, broadcast on the health channel and
/// returned to the caller of the loop so the process can exit and be restarted.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("engine failure: {0}")]
    Engine(#[from] EngineError),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
}

impl WorkerError {
    /// Serializable form sent to clients in `Error`/`HealthError` frames.
    pub fn cause(&self) -> ErrorCause {
        match self {
            WorkerError::Engine(e) => e.cause(),
            WorkerError::Protocol(message) => ErrorCause::protocol(message.clone()),
            WorkerError::Transport(e) => ErrorCause::new(ErrorKind::Transport, e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cause_keeps_engine_kind_and_message() {
        let err = WorkerError::from(EngineError::new("step exploded"));
        let cause = err.cause();
        assert_eq!(cause.kind, ErrorKind::Engine);
        assert_eq!(cause.message, "step exploded");
    }

    #[test]
    fn test_protocol_cause() {
        let cause = WorkerError::Protocol("unknown request tag".into()).cause();
        assert_eq!(cause.kind, ErrorKind::Protocol);
        assert_eq!(cause.message, "unknown request tag");
    }
}
