//! Sticky "first fatal error wins" cell.

use std::sync::{Arc, OnceLock};

use log::{error, warn};

use mq_engine_types::ErrorCause;

/// Records the first fatal error of the worker process. Never cleared.
///
/// Clones share the same cell, so a step-output callback running on another
/// thread observes the same captured cause as the loop.
#[derive(Debug, Clone, Default)]
pub struct ErrorState {
    captured: Arc<OnceLock<ErrorCause>>,
}

impl ErrorState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `cause` if nothing was recorded yet. Returns true for the first writer.
    pub fn record(&self, cause: ErrorCause) -> bool {
        match self.captured.set(cause) {
            Ok(()) => {
                if let Some(cause) = self.captured.get() {
                    error!("Engine errored: {cause}");
                }
                true
            }
            Err(later) => {
                warn!("Ignoring later fatal error, engine already errored: {later}");
                false
            }
        }
    }

    pub fn captured(&self) -> Option<&ErrorCause> {
        self.captured.get()
    }

    pub fn is_errored(&self) -> bool {
        self.captured.get().is_some()
    }

    /// Dead-engine cause wrapping the captured error, if any.
    pub fn dead_error(&self) -> ErrorCause {
        ErrorCause::dead_engine(self.captured())
    }
}
