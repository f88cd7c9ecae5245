//! Startup handshake on the data channel.
//!
//! ```text
//! AwaitQuery --IS_SERVER_READY--> AwaitQuery   (reply StartupCapabilities)
//! AwaitQuery --CLIENT_IS_READY--> Ready        (reply StartupAck, exit)
//! AwaitQuery --anything else----> AwaitQuery   (reply Error)
//! ```
//!
//! A bad query is answered with an error value and the handshake keeps
//! waiting; it never takes the worker down.

use log::{debug, warn};

use mq_engine_types::{ErrorCause, StartupQueryKind, WireRequest, WireResponse};

use super::channels::ChannelSet;
use super::worker_main::{ShutdownSignal, SHUTDOWN_CHECK_INTERVAL};
use crate::engine::Engine;
use crate::error::WorkerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitQuery,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// The client confirmed it is ready; the engine loop may start.
    Ready,
    /// Shutdown was requested before the client became ready.
    Interrupted,
}

impl HandshakeState {
    /// Reply to one data-channel frame and the state to move to.
    pub fn on_frame(self, frame: &str, engine: &dyn Engine) -> (WireResponse, HandshakeState) {
        match decode_query(frame) {
            Ok(StartupQueryKind::IsServerReady) => (
                WireResponse::StartupCapabilities {
                    tracing_enabled: engine.is_tracing_enabled(),
                },
                HandshakeState::AwaitQuery,
            ),
            Ok(StartupQueryKind::ClientIsReady) => {
                (WireResponse::startup_ack(), HandshakeState::Ready)
            }
            Err(cause) => {
                warn!("Rejected startup frame: {cause}");
                (WireResponse::error(None, false, cause), self)
            }
        }
    }
}

fn decode_query(frame: &str) -> Result<StartupQueryKind, ErrorCause> {
    match serde_json::from_str::<WireRequest>(frame) {
        Ok(WireRequest::StartupQuery { kind }) => Ok(kind),
        Ok(other) => Err(ErrorCause::protocol(format!(
            "{} is not a startup query",
            other.kind()
        ))),
        Err(e) => Err(ErrorCause::protocol(format!(
            "undecodable startup frame: {e}"
        ))),
    }
}

/// Answer startup queries until a client reports it is ready.
pub fn run_startup_loop(
    channels: &ChannelSet,
    engine: &dyn Engine,
    shutdown: &ShutdownSignal,
) -> Result<HandshakeOutcome, WorkerError> {
    let mut state = HandshakeState::AwaitQuery;
    while state != HandshakeState::Ready {
        if shutdown.is_set() {
            return Ok(HandshakeOutcome::Interrupted);
        }
        let Some((identity, frame)) = channels.recv_data(SHUTDOWN_CHECK_INTERVAL)? else {
            continue;
        };

        let (reply, next) = state.on_frame(&frame, engine);
        if let Err(e) = channels.reply_data(&identity, &reply) {
            warn!("Could not answer startup query from {identity}: {e}");
        }
        state = next;
    }
    channels.close_data();
    debug!("Client is ready, leaving startup loop");
    Ok(HandshakeOutcome::Ready)
}
