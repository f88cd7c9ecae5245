//! Decodes input frames and applies them to the engine.
//!
//! Per-request problems (a request the engine refuses, a failing health probe)
//! are answered to the caller and contained here. Anything that escapes
//! [`Dispatcher::handle_new_input`] is fatal: it is recorded in the error
//! state, broadcast on the health channel and returned to unwind the loop.

use std::sync::Arc;

use log::{debug, info, warn};

use mq_engine_types::{GenerateRequest, WireRequest, WireResponse};

use super::channels::ChannelSet;
use super::error_state::ErrorState;
use crate::engine::{Engine, EngineRequest, ProcessorRegistry};
use crate::error::WorkerError;

#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<ProcessorRegistry>,
    log_requests: bool,
}

impl Dispatcher {
    pub fn new(registry: Arc<ProcessorRegistry>, log_requests: bool) -> Self {
        Self {
            registry,
            log_requests,
        }
    }

    /// Handle every input frame that has already arrived.
    ///
    /// Frames arriving while draining wait for the next call, so this returns
    /// even under sustained load. Returns the number of frames handled.
    pub fn handle_new_input(
        &self,
        engine: &mut dyn Engine,
        channels: &mut ChannelSet,
        error_state: &ErrorState,
    ) -> Result<usize, WorkerError> {
        let result = self.drain(engine, channels, error_state);
        if let Err(ref err) = result {
            let cause = err.cause();
            error_state.record(cause.clone());
            if let Err(e) = channels.send_health(&WireResponse::unhealthy(cause)) {
                warn!("Could not broadcast unhealthy status: {e}");
            }
        }
        result
    }

    fn drain(
        &self,
        engine: &mut dyn Engine,
        channels: &mut ChannelSet,
        error_state: &ErrorState,
    ) -> Result<usize, WorkerError> {
        let budget = channels.pending_input();
        let mut handled = 0;
        while handled < budget {
            let Some(frame) = channels.try_recv_input() else {
                break;
            };
            let request = decode_request(&frame)?;
            self.dispatch(request, engine, channels, error_state)?;
            handled += 1;
        }
        Ok(handled)
    }

    fn dispatch(
        &self,
        request: WireRequest,
        engine: &mut dyn Engine,
        channels: &ChannelSet,
        error_state: &ErrorState,
    ) -> Result<(), WorkerError> {
        match request {
            WireRequest::Generate(generate) => {
                self.handle_generate(generate, engine, channels, error_state)
            }
            WireRequest::Abort { request_id } => {
                engine.abort_request(&request_id);
                if self.log_requests {
                    info!("Aborted request {request_id}.");
                }
                Ok(())
            }
            WireRequest::HealthCheck => handle_health(engine, channels, error_state),
            WireRequest::StartupQuery { kind } => Err(WorkerError::Protocol(format!(
                "startup query {kind:?} received on the input channel"
            ))),
        }
    }

    fn handle_generate(
        &self,
        generate: GenerateRequest,
        engine: &mut dyn Engine,
        channels: &ChannelSet,
        error_state: &ErrorState,
    ) -> Result<(), WorkerError> {
        let request_id = generate.request_id.clone();

        if error_state.is_errored() {
            let response =
                WireResponse::error(Some(request_id), true, error_state.dead_error());
            channels.send_output(&response)?;
            return Ok(());
        }

        let added = self
            .registry
            .resolve(&generate.sampling_params.logits_processors)
            .and_then(|processors| engine.add_request(EngineRequest::new(generate, processors)));

        match added {
            Ok(()) => {
                if self.log_requests {
                    info!("Added request {request_id}.");
                }
            }
            Err(e) => {
                // Not fatal: the request was bad, not the engine.
                debug!("Request {request_id} rejected: {e}");
                let response = WireResponse::error(
                    Some(request_id.clone()),
                    error_state.is_errored(),
                    e.cause(),
                );
                channels.send_output(&response)?;
                // The add may have left partial state behind.
                engine.abort_request(&request_id);
            }
        }
        Ok(())
    }
}

fn handle_health(
    engine: &dyn Engine,
    channels: &ChannelSet,
    error_state: &ErrorState,
) -> Result<(), WorkerError> {
    if let Some(cause) = error_state.captured() {
        channels.send_health(&WireResponse::unhealthy(cause.clone()))?;
        return Ok(());
    }
    let response = match engine.check_health() {
        Ok(()) => WireResponse::healthy(),
        Err(e) => {
            warn!("Health probe failed: {e}");
            WireResponse::unhealthy(e.cause())
        }
    };
    channels.send_health(&response)?;
    Ok(())
}

/// Undecodable frames mean the peer speaks a different protocol: fatal.
pub fn decode_request(frame: &str) -> Result<WireRequest, WorkerError> {
    serde_json::from_str(frame)
        .map_err(|e| WorkerError::Protocol(format!("unknown or malformed request: {e}")))
}
