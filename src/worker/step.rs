//! One engine step with fatal-error handling.

use log::{debug, warn};

use mq_engine_types::{RequestOutput, WireResponse};

use super::channels::ChannelSet;
use super::dispatcher::Dispatcher;
use super::error_state::ErrorState;
use super::overlap::OverlapSink;
use crate::engine::{Engine, EngineError, StepOutputSink};
use crate::error::WorkerError;

/// When the outputs of a step go out on the output channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Buffer the whole step; the loop emits once after it returns.
    EmitAfterStep,
    /// Emit every sub-batch from inside the step and drain input in between.
    EmitDuringStep,
}

#[derive(Default)]
struct CollectSink {
    outputs: Vec<RequestOutput>,
}

impl StepOutputSink for CollectSink {
    fn push(
        &mut self,
        _engine: &mut dyn Engine,
        mut outputs: Vec<RequestOutput>,
    ) -> Result<(), EngineError> {
        self.outputs.append(&mut outputs);
        Ok(())
    }
}

/// Run exactly one engine step.
///
/// In [`OutputMode::EmitDuringStep`] the outputs have already been sent when
/// this returns, so the returned batch is always empty.
///
/// A failed step is fatal: the cause is recorded, reported on the output
/// channel as an error without a request id and returned.
pub(crate) fn engine_step(
    engine: &mut dyn Engine,
    channels: &mut ChannelSet,
    dispatcher: &Dispatcher,
    error_state: &ErrorState,
    mode: OutputMode,
) -> Result<Vec<RequestOutput>, WorkerError> {
    let result = match mode {
        OutputMode::EmitAfterStep => {
            let mut sink = CollectSink::default();
            engine
                .step(&mut sink)
                .map(|()| sink.outputs)
                .map_err(WorkerError::from)
        }
        OutputMode::EmitDuringStep => {
            let mut sink = OverlapSink::new(channels, dispatcher, error_state);
            match engine.step(&mut sink) {
                // A sink failure is fatal even if the engine dropped it.
                Ok(()) => match sink.take_failure() {
                    Some(failure) => Err(failure),
                    None => {
                        debug!("Step emitted {} sub-batches", sink.emissions());
                        Ok(Vec::new())
                    }
                },
                Err(e) => Err(sink.take_failure().unwrap_or(WorkerError::Engine(e))),
            }
        }
    };

    result.map_err(|err| {
        let cause = err.cause();
        let first = error_state.record(cause.clone());
        if let Err(e) = channels.send_output(&WireResponse::error(None, true, cause.clone())) {
            warn!("Could not report step failure on the output channel: {e}");
        }
        if first {
            if let Err(e) = channels.send_health(&WireResponse::unhealthy(cause)) {
                warn!("Could not broadcast unhealthy status: {e}");
            }
        }
        err
    })
}
