//! Step output sink that overlaps IPC with the engine step.
//!
//! Every sub-batch the engine pushes is sent on the output channel right
//! away, then any input that arrived meanwhile is drained into the engine
//! before the step resumes.

use log::trace;

use mq_engine_types::{RequestOutput, WireResponse};

use super::channels::ChannelSet;
use super::dispatcher::Dispatcher;
use super::error_state::ErrorState;
use crate::engine::{Engine, EngineError, StepOutputSink};
use crate::error::WorkerError;

pub(crate) struct OverlapSink<'a> {
    channels: &'a mut ChannelSet,
    dispatcher: &'a Dispatcher,
    error_state: &'a ErrorState,
    /// The worker-level error behind the last `Err` returned to the engine.
    failure: Option<WorkerError>,
    emissions: usize,
}

impl<'a> OverlapSink<'a> {
    pub(crate) fn new(
        channels: &'a mut ChannelSet,
        dispatcher: &'a Dispatcher,
        error_state: &'a ErrorState,
    ) -> Self {
        Self {
            channels,
            dispatcher,
            error_state,
            failure: None,
            emissions: 0,
        }
    }

    pub(crate) fn emissions(&self) -> usize {
        self.emissions
    }

    pub(crate) fn take_failure(&mut self) -> Option<WorkerError> {
        self.failure.take()
    }

    fn fail(&mut self, err: WorkerError) -> EngineError {
        let engine_err = EngineError::from(err.cause());
        self.failure = Some(err);
        engine_err
    }
}

impl StepOutputSink for OverlapSink<'_> {
    fn push(
        &mut self,
        engine: &mut dyn Engine,
        outputs: Vec<RequestOutput>,
    ) -> Result<(), EngineError> {
        if !outputs.is_empty() {
            trace!("Emitting {} outputs mid-step", outputs.len());
            let response = WireResponse::Outputs { outputs };
            if let Err(e) = self.channels.send_output(&response) {
                return Err(self.fail(e.into()));
            }
            self.emissions += 1;
        }

        match self
            .dispatcher
            .handle_new_input(engine, self.channels, self.error_state)
        {
            Ok(_) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }
}
