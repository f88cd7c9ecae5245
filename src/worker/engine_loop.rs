//! The engine loop controller.
//!
//! One thread owns the engine and all four channels. While the engine has no
//! unfinished work the loop blocks on the input channel; otherwise every
//! iteration drains already-arrived input, runs one step and emits the step's
//! outputs (unless they were already emitted from inside the step).

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};

use mq_engine_types::{RequestOutput, WireResponse};

use super::channels::{ChannelSet, TransportError};
use super::dispatcher::Dispatcher;
use super::error_state::ErrorState;
use super::handshake::{run_startup_loop, HandshakeOutcome};
use super::step::{engine_step, OutputMode};
use super::worker_main::{ShutdownSignal, SHUTDOWN_CHECK_INTERVAL};
use crate::config::WorkerConfig;
use crate::engine::{Engine, ProcessorRegistry};
use crate::error::WorkerError;

/// Why the loop stopped without a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// Termination signal or an explicit shutdown request.
    Shutdown,
    /// Every input producer went away.
    InputClosed,
}

enum Wait {
    Ready,
    Shutdown,
    InputClosed,
}

pub struct EngineLoop<E: Engine> {
    engine: E,
    channels: ChannelSet,
    error_state: ErrorState,
    dispatcher: Dispatcher,
    mode: OutputMode,
    polling_timeout: Duration,
    log_stats: bool,
    shutdown: ShutdownSignal,
}

impl<E: Engine> EngineLoop<E> {
    pub fn new(
        engine: E,
        channels: ChannelSet,
        config: &WorkerConfig,
        registry: Arc<ProcessorRegistry>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            engine,
            channels,
            error_state: ErrorState::new(),
            dispatcher: Dispatcher::new(registry, config.log_requests),
            mode: config.output_mode(),
            polling_timeout: config.polling_timeout(),
            log_stats: config.log_stats,
            shutdown,
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn error_state(&self) -> &ErrorState {
        &self.error_state
    }

    pub fn output_mode(&self) -> OutputMode {
        self.mode
    }

    /// Handshake, then the engine loop. Channels are closed and the engine is
    /// dropped on every exit path.
    pub fn start(mut self) -> Result<LoopExit, WorkerError> {
        debug!("Starting startup loop.");
        let result = match run_startup_loop(&self.channels, &self.engine, &self.shutdown) {
            Ok(HandshakeOutcome::Ready) => {
                debug!("Starting engine loop.");
                self.run_engine_loop()
            }
            Ok(HandshakeOutcome::Interrupted) => Ok(LoopExit::Shutdown),
            Err(e) => Err(e),
        };

        match &result {
            Ok(exit) => info!("Engine loop stopped: {exit:?}"),
            Err(e) => error!("Engine loop failed: {e}"),
        }

        let EngineLoop {
            engine, channels, ..
        } = self;
        channels.close();
        drop(engine);
        debug!("Engine worker is shut down.");
        result
    }

    pub fn run_engine_loop(&mut self) -> Result<LoopExit, WorkerError> {
        loop {
            if self.shutdown.is_set() {
                debug!("Shutdown requested, leaving engine loop.");
                return Ok(LoopExit::Shutdown);
            }
            if !self.engine.has_unfinished_requests() {
                match self.wait_for_work()? {
                    Wait::Ready => {}
                    Wait::Shutdown => return Ok(LoopExit::Shutdown),
                    Wait::InputClosed => return Ok(LoopExit::InputClosed),
                }
            }
            self.run_iteration()?;
        }
    }

    /// One busy iteration: drain input, step once, emit.
    pub fn run_iteration(&mut self) -> Result<(), WorkerError> {
        self.dispatcher
            .handle_new_input(&mut self.engine, &mut self.channels, &self.error_state)?;

        let outputs = engine_step(
            &mut self.engine,
            &mut self.channels,
            &self.dispatcher,
            &self.error_state,
            self.mode,
        )?;

        // Overlap mode already sent everything from inside the step.
        if self.mode == OutputMode::EmitAfterStep {
            self.emit_outputs(outputs)?;
        }
        Ok(())
    }

    fn emit_outputs(&self, outputs: Vec<RequestOutput>) -> Result<(), WorkerError> {
        if outputs.is_empty() {
            return Ok(());
        }
        self.channels
            .send_output(&WireResponse::Outputs { outputs })
            .map_err(|e| self.fatal(e.into()))
    }

    /// Record and broadcast a fatal error raised outside the dispatcher and step wrapper.
    fn fatal(&self, err: WorkerError) -> WorkerError {
        let cause = err.cause();
        if self.error_state.record(cause.clone()) {
            if let Err(e) = self.channels.send_health(&WireResponse::unhealthy(cause)) {
                warn!("Could not broadcast unhealthy status: {e}");
            }
        }
        err
    }

    /// Block until input arrives, polling the shutdown flag in between.
    ///
    /// Each full polling timeout without input is a stats tick, not an error.
    fn wait_for_work(&mut self) -> Result<Wait, WorkerError> {
        let mut waited = Duration::ZERO;
        loop {
            if self.shutdown.is_set() {
                return Ok(Wait::Shutdown);
            }
            let slice = SHUTDOWN_CHECK_INTERVAL.min(self.polling_timeout - waited);
            match self.channels.poll_input(slice) {
                Ok(true) => return Ok(Wait::Ready),
                Ok(false) => {}
                Err(TransportError::Closed(_)) => {
                    info!("Input channel disconnected, shutting down");
                    return Ok(Wait::InputClosed);
                }
                Err(e) => return Err(self.fatal(e.into())),
            }

            waited += slice;
            if waited >= self.polling_timeout {
                waited = Duration::ZERO;
                if self.log_stats {
                    self.engine.do_log_stats();
                }
                debug!("Waiting for new requests in engine loop.");
            }
        }
    }
}
