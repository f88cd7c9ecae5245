//! Worker process entry point.
//!
//! Runs as a child process spawned by a supervisor. Binds the four channels
//! under the configured base path, answers the startup handshake and then
//! runs the engine loop until a fatal error or a termination signal.
//! All log output goes to stderr (inherited by the parent).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::info;

use super::channels::ChannelSet;
use super::engine_loop::{EngineLoop, LoopExit};
use crate::config::{EngineConfig, EngineKind, WorkerConfig};
use crate::engine::{EchoEngine, Engine, ProcessorRegistry};
use crate::error::WorkerError;

/// Longest time a blocking wait runs before the shutdown flag is rechecked.
pub const SHUTDOWN_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Set from the SIGTERM/SIGINT handler.
static SIGNALLED: AtomicBool = AtomicBool::new(false);

#[cfg(not(windows))]
extern "C" fn signal_handler(_sig: libc::c_int) {
    SIGNALLED.store(true, Ordering::SeqCst);
}

/// Route SIGTERM and SIGINT to [`ShutdownSignal::process`].
#[cfg(not(windows))]
pub fn install_signal_handlers() {
    // SAFETY: the handler only stores to an atomic.
    unsafe {
        libc::signal(
            libc::SIGTERM,
            signal_handler as *const () as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGINT,
            signal_handler as *const () as libc::sighandler_t,
        );
    }
}

#[cfg(windows)]
pub fn install_signal_handlers() {}

/// Graceful-shutdown request observed by the handshake and the engine loop.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    requested: Arc<AtomicBool>,
    watch_process: bool,
}

impl ShutdownSignal {
    /// A signal that only fires through [`ShutdownSignal::trigger`].
    pub fn new() -> Self {
        Self {
            requested: Arc::new(AtomicBool::new(false)),
            watch_process: false,
        }
    }

    /// Also fires when the process receives SIGTERM or SIGINT.
    pub fn process() -> Self {
        Self {
            requested: Arc::new(AtomicBool::new(false)),
            watch_process: true,
        }
    }

    pub fn trigger(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
            || (self.watch_process && SIGNALLED.load(Ordering::SeqCst))
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Engine named by the config.
pub fn build_engine(config: &EngineConfig) -> Box<dyn Engine> {
    match config.kind {
        EngineKind::Echo => Box::new(
            EchoEngine::new()
                .with_sub_batch_size(config.sub_batch_size)
                .with_tracing(config.tracing_enabled),
        ),
    }
}

#[cfg(unix)]
fn bind_channels(base: &str) -> Result<ChannelSet, WorkerError> {
    Ok(ChannelSet::bind(base)?)
}

#[cfg(not(unix))]
fn bind_channels(base: &str) -> Result<ChannelSet, WorkerError> {
    Err(WorkerError::Transport(super::channels::TransportError::io(
        format!("bind {base}"),
        std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "unix domain sockets are not available on this platform",
        ),
    )))
}

/// Run the worker process until shutdown or a fatal error.
pub fn run_worker<E: Engine>(
    config: &WorkerConfig,
    engine: E,
    shutdown: ShutdownSignal,
) -> Result<LoopExit, WorkerError> {
    info!(
        "Starting engine worker process (pid={}, ipc_path={})",
        std::process::id(),
        config.ipc_path
    );
    let channels = bind_channels(&config.ipc_path)?;

    let registry = Arc::new(ProcessorRegistry::with_builtins());
    EngineLoop::new(engine, channels, config, registry, shutdown).start()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_trigger_is_shared_by_clones() {
        let signal = ShutdownSignal::new();
        let clone = signal.clone();
        assert!(!clone.is_set());
        signal.trigger();
        assert!(clone.is_set());
    }

    #[test]
    fn test_build_engine_applies_engine_config() {
        let engine = build_engine(&EngineConfig {
            kind: EngineKind::Echo,
            sub_batch_size: 4,
            tracing_enabled: true,
        });
        assert!(engine.is_tracing_enabled());
        assert!(!engine.has_unfinished_requests());
    }
}
