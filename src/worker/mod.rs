//! Out-of-process engine worker.
//!
//! The engine runs in a separate child process for:
//! - Crash isolation: an engine crash doesn't take clients down
//! - Memory reclaim: kill the process to free everything it holds

pub mod channels;
pub mod dispatcher;
pub mod engine_loop;
pub mod error_state;
pub mod handshake;
mod overlap;
pub mod process_manager;
#[cfg(unix)]
mod socket;
pub mod step;
pub mod worker_bridge;
pub mod worker_main;

pub use channels::{ChannelSet, ClientChannels, DataConnection, TransportError};
pub use dispatcher::Dispatcher;
pub use engine_loop::{EngineLoop, LoopExit};
pub use error_state::ErrorState;
pub use process_manager::{ProcessManager, SpawnError, WorkerCommand};
pub use step::OutputMode;
pub use worker_bridge::{ClientError, EngineClient};
pub use worker_main::{
    build_engine, install_signal_handlers, run_worker, ShutdownSignal, SHUTDOWN_CHECK_INTERVAL,
};
