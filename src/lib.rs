//! Out-of-process engine worker.
//!
//! The engine runs in its own process and talks to clients only through four
//! message channels (input, output, health, handshake). A crash, OOM kill or a
//! wedged GPU inside the worker never takes a client process down with it.

pub mod config;
pub mod engine;
pub mod error;
pub mod input_mapper;
pub mod logger;
pub mod worker;

pub use mq_engine_types as types;
