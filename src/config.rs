//! Worker configuration.
//!
//! Values come from an optional JSON file and are then overridden by command
//! line flags, so a supervisor can ship one file and tweak single settings per
//! spawned worker.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use mq_engine_types::POLLING_TIMEOUT_MS;

use crate::worker::OutputMode;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// Which engine implementation the worker binary hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// Deterministic engine that streams the prompt back, one token per step.
    Echo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub kind: EngineKind,
    /// Outputs per sub-batch handed to the step output sink. 0 = whole step at once.
    pub sub_batch_size: usize,
    pub tracing_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: EngineKind::Echo,
            sub_batch_size: 0,
            tracing_enabled: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Base address; channel suffixes are appended to it.
    pub ipc_path: String,
    /// Interleave output emission and input draining with the engine step.
    pub overlap: bool,
    pub log_requests: bool,
    pub log_stats: bool,
    pub polling_timeout_ms: u64,
    pub log_file: Option<PathBuf>,
    /// Directory for a timestamped log file; ignored when `log_file` is set.
    pub log_dir: Option<PathBuf>,
    pub engine: EngineConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            ipc_path: std::env::temp_dir()
                .join("mq-engine")
                .to_string_lossy()
                .into_owned(),
            overlap: false,
            log_requests: true,
            log_stats: true,
            polling_timeout_ms: POLLING_TIMEOUT_MS,
            log_file: None,
            log_dir: None,
            engine: EngineConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: WorkerConfig =
            serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ipc_path.trim().is_empty() {
            return Err(ConfigError::Invalid("ipc_path must not be empty".into()));
        }
        if self.polling_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "polling_timeout_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn polling_timeout(&self) -> Duration {
        Duration::from_millis(self.polling_timeout_ms)
    }

    pub fn output_mode(&self) -> OutputMode {
        if self.overlap {
            OutputMode::EmitDuringStep
        } else {
            OutputMode::EmitAfterStep
        }
    }
}

/// Command line of the worker binary.
#[derive(Debug, Parser)]
#[command(name = "mq-engine-worker", about = "Out-of-process engine worker")]
pub struct WorkerArgs {
    /// JSON config file; flags below override its values.
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Base IPC path the four channels are bound under.
    #[arg(long)]
    pub ipc_path: Option<String>,
    /// Emit outputs and drain input while the engine step is running.
    #[arg(long)]
    pub overlap: bool,
    #[arg(long)]
    pub disable_log_requests: bool,
    #[arg(long)]
    pub disable_log_stats: bool,
    #[arg(long)]
    pub polling_timeout_ms: Option<u64>,
    /// Also write logs to this file.
    #[arg(long)]
    pub log_file: Option<PathBuf>,
    /// Also write logs to a new timestamped file in this directory.
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
    #[arg(long, value_enum)]
    pub engine: Option<EngineKind>,
    #[arg(long)]
    pub sub_batch_size: Option<usize>,
    #[arg(long)]
    pub enable_tracing: bool,
}

impl WorkerArgs {
    /// Build the effective config: file (if any), then flag overrides.
    pub fn resolve(&self) -> Result<WorkerConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => WorkerConfig::load(path)?,
            None => WorkerConfig::default(),
        };
        if let Some(ref ipc_path) = self.ipc_path {
            config.ipc_path = ipc_path.clone();
        }
        if self.overlap {
            config.overlap = true;
        }
        if self.disable_log_requests {
            config.log_requests = false;
        }
        if self.disable_log_stats {
            config.log_stats = false;
        }
        if let Some(timeout) = self.polling_timeout_ms {
            config.polling_timeout_ms = timeout;
        }
        if let Some(ref log_file) = self.log_file {
            config.log_file = Some(log_file.clone());
        }
        if let Some(ref log_dir) = self.log_dir {
            config.log_dir = Some(log_dir.clone());
        }
        if let Some(kind) = self.engine {
            config.engine.kind = kind;
        }
        if let Some(size) = self.sub_batch_size {
            config.engine.sub_batch_size = size;
        }
        if self.enable_tracing {
            config.engine.tracing_enabled = true;
        }
        config.validate()?;
        Ok(config)
    }
}
