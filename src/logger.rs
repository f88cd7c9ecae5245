//! Logging setup for the worker process.
//!
//! Everything goes to stderr so a supervisor that inherits the worker's stderr
//! sees the logs; a file appender can be added on top.

use std::path::{Path, PathBuf};

use chrono::Local;
use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

use crate::config::WorkerConfig;

const LOG_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} - {l} - [WORKER] {m}{n}";

/// `<dir>/<YYYY-MM-DD-HH_MM>-<pid>.log`
pub fn timestamped_log_path(dir: &Path) -> PathBuf {
    let timestamp = Local::now().format("%Y-%m-%d-%H_%M").to_string();
    dir.join(format!("{timestamp}-{}.log", std::process::id()))
}

/// The file the worker should log to, if any.
pub fn log_file_for(config: &WorkerConfig) -> Option<PathBuf> {
    config
        .log_file
        .clone()
        .or_else(|| config.log_dir.as_deref().map(timestamped_log_path))
}

pub fn setup_logging(
    log_file: Option<&Path>,
    level: LevelFilter,
) -> Result<(), Box<dyn std::error::Error>> {
    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
        .build();

    let mut builder =
        Config::builder().appender(Appender::builder().build("stderr", Box::new(stderr)));
    let mut root = Root::builder().appender("stderr");

    if let Some(path) = log_file {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file_appender = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
            .build(path)?;
        builder = builder.appender(Appender::builder().build("file", Box::new(file_appender)));
        root = root.appender("file");
    }

    let config = builder.build(root.build(level))?;
    log4rs::init_config(config)?;

    Ok(())
}
