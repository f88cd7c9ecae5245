use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, LevelFilter};

use mq_engine::config::WorkerArgs;
use mq_engine::logger::{log_file_for, setup_logging};
use mq_engine::worker::{build_engine, install_signal_handlers, run_worker, ShutdownSignal};

fn main() {
    if let Err(e) = run() {
        error!("Worker exiting after fatal error: {e:#}");
        eprintln!("[WORKER] fatal: {e:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = WorkerArgs::parse();
    let config = args.resolve().context("invalid worker configuration")?;

    let log_file = log_file_for(&config);
    setup_logging(log_file.as_deref(), LevelFilter::Info)
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {e}"))?;

    install_signal_handlers();

    let engine = build_engine(&config.engine);
    let exit = run_worker(&config, engine, ShutdownSignal::process())
        .context("engine worker terminated")?;
    info!("Worker exited cleanly ({exit:?})");
    Ok(())
}
