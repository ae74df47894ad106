//! # coapbench - Main Entry Point
//!
//! The binary runs in one of three modes:
//!
//! 1. **Local series** (default): one concurrency series against a target
//!    URI, with statistics written to the log and optionally to JSON.
//! 2. **Controller** (`--master`): listens for agents and reads operator
//!    commands from stdin.
//! 3. **Agent** (`--slave`): connects to a controller and executes its
//!    commands until told to exit.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use coapbench::{
    cli::{Args, Mode},
    control::agent::AgentSettings,
    logging,
    results::ResultsManager,
    utils, Agent, BenchmarkProcess, Controller, DeviceManager,
};
use tracing::{debug, info};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = logging::init(args.verbose, args.quiet, args.log_file.as_deref())?;

    args.validate()?;
    debug!("Configuration: {:?}", args);

    let process = BenchmarkProcess::new(args.process_settings())?;
    match args.mode() {
        Mode::Local => run_local(&args, process).await,
        Mode::Master => run_master(&args).await,
        Mode::Slave => run_slave(&args, process).await,
    }
}

/// Run the concurrency series of local mode and export the results.
async fn run_local(args: &Args, process: Arc<BenchmarkProcess>) -> Result<()> {
    let settings = args.manager_settings()?;
    let uri = args.target()?.to_string();
    let levels = args.clients.0.clone();
    let duration = args.duration();

    println!("{}", utils::series_banner(&uri, &levels, duration));
    let manager = DeviceManager::with_settings(Arc::clone(&process), settings);
    let series = manager.clone();
    let records = tokio::task::spawn_blocking(move || {
        let records = series.run_concurrency_series(&levels, duration);
        series.shutdown();
        records
    })
    .await
    .context("Benchmark series task failed")??;

    info!("Completed {} runs", records.len());
    if let Some(path) = process.sink().lock().log_path() {
        info!("Statistics written to {:?}", path);
    }

    if let Some(output_file) = &args.output_file {
        ResultsManager::new(output_file).write(&process.report(Some(uri)))?;
    }
    Ok(())
}

async fn run_master(args: &Args) -> Result<()> {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), args.port);
    let controller = Controller::bind(addr).await?;
    controller.run_interactive().await
}

async fn run_slave(args: &Args, process: Arc<BenchmarkProcess>) -> Result<()> {
    let settings = AgentSettings {
        master: args.master_endpoint(),
        bind: args.bind,
        ..Default::default()
    };
    info!("Agent connecting to {}", settings.master);
    Agent::new(process, settings).run().await
}
