//! # `nfs-dispatchd` — Main Entry Point
//!
//! The process entry point for the RPC dispatch and request-queueing core.
//!
//! ## Architecture Overview
//!
//! 1. **Parse arguments**: config file path, logging knobs, inspection modes.
//! 2. **Initialize logging**: colorized stdout layer plus an optional
//!    rolling file layer, per `src/logging.rs`.
//! 3. **Load configuration**: from the file named by `--config`, falling
//!    back to `Config::default()`.
//! 4. **Build and start the dispatcher**: `Dispatcher::new` then `start`,
//!    per spec.md §4.6.
//! 5. **Wait for a shutdown signal** (SIGINT/SIGTERM via `ctrl_c`), then run
//!    `dispatch_stop` and exit with a status reflecting what happened.
//!
//! ## Error Handling
//!
//! `main` returns `anyhow::Result<()>`; fatal startup errors
//! (`DispatchError::is_fatal_startup`) are logged with `anyhow::Context` and
//! cause a non-zero exit, the same shape the teacher's CLI used for
//! continue-on-error vs. hard-failure branching.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use nfs_dispatch_core::cli::Args;
use nfs_dispatch_core::codec::FakeCodec;
use nfs_dispatch_core::config::Config;
use nfs_dispatch_core::decoder::HandlerTable;
use nfs_dispatch_core::logging;
use nfs_dispatch_core::registry::{Dispatcher, FakeNetconfigClient};
use nfs_dispatch_core::{DispatchError, FakePortmapClient};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Held for the process lifetime: dropping it flushes buffered log
    // lines written through the non-blocking file appender.
    let _log_guard = logging::init(args.log_level(), args.log_file.as_deref());

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return Ok(ExitCode::FAILURE);
        }
    };

    if args.dump_config {
        println!("{}", serde_json::to_string_pretty(&config).context("serializing config")?);
        return Ok(ExitCode::SUCCESS);
    }
    if args.validate_config {
        info!("configuration is valid");
        return Ok(ExitCode::SUCCESS);
    }

    // The external RPC/XDR codec, portmap client, and netconfig client are
    // out of this core's scope (spec.md §1); a real deployment supplies its
    // own `RpcCodec`/`PortmapClient`/`NetconfigClient` implementations here.
    let dispatcher = Dispatcher::new(
        config,
        Arc::new(FakeCodec::new()),
        Arc::new(FakePortmapClient::new()),
        Arc::new(FakeNetconfigClient::default()),
        HandlerTable::new(),
    );

    if let Err(e) = dispatcher.start().await {
        error!(error = %e, fatal = e.is_fatal_startup(), "dispatcher startup failed");
        return Ok(ExitCode::FAILURE);
    }
    info!("nfs-dispatchd is running, press Ctrl-C to stop");

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping");
    dispatcher.dispatch_stop().await;

    Ok(ExitCode::SUCCESS)
}

fn load_config(args: &Args) -> Result<Config, DispatchError> {
    match &args.config {
        Some(path) => Config::load_from_file(path),
        None => Ok(Config::default()),
    }
}

/// Waits for SIGINT (Ctrl-C) or, on Unix, SIGTERM — whichever arrives
/// first — so the process reacts to both an interactive stop and the
/// signal a service manager sends.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler, waiting on Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
