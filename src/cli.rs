//! # Command-Line Interface
//!
//! Argument parsing for `nfs-dispatchd`, via `clap`'s derive API, same as
//! the teacher's benchmark CLI. Where the teacher's `Args` described a
//! benchmark run (mechanisms, iterations, duration), this `Args` describes a
//! dispatch-daemon startup: a config file path, logging knobs, and two
//! inspection modes (`--dump-config`, `--validate-config`) for operators to
//! sanity-check a config file before the daemon runs for real.

use clap::{
    builder::styling::{AnsiColor, Styles},
    Parser,
};
use std::path::PathBuf;

/// Defines the styles for the help message to replicate clap v3's appearance.
fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// `nfs-dispatchd` — the RPC dispatch and request-queueing core of an
/// NFS-family server.
///
/// Loads a JSON configuration file describing ports, buffer sizes, worker
/// thread count, and protocol feature toggles, then brings up the endpoint
/// manager, event-channel reactors, and worker pool described in spec.md.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    /// Path to the JSON configuration file.
    ///
    /// See `src/config.rs` for every field this file may set. When omitted,
    /// the daemon starts from `Config::default()`.
    #[arg(short = 'c', long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Write logs to this file in addition to stdout.
    ///
    /// The file is opened through a daily-rolling appender, mirroring how
    /// the teacher's logging layer split a colorized stdout stream from an
    /// optional file sink.
    #[arg(long, value_name = "FILE", help_heading = "Output and Logging")]
    pub log_file: Option<PathBuf>,

    /// Silence informational output on stdout; only warnings and errors
    /// are shown.
    #[arg(short = 'q', long, help_heading = "Output and Logging")]
    pub quiet: bool,

    /// Increase log verbosity.
    ///
    ///  -v: info
    ///  -vv: debug
    ///  -vvv: trace
    ///
    /// By default, only WARNING and ERROR messages are shown.
    #[arg(short, long, action = clap::ArgAction::Count, help_heading = "Output and Logging")]
    pub verbose: u8,

    /// Parse and validate the configuration file, print any error, and exit
    /// without starting the dispatcher.
    #[arg(long)]
    pub validate_config: bool,

    /// Print the effective configuration (file values merged over defaults)
    /// as JSON and exit without starting the dispatcher.
    #[arg(long)]
    pub dump_config: bool,
}

impl Args {
    /// Resolve the effective `tracing` level from `--quiet`/`-v` counts, the
    /// same precedence the teacher's CLI used for its own verbosity flags.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            return tracing::Level::ERROR;
        }
        match self.verbose {
            0 => tracing::Level::WARN,
            1 => tracing::Level::INFO,
            2 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        }
    }
}
