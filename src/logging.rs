//! # Logging
//!
//! `tracing` everywhere inside the core; `main.rs` wires a colorized stdout
//! layer (the `ColorizedFormatter` below) plus an optional rolling file
//! layer via `tracing_appender::rolling`, gated by `--log-file`. Every
//! dispatch-core module opens its spans/events against one of the `target`
//! constants here (`endpoint`, `channel`, `decoder`, `queue`, `worker`,
//! `registry`) so operators can filter by subsystem with `RUST_LOG`.

use std::fmt;
use std::path::Path;

use colored::*;
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

pub mod target {
    pub const ENDPOINT: &str = "endpoint";
    pub const CHANNEL: &str = "channel";
    pub const DECODER: &str = "decoder";
    pub const QUEUE: &str = "queue";
    pub const WORKER: &str = "worker";
    pub const REGISTRY: &str = "registry";
}

/// A custom tracing event formatter for colorizing log output based on
/// level, printing the event's `target` ahead of its fields so operators
/// can tell which subsystem logged a line at a glance.
pub struct ColorizedFormatter;

impl<S, N> FormatEvent<S, N> for ColorizedFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        // Buffer the formatted fields to apply color to the entire line.
        // This is necessary because the format_fields method writes directly.
        let mut buffer = String::new();
        let mut buf_writer = Writer::new(&mut buffer);
        ctx.format_fields(buf_writer.by_ref(), event)?;

        let line = format!("[{}] {}", event.metadata().target(), buffer);

        let colored_output = match *event.metadata().level() {
            Level::INFO => line.white(),
            Level::WARN => line.yellow(),
            Level::ERROR => line.red(),
            Level::DEBUG => line.blue(),
            Level::TRACE => line.purple(),
        };

        writeln!(writer, "{}", colored_output)
    }
}

/// Install the global `tracing` subscriber: a colorized stdout layer at
/// `level`, plus an optional daily-rolling file layer when `log_file` is
/// set. Returns the file appender's guard, which must be held for the
/// process lifetime or buffered lines are lost on exit.
pub fn init(level: Level, log_file: Option<&Path>) -> Option<WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::builder()
        .with_default_directive(tracing_subscriber::filter::LevelFilter::from(level).into())
        .from_env_lossy();

    let stdout_layer = tracing_subscriber::fmt::layer()
        .event_format(ColorizedFormatter)
        .with_writer(std::io::stdout);

    match log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
            let file_name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| "nfs-dispatchd.log".to_string());
            let file_appender = tracing_appender::rolling::daily(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking);

            tracing_subscriber::registry()
                .with(filter)
                .with(stdout_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stdout_layer).init();
            None
        }
    }
}
