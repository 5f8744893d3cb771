//! Tracing subscriber setup for the gateway binary.
//!
//! Two layers: a detailed layer writing to a daily-rolling file (or
//! stderr), and an optional stdout layer for user-facing output that
//! prints each event as a single severity-tinted line. Library code
//! only emits `tracing` events and never installs a subscriber.

use colored::{Color, Colorize};
use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{prelude::*, Layer};

/// Console tint for each severity.
fn level_color(level: Level) -> Color {
    match level {
        Level::ERROR => Color::Red,
        Level::WARN => Color::Yellow,
        Level::INFO => Color::White,
        Level::DEBUG => Color::Blue,
        Level::TRACE => Color::Magenta,
    }
}

/// Console event formatter: no timestamps, no level prefix, just the
/// event fields with the whole line colored by severity.
pub struct ConsoleFormatter;

impl<S, N> FormatEvent<S, N> for ConsoleFormatter
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
        // The fields land in an intermediate string; tinting has to
        // cover the assembled line, not each fragment.
        let mut line = String::new();
        ctx.format_fields(Writer::new(&mut line), event)?;

        let tint = level_color(*event.metadata().level());
        writeln!(writer, "{}", line.color(tint))
    }
}

/// Install the global subscriber.
///
/// `verbose` maps 0/1/2+ to info/debug/trace. `log_file` selects the
/// detailed layer's destination: `Some("stderr")` writes to stderr, any
/// other value is a file path, and `None` falls back to a daily-rolling
/// `l4-gateway.log` in the working directory. The returned guard must
/// stay alive for the life of the process or file logging stops.
pub fn init(verbose: u8, quiet: bool, log_file: Option<&str>) -> Option<WorkerGuard> {
    let log_level = match verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let guard;
    let detailed_layer;
    if let Some("stderr") = log_file {
        detailed_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(log_level)
            .boxed();
        guard = None;
    } else {
        let appender = match log_file {
            Some(path) => {
                let path = std::path::Path::new(path);
                let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
                let file = path
                    .file_name()
                    .unwrap_or_else(|| std::ffi::OsStr::new("l4-gateway.log"));
                tracing_appender::rolling::daily(dir, file)
            }
            None => tracing_appender::rolling::daily(".", "l4-gateway.log"),
        };
        let (writer, file_guard) = tracing_appender::non_blocking(appender);
        detailed_layer = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_filter(log_level)
            .boxed();
        guard = Some(file_guard);
    }

    let stdout_layer = if quiet {
        None
    } else {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(ConsoleFormatter)
                .with_filter(log_level),
        )
    };

    tracing_subscriber::registry()
        .with(detailed_layer)
        .with(stdout_layer)
        .init();

    guard
}
