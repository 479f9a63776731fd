//! # Logging
//!
//! Log output for interactive runs: each line is colored by severity, prefixed
//! with its level, and carries the structured fields (`phase`, `metric`,
//! `agent`, ...) attached by the statistics engine.

use crate::sla::Failure;
use colored::*;
use std::fmt;
use tracing::{warn, Event, Level, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// Formatter coloring the whole log line according to its level.
///
/// No timestamps or targets are printed; the level is kept as a short tag so
/// that output stays readable when colors are disabled.
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
        // Fields are buffered so the color applies to the entire line.
        let mut buffer = String::new();
        ctx.format_fields(Writer::new(&mut buffer), event)?;

        let level = *event.metadata().level();
        let line = format!("{:<5} {}", level_tag(level), buffer);
        let colored_line = match level {
            Level::ERROR => line.red(),
            Level::WARN => line.yellow(),
            Level::INFO => line.normal(),
            Level::DEBUG => line.blue(),
            Level::TRACE => line.purple(),
        };
        writeln!(writer, "{}", colored_line)
    }
}

fn level_tag(level: Level) -> &'static str {
    match level {
        Level::ERROR => "ERROR",
        Level::WARN => "WARN",
        Level::INFO => "INFO",
        Level::DEBUG => "DEBUG",
        Level::TRACE => "TRACE",
    }
}

/// Install the colorized subscriber.
///
/// `RUST_LOG` takes precedence; otherwise `info` is used, or `debug` when
/// `verbose` is set. Returns `false` if a global subscriber was already installed.
pub fn init(verbose: bool) -> bool {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(ColorizedFormatter)
        .try_init()
        .is_ok()
}

/// Live failure callback printing every SLA violation as it is detected
pub fn log_failure(failure: &Failure) {
    warn!(
        phase = failure.phase(),
        metric = failure.metric().unwrap_or("*"),
        "{} {}",
        "SLA violated:".bold(),
        failure.message()
    );
}
