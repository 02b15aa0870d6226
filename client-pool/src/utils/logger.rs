use anyhow::{Context, Result};
use chrono::Local;
use nu_ansi_term::{Color, Style};
use std::fmt::{self, Write as _};
use std::path::Path;
use tracing::level_filters::LevelFilter;
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    filter::Targets,
    fmt::{format::Writer, FmtContext, FormatEvent, FormatFields},
    prelude::*,
    registry::LookupSpan,
    Layer,
};

/// Installs the global subscriber: an hourly rolling file under `log_dir`
/// and a coloured console.
///
/// `verbose` lowers both layers to DEBUG for this crate. The returned guard
/// flushes the file writer and must be kept alive.
pub fn setup_logger(log_dir: impl AsRef<Path>, verbose: bool) -> Result<WorkerGuard> {
    let log_dir = log_dir.as_ref();
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    let file_appender = tracing_appender::rolling::hourly(log_dir, "client-pool");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let crate_level = if verbose { Level::DEBUG } else { Level::INFO };

    // Rotation history goes to the file; dependencies only when they warn.
    let file_filter = Targets::new()
        .with_target("client_pool", crate_level)
        .with_target("pool_probe", crate_level)
        .with_default(Level::WARN);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .event_format(FileFormatter)
        .with_filter(file_filter);

    let console_filter = Targets::new()
        .with_target(
            "client_pool",
            if verbose { LevelFilter::DEBUG } else { LevelFilter::WARN },
        )
        .with_target("pool_probe", LevelFilter::INFO)
        .with_default(LevelFilter::ERROR);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .event_format(TerminalFormatter)
        .with_filter(console_filter);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .context("Failed to set global subscriber")?;

    Ok(guard)
}

// --- Formatters ---

/// Collects the message and renders every other field as `key=value`.
#[derive(Default)]
struct EventVisitor {
    message: String,
    fields: String,
}

impl tracing::field::Visit for EventVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }
}

fn visit(event: &Event<'_>) -> EventVisitor {
    let mut visitor = EventVisitor::default();
    event.record(&mut visitor);
    visitor
}

fn span_path<S, N>(ctx: &FmtContext<'_, S, N>) -> String
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    ctx.event_scope()
        .map(|scope| {
            scope
                .from_root()
                .map(|span| span.name())
                .collect::<Vec<_>>()
                .join(":")
        })
        .unwrap_or_default()
}

pub struct TerminalFormatter;

impl<S, N> FormatEvent<S, N> for TerminalFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let visitor = visit(event);
        let level = *event.metadata().level();

        let tag = match level {
            Level::ERROR => Style::new().fg(Color::LightRed).bold().paint("ERROR"),
            Level::WARN => Style::new().fg(Color::Yellow).bold().paint("WARN "),
            Level::INFO => Style::new().fg(Color::LightGreen).paint("INFO "),
            _ => Style::new().fg(Color::DarkGray).paint("DEBUG"),
        };
        let fields = Style::new().fg(Color::DarkGray).paint(visitor.fields);

        writeln!(writer, "{} {}{}", tag, visitor.message, fields)
    }
}

pub struct FileFormatter;

impl<S, N> FormatEvent<S, N> for FileFormatter
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
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let level = event.metadata().level();
        write!(writer, "{} [{}] ", timestamp, level)?;

        let spans = span_path(ctx);
        if !spans.is_empty() {
            write!(writer, "{}: ", spans)?;
        }

        let visitor = visit(event);
        writeln!(writer, "{}{}", visitor.message, visitor.fields)
    }
}
