//! Log line layout: level, thread, target, span path, message.
//!
//! Default tracing format: `LEVEL span1:span2: target: message`
//! This format:            `LEVEL [thread] target: span1{name=x}:span2: message`
//!
//! The thread name tells hub, adapter and blocking serial reader output apart
//! when several adapters log at once.

use std::fmt;
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::{self, DefaultFields, FormatEvent, FormatFields};
use tracing_subscriber::fmt::{FmtContext, FormattedFields, MakeWriter};
use tracing_subscriber::registry::LookupSpan;

/// Event formatter that puts the target before the span context
pub struct TargetFirstFormat {
    ansi: bool,
}

impl TargetFirstFormat {
    pub fn new(ansi: bool) -> Self {
        Self { ansi }
    }
}

impl Default for TargetFirstFormat {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Colourless layer for log files; field names are written without escapes too
pub fn plain_layer<S, W>(writer: W) -> tracing_subscriber::fmt::Layer<S, DefaultFields, TargetFirstFormat, W>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + 'static,
{
    tracing_subscriber::fmt::layer()
        .event_format(TargetFirstFormat::new(false))
        .with_ansi(false)
        .with_writer(writer)
}

fn level_style(level: &tracing::Level) -> &'static str {
    match *level {
        tracing::Level::ERROR => "\x1b[31m", // Red
        tracing::Level::WARN => "\x1b[33m",  // Yellow
        tracing::Level::INFO => "\x1b[32m",  // Green
        tracing::Level::DEBUG => "\x1b[34m", // Blue
        tracing::Level::TRACE => "\x1b[35m", // Magenta
    }
}

impl<S, N> FormatEvent<S, N> for TargetFirstFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();

        let level = metadata.level();
        if self.ansi && writer.has_ansi_escapes() {
            write!(writer, "{}{:>5}\x1b[0m ", level_style(level), level)?;
        } else {
            write!(writer, "{:>5} ", level)?;
        }

        let thread = std::thread::current();
        write!(writer, "[{}] ", thread.name().unwrap_or("-"))?;

        write!(writer, "{}: ", metadata.target())?;

        // Span path, with each span's fields so adapter names show up
        if let Some(scope) = ctx.event_scope() {
            let mut first = true;
            for span in scope.from_root() {
                if !first {
                    write!(writer, ":")?;
                }
                write!(writer, "{}", span.name())?;
                let extensions = span.extensions();
                if let Some(fields) = extensions.get::<FormattedFields<N>>()
                    && !fields.is_empty()
                {
                    write!(writer, "{{{}}}", fields)?;
                }
                first = false;
            }
            if !first {
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}
