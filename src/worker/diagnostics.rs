//! Prefixed diagnostic lines for the worker's logs.
//!
//! The host tells diagnostics from responses by prefix, so every event is
//! flattened to a single prefixed line:
//!
//! | level               | stream | prefix          |
//! |---------------------|--------|-----------------|
//! | TRACE, DEBUG, INFO  | stdout | `TDSLOG:`       |
//! | WARN                | stderr | `TDSERROR:`     |
//! | ERROR               | stderr | `TDSEXCEPTION:` |
//!
//! Stdout lines go through the [`OutputSink`] shared with responses.

use std::io::{self, Write};

use tracing::{Level, Metadata};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer};

use super::output::OutputSink;
use crate::logging::DEFAULT_LOG_FILTER;
use crate::protocol::{ERROR_PREFIX, EXCEPTION_PREFIX, LOG_PREFIX};

/// Longest diagnostic text kept before truncation, in characters.
pub const MAX_DIAGNOSTIC_CHARS: usize = 1000;

const TRUNCATION_MARKER: &str = " ... (truncated)";

/// Shorten `text` to [`MAX_DIAGNOSTIC_CHARS`] characters.
pub fn truncate_diagnostic(text: &str) -> String {
    match text.char_indices().nth(MAX_DIAGNOSTIC_CHARS) {
        Some((cut, _)) => format!("{}{}", &text[..cut], TRUNCATION_MARKER),
        None => text.to_string(),
    }
}

fn prefix_for(level: Level) -> &'static str {
    if level == Level::ERROR {
        EXCEPTION_PREFIX
    } else if level == Level::WARN {
        ERROR_PREFIX
    } else {
        LOG_PREFIX
    }
}

/// Format one diagnostic line: prefix, then the text on a single line.
pub fn format_diagnostic(level: Level, text: &str) -> String {
    let single_line: String = text
        .trim_end()
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();
    format!("{} {}", prefix_for(level), truncate_diagnostic(&single_line))
}

/// Write an error line straight to stderr. Used before logging is set up.
pub fn write_error_line(text: &str) {
    let line = format_diagnostic(Level::WARN, text);
    let _ = writeln!(io::stderr().lock(), "{}", line);
}

/// [`MakeWriter`] routing each formatted event by level.
#[derive(Clone, Debug)]
pub struct DiagnosticWriter {
    sink: OutputSink,
}

impl DiagnosticWriter {
    pub fn new(sink: OutputSink) -> Self {
        Self { sink }
    }
}

impl<'a> MakeWriter<'a> for DiagnosticWriter {
    type Writer = DiagnosticLine;

    fn make_writer(&'a self) -> Self::Writer {
        DiagnosticLine::new(self.sink.clone(), Level::INFO)
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        DiagnosticLine::new(self.sink.clone(), *meta.level())
    }
}

/// Buffer for one event, emitted as a prefixed line when dropped.
pub struct DiagnosticLine {
    sink: OutputSink,
    level: Level,
    buf: Vec<u8>,
}

impl DiagnosticLine {
    fn new(sink: OutputSink, level: Level) -> Self {
        Self {
            sink,
            level,
            buf: Vec::new(),
        }
    }
}

impl Write for DiagnosticLine {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for DiagnosticLine {
    fn drop(&mut self) {
        let text = String::from_utf8_lossy(&self.buf);
        if text.trim().is_empty() {
            return;
        }

        let line = format_diagnostic(self.level, &text);
        if self.level <= Level::WARN {
            let _ = writeln!(io::stderr().lock(), "{}", line);
        } else {
            self.sink.send_line(line);
        }
    }
}

/// Install the worker's subscriber.
///
/// With `enabled` false every event is filtered out; the worker then only
/// writes responses and the startup line.
pub fn init_worker_logging(sink: OutputSink, enabled: bool) -> Result<(), TryInitError> {
    let filter = if enabled {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    } else {
        EnvFilter::new("off")
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(DiagnosticWriter::new(sink))
                .without_time()
                .with_level(false)
                .with_target(false)
                .with_ansi(false)
                .with_filter(filter),
        )
        .try_init()
}
