//! Worker stderr monitor.

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, error, info, warn};

use crate::logging::WORKER_LOG_TARGET;
use crate::protocol::{classify_diagnostic, ErrorSeverity, Message};

/// Why the monitor stopped reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorExit {
    /// Stderr closed. Not fatal on its own; stdout closure decides that.
    Closed,
    /// The worker wrote a line without a diagnostic prefix.
    Fault(String),
}

/// Surface one diagnostic line as a log event. Returns `false` if the line
/// carries no recognized prefix.
pub fn log_diagnostic(line: &str) -> bool {
    match classify_diagnostic(line) {
        Some(Message::InfoLog(text)) => info!(target: WORKER_LOG_TARGET, "{}", text),
        Some(Message::ErrorLog {
            severity: ErrorSeverity::Error,
            text,
        }) => warn!(target: WORKER_LOG_TARGET, "{}", text),
        Some(Message::ErrorLog {
            severity: ErrorSeverity::Exception,
            text,
        }) => error!(target: WORKER_LOG_TARGET, "{}", text),
        _ => return false,
    }
    true
}

/// Read worker stderr until it closes or produces an unrecognized line.
pub(crate) async fn monitor_loop<R>(reader: R) -> MonitorExit
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() || log_diagnostic(&line) {
                    continue;
                }
                warn!(line = %line, "Unexpected output on worker stderr");
                return MonitorExit::Fault(line);
            }
            Ok(None) => {
                debug!("Worker stderr closed");
                return MonitorExit::Closed;
            }
            Err(e) => {
                debug!(error = %e, "Failed to read worker stderr");
                return MonitorExit::Closed;
            }
        }
    }
}
