//! Host-side logging setup.

use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Layer};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "tds_bridge=info";

/// Target of events re-emitted from worker diagnostic lines.
pub const WORKER_LOG_TARGET: &str = "tds_bridge::worker_log";

/// Logging configuration for host binaries.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    /// Log at debug level regardless of `RUST_LOG`.
    pub verbose: bool,
}

/// Initialize tracing with human-readable output on stderr.
pub fn init_logging(config: LogConfig) -> Result<(), TryInitError> {
    let filter = if config.verbose {
        EnvFilter::new("tds_bridge=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(filter),
        )
        .try_init()
}
