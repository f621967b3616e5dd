//! Worker side of the bridge.
//!
//! The worker is a long-running child process owning the database driver.
//! It reads requests on stdin, runs them on one of two pools, and answers on
//! stdout.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                    tds-bridge-worker process                     │
//! │                                                                  │
//! │  stdin ──► Worker::serve ──► one task per request                │
//! │                                 │                                │
//! │                  transId = -1   │   transId >= 0                 │
//! │                 ┌───────────────┴────────────────┐               │
//! │                 ▼                                ▼               │
//! │        ┌────────────────┐             ┌─────────────────────┐    │
//! │        │ ConnectionPool │             │  TransactionPool    │    │
//! │        │ min..max idle  │             │  transId → conn     │    │
//! │        │ + maintenance  │             │  + spare reserve    │    │
//! │        └───────┬────────┘             └──────────┬──────────┘    │
//! │                └──────────────┬──────────────────┘               │
//! │                               ▼                                  │
//! │                     Driver (tiberius / scripted)                 │
//! │                                                                  │
//! │  responses + TDSLOG lines ──► OutputSink ──► stdout              │
//! │  TDSERROR / TDSEXCEPTION lines ──────────────► stderr            │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

mod diagnostics;
mod driver;
mod error;
mod output;
mod pool;
mod scripted;
mod server;
mod tds;
mod transaction;

pub use diagnostics::{
    format_diagnostic, init_worker_logging, truncate_diagnostic, write_error_line,
    DiagnosticWriter, MAX_DIAGNOSTIC_CHARS,
};
pub use driver::{Connection, Driver};
pub use error::{DriverError, DriverResult, PoolError, PoolResult};
pub use output::OutputSink;
pub use pool::{ConnectionPool, PoolConfig, PoolStats, PooledConnection};
pub use scripted::{ScriptedConnection, ScriptedDriver};
pub use server::Worker;
pub use tds::{TdsConnection, TdsDriver};
pub use transaction::{SharedConnection, TransactionPool};
