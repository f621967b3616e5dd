//! Host side of the bridge.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────┐          ┌──────────────────────────┐
//! │ Bridge::execute (any task)  │          │   tds-bridge-worker      │
//! │   register waiter(msgId)    │          │                          │
//! │   write request line  ──────┼─ stdin ─►│                          │
//! │                             │          │                          │
//! │ reader task ◄───────────────┼─ stdout ─┤ responses, TDSLOG lines  │
//! │   Router::route_line        │          │                          │
//! │                             │          │                          │
//! │ monitor task ◄──────────────┼─ stderr ─┤ TDSERROR / TDSEXCEPTION  │
//! │   unprefixed line → teardown│          │                          │
//! └─────────────────────────────┘          └──────────────────────────┘
//! ```
//!
//! Stdout closing or an unrecognized stderr line tears the bridge down: the
//! worker is killed and every pending call resolves with
//! [`BridgeError::Disconnected`].

mod client;
mod error;
mod locate;
mod monitor;
mod router;
mod supervisor;
mod transaction;

pub use client::{Bridge, BridgeOptions};
pub use error::{BridgeError, BridgeResult};
pub use locate::{locate_worker, WORKER_BINARY};
pub use monitor::log_diagnostic;
pub use router::{ResponseReceiver, Router};
pub use supervisor::WorkerCommand;
pub use transaction::Transaction;
