//! # tds-bridge
//!
//! Runs SQL against a TDS database server through a supervised worker
//! process.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  Host (bridge::Bridge)                   │
//! │   concurrent execute() calls, transaction handles        │
//! └─────────────────────────────────────────────────────────┘
//!            │ request lines (JSON)      ▲ response lines
//!            ▼ stdin                     │ stdout / stderr
//! ┌─────────────────────────────────────────────────────────┐
//! │              Worker process (worker::Worker)             │
//! │   stateless ConnectionPool  +  TransactionPool           │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ TDS
//! ┌─────────────────────────────────────────────────────────┐
//! │                    Database server                       │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Both sides share the wire types in [`protocol`] and the row model in
//! [`rows`].

pub mod bridge;
pub mod config;
pub mod logging;
pub mod protocol;
pub mod rows;
pub mod worker;

pub use bridge::{Bridge, BridgeError, BridgeOptions, BridgeResult, Transaction};
pub use config::Settings;
pub use rows::{ResultSet, Row, Rows, Value};
