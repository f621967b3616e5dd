//! Wire protocol between the host bridge and the worker.
//!
//! One JSON object per line on the worker's stdin and stdout:
//!
//! ```text
//! host → worker   {"msgId":1,"transId":-1,"finishTrans":true,"sql":"SELECT 1"}
//! worker → host   {"msgId":1,"result":[[{"":1}]]}
//! worker → host   {"msgId":2,"result":[],"error":"Invalid column name 'x'.","errorCode":"QUERY_FAILED"}
//! ```
//!
//! Diagnostic lines share the worker's output streams. They start with a fixed
//! prefix and are classified before any JSON decoding is attempted.

use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

use crate::rows::ResultSet;

/// Prefix of informational diagnostic lines (stdout).
pub const LOG_PREFIX: &str = "TDSLOG:";

/// Prefix of error diagnostic lines (stderr).
pub const ERROR_PREFIX: &str = "TDSERROR:";

/// Prefix of exception diagnostic lines (stderr).
pub const EXCEPTION_PREFIX: &str = "TDSEXCEPTION:";

/// The line a worker writes once its pools are ready.
pub const STARTUP_LINE: &str = "TDSLOG: Connection created";

/// Transaction id meaning "no transaction".
pub const NO_TRANSACTION: i64 = -1;

/// Error decoding a line.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed JSON line: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("line is not a JSON object")]
    NotAnObject,

    #[error("request has no integer msgId")]
    MissingMsgId,

    #[error("invalid request {msg_id}: {reason}")]
    InvalidRequest { msg_id: i64, reason: String },
}

/// Unit of a request's `timeout`. Unknown names read as milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "nanoseconds" => TimeUnit::Nanoseconds,
            "microseconds" => TimeUnit::Microseconds,
            "seconds" => TimeUnit::Seconds,
            "minutes" => TimeUnit::Minutes,
            "hours" => TimeUnit::Hours,
            "days" => TimeUnit::Days,
            _ => TimeUnit::Milliseconds,
        }
    }

    pub fn duration(self, amount: u64) -> Duration {
        match self {
            TimeUnit::Nanoseconds => Duration::from_nanos(amount),
            TimeUnit::Microseconds => Duration::from_micros(amount),
            TimeUnit::Milliseconds => Duration::from_millis(amount),
            TimeUnit::Seconds => Duration::from_secs(amount),
            TimeUnit::Minutes => Duration::from_secs(amount.saturating_mul(60)),
            TimeUnit::Hours => Duration::from_secs(amount.saturating_mul(3600)),
            TimeUnit::Days => Duration::from_secs(amount.saturating_mul(86_400)),
        }
    }
}

impl<'de> Deserialize<'de> for TimeUnit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(TimeUnit::from_name(&name))
    }
}

/// Statement timeout when a request carries none.
pub const DEFAULT_STATEMENT_TIMEOUT: Duration = Duration::from_secs(3 * 60);

fn default_trans_id() -> i64 {
    NO_TRANSACTION
}

fn default_finish_trans() -> bool {
    true
}

/// A request to run one SQL string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    #[serde(rename = "msgId")]
    pub msg_id: i64,

    #[serde(rename = "transId", default = "default_trans_id")]
    pub trans_id: i64,

    #[serde(rename = "finishTrans", default = "default_finish_trans")]
    pub finish_trans: bool,

    #[serde(default)]
    pub sql: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeunit: Option<TimeUnit>,
}

impl QueryRequest {
    /// A non-transactional request.
    pub fn new(msg_id: i64, sql: impl Into<String>) -> Self {
        Self {
            msg_id,
            trans_id: NO_TRANSACTION,
            finish_trans: true,
            sql: sql.into(),
            timeout: None,
            timeunit: None,
        }
    }

    /// Attach this request to transaction `trans_id`.
    pub fn in_transaction(mut self, trans_id: i64, finish: bool) -> Self {
        self.trans_id = trans_id;
        self.finish_trans = finish;
        self
    }

    /// Bound the statement on the worker side.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self.timeunit = Some(TimeUnit::Milliseconds);
        self
    }

    /// Transaction id, or `None` for a stateless request.
    pub fn transaction(&self) -> Option<i64> {
        (self.trans_id >= 0).then_some(self.trans_id)
    }

    /// Statement timeout to enforce in the worker.
    pub fn statement_timeout(&self) -> Duration {
        match self.timeout {
            Some(amount) => self
                .timeunit
                .unwrap_or(TimeUnit::Milliseconds)
                .duration(amount),
            None => DEFAULT_STATEMENT_TIMEOUT,
        }
    }
}

/// Machine-readable failure class carried next to the error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidRequest,
    PoolExhausted,
    ConnectionFailed,
    QueryFailed,
    Timeout,
    #[serde(other)]
    Unknown,
}

/// The worker's answer to one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    #[serde(rename = "msgId")]
    pub msg_id: i64,

    #[serde(default)]
    pub result: Vec<ResultSet>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(rename = "errorCode", default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
}

impl QueryResponse {
    pub fn success(msg_id: i64, result: Vec<ResultSet>) -> Self {
        Self {
            msg_id,
            result,
            error: None,
            error_code: None,
        }
    }

    pub fn failure(msg_id: i64, code: ErrorCode, error: impl Into<String>) -> Self {
        Self {
            msg_id,
            result: Vec::new(),
            error: Some(error.into()),
            error_code: Some(code),
        }
    }

    /// Error text, if the worker reported a non-empty one.
    pub fn error_text(&self) -> Option<&str> {
        self.error.as_deref().filter(|e| !e.is_empty())
    }
}

/// Severity of a diagnostic line routed to the error stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Error,
    Exception,
}

/// A classified protocol line.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(QueryRequest),
    Response(QueryResponse),
    InfoLog(String),
    ErrorLog {
        severity: ErrorSeverity,
        text: String,
    },
}

/// Classify a diagnostic line by prefix. Returns `None` for anything else.
pub fn classify_diagnostic(line: &str) -> Option<Message> {
    let strip = |prefix: &str| line.strip_prefix(prefix).map(|t| t.trim().to_string());

    if let Some(text) = strip(LOG_PREFIX) {
        return Some(Message::InfoLog(text));
    }
    if let Some(text) = strip(ERROR_PREFIX) {
        return Some(Message::ErrorLog {
            severity: ErrorSeverity::Error,
            text,
        });
    }
    strip(EXCEPTION_PREFIX).map(|text| Message::ErrorLog {
        severity: ErrorSeverity::Exception,
        text,
    })
}

/// Decode one line read from either side of the bridge.
///
/// Diagnostic prefixes are checked first; a JSON object carrying `sql` is a
/// request, any other object a response.
pub fn decode(line: &str) -> Result<Message, ProtocolError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if let Some(diagnostic) = classify_diagnostic(line) {
        return Ok(diagnostic);
    }

    let value: serde_json::Value = serde_json::from_str(line)?;
    let object = value.as_object().ok_or(ProtocolError::NotAnObject)?;
    if object.contains_key("sql") {
        Ok(Message::Request(serde_json::from_value(value)?))
    } else {
        Ok(Message::Response(serde_json::from_value(value)?))
    }
}

/// Parse a request line on the worker side.
///
/// Distinguishes a line that cannot be answered (no `msgId`) from one that
/// can be answered with an error.
pub fn parse_request(line: &str) -> Result<QueryRequest, ProtocolError> {
    let value: serde_json::Value = serde_json::from_str(line.trim())?;
    let object = value.as_object().ok_or(ProtocolError::NotAnObject)?;
    let msg_id = object
        .get("msgId")
        .and_then(serde_json::Value::as_i64)
        .ok_or(ProtocolError::MissingMsgId)?;

    let request: QueryRequest =
        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidRequest {
            msg_id,
            reason: e.to_string(),
        })?;

    if request.sql.trim().is_empty() {
        return Err(ProtocolError::InvalidRequest {
            msg_id,
            reason: "sql must not be empty".to_string(),
        });
    }
    Ok(request)
}

/// Encode a request or response as one newline-terminated line.
///
/// JSON string escaping keeps embedded newlines in SQL text on one line.
pub fn encode<T: Serialize>(message: &T) -> Result<String, ProtocolError> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}
