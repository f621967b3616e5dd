//! TDS driver backed by `tiberius`.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use tiberius::{AuthMethod, Client, ColumnData, Config, EncryptionLevel};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use super::driver::{Connection, Driver};
use super::error::{DriverError, DriverResult};
use crate::config::DatabaseSettings;
use crate::rows::{ResultSet, Row, Value};

const ROLLBACK_SQL: &str = "IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION";

type TdsClient = Client<Compat<TcpStream>>;

/// Opens TDS connections to the configured server.
#[derive(Debug, Clone)]
pub struct TdsDriver {
    settings: DatabaseSettings,
}

impl TdsDriver {
    pub fn new(settings: DatabaseSettings) -> Self {
        Self { settings }
    }

    fn build_config(&self) -> Config {
        let db = &self.settings;
        let mut config = Config::new();
        config.host(&db.host);
        config.port(db.port);
        config.authentication(AuthMethod::sql_server(&db.username, &db.password));
        if !db.database.is_empty() {
            config.database(&db.database);
        }
        config.application_name("tds-bridge");
        config.encryption(if db.encrypt {
            EncryptionLevel::Required
        } else {
            EncryptionLevel::NotSupported
        });
        config.trust_cert();
        config
    }
}

#[async_trait]
impl Driver for TdsDriver {
    type Connection = TdsConnection;

    async fn connect(&self) -> DriverResult<TdsConnection> {
        let config = self.build_config();
        let tcp = TcpStream::connect(config.get_addr()).await.map_err(|e| {
            DriverError::Connect(format!(
                "Failed to connect to {}: {}",
                self.settings.describe(),
                e
            ))
        })?;
        tcp.set_nodelay(true).ok();

        let client = Client::connect(config, tcp.compat_write())
            .await
            .map_err(|e| DriverError::Connect(e.to_string()))?;

        Ok(TdsConnection {
            client,
            broken: false,
        })
    }
}

/// One TDS session.
pub struct TdsConnection {
    client: TdsClient,
    broken: bool,
}

impl TdsConnection {
    fn query_error(&mut self, err: tiberius::error::Error) -> DriverError {
        if matches!(err, tiberius::error::Error::Io { .. }) {
            self.broken = true;
        }
        match &err {
            tiberius::error::Error::Server(token) => DriverError::Query(token.message().to_string()),
            _ => DriverError::Query(err.to_string()),
        }
    }
}

async fn run_query(
    client: &mut TdsClient,
    sql: &str,
) -> tiberius::Result<Vec<Vec<tiberius::Row>>> {
    let stream = client.simple_query(sql).await?;
    stream.into_results().await
}

#[async_trait]
impl Connection for TdsConnection {
    async fn execute(&mut self, sql: &str) -> DriverResult<Vec<ResultSet>> {
        if self.broken {
            return Err(DriverError::Closed);
        }

        let results = match run_query(&mut self.client, sql).await {
            Ok(results) => results,
            Err(e) => return Err(self.query_error(e)),
        };

        Ok(results
            .iter()
            .map(|rows| rows.iter().map(convert_row).collect())
            .collect())
    }

    async fn rollback(&mut self) -> DriverResult<()> {
        self.execute(ROLLBACK_SQL).await.map(|_| ())
    }

    async fn close(self) -> DriverResult<()> {
        self.client
            .close()
            .await
            .map_err(|e| DriverError::Query(e.to_string()))
    }

    fn is_broken(&self) -> bool {
        self.broken
    }
}

/// Timestamps travel as UTC instants with millisecond precision.
pub fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

pub fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub fn format_time(time: NaiveTime) -> String {
    time.format("%H:%M:%S%.f").to_string()
}

fn hex_literal(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("0x");
    for byte in bytes {
        out.push_str(&format!("{:02X}", byte));
    }
    out
}

/// Exact decimal text for a DECIMAL/NUMERIC cell, keeping the column scale.
fn decimal_text(value: i128, scale: u8) -> String {
    let digits = value.unsigned_abs().to_string();
    let scale = usize::from(scale);
    let sign = if value < 0 { "-" } else { "" };
    if scale == 0 {
        return format!("{}{}", sign, digits);
    }

    let padded = format!("{:0>width$}", digits, width = scale + 1);
    let (int, frac) = padded.split_at(padded.len() - scale);
    format!("{}{}.{}", sign, int, frac)
}

fn numeric_value(value: i128, scale: u8) -> Value {
    let text = decimal_text(value, scale);
    match text.parse::<serde_json::Number>() {
        Ok(number) => Value::Number(number),
        Err(_) => Value::String(text),
    }
}

/// Convert a non-temporal cell.
fn convert_column_data(data: &ColumnData<'_>) -> Value {
    match data {
        ColumnData::Bit(Some(b)) => Value::Bool(*b),
        ColumnData::U8(Some(v)) => Value::from(i64::from(*v)),
        ColumnData::I16(Some(v)) => Value::from(i64::from(*v)),
        ColumnData::I32(Some(v)) => Value::from(i64::from(*v)),
        ColumnData::I64(Some(v)) => Value::from(*v),
        ColumnData::F32(Some(v)) => Value::from_f64(f64::from(*v)),
        ColumnData::F64(Some(v)) => Value::from_f64(*v),
        ColumnData::Numeric(Some(n)) => numeric_value(n.value(), n.scale()),
        ColumnData::String(Some(s)) => Value::String(s.to_string()),
        ColumnData::Guid(Some(g)) => Value::String(g.to_string()),
        ColumnData::Binary(Some(b)) => Value::String(hex_literal(b)),
        ColumnData::Xml(Some(xml)) => Value::String(xml.to_string()),
        _ => Value::Null,
    }
}

/// Convert one row, keeping NULL columns as explicit nulls.
fn convert_row(row: &tiberius::Row) -> Row {
    let mut out = Row::new();
    for (i, (column, data)) in row.cells().enumerate() {
        let value = match data {
            ColumnData::DateTime(Some(_))
            | ColumnData::SmallDateTime(Some(_))
            | ColumnData::DateTime2(Some(_)) => row
                .try_get::<NaiveDateTime, _>(i)
                .ok()
                .flatten()
                .map(|dt| Value::String(format_timestamp(dt.and_utc())))
                .unwrap_or(Value::Null),
            ColumnData::DateTimeOffset(Some(_)) => row
                .try_get::<DateTime<Utc>, _>(i)
                .ok()
                .flatten()
                .map(|dt| Value::String(format_timestamp(dt)))
                .unwrap_or(Value::Null),
            ColumnData::Date(Some(_)) => row
                .try_get::<NaiveDate, _>(i)
                .ok()
                .flatten()
                .map(|d| Value::String(format_date(d)))
                .unwrap_or(Value::Null),
            ColumnData::Time(Some(_)) => row
                .try_get::<NaiveTime, _>(i)
                .ok()
                .flatten()
                .map(|t| Value::String(format_time(t)))
                .unwrap_or(Value::Null),
            _ => convert_column_data(data),
        };
        out.insert(column.name(), value);
    }
    out
}
