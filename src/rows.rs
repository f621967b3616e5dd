//! Row and result model shared by the host bridge and the worker.
//!
//! A statement produces an ordered list of result sets; each result set is an
//! ordered list of rows; each row maps column names to scalar values. Column
//! order is the order of first appearance so rows can be scanned positionally,
//! and SQL `NULL` is kept as an explicit [`Value::Null`] instead of dropping
//! the column.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::de::{DeserializeOwned, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A single column value.
///
/// Temporal columns travel as ISO-8601 text; use [`Row::get`] with a `chrono`
/// type to parse them back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Name of the variant, used in conversion errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
        }
    }

    /// Build a number value from a float. Non-finite floats have no JSON
    /// representation and become `Null`.
    pub fn from_f64(value: f64) -> Self {
        serde_json::Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Number(value.into())
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Number(value.into())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::from_f64(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Error converting a column value into a Rust type.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValueError {
    #[error("column not found: {0}")]
    MissingColumn(String),

    #[error("column {column}: expected {expected}, found {found}")]
    TypeMismatch {
        column: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("column {column}: {message}")]
    Invalid { column: String, message: String },
}

/// Conversion from a column [`Value`].
pub trait FromValue: Sized {
    /// Convert `value`, read from `column`, into `Self`.
    fn from_value(column: &str, value: &Value) -> Result<Self, ValueError>;
}

fn mismatch(column: &str, expected: &'static str, value: &Value) -> ValueError {
    ValueError::TypeMismatch {
        column: column.to_string(),
        expected,
        found: value.kind(),
    }
}

impl FromValue for Value {
    fn from_value(_column: &str, value: &Value) -> Result<Self, ValueError> {
        Ok(value.clone())
    }
}

impl FromValue for String {
    fn from_value(column: &str, value: &Value) -> Result<Self, ValueError> {
        match value {
            Value::String(s) => Ok(s.clone()),
            Value::Number(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            Value::Null => Err(mismatch(column, "string", value)),
        }
    }
}

impl FromValue for i64 {
    fn from_value(column: &str, value: &Value) -> Result<Self, ValueError> {
        match value {
            Value::Number(n) => n.as_i64().ok_or_else(|| mismatch(column, "integer", value)),
            Value::String(s) => s.trim().parse().map_err(|_| mismatch(column, "integer", value)),
            _ => Err(mismatch(column, "integer", value)),
        }
    }
}

impl FromValue for i32 {
    fn from_value(column: &str, value: &Value) -> Result<Self, ValueError> {
        let wide = i64::from_value(column, value)?;
        i32::try_from(wide).map_err(|_| ValueError::Invalid {
            column: column.to_string(),
            message: format!("{} does not fit in i32", wide),
        })
    }
}

impl FromValue for f64 {
    fn from_value(column: &str, value: &Value) -> Result<Self, ValueError> {
        match value {
            Value::Number(n) => n.as_f64().ok_or_else(|| mismatch(column, "float", value)),
            Value::String(s) => s.trim().parse().map_err(|_| mismatch(column, "float", value)),
            _ => Err(mismatch(column, "float", value)),
        }
    }
}

impl FromValue for bool {
    fn from_value(column: &str, value: &Value) -> Result<Self, ValueError> {
        match value {
            Value::Bool(b) => Ok(*b),
            Value::Number(n) => match n.as_i64() {
                Some(0) => Ok(false),
                Some(1) => Ok(true),
                _ => Err(mismatch(column, "boolean", value)),
            },
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "1" => Ok(true),
                "false" | "0" => Ok(false),
                _ => Err(mismatch(column, "boolean", value)),
            },
            Value::Null => Err(mismatch(column, "boolean", value)),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(column: &str, value: &Value) -> Result<Self, ValueError> {
        if value.is_null() {
            Ok(None)
        } else {
            T::from_value(column, value).map(Some)
        }
    }
}

fn temporal_text<'a>(
    column: &str,
    value: &'a Value,
    expected: &'static str,
) -> Result<&'a str, ValueError> {
    value.as_str().ok_or_else(|| mismatch(column, expected, value))
}

fn invalid(column: &str, err: impl fmt::Display) -> ValueError {
    ValueError::Invalid {
        column: column.to_string(),
        message: err.to_string(),
    }
}

impl FromValue for NaiveDate {
    fn from_value(column: &str, value: &Value) -> Result<Self, ValueError> {
        let text = temporal_text(column, value, "date")?;
        // Accept a full timestamp as well: older workers sent dates that way.
        let date_part = text.split('T').next().unwrap_or(text);
        NaiveDate::parse_from_str(date_part, "%Y-%m-%d").map_err(|e| invalid(column, e))
    }
}

impl FromValue for NaiveTime {
    fn from_value(column: &str, value: &Value) -> Result<Self, ValueError> {
        let text = temporal_text(column, value, "time")?;
        NaiveTime::parse_from_str(text, "%H:%M:%S%.f").map_err(|e| invalid(column, e))
    }
}

impl FromValue for DateTime<Utc> {
    fn from_value(column: &str, value: &Value) -> Result<Self, ValueError> {
        let text = temporal_text(column, value, "timestamp")?;
        DateTime::parse_from_rfc3339(text)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| invalid(column, e))
    }
}

impl FromValue for NaiveDateTime {
    fn from_value(column: &str, value: &Value) -> Result<Self, ValueError> {
        DateTime::<Utc>::from_value(column, value).map(|dt| dt.naive_utc())
    }
}

/// One result row: column names mapped to values in column order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<(String, Value)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a column. A repeated name keeps its original position and takes the
    /// new value, so names stay unique.
    pub fn insert(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        let column = column.into();
        let value = value.into();
        match self.columns.iter_mut().find(|(name, _)| *name == column) {
            Some(slot) => slot.1 = value,
            None => self.columns.push((column, value)),
        }
    }

    /// Builder-style [`Row::insert`].
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(column, value);
        self
    }

    /// Raw value of a column, `None` when the column is absent.
    pub fn value(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    /// Value at a position, in column order.
    pub fn value_at(&self, index: usize) -> Option<&Value> {
        self.columns.get(index).map(|(_, value)| value)
    }

    /// Typed access to a column.
    ///
    /// A present-but-null column converts to `None` for `Option<T>` and is an
    /// error for non-optional targets; an absent column is always an error.
    pub fn get<T: FromValue>(&self, column: &str) -> Result<T, ValueError> {
        let value = self
            .value(column)
            .ok_or_else(|| ValueError::MissingColumn(column.to_string()))?;
        T::from_value(column, value)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.value(column).is_some()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Map the row onto a serde type, matching fields by column name.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        let value = serde_json::to_value(self)?;
        serde_json::from_value(value)
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.columns.len()))?;
        for (name, value) in &self.columns {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Row {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RowVisitor;

        impl<'de> Visitor<'de> for RowVisitor {
            type Value = Row;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a JSON object of column values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Row, A::Error> {
                let mut row = Row {
                    columns: Vec::with_capacity(access.size_hint().unwrap_or(0)),
                };
                while let Some((name, value)) = access.next_entry::<String, Value>()? {
                    row.insert(name, value);
                }
                Ok(row)
            }
        }

        deserializer.deserialize_map(RowVisitor)
    }
}

/// An ordered sequence of rows from one statement result.
pub type ResultSet = Vec<Row>;

/// Finite cursor over the rows of every result set of a statement, in order.
///
/// A `Rows` value cannot be rewound; issue the statement again to read the
/// rows again.
#[derive(Debug)]
pub struct Rows {
    inner: std::iter::Flatten<std::vec::IntoIter<ResultSet>>,
}

impl Rows {
    pub fn new(result_sets: Vec<ResultSet>) -> Self {
        Self {
            inner: result_sets.into_iter().flatten(),
        }
    }

    /// Feed each row to `callback`, stopping at the first error.
    ///
    /// Rows handed to the callback before the failure stay delivered.
    pub fn try_for_each_row<E, F>(self, mut callback: F) -> Result<(), E>
    where
        F: FnMut(Row) -> Result<(), E>,
    {
        for row in self {
            callback(row)?;
        }
        Ok(())
    }
}

impl Iterator for Rows {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        self.inner.next()
    }
}
