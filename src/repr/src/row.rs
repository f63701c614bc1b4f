// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Rows and datums.
//!
//! Replicated rows are heterogeneous column maps. [`Datum`] is the owned sum
//! over the SQL value kinds the replica can produce; [`Row`] is an ordered
//! column map. Rows cross the wire as JSON objects, so every datum must be
//! convertible to JSON — with one deliberate gap: integers beyond the range
//! JavaScript can represent losslessly are rejected rather than silently
//! rounded.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ErrorKind;

/// The column every replicated row must carry; it holds the row's version
/// token and is stripped before the row is stored or sent to clients.
pub const ROW_VERSION_COLUMN: &str = "_0_version";

/// The largest integer exactly representable as an IEEE 754 double, i.e. by
/// a JavaScript client.
const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

/// An error produced while handling a row.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RowError {
    /// The row is missing its version column.
    #[error("replicated row is missing the {ROW_VERSION_COLUMN} column")]
    MissingVersion,
    /// The version column was present but not a non-empty string.
    #[error("replicated row has an invalid {ROW_VERSION_COLUMN} column: {0:?}")]
    InvalidVersion(String),
    /// An integer column cannot be represented losslessly on the client.
    #[error("integer {0} in column {1:?} is outside the safe client range")]
    NumericOutOfRange(i64, String),
    /// A binary column cannot be carried in a JSON row payload.
    #[error("binary value in column {0:?} cannot be encoded for the client")]
    BinaryValue(String),
}

impl RowError {
    /// The taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Internal
    }
}

/// An owned SQL value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Datum {
    /// The SQL null.
    Null,
    /// A boolean.
    Bool(bool),
    /// A 64-bit signed integer.
    Int64(i64),
    /// A 64-bit float.
    Float64(f64),
    /// A string.
    String(String),
    /// A byte array.
    Bytes(Vec<u8>),
    /// A JSON document, carried opaquely.
    Json(serde_json::Value),
}

impl Datum {
    /// Converts a JSON value into a datum. Numbers that fit in `i64` become
    /// integers; everything structured stays JSON.
    pub fn from_json(value: serde_json::Value) -> Datum {
        use serde_json::Value;
        match value {
            Value::Null => Datum::Null,
            Value::Bool(b) => Datum::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Datum::Int64(i),
                None => Datum::Float64(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => Datum::String(s),
            v @ (Value::Array(_) | Value::Object(_)) => Datum::Json(v),
        }
    }

    /// Converts this datum into a JSON value for the wire or for jsonb
    /// storage. `column` is only used for error reporting.
    pub fn into_json(self, column: &str) -> Result<serde_json::Value, RowError> {
        use serde_json::Value;
        match self {
            Datum::Null => Ok(Value::Null),
            Datum::Bool(b) => Ok(Value::Bool(b)),
            Datum::Int64(i) => {
                if i.unsigned_abs() > MAX_SAFE_INTEGER as u64 {
                    return Err(RowError::NumericOutOfRange(i, column.to_owned()));
                }
                Ok(Value::Number(i.into()))
            }
            Datum::Float64(f) => Ok(serde_json::Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null)),
            Datum::String(s) => Ok(Value::String(s)),
            Datum::Bytes(_) => Err(RowError::BinaryValue(column.to_owned())),
            Datum::Json(v) => Ok(v),
        }
    }
}

impl From<i64> for Datum {
    fn from(i: i64) -> Datum {
        Datum::Int64(i)
    }
}

impl From<&str> for Datum {
    fn from(s: &str) -> Datum {
        Datum::String(s.to_owned())
    }
}

impl From<bool> for Datum {
    fn from(b: bool) -> Datum {
        Datum::Bool(b)
    }
}

/// The non-empty version token carried by every replicated row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowVersion(String);

impl RowVersion {
    /// Validates and wraps a row version token.
    pub fn new(token: String) -> Result<RowVersion, RowError> {
        if token.is_empty() {
            return Err(RowError::InvalidVersion(token));
        }
        Ok(RowVersion(token))
    }

    /// The token as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RowVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An ordered map from column name to datum.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row {
    columns: BTreeMap<String, Datum>,
}

impl Row {
    /// Creates an empty row.
    pub fn new() -> Row {
        Row::default()
    }

    /// Builder-style column insertion, for tests and fixtures.
    pub fn with_column(mut self, name: impl Into<String>, datum: impl Into<Datum>) -> Row {
        self.columns.insert(name.into(), datum.into());
        self
    }

    /// Inserts a column, replacing any existing datum.
    pub fn insert(&mut self, name: impl Into<String>, datum: Datum) {
        self.columns.insert(name.into(), datum);
    }

    /// Returns the datum for `name`, if present.
    pub fn get(&self, name: &str) -> Option<&Datum> {
        self.columns.get(name)
    }

    /// Whether the row has a column named `name`.
    pub fn contains_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    /// Iterates over `(column, datum)` pairs in column order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Datum)> {
        self.columns.iter()
    }

    /// The number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Whether the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Checks that the row carries a valid [`ROW_VERSION_COLUMN`] without
    /// consuming it.
    pub fn validate_version(&self) -> Result<(), RowError> {
        match self.columns.get(ROW_VERSION_COLUMN) {
            None => Err(RowError::MissingVersion),
            Some(Datum::String(token)) if !token.is_empty() => Ok(()),
            Some(other) => Err(RowError::InvalidVersion(format!("{other:?}"))),
        }
    }

    /// Splits off the [`ROW_VERSION_COLUMN`], returning the remaining
    /// contents and the validated version token.
    ///
    /// Every row that reaches the CVR must have passed through here: stored
    /// and poked rows never carry the version column inline.
    pub fn take_version(mut self) -> Result<(Row, RowVersion), RowError> {
        match self.columns.remove(ROW_VERSION_COLUMN) {
            None => Err(RowError::MissingVersion),
            Some(Datum::String(token)) => Ok((self, RowVersion::new(token)?)),
            Some(other) => Err(RowError::InvalidVersion(format!("{other:?}"))),
        }
    }

    /// Converts the row into a JSON object for the wire or jsonb storage.
    pub fn into_json(self) -> Result<serde_json::Value, RowError> {
        let mut map = serde_json::Map::new();
        for (name, datum) in self.columns {
            let value = datum.into_json(&name)?;
            map.insert(name, value);
        }
        Ok(serde_json::Value::Object(map))
    }

    /// Reconstructs a row from a JSON object. Non-object values produce an
    /// empty row; the caller is expected to have stored objects only.
    pub fn from_json(value: serde_json::Value) -> Row {
        let mut row = Row::new();
        if let serde_json::Value::Object(map) = value {
            for (name, value) in map {
                row.insert(name, Datum::from_json(value));
            }
        }
        row
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_version() {
        let row = Row::new()
            .with_column("id", 3)
            .with_column(ROW_VERSION_COLUMN, "0a");
        let (contents, version) = row.take_version().unwrap();
        assert_eq!(version.as_str(), "0a");
        assert!(!contents.contains_column(ROW_VERSION_COLUMN));
        assert_eq!(contents.get("id"), Some(&Datum::Int64(3)));
    }

    #[test]
    fn test_take_version_missing() {
        let err = Row::new().with_column("id", 3).take_version().unwrap_err();
        assert_eq!(err, RowError::MissingVersion);
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_take_version_empty() {
        let err = Row::new()
            .with_column(ROW_VERSION_COLUMN, "")
            .take_version()
            .unwrap_err();
        assert_eq!(err, RowError::InvalidVersion(String::new()));
    }

    #[test]
    fn test_json_round_trip() {
        let row = Row::new()
            .with_column("id", 3)
            .with_column("title", "baz")
            .with_column("closed", false)
            .with_column("meta", Datum::Json(serde_json::json!({"a": [1, 2]})));
        let json = row.clone().into_json().unwrap();
        assert_eq!(Row::from_json(json), row);
    }

    #[test]
    fn test_unsafe_integer_rejected() {
        let row = Row::new().with_column("big", (1i64 << 53) + 1);
        let err = row.into_json().unwrap_err();
        assert!(matches!(err, RowError::NumericOutOfRange(_, ref c) if c == "big"));
    }
}
