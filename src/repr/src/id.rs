// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Identifiers.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies a client group: the set of clients sharing one CVR.
pub type ClientGroupId = String;

/// Identifies one client within a group.
pub type ClientId = String;

/// The stable hash identifying a query, assigned by the client.
pub type QueryHash = String;

/// The canonical identity of a row: its fingerprint.
///
/// The key is JSON so that composite and non-string primary keys round-trip
/// through storage and the wire unchanged. Ordering is over
/// `(schema, table, canonical key text)`, which is what gives catch-up scans
/// their deterministic tie-break.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowId {
    /// The schema of the row's table.
    pub schema: String,
    /// The row's table.
    pub table: String,
    /// The row's primary key, as a JSON value.
    pub key: serde_json::Value,
}

impl RowId {
    /// Creates a fingerprint for a row in `schema.table`.
    pub fn new(schema: impl Into<String>, table: impl Into<String>, key: serde_json::Value) -> RowId {
        RowId {
            schema: schema.into(),
            table: table.into(),
            key,
        }
    }

    /// The canonical text of the key. serde_json maps are ordered, so equal
    /// keys always produce equal text.
    pub fn key_text(&self) -> String {
        self.key.to_string()
    }
}

impl Ord for RowId {
    fn cmp(&self, other: &Self) -> Ordering {
        (&self.schema, &self.table)
            .cmp(&(&other.schema, &other.table))
            .then_with(|| self.key_text().cmp(&other.key_text()))
    }
}

impl PartialOrd for RowId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}/{}", self.schema, self.table, self.key)
    }
}
