// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Compiled query specifications.
//!
//! The view syncer does not parse SQL. Clients ship queries in an already
//! compiled form: a table plus an optional predicate. The spec is a plain
//! value; evaluation lives with the pipeline driver that owns table
//! metadata.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Datum, Row};

/// A compiled query: one table, optionally filtered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    /// The schema of the queried table.
    #[serde(default = "default_schema")]
    pub schema: String,
    /// The queried table.
    pub table: String,
    /// The predicate rows must satisfy, or `None` for the whole table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Predicate>,
}

fn default_schema() -> String {
    "public".into()
}

impl QuerySpec {
    /// A query selecting every row of `table` in the default schema.
    pub fn table(table: impl Into<String>) -> QuerySpec {
        QuerySpec {
            schema: default_schema(),
            table: table.into(),
            filter: None,
        }
    }

    /// Adds a filter to this query.
    pub fn with_filter(mut self, filter: Predicate) -> QuerySpec {
        self.filter = Some(filter);
        self
    }

    /// The stable identifier of this query's normalized form.
    ///
    /// Queries with equal transformation hashes produce byte-equal result
    /// sets, so a stored hash matching a live one means re-hydration can
    /// reuse the stored row set.
    pub fn transformation_hash(&self) -> String {
        let encoded = serde_json::to_string(self).expect("query specs are always serializable");
        let digest: [u8; 32] = Sha256::digest(encoded.as_bytes()).into();
        let mut out = String::with_capacity(64);
        for byte in digest {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }
}

/// A predicate over one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Predicate {
    /// The column equals the value.
    Eq {
        /// The filtered column.
        column: String,
        /// The value to compare against.
        value: Datum,
    },
    /// The column equals one of the values.
    In {
        /// The filtered column.
        column: String,
        /// The accepted values.
        values: Vec<Datum>,
    },
}

impl Predicate {
    /// The column this predicate filters on.
    pub fn column(&self) -> &str {
        match self {
            Predicate::Eq { column, .. } | Predicate::In { column, .. } => column,
        }
    }

    /// Whether `row` satisfies this predicate. A missing column never
    /// matches; column existence is validated when the query is added.
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Predicate::Eq { column, value } => row.get(column) == Some(value),
            Predicate::In { column, values } => match row.get(column) {
                Some(datum) => values.contains(datum),
                None => false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issues_by_id(ids: &[i64]) -> QuerySpec {
        QuerySpec::table("issues").with_filter(Predicate::In {
            column: "id".into(),
            values: ids.iter().copied().map(Datum::Int64).collect(),
        })
    }

    #[test]
    fn test_predicate_matches() {
        let spec = issues_by_id(&[1, 2, 3, 4]);
        let hit = Row::new().with_column("id", 3);
        let miss = Row::new().with_column("id", 5);
        let filter = spec.filter.unwrap();
        assert!(filter.matches(&hit));
        assert!(!filter.matches(&miss));
        assert!(!filter.matches(&Row::new()));
    }

    #[test]
    fn test_transformation_hash_is_stable() {
        let a = issues_by_id(&[1, 2, 3, 4]);
        let b = issues_by_id(&[1, 2, 3, 4]);
        let c = issues_by_id(&[1, 2, 3]);
        assert_eq!(a.transformation_hash(), b.transformation_hash());
        assert_ne!(a.transformation_hash(), c.transformation_hash());
        assert_eq!(a.transformation_hash().len(), 64);
    }

    #[test]
    fn test_spec_round_trips_through_json() {
        let spec = issues_by_id(&[7]);
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(serde_json::from_value::<QuerySpec>(json).unwrap(), spec);
    }
}
