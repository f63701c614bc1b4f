// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The replica boundary.
//!
//! The logical-replication ingester that populates the replica is an
//! external collaborator; the driver sees it through the [`Replica`] trait.
//! A replica holds versioned table snapshots and a queue of atomically
//! ingested deltas. [`MemoryReplica`] is the in-process implementation used
//! by tests and local development.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use vp_repr::{Row, StateVersion};

/// One replicated change to one row. `row` is the row's new state, or
/// `None` if the row was deleted upstream.
#[derive(Debug, Clone)]
pub struct TableChange {
    /// The changed row's schema.
    pub schema: String,
    /// The changed row's table.
    pub table: String,
    /// The changed row's primary key.
    pub key: serde_json::Value,
    /// The row's new state, including its version column.
    pub row: Option<Row>,
}

/// One atomically ingested replication step.
#[derive(Debug, Clone)]
pub struct ReplicaDelta {
    /// The state version the replica reaches by applying this delta.
    pub version: StateVersion,
    /// The changed rows.
    pub changes: Vec<TableChange>,
}

/// Read access to the local replica.
///
/// `scan` and `get_row` observe the replica as of the last applied delta;
/// `next_delta` applies the next queued delta before returning it, so a
/// caller that processes the returned changes sees `get_row` agree with
/// them.
pub trait Replica: Send + Sync {
    /// The version at which this replica was initially synced from
    /// upstream. Changes when the replica is re-provisioned, invalidating
    /// every CVR built against the old lineage.
    fn replica_version(&self) -> StateVersion;

    /// The version of the last applied delta.
    fn current_version(&self) -> StateVersion;

    /// The columns of `schema.table`, or `None` if the table does not
    /// exist.
    fn table_columns(&self, schema: &str, table: &str) -> Option<Vec<String>>;

    /// Iterates over every `(key, row)` of `schema.table`.
    fn scan<'a>(
        &'a self,
        schema: &str,
        table: &str,
    ) -> Box<dyn Iterator<Item = (serde_json::Value, Row)> + 'a>;

    /// Point lookup of one row.
    fn get_row(&self, schema: &str, table: &str, key: &serde_json::Value) -> Option<Row>;

    /// Applies and returns the next queued delta, or `None` if the replica
    /// is idle.
    fn next_delta(&mut self) -> Option<ReplicaDelta>;
}

#[derive(Debug, Default, Clone)]
struct Table {
    columns: Vec<String>,
    // Keyed by canonical key text so scans are deterministic.
    rows: BTreeMap<String, (serde_json::Value, Row)>,
}

/// A [`Replica`] holding everything in process memory.
#[derive(Debug)]
pub struct MemoryReplica {
    replica_version: StateVersion,
    version: StateVersion,
    tables: BTreeMap<(String, String), Table>,
    pending: VecDeque<ReplicaDelta>,
}

impl MemoryReplica {
    /// Creates a replica initially synced at `version`.
    pub fn new(version: StateVersion) -> MemoryReplica {
        MemoryReplica {
            replica_version: version.clone(),
            version,
            tables: BTreeMap::new(),
            pending: VecDeque::new(),
        }
    }

    /// Creates `schema.table` with the given columns.
    pub fn create_table(
        &mut self,
        schema: impl Into<String>,
        table: impl Into<String>,
        columns: &[&str],
    ) {
        self.tables.insert(
            (schema.into(), table.into()),
            Table {
                columns: columns.iter().map(|c| (*c).to_owned()).collect(),
                rows: BTreeMap::new(),
            },
        );
    }

    /// Writes a row directly into the current snapshot, bypassing the delta
    /// queue. For seeding initial state.
    pub fn seed_row(
        &mut self,
        schema: &str,
        table: &str,
        key: serde_json::Value,
        row: Row,
    ) {
        let t = self
            .tables
            .get_mut(&(schema.to_owned(), table.to_owned()))
            .expect("seeding a table that was never created");
        t.rows.insert(key.to_string(), (key, row));
    }

    /// Queues a delta for a later `next_delta` call.
    pub fn ingest(&mut self, delta: ReplicaDelta) {
        self.pending.push_back(delta);
    }

    /// Whether any deltas are queued.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

impl Replica for MemoryReplica {
    fn replica_version(&self) -> StateVersion {
        self.replica_version.clone()
    }

    fn current_version(&self) -> StateVersion {
        self.version.clone()
    }

    fn table_columns(&self, schema: &str, table: &str) -> Option<Vec<String>> {
        self.tables
            .get(&(schema.to_owned(), table.to_owned()))
            .map(|t| t.columns.clone())
    }

    fn scan<'a>(
        &'a self,
        schema: &str,
        table: &str,
    ) -> Box<dyn Iterator<Item = (serde_json::Value, Row)> + 'a> {
        match self.tables.get(&(schema.to_owned(), table.to_owned())) {
            Some(t) => Box::new(t.rows.values().cloned()),
            None => Box::new(std::iter::empty()),
        }
    }

    fn get_row(&self, schema: &str, table: &str, key: &serde_json::Value) -> Option<Row> {
        self.tables
            .get(&(schema.to_owned(), table.to_owned()))?
            .rows
            .get(&key.to_string())
            .map(|(_, row)| row.clone())
    }

    fn next_delta(&mut self) -> Option<ReplicaDelta> {
        let delta = self.pending.pop_front()?;
        debug_assert!(
            delta.version > self.version,
            "deltas must advance the replica"
        );
        for change in &delta.changes {
            let table = self
                .tables
                .get_mut(&(change.schema.clone(), change.table.clone()))
                .expect("delta for a table that was never created");
            match &change.row {
                Some(row) => {
                    table
                        .rows
                        .insert(change.key.to_string(), (change.key.clone(), row.clone()));
                }
                None => {
                    table.rows.remove(&change.key.to_string());
                }
            }
        }
        self.version = delta.version.clone();
        Some(delta)
    }
}

/// A shared handle on a [`MemoryReplica`], for embedders (and tests) that
/// keep ingesting deltas while the driver owns the replica end.
impl Replica for Arc<Mutex<MemoryReplica>> {
    fn replica_version(&self) -> StateVersion {
        self.lock().expect("poisoned").replica_version()
    }

    fn current_version(&self) -> StateVersion {
        self.lock().expect("poisoned").current_version()
    }

    fn table_columns(&self, schema: &str, table: &str) -> Option<Vec<String>> {
        self.lock().expect("poisoned").table_columns(schema, table)
    }

    fn scan<'a>(
        &'a self,
        schema: &str,
        table: &str,
    ) -> Box<dyn Iterator<Item = (serde_json::Value, Row)> + 'a> {
        let rows: Vec<_> = self.lock().expect("poisoned").scan(schema, table).collect();
        Box::new(rows.into_iter())
    }

    fn get_row(&self, schema: &str, table: &str, key: &serde_json::Value) -> Option<Row> {
        self.lock().expect("poisoned").get_row(schema, table, key)
    }

    fn next_delta(&mut self) -> Option<ReplicaDelta> {
        self.lock().expect("poisoned").next_delta()
    }
}
