// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The pipeline driver.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use vp_repr::{QueryHash, QuerySpec, Row, RowId};

use crate::{PipelineError, Replica};

/// One incremental change: `query_hash` now includes (`row` present) or
/// excludes (`row` absent) the row identified by `row_id`.
///
/// An in-place update of a row that stays in a query surfaces as an exclude
/// immediately followed by an include carrying the new contents; reference
/// counts net out and the contents flow through.
#[derive(Debug, Clone)]
pub struct RowChange {
    /// The query whose membership changed.
    pub query_hash: QueryHash,
    /// The affected row.
    pub row_id: RowId,
    /// The row's contents (including its version column), or `None` if the
    /// row left the query.
    pub row: Option<Row>,
}

/// The result of one pipeline advancement.
#[derive(Debug)]
pub struct Advancement {
    /// The state version the pipeline reached.
    pub version: vp_repr::StateVersion,
    /// The number of upstream changes consumed.
    pub num_changes: usize,
    /// The per-query membership changes.
    pub changes: Vec<RowChange>,
}

#[derive(Debug)]
struct QueryState {
    spec: QuerySpec,
    // Canonical key texts of the rows currently in the query.
    membership: BTreeSet<String>,
}

/// Maintains the registered queries incrementally against the replica.
///
/// The driver is single-caller by construction: only the view syncer's
/// lock-holding run loop touches it.
pub struct PipelineDriver {
    replica: Box<dyn Replica>,
    queries: BTreeMap<QueryHash, QueryState>,
    initialized: bool,
}

impl std::fmt::Debug for PipelineDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineDriver")
            .field("queries", &self.queries.keys().collect::<Vec<_>>())
            .field("initialized", &self.initialized)
            .finish_non_exhaustive()
    }
}

impl PipelineDriver {
    /// Creates a driver over `replica`. No queries are registered and the
    /// driver is uninitialized until [`PipelineDriver::init`].
    pub fn new(replica: Box<dyn Replica>) -> PipelineDriver {
        PipelineDriver {
            replica,
            queries: BTreeMap::new(),
            initialized: false,
        }
    }

    /// Idempotently starts the driver.
    pub fn init(&mut self) {
        if !self.initialized {
            debug!(version = %self.replica.current_version(), "pipeline initialized");
            self.initialized = true;
        }
    }

    /// Whether [`PipelineDriver::init`] has run.
    pub fn initialized(&self) -> bool {
        self.initialized
    }

    /// The version at which the replica was initially synced; identifies
    /// the replica lineage.
    pub fn replica_version(&self) -> vp_repr::StateVersion {
        self.replica.replica_version()
    }

    /// The state version the pipeline has fully applied.
    pub fn current_version(&self) -> vp_repr::StateVersion {
        self.replica.current_version()
    }

    /// The hashes of the registered queries.
    pub fn added_queries(&self) -> BTreeSet<QueryHash> {
        self.queries.keys().cloned().collect()
    }

    /// Checks that `spec` can run against the replica: its table exists and
    /// its filter references a real column. Usable before `init`, so bad
    /// queries can be rejected at the RPC boundary before anything is
    /// recorded.
    pub fn validate_query(&self, spec: &QuerySpec) -> Result<(), PipelineError> {
        let columns = self
            .replica
            .table_columns(&spec.schema, &spec.table)
            .ok_or_else(|| PipelineError::UnknownTable {
                schema: spec.schema.clone(),
                table: spec.table.clone(),
            })?;
        if let Some(filter) = &spec.filter {
            if !columns.iter().any(|c| c == filter.column()) {
                return Err(PipelineError::UnknownColumn {
                    schema: spec.schema.clone(),
                    table: spec.table.clone(),
                    column: filter.column().to_owned(),
                });
            }
        }
        Ok(())
    }

    /// Registers `spec` under `hash` and hydrates it, yielding one include
    /// per matching row in the current snapshot.
    pub fn add_query(
        &mut self,
        hash: &QueryHash,
        spec: &QuerySpec,
    ) -> Result<Vec<RowChange>, PipelineError> {
        if !self.initialized {
            return Err(PipelineError::NotInitialized);
        }
        if self.queries.contains_key(hash) {
            return Err(PipelineError::DuplicateQuery(hash.clone()));
        }
        self.validate_query(spec)?;

        let mut membership = BTreeSet::new();
        let mut changes = Vec::new();
        for (key, row) in self.replica.scan(&spec.schema, &spec.table) {
            if spec.filter.as_ref().is_some_and(|f| !f.matches(&row)) {
                continue;
            }
            let row_id = RowId::new(spec.schema.clone(), spec.table.clone(), key);
            membership.insert(row_id.key_text());
            changes.push(RowChange {
                query_hash: hash.clone(),
                row_id,
                row: Some(row),
            });
        }
        debug!(query = %hash, rows = changes.len(), "hydrated query");
        self.queries.insert(
            hash.clone(),
            QueryState {
                spec: spec.clone(),
                membership,
            },
        );
        Ok(changes)
    }

    /// Drops the query registered under `hash`; later advancements will not
    /// mention it. Dropping an unregistered hash is a no-op.
    pub fn remove_query(&mut self, hash: &QueryHash) {
        self.queries.remove(hash);
    }

    /// Consumes the next replication delta, diffing each changed row
    /// against every registered query's membership. Returns `None` when the
    /// replica has nothing queued (version signals may coalesce).
    pub fn advance(&mut self) -> Result<Option<Advancement>, PipelineError> {
        if !self.initialized {
            return Err(PipelineError::NotInitialized);
        }
        let prior = self.replica.current_version();
        let Some(delta) = self.replica.next_delta() else {
            return Ok(None);
        };
        if delta.version <= prior {
            return Err(PipelineError::Advance(format!(
                "replica produced delta {} at or before {prior}",
                delta.version
            )));
        }
        let mut changes = Vec::new();
        for change in &delta.changes {
            for (hash, state) in &mut self.queries {
                if state.spec.schema != change.schema || state.spec.table != change.table {
                    continue;
                }
                let row_id = RowId::new(
                    change.schema.clone(),
                    change.table.clone(),
                    change.key.clone(),
                );
                let key_text = row_id.key_text();
                let was_member = state.membership.contains(&key_text);
                let now_member = change
                    .row
                    .as_ref()
                    .is_some_and(|row| state.spec.filter.as_ref().map_or(true, |f| f.matches(row)));
                match (was_member, now_member) {
                    (false, false) => {}
                    (false, true) => {
                        state.membership.insert(key_text);
                        changes.push(RowChange {
                            query_hash: hash.clone(),
                            row_id,
                            row: change.row.clone(),
                        });
                    }
                    (true, false) => {
                        state.membership.remove(&key_text);
                        changes.push(RowChange {
                            query_hash: hash.clone(),
                            row_id,
                            row: None,
                        });
                    }
                    (true, true) => {
                        // In-place update: exclude then include, so the
                        // refcount nets out and the contents flow through.
                        changes.push(RowChange {
                            query_hash: hash.clone(),
                            row_id: row_id.clone(),
                            row: None,
                        });
                        changes.push(RowChange {
                            query_hash: hash.clone(),
                            row_id,
                            row: change.row.clone(),
                        });
                    }
                }
            }
        }
        Ok(Some(Advancement {
            version: delta.version,
            num_changes: delta.changes.len(),
            changes,
        }))
    }

    /// Point lookup against the current snapshot, used by catch-up to
    /// materialize row contents.
    pub fn get_row(&self, schema: &str, table: &str, key: &serde_json::Value) -> Option<Row> {
        self.replica.get_row(schema, table, key)
    }
}

#[cfg(test)]
mod tests {
    use vp_repr::{Datum, Predicate, StateVersion, ROW_VERSION_COLUMN};

    use crate::{MemoryReplica, ReplicaDelta, TableChange};

    use super::*;

    fn issue(id: i64, title: &str, version: &str) -> Row {
        Row::new()
            .with_column("id", id)
            .with_column("title", title)
            .with_column(ROW_VERSION_COLUMN, version)
    }

    fn issues_by_id(ids: &[i64]) -> QuerySpec {
        QuerySpec::table("issues").with_filter(Predicate::In {
            column: "id".into(),
            values: ids.iter().copied().map(Datum::Int64).collect(),
        })
    }

    fn replica_with_issues() -> MemoryReplica {
        let mut replica = MemoryReplica::new(StateVersion::parse("1xz").unwrap());
        replica.create_table("public", "issues", &["id", "title", ROW_VERSION_COLUMN]);
        for id in 1..=5 {
            replica.seed_row(
                "public",
                "issues",
                serde_json::json!({"id": id}),
                issue(id, "hello", "0a"),
            );
        }
        replica
    }

    fn driver() -> PipelineDriver {
        let mut driver = PipelineDriver::new(Box::new(replica_with_issues()));
        driver.init();
        driver
    }

    #[test]
    fn test_hydration_yields_matching_rows() {
        let mut driver = driver();
        let changes = driver
            .add_query(&"qH".to_owned(), &issues_by_id(&[1, 2, 3, 4]))
            .unwrap();
        assert_eq!(changes.len(), 4);
        assert!(changes.iter().all(|c| c.row.is_some()));
        assert_eq!(driver.added_queries().len(), 1);
    }

    #[test]
    fn test_unknown_column_is_rejected() {
        let mut driver = driver();
        let spec = QuerySpec::table("issues").with_filter(Predicate::Eq {
            column: "nope".into(),
            value: Datum::Int64(1),
        });
        let err = driver.add_query(&"qH".to_owned(), &spec).unwrap_err();
        assert_eq!(err.kind(), vp_repr::ErrorKind::BadQuery);
        assert!(driver.added_queries().is_empty());
    }

    #[test]
    fn test_advance_update_nets_out() {
        let mut replica = replica_with_issues();
        replica.ingest(ReplicaDelta {
            version: StateVersion::parse("1y0").unwrap(),
            changes: vec![TableChange {
                schema: "public".into(),
                table: "issues".into(),
                key: serde_json::json!({"id": 3}),
                row: Some(issue(3, "baz", "0b")),
            }],
        });
        let mut driver = PipelineDriver::new(Box::new(replica));
        driver.init();
        driver
            .add_query(&"qH".to_owned(), &issues_by_id(&[1, 2, 3, 4]))
            .unwrap();

        let advancement = driver.advance().unwrap().unwrap();
        assert_eq!(advancement.version, StateVersion::parse("1y0").unwrap());
        assert_eq!(advancement.num_changes, 1);
        // Exclude then include for the same row.
        assert_eq!(advancement.changes.len(), 2);
        assert!(advancement.changes[0].row.is_none());
        assert!(advancement.changes[1].row.is_some());
        // The driver's snapshot agrees with the delta it just returned.
        let row = driver
            .get_row("public", "issues", &serde_json::json!({"id": 3}))
            .unwrap();
        assert_eq!(row.get("title"), Some(&Datum::String("baz".into())));
    }

    #[test]
    fn test_advance_row_leaves_query() {
        let mut replica = replica_with_issues();
        replica.ingest(ReplicaDelta {
            version: StateVersion::parse("1y0").unwrap(),
            changes: vec![TableChange {
                schema: "public".into(),
                table: "issues".into(),
                key: serde_json::json!({"id": 3}),
                row: Some(issue(99, "moved", "0b")),
            }],
        });
        let mut driver = PipelineDriver::new(Box::new(replica));
        driver.init();
        driver
            .add_query(&"qH".to_owned(), &issues_by_id(&[1, 2, 3, 4]))
            .unwrap();

        let advancement = driver.advance().unwrap().unwrap();
        assert_eq!(advancement.changes.len(), 1);
        assert!(advancement.changes[0].row.is_none());
    }

    // Membership bookkeeping agrees with a brute-force evaluation of the
    // filter over the final table state, for any sequence of upserts and
    // deletes applied one delta at a time.
    mod membership {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #[test]
            fn prop_membership_tracks_filter(
                ops in proptest::collection::vec((1i64..8, proptest::option::of(0i64..8)), 1..25),
            ) {
                let replica = std::sync::Arc::new(std::sync::Mutex::new(replica_with_issues()));
                let mut driver = PipelineDriver::new(Box::new(std::sync::Arc::clone(&replica)));
                driver.init();

                // Net membership according to the emitted changes.
                let mut live: std::collections::BTreeSet<String> = driver
                    .add_query(&"qH".to_owned(), &issues_by_id(&[1, 2, 3, 4]))
                    .unwrap()
                    .iter()
                    .map(|change| change.row_id.key_text())
                    .collect();

                let mut state = 1000u64;
                for (key_id, new_id) in &ops {
                    state += 1;
                    let row = new_id.map(|id| issue(id, "x", &format!("0{state}")));
                    replica.lock().unwrap().ingest(ReplicaDelta {
                        version: StateVersion::parse(&format!("2{}", vp_repr::to_lexi(state)))
                            .unwrap(),
                        changes: vec![TableChange {
                            schema: "public".into(),
                            table: "issues".into(),
                            key: serde_json::json!({"id": key_id}),
                            row,
                        }],
                    });
                    let advancement = driver.advance().unwrap().unwrap();
                    for change in &advancement.changes {
                        let key = change.row_id.key_text();
                        if change.row.is_some() {
                            live.insert(key);
                        } else {
                            live.remove(&key);
                        }
                    }
                }

                // Brute force: which keyed rows currently satisfy the filter?
                let expected: std::collections::BTreeSet<String> = (1..8)
                    .filter_map(|key_id| {
                        let key = serde_json::json!({"id": key_id});
                        let row = driver.get_row("public", "issues", &key)?;
                        issues_by_id(&[1, 2, 3, 4])
                            .filter
                            .unwrap()
                            .matches(&row)
                            .then(|| key.to_string())
                    })
                    .collect();
                prop_assert_eq!(live, expected);
            }
        }
    }

    #[test]
    fn test_remove_query_silences_changes() {
        let mut replica = replica_with_issues();
        replica.ingest(ReplicaDelta {
            version: StateVersion::parse("1y0").unwrap(),
            changes: vec![TableChange {
                schema: "public".into(),
                table: "issues".into(),
                key: serde_json::json!({"id": 3}),
                row: Some(issue(3, "baz", "0b")),
            }],
        });
        let mut driver = PipelineDriver::new(Box::new(replica));
        driver.init();
        driver
            .add_query(&"qH".to_owned(), &issues_by_id(&[1, 2, 3, 4]))
            .unwrap();
        driver.remove_query(&"qH".to_owned());

        let advancement = driver.advance().unwrap().unwrap();
        assert_eq!(advancement.num_changes, 1);
        assert!(advancement.changes.is_empty());
    }
}
