// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! CVR updaters.
//!
//! All CVR mutation flows through one of two builders. The config-driven
//! updater handles client and desired-query membership changes and bumps the
//! minor version. The query-driven updater applies pipeline row changes at
//! the pipeline's state version. Both stage changes against an immutable
//! snapshot; nothing is visible to anyone until `flush` commits the staged
//! write set atomically and returns the successor snapshot.

use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;

use vp_base::now::NowFn;
use vp_repr::{ClientId, CvrVersion, QueryHash, QuerySpec, RowId, StateVersion};

use crate::store::{CvrStore, StagedWrite};
use crate::{
    ClientRecord, ConfigPatch, CvrError, CvrSnapshot, DesireState, PatchOp, QueryRecord,
    RowRecord, RowUpdate, VersionedConfigPatch, VersionedRowPatch,
};

/// Stages client and desired-query membership changes against a CVR
/// snapshot.
///
/// Config changes never touch rows: the reconciler later converges the
/// pipeline (and row set) to the new desired set via a [`QueryUpdater`].
#[derive(Debug)]
pub struct ConfigUpdater {
    base_version: CvrVersion,
    cvr: CvrSnapshot,
    version: CvrVersion,
    patches: Vec<VersionedConfigPatch>,
    changed_clients: BTreeSet<ClientId>,
    deleted_clients: BTreeMap<ClientId, ClientRecord>,
    changed_queries: BTreeSet<QueryHash>,
    dirty: bool,
}

impl ConfigUpdater {
    /// Creates an updater staging against `base`. The staged version is the
    /// minor-version successor; it is only assigned if something actually
    /// changes.
    pub fn new(base: &CvrSnapshot) -> ConfigUpdater {
        ConfigUpdater {
            base_version: base.version.clone(),
            cvr: base.clone(),
            version: base.version.bump_minor(),
            patches: Vec::new(),
            changed_clients: BTreeSet::new(),
            deleted_clients: BTreeMap::new(),
            changed_queries: BTreeSet::new(),
            dirty: false,
        }
    }

    /// The version staged changes will land at.
    pub fn updated_version(&self) -> &CvrVersion {
        &self.version
    }

    /// Ensures a client record exists for `client_id`, creating it (and its
    /// put patch) if this is the client's first appearance.
    pub fn put_client(&mut self, client_id: &ClientId) {
        if self.cvr.clients.contains_key(client_id) {
            return;
        }
        self.dirty = true;
        self.cvr.clients.insert(
            client_id.clone(),
            ClientRecord {
                id: client_id.clone(),
                patch_version: self.version.clone(),
                desired_query_ids: Vec::new(),
            },
        );
        self.changed_clients.insert(client_id.clone());
        self.patches.push(VersionedConfigPatch {
            version: self.version.clone(),
            patch: ConfigPatch::Client {
                op: PatchOp::Put,
                client_id: client_id.clone(),
            },
        });
    }

    /// Marks each query in `queries` as desired by `client_id`, adding the
    /// client and any unknown queries to the CVR. Returns the `(hash, spec)`
    /// pairs that were not previously tracked.
    pub fn put_desired_queries(
        &mut self,
        client_id: &ClientId,
        queries: &[(QueryHash, QuerySpec)],
    ) -> Vec<(QueryHash, QuerySpec)> {
        self.put_client(client_id);
        let mut newly_added = Vec::new();
        for (hash, spec) in queries {
            let query = self.cvr.queries.entry(hash.clone()).or_insert_with(|| {
                newly_added.push((hash.clone(), spec.clone()));
                QueryRecord::new(hash.clone(), spec.clone())
            });
            let already_desired = query
                .desired_by
                .get(client_id)
                .is_some_and(|d| !d.deleted);
            if already_desired {
                continue;
            }
            self.dirty = true;
            query.desired_by.insert(
                client_id.clone(),
                DesireState {
                    patch_version: self.version.clone(),
                    deleted: false,
                },
            );
            self.changed_queries.insert(hash.clone());
            let client = self
                .cvr
                .clients
                .get_mut(client_id)
                .expect("ensured above");
            if let Err(pos) = client.desired_query_ids.binary_search(hash) {
                client.desired_query_ids.insert(pos, hash.clone());
            }
            self.changed_clients.insert(client_id.clone());
            self.patches.push(VersionedConfigPatch {
                version: self.version.clone(),
                patch: ConfigPatch::DesiredQuery {
                    op: PatchOp::Put,
                    client_id: client_id.clone(),
                    hash: hash.clone(),
                    spec: Some(spec.clone()),
                },
            });
        }
        newly_added
    }

    /// Withdraws `client_id`'s desire for each query in `hashes`. Queries
    /// left with no desirers become removable; the query-driven updater
    /// performs the removal once the pipeline has dropped them.
    pub fn delete_desired_queries(&mut self, client_id: &ClientId, hashes: &[QueryHash]) {
        for hash in hashes {
            let Some(query) = self.cvr.queries.get_mut(hash) else {
                continue;
            };
            let live = query
                .desired_by
                .get(client_id)
                .is_some_and(|d| !d.deleted);
            if !live {
                continue;
            }
            self.dirty = true;
            query.desired_by.insert(
                client_id.clone(),
                DesireState {
                    patch_version: self.version.clone(),
                    deleted: true,
                },
            );
            self.changed_queries.insert(hash.clone());
            if let Some(client) = self.cvr.clients.get_mut(client_id) {
                if let Ok(pos) = client.desired_query_ids.binary_search(hash) {
                    client.desired_query_ids.remove(pos);
                    self.changed_clients.insert(client_id.clone());
                }
            }
            self.patches.push(VersionedConfigPatch {
                version: self.version.clone(),
                patch: ConfigPatch::DesiredQuery {
                    op: PatchOp::Del,
                    client_id: client_id.clone(),
                    hash: hash.clone(),
                    spec: None,
                },
            });
        }
    }

    /// Withdraws every desire of `client_id`.
    pub fn clear_desired_queries(&mut self, client_id: &ClientId) {
        let hashes = self
            .cvr
            .clients
            .get(client_id)
            .map(|c| c.desired_query_ids.clone())
            .unwrap_or_default();
        self.delete_desired_queries(client_id, &hashes);
    }

    /// Removes `client_id` from the group, withdrawing its desires.
    pub fn delete_client(&mut self, client_id: &ClientId) {
        self.clear_desired_queries(client_id);
        let Some(mut record) = self.cvr.clients.remove(client_id) else {
            return;
        };
        self.dirty = true;
        record.patch_version = self.version.clone();
        self.changed_clients.remove(client_id);
        self.deleted_clients.insert(client_id.clone(), record);
        self.patches.push(VersionedConfigPatch {
            version: self.version.clone(),
            patch: ConfigPatch::Client {
                op: PatchOp::Del,
                client_id: client_id.clone(),
            },
        });
    }

    /// Flushes the staged changes, returning the successor snapshot and the
    /// patches to broadcast. If nothing changed, the base snapshot is
    /// returned unchanged and nothing is written.
    pub async fn flush(
        mut self,
        store: &dyn CvrStore,
        now: &NowFn,
    ) -> Result<(CvrSnapshot, Vec<VersionedConfigPatch>), CvrError> {
        if !self.dirty {
            return Ok((self.cvr, Vec::new()));
        }
        self.cvr.version = self.version.clone();
        self.cvr.last_active = now.now();
        let mut writes = Vec::new();
        for client_id in &self.changed_clients {
            let record = self.cvr.clients[client_id].clone();
            writes.push(StagedWrite::Client {
                record,
                deleted: false,
            });
        }
        for record in self.deleted_clients.values() {
            writes.push(StagedWrite::Client {
                record: record.clone(),
                deleted: true,
            });
        }
        for hash in &self.changed_queries {
            let record = self.cvr.queries[hash].clone();
            writes.push(StagedWrite::Query {
                record,
                deleted: false,
            });
        }
        store.flush(&self.base_version, &self.cvr, &writes).await?;
        Ok((self.cvr, self.patches))
    }
}

/// Applies pipeline row changes and got-set transitions to a CVR snapshot.
///
/// One updater covers one poke cycle: `track_queries` first (if the query
/// set changed), any number of `received` calls, `delete_unreferenced_rows`
/// exactly once after the last `received`, then `flush`.
#[derive(Debug)]
pub struct QueryUpdater {
    base_version: CvrVersion,
    cvr: CvrSnapshot,
    version: CvrVersion,
    replica_version: StateVersion,
    // Queries removed or (re)hydrated this cycle. Their stored refcounts
    // are obsolete: a hydration reports a query's full row set, so the old
    // counts must not be added to.
    removed_or_executed: BTreeSet<QueryHash>,
    // Rows seen by `received` this cycle. The first touch of a row drops
    // its obsolete refcounts; rows never touched are settled by
    // `delete_unreferenced_rows`.
    touched_rows: BTreeSet<RowId>,
    changed_queries: BTreeSet<QueryHash>,
    deleted_query_records: Vec<QueryRecord>,
    changed_rows: BTreeSet<RowId>,
    deleted_unreferenced: bool,
}

impl QueryUpdater {
    /// Creates an updater for a pipeline at `state_version` over the replica
    /// lineage `replica_version`.
    ///
    /// The staged version advances the CVR to `state_version`, or bumps the
    /// minor version if the pipeline has not moved past the CVR. A pipeline
    /// behind the CVR is an invariant violation.
    pub fn new(
        base: &CvrSnapshot,
        state_version: StateVersion,
        replica_version: StateVersion,
    ) -> Result<QueryUpdater, CvrError> {
        if state_version < base.version.state_version {
            return Err(CvrError::Internal(format!(
                "pipeline at {state_version} lags cvr at {}",
                base.version.state_version
            )));
        }
        let version = base.version.advance_to(state_version);
        Ok(QueryUpdater {
            base_version: base.version.clone(),
            cvr: base.clone(),
            version,
            replica_version,
            removed_or_executed: BTreeSet::new(),
            touched_rows: BTreeSet::new(),
            changed_queries: BTreeSet::new(),
            deleted_query_records: Vec::new(),
            changed_rows: BTreeSet::new(),
            deleted_unreferenced: false,
        })
    }

    /// The version staged changes will land at.
    pub fn updated_version(&self) -> &CvrVersion {
        &self.version
    }

    /// Promotes `add` to got (recording their transformation hashes) and
    /// removes `remove` from the CVR, returning the got-set patches to
    /// include in the current poke.
    pub fn track_queries(
        &mut self,
        add: &[(QueryHash, String)],
        remove: &[QueryHash],
    ) -> Result<Vec<VersionedConfigPatch>, CvrError> {
        let mut patches = Vec::new();
        for (hash, transformation_hash) in add {
            let query = self.cvr.queries.get_mut(hash).ok_or_else(|| {
                CvrError::Internal(format!("tracking unknown query {hash}"))
            })?;
            query.transformation_hash = Some(transformation_hash.clone());
            query.transformation_version = Some(self.version.clone());
            query.patch_version = Some(self.version.clone());
            self.changed_queries.insert(hash.clone());
            self.removed_or_executed.insert(hash.clone());
            if !query.internal {
                patches.push(VersionedConfigPatch {
                    version: self.version.clone(),
                    patch: ConfigPatch::GotQuery {
                        op: PatchOp::Put,
                        hash: hash.clone(),
                        spec: Some(query.spec.clone()),
                    },
                });
            }
        }
        for hash in remove {
            let Some(mut query) = self.cvr.queries.remove(hash) else {
                continue;
            };
            let was_got = query.got();
            query.transformation_hash = None;
            query.transformation_version = None;
            query.patch_version = Some(self.version.clone());
            let internal = query.internal;
            self.changed_queries.remove(hash);
            self.deleted_query_records.push(query);
            self.removed_or_executed.insert(hash.clone());
            if was_got && !internal {
                patches.push(VersionedConfigPatch {
                    version: self.version.clone(),
                    patch: ConfigPatch::GotQuery {
                        op: PatchOp::Del,
                        hash: hash.clone(),
                        spec: None,
                    },
                });
            }
        }
        Ok(patches)
    }

    /// Merges a batch of row updates into the CVR, returning the row patches
    /// to include in the current poke.
    pub fn received(
        &mut self,
        rows: &BTreeMap<RowId, RowUpdate>,
    ) -> Result<Vec<VersionedRowPatch>, CvrError> {
        let mut patches = Vec::new();
        for (id, update) in rows {
            let existing = self.cvr.rows.get(id);
            let mut counts = existing
                .and_then(|r| r.ref_counts.clone())
                .unwrap_or_default();
            if self.touched_rows.insert(id.clone()) && !self.removed_or_executed.is_empty() {
                // First touch this cycle: counts for removed or re-hydrated
                // queries are obsolete; the hydration output replaces them.
                counts.retain(|hash, _| !self.removed_or_executed.contains(hash));
            }
            for (hash, delta) in &update.ref_counts {
                let current = i64::from(counts.get(hash).copied().unwrap_or(0)) + delta;
                if current > 0 {
                    let clamped = u32::try_from(current).unwrap_or_else(|_| {
                        warn!(row = ?id, query = %hash, "refcount overflow; clamping");
                        u32::MAX
                    });
                    counts.insert(hash.clone(), clamped);
                } else {
                    if current < 0 {
                        warn!(row = ?id, query = %hash, "refcount underflow; clamping to zero");
                    }
                    counts.remove(hash);
                }
            }
            if counts.is_empty() {
                // The row left its last query. Tombstone it, unless it was
                // never delivered (or already tombstoned).
                match existing {
                    Some(record) if record.referenced() => {
                        let tombstone = RowRecord {
                            id: id.clone(),
                            patch_version: self.version.clone(),
                            row_version: record.row_version.clone(),
                            ref_counts: None,
                        };
                        self.cvr.rows.insert(id.clone(), tombstone);
                        self.changed_rows.insert(id.clone());
                        patches.push(VersionedRowPatch {
                            version: self.version.clone(),
                            patch: crate::RowPatch::Del { id: id.clone() },
                        });
                    }
                    _ => {}
                }
                continue;
            }
            match &update.contents {
                Some(contents) => {
                    let row_version = update.version.clone().ok_or_else(|| {
                        CvrError::Internal(format!("row {id:?} has contents but no version"))
                    })?;
                    self.cvr.rows.insert(
                        id.clone(),
                        RowRecord {
                            id: id.clone(),
                            patch_version: self.version.clone(),
                            row_version: row_version.clone(),
                            ref_counts: Some(counts),
                        },
                    );
                    self.changed_rows.insert(id.clone());
                    patches.push(VersionedRowPatch {
                        version: self.version.clone(),
                        patch: crate::RowPatch::Put {
                            id: id.clone(),
                            contents: contents.clone(),
                            row_version,
                        },
                    });
                }
                None => match existing {
                    // A pure refcount change to a row the client already
                    // has: update the bookkeeping, emit nothing.
                    Some(record) if record.referenced() => {
                        let mut record = record.clone();
                        record.ref_counts = Some(counts);
                        self.cvr.rows.insert(id.clone(), record);
                        self.changed_rows.insert(id.clone());
                    }
                    _ => {
                        return Err(CvrError::Internal(format!(
                            "row {id:?} gained references without contents"
                        )));
                    }
                },
            }
        }
        Ok(patches)
    }

    /// Settles rows untouched by this cycle's `received` calls: their
    /// references to removed or re-hydrated queries are dropped, and rows
    /// left with no references are tombstoned with a del patch. Must be
    /// called exactly once, after the final `received` call.
    pub fn delete_unreferenced_rows(&mut self) -> Result<Vec<VersionedRowPatch>, CvrError> {
        if self.deleted_unreferenced {
            return Err(CvrError::Internal(
                "delete_unreferenced_rows called twice".into(),
            ));
        }
        self.deleted_unreferenced = true;
        if self.removed_or_executed.is_empty() {
            return Ok(Vec::new());
        }
        let mut patches = Vec::new();
        let ids: Vec<RowId> = self.cvr.rows.keys().cloned().collect();
        for id in ids {
            if self.touched_rows.contains(&id) {
                continue;
            }
            let record = self.cvr.rows.get_mut(&id).expect("key just listed");
            let Some(counts) = record.ref_counts.as_mut() else {
                continue;
            };
            let before = counts.len();
            counts.retain(|hash, _| !self.removed_or_executed.contains(hash));
            if counts.len() == before {
                continue;
            }
            self.changed_rows.insert(id.clone());
            if counts.is_empty() {
                record.ref_counts = None;
                record.patch_version = self.version.clone();
                patches.push(VersionedRowPatch {
                    version: self.version.clone(),
                    patch: crate::RowPatch::Del { id: id.clone() },
                });
            }
        }
        Ok(patches)
    }

    /// Flushes the staged changes, returning the successor snapshot.
    pub async fn flush(mut self, store: &dyn CvrStore, now: &NowFn) -> Result<CvrSnapshot, CvrError> {
        self.cvr.version = self.version.clone();
        self.cvr.last_active = now.now();
        self.cvr.replica_version = Some(self.replica_version.clone());
        let mut writes = Vec::new();
        for hash in &self.changed_queries {
            writes.push(StagedWrite::Query {
                record: self.cvr.queries[hash].clone(),
                deleted: false,
            });
        }
        for record in &self.deleted_query_records {
            writes.push(StagedWrite::Query {
                record: record.clone(),
                deleted: true,
            });
        }
        for id in &self.changed_rows {
            writes.push(StagedWrite::Row(self.cvr.rows[id].clone()));
        }
        store.flush(&self.base_version, &self.cvr, &writes).await?;
        Ok(self.cvr)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use vp_base::now::now_zero;
    use vp_repr::{QuerySpec, Row, RowVersion, StateVersion};

    use crate::{MemoryCvrStore, PatchOp, RowPatch};

    use super::*;

    fn sv(token: &str) -> StateVersion {
        StateVersion::parse(token).unwrap()
    }

    fn row_id(id: i64) -> RowId {
        RowId::new("public", "issues", serde_json::json!({"id": id}))
    }

    fn put_update(id: i64, hash: &str, row_version: &str) -> RowUpdate {
        RowUpdate {
            version: Some(RowVersion::new(row_version.into()).unwrap()),
            contents: Some(Row::new().with_column("id", id)),
            ref_counts: BTreeMap::from([(hash.to_owned(), 1)]),
        }
    }

    async fn cvr_with_desired_query(store: &MemoryCvrStore) -> CvrSnapshot {
        let base = store.load(&"g1".to_owned()).await.unwrap();
        let mut updater = ConfigUpdater::new(&base);
        updater.put_desired_queries(
            &"c1".to_owned(),
            &[("qH".to_owned(), QuerySpec::table("issues"))],
        );
        let (cvr, _) = updater.flush(store, &now_zero()).await.unwrap();
        cvr
    }

    #[tokio::test]
    async fn test_put_desired_queries_creates_client_and_query() {
        let store = MemoryCvrStore::new();
        let base = store.load(&"g1".to_owned()).await.unwrap();
        let mut updater = ConfigUpdater::new(&base);
        let newly = updater.put_desired_queries(
            &"c1".to_owned(),
            &[("qH".to_owned(), QuerySpec::table("issues"))],
        );
        assert_eq!(newly.len(), 1);
        let (cvr, patches) = updater.flush(&store, &now_zero()).await.unwrap();

        assert_eq!(cvr.version, base.version.bump_minor());
        assert_eq!(cvr.clients["c1"].desired_query_ids, vec!["qH".to_owned()]);
        let query = &cvr.queries["qH"];
        assert!(query.desired());
        assert!(!query.got());
        // One client put, one desired-query put.
        assert_eq!(patches.len(), 2);
        assert!(patches.iter().all(|p| p.version == cvr.version));

        // The flush is durable.
        let reloaded = store.load(&"g1".to_owned()).await.unwrap();
        assert_eq!(reloaded, cvr);
    }

    #[tokio::test]
    async fn test_put_desired_queries_is_idempotent_per_client() {
        let store = MemoryCvrStore::new();
        let cvr = cvr_with_desired_query(&store).await;
        let mut updater = ConfigUpdater::new(&cvr);
        let newly = updater.put_desired_queries(
            &"c1".to_owned(),
            &[("qH".to_owned(), QuerySpec::table("issues"))],
        );
        assert!(newly.is_empty());
        let (unchanged, patches) = updater.flush(&store, &now_zero()).await.unwrap();
        assert_eq!(unchanged.version, cvr.version);
        assert!(patches.is_empty());
    }

    #[tokio::test]
    async fn test_delete_desired_queries_makes_query_removable() {
        let store = MemoryCvrStore::new();
        let cvr = cvr_with_desired_query(&store).await;
        let mut updater = ConfigUpdater::new(&cvr);
        updater.delete_desired_queries(&"c1".to_owned(), &["qH".to_owned()]);
        let (cvr, patches) = updater.flush(&store, &now_zero()).await.unwrap();

        assert!(!cvr.queries["qH"].desired());
        assert!(cvr.clients["c1"].desired_query_ids.is_empty());
        assert_eq!(patches.len(), 1);
        assert!(matches!(
            &patches[0].patch,
            ConfigPatch::DesiredQuery { op: PatchOp::Del, hash, .. } if hash == "qH"
        ));
    }

    #[tokio::test]
    async fn test_delete_client_withdraws_its_desires() {
        let store = MemoryCvrStore::new();
        let cvr = cvr_with_desired_query(&store).await;
        let mut updater = ConfigUpdater::new(&cvr);
        updater.delete_client(&"c1".to_owned());
        let (cvr, patches) = updater.flush(&store, &now_zero()).await.unwrap();

        assert!(cvr.clients.is_empty());
        assert!(!cvr.queries["qH"].desired());
        assert!(patches.iter().any(|p| matches!(
            &p.patch,
            ConfigPatch::Client { op: PatchOp::Del, client_id } if client_id == "c1"
        )));

        // The tombstone survives for catch-up.
        let reloaded = store.load(&"g1".to_owned()).await.unwrap();
        assert!(reloaded.clients.is_empty());
    }

    #[tokio::test]
    async fn test_track_and_receive_rows() {
        let store = MemoryCvrStore::new();
        let cvr = cvr_with_desired_query(&store).await;
        let mut updater = QueryUpdater::new(&cvr, sv("1xz"), sv("1xz")).unwrap();
        assert_eq!(updater.updated_version().state_version, sv("1xz"));

        let got = updater
            .track_queries(&[("qH".to_owned(), "tH".to_owned())], &[])
            .unwrap();
        assert_eq!(got.len(), 1);
        assert!(matches!(
            &got[0].patch,
            ConfigPatch::GotQuery { op: PatchOp::Put, hash, .. } if hash == "qH"
        ));

        let rows = BTreeMap::from([(row_id(1), put_update(1, "qH", "0a"))]);
        let patches = updater.received(&rows).unwrap();
        assert_eq!(patches.len(), 1);
        assert!(matches!(&patches[0].patch, RowPatch::Put { .. }));
        assert!(updater.delete_unreferenced_rows().unwrap().is_empty());

        let cvr = updater.flush(&store, &now_zero()).await.unwrap();
        assert_eq!(cvr.consistency_check(), Ok(()));
        assert!(cvr.queries["qH"].got());
        let record = &cvr.rows[&row_id(1)];
        assert_eq!(record.ref_counts.as_ref().unwrap()["qH"], 1);
        assert_eq!(store.load(&"g1".to_owned()).await.unwrap(), cvr);
    }

    #[tokio::test]
    async fn test_row_leaving_last_query_becomes_tombstone() {
        let store = MemoryCvrStore::new();
        let cvr = cvr_with_desired_query(&store).await;
        let mut updater = QueryUpdater::new(&cvr, sv("1xz"), sv("1xz")).unwrap();
        updater
            .track_queries(&[("qH".to_owned(), "tH".to_owned())], &[])
            .unwrap();
        updater
            .received(&BTreeMap::from([(row_id(1), put_update(1, "qH", "0a"))]))
            .unwrap();
        let cvr = updater.flush(&store, &now_zero()).await.unwrap();

        let mut updater = QueryUpdater::new(&cvr, sv("1y0"), sv("1xz")).unwrap();
        let patches = updater
            .received(&BTreeMap::from([(
                row_id(1),
                RowUpdate {
                    ref_counts: BTreeMap::from([("qH".to_owned(), -1)]),
                    ..Default::default()
                },
            )]))
            .unwrap();
        assert_eq!(patches.len(), 1);
        assert!(matches!(&patches[0].patch, RowPatch::Del { .. }));
        let cvr = updater.flush(&store, &now_zero()).await.unwrap();
        let record = &cvr.rows[&row_id(1)];
        assert!(record.ref_counts.is_none());
        assert_eq!(record.patch_version, cvr.version);
    }

    #[tokio::test]
    async fn test_in_place_update_nets_out() {
        let store = MemoryCvrStore::new();
        let cvr = cvr_with_desired_query(&store).await;
        let mut updater = QueryUpdater::new(&cvr, sv("1xz"), sv("1xz")).unwrap();
        updater
            .track_queries(&[("qH".to_owned(), "tH".to_owned())], &[])
            .unwrap();
        updater
            .received(&BTreeMap::from([(row_id(1), put_update(1, "qH", "0a"))]))
            .unwrap();
        let cvr = updater.flush(&store, &now_zero()).await.unwrap();

        // An exclude/include pair assembles as a zero delta with contents.
        let mut updater = QueryUpdater::new(&cvr, sv("1y0"), sv("1xz")).unwrap();
        let mut update = put_update(1, "qH", "0b");
        update.ref_counts.insert("qH".to_owned(), 0);
        let patches = updater
            .received(&BTreeMap::from([(row_id(1), update)]))
            .unwrap();
        assert_eq!(patches.len(), 1);
        assert!(matches!(
            &patches[0].patch,
            RowPatch::Put { row_version, .. } if row_version.as_str() == "0b"
        ));
        let cvr = updater.flush(&store, &now_zero()).await.unwrap();
        assert_eq!(cvr.rows[&row_id(1)].ref_counts.as_ref().unwrap()["qH"], 1);
    }

    #[tokio::test]
    async fn test_removed_query_deletes_its_rows() {
        let store = MemoryCvrStore::new();
        let cvr = cvr_with_desired_query(&store).await;
        let mut updater = QueryUpdater::new(&cvr, sv("1xz"), sv("1xz")).unwrap();
        updater
            .track_queries(&[("qH".to_owned(), "tH".to_owned())], &[])
            .unwrap();
        updater
            .received(&BTreeMap::from([(row_id(1), put_update(1, "qH", "0a"))]))
            .unwrap();
        let cvr = updater.flush(&store, &now_zero()).await.unwrap();

        let mut updater = QueryUpdater::new(&cvr, sv("1xz"), sv("1xz")).unwrap();
        let got = updater.track_queries(&[], &["qH".to_owned()]).unwrap();
        assert!(matches!(
            &got[0].patch,
            ConfigPatch::GotQuery { op: PatchOp::Del, .. }
        ));
        let dels = updater.delete_unreferenced_rows().unwrap();
        assert_eq!(dels.len(), 1);
        assert!(matches!(&dels[0].patch, RowPatch::Del { .. }));

        let cvr = updater.flush(&store, &now_zero()).await.unwrap();
        assert_eq!(cvr.consistency_check(), Ok(()));
        assert!(cvr.queries.is_empty());
        assert!(cvr.rows[&row_id(1)].ref_counts.is_none());
    }

    #[tokio::test]
    async fn test_delete_unreferenced_rows_is_once_only() {
        let store = MemoryCvrStore::new();
        let cvr = cvr_with_desired_query(&store).await;
        let mut updater = QueryUpdater::new(&cvr, sv("1xz"), sv("1xz")).unwrap();
        updater.delete_unreferenced_rows().unwrap();
        assert!(updater.delete_unreferenced_rows().is_err());
    }

    #[tokio::test]
    async fn test_new_row_without_contents_is_an_error() {
        let store = MemoryCvrStore::new();
        let cvr = cvr_with_desired_query(&store).await;
        let mut updater = QueryUpdater::new(&cvr, sv("1xz"), sv("1xz")).unwrap();
        let err = updater
            .received(&BTreeMap::from([(
                row_id(1),
                RowUpdate {
                    ref_counts: BTreeMap::from([("qH".to_owned(), 1)]),
                    ..Default::default()
                },
            )]))
            .unwrap_err();
        assert_eq!(err.kind(), vp_repr::ErrorKind::Internal);
    }

    #[tokio::test]
    async fn test_pipeline_lagging_cvr_is_rejected() {
        let store = MemoryCvrStore::new();
        let cvr = cvr_with_desired_query(&store).await;
        let mut updater = QueryUpdater::new(&cvr, sv("1y0"), sv("1xz")).unwrap();
        updater
            .track_queries(&[("qH".to_owned(), "tH".to_owned())], &[])
            .unwrap();
        let cvr = updater.flush(&store, &now_zero()).await.unwrap();
        assert!(QueryUpdater::new(&cvr, sv("1xz"), sv("1xz")).is_err());
    }

    // Refcount soundness over random operation sequences: after every
    // flush, each positive refcount points at a got query, counts match an
    // independent model, and the snapshot passes its structural checks.
    mod refcounts {
        use futures::executor::block_on;
        use proptest::prelude::*;

        use super::*;

        async fn check_batches(
            batches: &[Vec<(i64, usize, i64)>],
        ) -> Result<(), TestCaseError> {
            let store = MemoryCvrStore::new();
            let base = store.load(&"g1".to_owned()).await.unwrap();
            let mut config = ConfigUpdater::new(&base);
            let queries: Vec<QueryHash> = (0..3).map(|i| format!("q{i}")).collect();
            for hash in &queries {
                config.put_desired_queries(
                    &"c1".to_owned(),
                    &[(hash.clone(), QuerySpec::table("issues"))],
                );
            }
            let (cvr, _) = config.flush(&store, &now_zero()).await.unwrap();

            let mut updater = QueryUpdater::new(&cvr, sv("10"), sv("10")).unwrap();
            let tracked: Vec<(QueryHash, String)> = queries
                .iter()
                .map(|hash| (hash.clone(), format!("t-{hash}")))
                .collect();
            updater.track_queries(&tracked, &[]).unwrap();
            updater.delete_unreferenced_rows().unwrap();
            let mut cvr = updater.flush(&store, &now_zero()).await.unwrap();

            // Model: refcount per (row, query), clamped at zero per batch.
            let mut model: BTreeMap<(i64, QueryHash), i64> = BTreeMap::new();
            let mut state = 100u64;
            for batch in batches {
                state += 1;
                let version = format!("1{}", vp_repr::to_lexi(state));
                let mut updater = QueryUpdater::new(&cvr, sv(&version), sv("10")).unwrap();

                let mut rows: BTreeMap<RowId, RowUpdate> = BTreeMap::new();
                let mut batch_deltas: BTreeMap<(i64, QueryHash), i64> = BTreeMap::new();
                for (id, query, delta) in batch {
                    let hash = queries[*query].clone();
                    let update = rows.entry(row_id(*id)).or_insert_with(|| RowUpdate {
                        version: Some(RowVersion::new(version.clone()).unwrap()),
                        contents: Some(Row::new().with_column("id", *id)),
                        ref_counts: BTreeMap::new(),
                    });
                    *update.ref_counts.entry(hash.clone()).or_insert(0) += delta;
                    *batch_deltas.entry((*id, hash)).or_insert(0) += delta;
                }
                for (key, delta) in batch_deltas {
                    let entry = model.entry(key).or_insert(0);
                    *entry = (*entry + delta).max(0);
                }
                updater.received(&rows).unwrap();
                cvr = updater.flush(&store, &now_zero()).await.unwrap();

                prop_assert_eq!(cvr.consistency_check(), Ok(()));
                for id in 0..6 {
                    let record = cvr.rows.get(&row_id(id));
                    for hash in &queries {
                        let modeled = model.get(&(id, hash.clone())).copied().unwrap_or(0);
                        let stored = record
                            .and_then(|r| r.ref_counts.as_ref())
                            .and_then(|rc| rc.get(hash).copied())
                            .unwrap_or(0);
                        prop_assert_eq!(i64::from(stored), modeled);
                    }
                }
            }
            Ok(())
        }

        proptest! {
            #[test]
            fn prop_refcount_soundness(
                batches in proptest::collection::vec(
                    proptest::collection::vec((0i64..6, 0usize..3, -2i64..3), 1..8),
                    1..12,
                ),
            ) {
                block_on(check_batches(&batches))?;
            }
        }
    }

    #[tokio::test]
    async fn test_concurrent_flushes_conflict() {
        let store = MemoryCvrStore::new();
        let cvr = cvr_with_desired_query(&store).await;

        let mut first = ConfigUpdater::new(&cvr);
        first.put_desired_queries(
            &"c2".to_owned(),
            &[("uH".to_owned(), QuerySpec::table("users"))],
        );
        let mut second = ConfigUpdater::new(&cvr);
        second.put_desired_queries(
            &"c3".to_owned(),
            &[("vH".to_owned(), QuerySpec::table("users"))],
        );

        first.flush(&store, &now_zero()).await.unwrap();
        let err = second.flush(&store, &now_zero()).await.unwrap_err();
        assert!(matches!(err, CvrError::ConcurrentModification { .. }));
        assert_eq!(err.kind(), vp_repr::ErrorKind::Unavailable);
    }
}
