// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! An in-memory CVR store.
//!
//! The in-memory store implements the full [`CvrStore`] contract, including
//! the flush version check and tombstone retention, over plain maps. It
//! backs the test suites and local development; production uses the
//! Postgres store.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;

use vp_base::now::EpochMillis;
use vp_repr::{ClientGroupId, ClientId, CvrVersion, QueryHash, RowId, StateVersion};

use crate::store::{CvrStore, StagedWrite};
use crate::{
    ClientRecord, ConfigPatch, CvrError, CvrSnapshot, PatchOp, QueryRecord, RowRecord,
    VersionedConfigPatch,
};

#[derive(Debug, Clone, Default)]
struct StoredGroup {
    version: Option<CvrVersion>,
    last_active: EpochMillis,
    replica_version: Option<StateVersion>,
    clients: BTreeMap<ClientId, (ClientRecord, bool)>,
    queries: BTreeMap<QueryHash, (QueryRecord, bool)>,
    rows: BTreeMap<RowId, RowRecord>,
}

/// A [`CvrStore`] holding everything in process memory.
#[derive(Debug, Default)]
pub struct MemoryCvrStore {
    groups: Mutex<BTreeMap<ClientGroupId, StoredGroup>>,
}

impl MemoryCvrStore {
    /// Creates an empty store.
    pub fn new() -> MemoryCvrStore {
        MemoryCvrStore::default()
    }
}

#[async_trait]
impl CvrStore for MemoryCvrStore {
    async fn load(&self, group: &ClientGroupId) -> Result<CvrSnapshot, CvrError> {
        let groups = self.groups.lock().expect("poisoned");
        let Some(stored) = groups.get(group) else {
            return Ok(CvrSnapshot::empty(group.clone()));
        };
        Ok(CvrSnapshot {
            id: group.clone(),
            version: stored.version.clone().unwrap_or_else(CvrVersion::min),
            last_active: stored.last_active,
            replica_version: stored.replica_version.clone(),
            clients: stored
                .clients
                .iter()
                .filter(|(_, (_, deleted))| !deleted)
                .map(|(id, (record, _))| (id.clone(), record.clone()))
                .collect(),
            queries: stored
                .queries
                .iter()
                .filter(|(_, (_, deleted))| !deleted)
                .map(|(hash, (record, _))| (hash.clone(), record.clone()))
                .collect(),
            rows: stored.rows.clone(),
        })
    }

    fn catchup_row_patches<'a>(
        &'a self,
        group: &'a ClientGroupId,
        from: &'a CvrVersion,
        to: &'a CvrVersion,
        exclude_queries: &'a BTreeSet<QueryHash>,
    ) -> BoxStream<'a, Result<RowRecord, CvrError>> {
        let groups = self.groups.lock().expect("poisoned");
        let mut records: Vec<RowRecord> = groups
            .get(group)
            .map(|stored| {
                stored
                    .rows
                    .values()
                    .filter(|r| r.patch_version > *from && r.patch_version <= *to)
                    .filter(|r| !solely_referenced_by(r, exclude_queries))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        records.sort_by(|a, b| {
            (&a.patch_version, &a.id).cmp(&(&b.patch_version, &b.id))
        });
        futures::stream::iter(records.into_iter().map(Ok)).boxed()
    }

    async fn catchup_config_patches(
        &self,
        group: &ClientGroupId,
        from: &CvrVersion,
        to: &CvrVersion,
    ) -> Result<Vec<VersionedConfigPatch>, CvrError> {
        let groups = self.groups.lock().expect("poisoned");
        let Some(stored) = groups.get(group) else {
            return Ok(Vec::new());
        };
        Ok(config_patches_in_range(
            stored.clients.values(),
            stored.queries.values(),
            from,
            to,
        ))
    }

    async fn flush(
        &self,
        expected_version: &CvrVersion,
        snapshot: &CvrSnapshot,
        writes: &[StagedWrite],
    ) -> Result<(), CvrError> {
        let mut groups = self.groups.lock().expect("poisoned");
        let stored = groups.entry(snapshot.id.clone()).or_default();
        let actual = stored.version.clone().unwrap_or_else(CvrVersion::min);
        if actual != *expected_version {
            return Err(CvrError::ConcurrentModification {
                group: snapshot.id.clone(),
                expected: expected_version.clone(),
                actual,
            });
        }
        for write in writes {
            match write {
                StagedWrite::Client { record, deleted } => {
                    stored
                        .clients
                        .insert(record.id.clone(), (record.clone(), *deleted));
                }
                StagedWrite::Query { record, deleted } => {
                    stored
                        .queries
                        .insert(record.id.clone(), (record.clone(), *deleted));
                }
                StagedWrite::Row(record) => {
                    stored.rows.insert(record.id.clone(), record.clone());
                }
            }
        }
        stored.version = Some(snapshot.version.clone());
        stored.last_active = snapshot.last_active;
        stored.replica_version = snapshot.replica_version.clone();
        Ok(())
    }
}

/// Whether every reference on `record` is to a query in `exclude`.
/// Tombstones (no references) are never excluded.
pub(crate) fn solely_referenced_by(record: &RowRecord, exclude: &BTreeSet<QueryHash>) -> bool {
    match &record.ref_counts {
        Some(counts) if !counts.is_empty() => counts.keys().all(|hash| exclude.contains(hash)),
        _ => false,
    }
}

/// Derives the config patches with `from < patch_version <= to` from stored
/// client and query records, sorted by `(version, patch kind, client, hash)`.
///
/// Shared by every store backend so the catch-up stream is a total function
/// of the stored CVR, whatever holds it.
pub(crate) fn config_patches_in_range<'a>(
    clients: impl Iterator<Item = &'a (ClientRecord, bool)>,
    queries: impl Iterator<Item = &'a (QueryRecord, bool)>,
    from: &CvrVersion,
    to: &CvrVersion,
) -> Vec<VersionedConfigPatch> {
    let in_range = |v: &CvrVersion| v > from && v <= to;
    let mut patches = Vec::new();
    for (record, deleted) in clients {
        if in_range(&record.patch_version) {
            patches.push((
                0u8,
                String::new(),
                record.id.clone(),
                VersionedConfigPatch {
                    version: record.patch_version.clone(),
                    patch: ConfigPatch::Client {
                        op: if *deleted { PatchOp::Del } else { PatchOp::Put },
                        client_id: record.id.clone(),
                    },
                },
            ));
        }
    }
    for (record, deleted) in queries {
        if !record.internal {
            let got_version = record.patch_version.as_ref();
            if let Some(version) = got_version.filter(|v| in_range(v)) {
                if *deleted {
                    patches.push((
                        1,
                        record.id.clone(),
                        String::new(),
                        VersionedConfigPatch {
                            version: version.clone(),
                            patch: ConfigPatch::GotQuery {
                                op: PatchOp::Del,
                                hash: record.id.clone(),
                                spec: None,
                            },
                        },
                    ));
                } else if record.got() {
                    patches.push((
                        1,
                        record.id.clone(),
                        String::new(),
                        VersionedConfigPatch {
                            version: version.clone(),
                            patch: ConfigPatch::GotQuery {
                                op: PatchOp::Put,
                                hash: record.id.clone(),
                                spec: Some(record.spec.clone()),
                            },
                        },
                    ));
                }
            }
            for (client_id, desire) in &record.desired_by {
                if in_range(&desire.patch_version) {
                    patches.push((
                        2,
                        record.id.clone(),
                        client_id.clone(),
                        VersionedConfigPatch {
                            version: desire.patch_version.clone(),
                            patch: ConfigPatch::DesiredQuery {
                                op: if desire.deleted { PatchOp::Del } else { PatchOp::Put },
                                client_id: client_id.clone(),
                                hash: record.id.clone(),
                                spec: (!desire.deleted).then(|| record.spec.clone()),
                            },
                        },
                    ));
                }
            }
        }
    }
    patches.sort_by(|a, b| {
        (&a.3.version, a.0, &a.1, &a.2).cmp(&(&b.3.version, b.0, &b.1, &b.2))
    });
    patches.into_iter().map(|(_, _, _, patch)| patch).collect()
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use vp_repr::{CvrVersion, RowVersion, StateVersion};

    use super::*;

    fn version(state: &str, minor: u32) -> CvrVersion {
        CvrVersion {
            state_version: StateVersion::parse(state).unwrap(),
            minor_version: minor,
        }
    }

    fn row_record(table: &str, id: i64, state: &str, refs: &[(&str, u32)]) -> RowRecord {
        RowRecord {
            id: RowId::new("public", table, serde_json::json!({"id": id})),
            patch_version: version(state, 0),
            row_version: RowVersion::new("0a".into()).unwrap(),
            ref_counts: if refs.is_empty() {
                None
            } else {
                Some(refs.iter().map(|(h, c)| ((*h).to_owned(), *c)).collect())
            },
        }
    }

    async fn store_with_rows(records: Vec<RowRecord>) -> (MemoryCvrStore, CvrSnapshot) {
        let store = MemoryCvrStore::new();
        let mut snapshot = CvrSnapshot::empty("g1".to_owned());
        snapshot.version = version("1y0", 0);
        let writes: Vec<StagedWrite> = records.into_iter().map(StagedWrite::Row).collect();
        store
            .flush(&CvrVersion::min(), &snapshot, &writes)
            .await
            .unwrap();
        (store, snapshot)
    }

    async fn collect(
        store: &MemoryCvrStore,
        from: &CvrVersion,
        to: &CvrVersion,
        exclude: &BTreeSet<String>,
    ) -> Vec<RowRecord> {
        store
            .catchup_row_patches(&"g1".to_owned(), from, to, exclude)
            .map(|r| r.unwrap())
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_row_catchup_range_and_order() {
        let (store, _) = store_with_rows(vec![
            row_record("users", 1, "1y0", &[("uH", 1)]),
            row_record("issues", 2, "1y0", &[("qH", 1)]),
            row_record("issues", 1, "1xz", &[("qH", 1)]),
            row_record("issues", 3, "1t0", &[("qH", 1)]),
        ])
        .await;

        let records = collect(
            &store,
            &version("1t0", 0),
            &version("1y0", 0),
            &BTreeSet::new(),
        )
        .await;
        // "1t0" is excluded (from is exclusive); order is patch version,
        // then schema, table, key.
        let keys: Vec<(String, String)> = records
            .iter()
            .map(|r| (r.patch_version.to_cookie(), r.id.table.clone()))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("1xz".to_owned(), "issues".to_owned()),
                ("1y0".to_owned(), "issues".to_owned()),
                ("1y0".to_owned(), "users".to_owned()),
            ]
        );
    }

    #[tokio::test]
    async fn test_row_catchup_is_deterministic() {
        let (store, _) = store_with_rows(vec![
            row_record("issues", 2, "1y0", &[("qH", 1)]),
            row_record("issues", 1, "1y0", &[("qH", 1)]),
            row_record("users", 1, "1xz", &[("uH", 1)]),
        ])
        .await;
        let from = CvrVersion::min();
        let to = version("1y0", 0);
        let first = collect(&store, &from, &to, &BTreeSet::new()).await;
        let second = collect(&store, &from, &to, &BTreeSet::new()).await;
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
    }

    #[tokio::test]
    async fn test_row_catchup_excludes_solely_referenced_rows() {
        let (store, _) = store_with_rows(vec![
            // Only referenced by the excluded query: skipped.
            row_record("issues", 1, "1xz", &[("qH", 1)]),
            // Also referenced elsewhere: kept.
            row_record("issues", 2, "1xz", &[("qH", 1), ("uH", 1)]),
            // Tombstones are never skipped.
            row_record("issues", 3, "1xz", &[]),
        ])
        .await;
        let exclude = BTreeSet::from(["qH".to_owned()]);
        let records = collect(&store, &CvrVersion::min(), &version("1y0", 0), &exclude).await;
        let ids: Vec<String> = records.iter().map(|r| r.id.key_text()).collect();
        assert_eq!(ids, vec![r#"{"id":2}"#.to_owned(), r#"{"id":3}"#.to_owned()]);
    }

    #[tokio::test]
    async fn test_config_catchup_covers_clients_queries_and_desires() {
        let store = MemoryCvrStore::new();
        let mut snapshot = CvrSnapshot::empty("g1".to_owned());
        snapshot.version = version("1y0", 1);
        let client = ClientRecord {
            id: "c1".to_owned(),
            patch_version: version("1xz", 1),
            desired_query_ids: vec!["qH".to_owned()],
        };
        let query = QueryRecord {
            id: "qH".to_owned(),
            spec: vp_repr::QuerySpec::table("issues"),
            internal: false,
            desired_by: BTreeMap::from([(
                "c1".to_owned(),
                crate::DesireState {
                    patch_version: version("1xz", 1),
                    deleted: false,
                },
            )]),
            transformation_hash: Some("tH".to_owned()),
            transformation_version: Some(version("1y0", 0)),
            patch_version: Some(version("1y0", 0)),
        };
        store
            .flush(
                &CvrVersion::min(),
                &snapshot,
                &[
                    StagedWrite::Client {
                        record: client,
                        deleted: false,
                    },
                    StagedWrite::Query {
                        record: query,
                        deleted: false,
                    },
                ],
            )
            .await
            .unwrap();

        let all = store
            .catchup_config_patches(&"g1".to_owned(), &CvrVersion::min(), &version("1y0", 1))
            .await
            .unwrap();
        // Client put and desire put at (1xz, 1), got put at (1y0, 0), in
        // version order.
        assert_eq!(all.len(), 3);
        assert!(matches!(&all[0].patch, ConfigPatch::Client { op: PatchOp::Put, .. }));
        assert!(matches!(&all[1].patch, ConfigPatch::DesiredQuery { op: PatchOp::Put, .. }));
        assert!(matches!(&all[2].patch, ConfigPatch::GotQuery { op: PatchOp::Put, .. }));

        // A catch-up from a later version sees only the got patch.
        let later = store
            .catchup_config_patches(&"g1".to_owned(), &version("1xz", 1), &version("1y0", 1))
            .await
            .unwrap();
        assert_eq!(later.len(), 1);
        assert!(matches!(&later[0].patch, ConfigPatch::GotQuery { .. }));
    }

    #[tokio::test]
    async fn test_flush_cas_guards_the_version() {
        let store = MemoryCvrStore::new();
        let mut snapshot = CvrSnapshot::empty("g1".to_owned());
        snapshot.version = version("1xz", 0);
        store
            .flush(&CvrVersion::min(), &snapshot, &[])
            .await
            .unwrap();
        // A second flush staged against the pre-image fails.
        let err = store
            .flush(&CvrVersion::min(), &snapshot, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, CvrError::ConcurrentModification { .. }));
    }
}
