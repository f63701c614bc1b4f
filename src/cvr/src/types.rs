// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The CVR data model.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use vp_base::now::EpochMillis;
use vp_repr::{
    ClientGroupId, ClientId, CvrVersion, QueryHash, QuerySpec, Row, RowId, RowVersion,
    StateVersion,
};

/// One client's membership in the group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRecord {
    /// The client's id.
    pub id: ClientId,
    /// The CVR version at which this client record last changed.
    pub patch_version: CvrVersion,
    /// The queries this client currently desires, in hash order.
    pub desired_query_ids: Vec<QueryHash>,
}

/// One client's interest in a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesireState {
    /// The CVR version at which the desire last changed.
    pub patch_version: CvrVersion,
    /// Whether the desire has been withdrawn. Withdrawn desires stay
    /// recorded until catch-up no longer needs their del patches.
    pub deleted: bool,
}

/// One query tracked by the CVR.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRecord {
    /// The query's hash, assigned by the client.
    pub id: QueryHash,
    /// The compiled query.
    pub spec: QuerySpec,
    /// Internal queries are always desired and never advertised to clients.
    pub internal: bool,
    /// Which clients desire this query, and at which version that changed.
    pub desired_by: BTreeMap<ClientId, DesireState>,
    /// Set once the query has been hydrated; its presence makes the query
    /// "got".
    pub transformation_hash: Option<String>,
    /// The CVR version at which the current transformation was recorded.
    pub transformation_version: Option<CvrVersion>,
    /// The CVR version of the query's latest got/del patch.
    pub patch_version: Option<CvrVersion>,
}

impl QueryRecord {
    /// Creates an undesired, un-got record for `spec`.
    pub fn new(id: QueryHash, spec: QuerySpec) -> QueryRecord {
        QueryRecord {
            id,
            spec,
            internal: false,
            desired_by: BTreeMap::new(),
            transformation_hash: None,
            transformation_version: None,
            patch_version: None,
        }
    }

    /// Whether any client (or the system) still wants this query.
    pub fn desired(&self) -> bool {
        self.internal || self.desired_by.values().any(|d| !d.deleted)
    }

    /// Whether the query has been hydrated into the pipeline and its rows
    /// are tracked by the CVR.
    pub fn got(&self) -> bool {
        self.transformation_hash.is_some()
    }
}

/// One row's delivery state.
///
/// `ref_counts` of `None` is the tombstone: the row was delivered and has
/// since left every query; the record survives as a del patch until every
/// client has acknowledged past `patch_version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowRecord {
    /// The row's fingerprint.
    pub id: RowId,
    /// The CVR version of the row's latest patch.
    pub patch_version: CvrVersion,
    /// The version token the row carried when last delivered.
    pub row_version: RowVersion,
    /// How many times each got query references this row, or `None` for a
    /// tombstone.
    pub ref_counts: Option<BTreeMap<QueryHash, u32>>,
}

impl RowRecord {
    /// Whether at least one got query still references the row.
    pub fn referenced(&self) -> bool {
        self.ref_counts.as_ref().is_some_and(|rc| !rc.is_empty())
    }
}

/// A staged change to one row, assembled from pipeline row changes before
/// being merged into the CVR by the query-driven updater.
#[derive(Debug, Clone, Default)]
pub struct RowUpdate {
    /// The row's version token, if contents arrived in this batch.
    pub version: Option<RowVersion>,
    /// The row's contents (version column stripped), if they arrived in
    /// this batch. Only the first contents seen for a row in a batch are
    /// kept.
    pub contents: Option<Row>,
    /// Signed reference-count deltas per query.
    pub ref_counts: BTreeMap<QueryHash, i64>,
}

/// An immutable snapshot of one client group's CVR.
#[derive(Debug, Clone, PartialEq)]
pub struct CvrSnapshot {
    /// The client group this CVR describes.
    pub id: ClientGroupId,
    /// The CVR's current version.
    pub version: CvrVersion,
    /// Wall-clock time of the last flush, for idle-group GC.
    pub last_active: EpochMillis,
    /// The replica lineage the CVR was built against. `None` until the
    /// first query-driven flush.
    pub replica_version: Option<StateVersion>,
    /// The group's clients.
    pub clients: BTreeMap<ClientId, ClientRecord>,
    /// The group's queries.
    pub queries: BTreeMap<QueryHash, QueryRecord>,
    /// The delivery state of every row any got query references, plus
    /// tombstones not yet acknowledged.
    pub rows: BTreeMap<RowId, RowRecord>,
}

impl CvrSnapshot {
    /// The empty CVR for `id`, at the minimum version.
    pub fn empty(id: ClientGroupId) -> CvrSnapshot {
        CvrSnapshot {
            id,
            version: CvrVersion::min(),
            last_active: 0,
            replica_version: None,
            clients: BTreeMap::new(),
            queries: BTreeMap::new(),
            rows: BTreeMap::new(),
        }
    }

    /// The hashes of all desired queries.
    pub fn desired_queries(&self) -> impl Iterator<Item = &QueryHash> {
        self.queries.values().filter(|q| q.desired()).map(|q| &q.id)
    }

    /// Checks the structural invariants that every flushed snapshot must
    /// satisfy, returning a description of the first violation.
    ///
    /// Intended for tests and debug assertions, not the hot path.
    pub fn consistency_check(&self) -> Result<(), String> {
        for client in self.clients.values() {
            if client.patch_version > self.version {
                return Err(format!(
                    "client {} patch version {} exceeds cvr version {}",
                    client.id, client.patch_version, self.version
                ));
            }
        }
        for row in self.rows.values() {
            if row.patch_version > self.version {
                return Err(format!(
                    "row {:?} patch version {} exceeds cvr version {}",
                    row.id, row.patch_version, self.version
                ));
            }
            for (hash, count) in row.ref_counts.iter().flatten() {
                if *count == 0 {
                    return Err(format!("row {:?} has a zero refcount for {hash}", row.id));
                }
                match self.queries.get(hash) {
                    Some(query) if query.got() => {}
                    Some(_) => {
                        return Err(format!(
                            "row {:?} references un-got query {hash}",
                            row.id
                        ));
                    }
                    None => {
                        return Err(format!(
                            "row {:?} references unknown query {hash}",
                            row.id
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}
