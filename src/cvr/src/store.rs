// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The durable CVR store interface.

use std::collections::BTreeSet;

use async_trait::async_trait;
use futures::stream::BoxStream;

use vp_repr::{ClientGroupId, CvrVersion, QueryHash};

use crate::{ClientRecord, CvrError, CvrSnapshot, QueryRecord, RowRecord, VersionedConfigPatch};

/// One record of an atomic CVR write set.
///
/// Updaters stage these; the store applies the whole set in a single
/// transaction together with the new instance version. Deleted clients and
/// queries are written as tombstones so catch-up scans can replay their del
/// patches.
#[derive(Debug, Clone)]
pub enum StagedWrite {
    /// Upsert a client record.
    Client {
        /// The record to write.
        record: ClientRecord,
        /// Whether the client has been removed from the group.
        deleted: bool,
    },
    /// Upsert a query record.
    Query {
        /// The record to write.
        record: QueryRecord,
        /// Whether the query has been removed from the CVR.
        deleted: bool,
    },
    /// Upsert a row record. Tombstones are rows with `ref_counts: None`.
    Row(RowRecord),
}

/// Durable, transactional storage for client view records.
///
/// A store may serve many client groups concurrently; per-group
/// serializability is the store's responsibility and is enforced by the
/// version compare-and-swap in [`CvrStore::flush`].
#[async_trait]
pub trait CvrStore: Send + Sync {
    /// Loads the CVR for `group` into an immutable snapshot, or returns the
    /// empty CVR at the minimum version if the group has never been written.
    async fn load(&self, group: &ClientGroupId) -> Result<CvrSnapshot, CvrError>;

    /// Streams the row patch records with `from < patch_version <= to`, in
    /// ascending `(patch_version, schema, table, key text)` order.
    ///
    /// Records whose every reference is in `exclude_queries` are skipped;
    /// their rows are replayed by the excluded queries' own hydration.
    /// Tombstones are never skipped.
    fn catchup_row_patches<'a>(
        &'a self,
        group: &'a ClientGroupId,
        from: &'a CvrVersion,
        to: &'a CvrVersion,
        exclude_queries: &'a BTreeSet<QueryHash>,
    ) -> BoxStream<'a, Result<RowRecord, CvrError>>;

    /// Returns the client and query patches with `from < patch_version <=
    /// to`, in ascending patch-version order with deterministic tie-breaks.
    async fn catchup_config_patches(
        &self,
        group: &ClientGroupId,
        from: &CvrVersion,
        to: &CvrVersion,
    ) -> Result<Vec<VersionedConfigPatch>, CvrError>;

    /// Atomically replaces the CVR's instance record with `snapshot`'s and
    /// applies `writes`, if and only if the stored version still equals
    /// `expected_version`.
    ///
    /// On a version mismatch the flush fails with
    /// [`CvrError::ConcurrentModification`] and writes nothing: another
    /// service instance owns the group now.
    async fn flush(
        &self,
        expected_version: &CvrVersion,
        snapshot: &CvrSnapshot,
        writes: &[StagedWrite],
    ) -> Result<(), CvrError>;
}
