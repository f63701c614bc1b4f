// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Patches: the unit of change delivered to clients.
//!
//! Updater flushes and catch-up scans both produce patches. Each patch is
//! tagged with the CVR version that introduced it, so pokers can route it to
//! the poke delivering that version.

use serde::{Deserialize, Serialize};

use vp_repr::{ClientId, CvrVersion, QueryHash, QuerySpec, Row, RowId, RowVersion};

/// Whether a patch adds or removes its subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    /// The subject now exists.
    Put,
    /// The subject no longer exists.
    Del,
}

/// A change to CVR metadata: clients and queries.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigPatch {
    /// A client joined or left the group.
    Client {
        /// Add or remove.
        op: PatchOp,
        /// The affected client.
        client_id: ClientId,
    },
    /// A query entered or left the got set.
    GotQuery {
        /// Add or remove.
        op: PatchOp,
        /// The query's hash.
        hash: QueryHash,
        /// The compiled query, present on put.
        spec: Option<QuerySpec>,
    },
    /// A client's desired-queries set changed.
    DesiredQuery {
        /// Add or remove.
        op: PatchOp,
        /// The client whose desires changed.
        client_id: ClientId,
        /// The query's hash.
        hash: QueryHash,
        /// The compiled query, present on put.
        spec: Option<QuerySpec>,
    },
}

/// A [`ConfigPatch`] tagged with the version that introduced it.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedConfigPatch {
    /// The CVR version the patch belongs to.
    pub version: CvrVersion,
    /// The patch.
    pub patch: ConfigPatch,
}

/// A change to one row's delivered state.
#[derive(Debug, Clone, PartialEq)]
pub enum RowPatch {
    /// The row's contents at `row_version` should replace whatever the
    /// client holds.
    Put {
        /// The row's fingerprint.
        id: RowId,
        /// The row's contents, version column stripped.
        contents: Row,
        /// The row's version token.
        row_version: RowVersion,
    },
    /// The row left every query the client sees.
    Del {
        /// The row's fingerprint.
        id: RowId,
    },
}

impl RowPatch {
    /// The fingerprint of the patched row.
    pub fn id(&self) -> &RowId {
        match self {
            RowPatch::Put { id, .. } | RowPatch::Del { id } => id,
        }
    }
}

/// A [`RowPatch`] tagged with the version that introduced it.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedRowPatch {
    /// The CVR version the patch belongs to.
    pub version: CvrVersion,
    /// The patch.
    pub patch: RowPatch,
}
