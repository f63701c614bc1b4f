// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use vp_repr::{CvrVersion, ErrorKind, RowError};

/// An error produced by the CVR store or an updater.
#[derive(Debug, thiserror::Error)]
pub enum CvrError {
    /// The underlying Postgres connection failed.
    #[error("cvr storage: {0}")]
    Postgres(#[from] tokio_postgres::Error),
    /// The stored CVR version did not match the version the flush was staged
    /// against; another writer got there first.
    #[error("concurrent modification of cvr {group}: expected {expected}, found {actual}")]
    ConcurrentModification {
        /// The affected client group.
        group: String,
        /// The version the flush expected to replace.
        expected: CvrVersion,
        /// The version actually found in storage.
        actual: CvrVersion,
    },
    /// A stored value could not be decoded.
    #[error("corrupt cvr record: {0}")]
    Corruption(String),
    /// A row failed validation.
    #[error(transparent)]
    Row(#[from] RowError),
    /// An invariant was violated while staging an update.
    #[error("internal cvr error: {0}")]
    Internal(String),
}

impl CvrError {
    /// The taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CvrError::Postgres(_) | CvrError::ConcurrentModification { .. } => {
                ErrorKind::Unavailable
            }
            CvrError::Corruption(_) | CvrError::Row(_) | CvrError::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }
}
