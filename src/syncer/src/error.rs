// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use vp_cvr::CvrError;
use vp_pipeline::PipelineError;
use vp_repr::{ClientId, ErrorKind, RowError, VersionError};

use crate::protocol::ErrorBody;

/// An error produced by the view syncer.
#[derive(Debug, thiserror::Error)]
pub enum SyncerError {
    /// A malformed request.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// A malformed cookie.
    #[error(transparent)]
    Version(#[from] VersionError),
    /// A pipeline error; carries its own kind (bad queries fail their
    /// client, advance failures fail the group).
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    /// A CVR store or updater error.
    #[error(transparent)]
    Cvr(#[from] CvrError),
    /// A row failed validation or conversion.
    #[error(transparent)]
    Row(#[from] RowError),
    /// A message arrived for a websocket that is no longer the client's
    /// live connection.
    #[error("stale connection for client {0}")]
    StaleConnection(ClientId),
    /// A client presented a cookie newer than the CVR; its state cannot be
    /// caught up from here.
    #[error("client {client_id} is ahead of the cvr: {cookie}")]
    ClientAhead {
        /// The offending client.
        client_id: ClientId,
        /// The cookie it presented.
        cookie: String,
    },
    /// An invariant was violated.
    #[error("internal: {0}")]
    Internal(String),
}

impl SyncerError {
    /// The taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncerError::BadRequest(_) | SyncerError::ClientAhead { .. } => ErrorKind::BadRequest,
            SyncerError::Version(e) => e.kind(),
            SyncerError::Pipeline(e) => e.kind(),
            SyncerError::Cvr(e) => e.kind(),
            SyncerError::Row(e) => e.kind(),
            SyncerError::StaleConnection(_) => ErrorKind::StaleConnection,
            SyncerError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// The terminal error frame for a client being failed by this error.
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}
