// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The error taxonomy shared by every crate in the workspace.

/// The kind of an error, determining its blast radius and how the view
/// syncer routes it.
///
/// Every error type in the workspace reports a kind. Kinds are about policy,
/// not provenance: a `BadRequest` fails only the RPC that carried it, an
/// `Internal` fails the current poke and its connection, a `Fatal` tears the
/// whole group down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A malformed patch, cookie, or operation. Fails the offending RPC.
    BadRequest,
    /// A query referencing nonexistent columns. Fails the client that sent
    /// it; the CVR is not mutated.
    BadQuery,
    /// A message for a websocket that no longer matches the live handler.
    /// Silently dropped.
    StaleConnection,
    /// An invariant violation. Fails the current poke and its connection;
    /// the CVR stays consistent because flushes are atomic.
    Internal,
    /// CVR storage is unreachable. The caller restarts the service and
    /// retries.
    Unavailable,
    /// The pipeline cannot advance. The service stops; the group restarts
    /// from durable state.
    Fatal,
}
