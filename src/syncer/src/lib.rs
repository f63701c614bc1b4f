// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The view syncer.
//!
//! The view syncer keeps every client of a client group continuously in
//! sync with the local replica. It owns the group's client view record,
//! drives the incremental query pipeline as the replica advances, and
//! delivers each version increment to each client as an ordered poke.
//!
//! One service instance exclusively owns one client group; scaling out is
//! by partitioning groups across instances. Within an instance, a single
//! fair mutex serializes every mutation, so the service is effectively a
//! cooperative single-threaded actor that may suspend for I/O.

mod client;
mod error;
mod protocol;
mod service;

pub use client::{ClientHandler, DownstreamReceiver, Poker};
pub use error::SyncerError;
pub use protocol::{
    ClientPatch, DesiredQueryOp, Downstream, EntityPatch, ErrorBody, PokeEnd, PokePart, PokeStart,
    QueryPatch, SyncContext,
};
pub use service::{ViewSyncer, DEFAULT_KEEPALIVE};
