// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Client view records.
//!
//! A client view record (CVR) is the durable description of what one client
//! group has been shown: the clients that exist, the queries they want, the
//! queries that have been hydrated, and the version at which each row was
//! last delivered. This crate owns the CVR data model, the durable store
//! that persists it, and the two updaters through which all mutation flows.
//!
//! The store is deliberately dumb: it loads snapshots, streams catch-up
//! scans, and applies staged writes atomically. All CVR semantics — version
//! assignment, reference counting, tombstones — live in the updaters, which
//! stage changes against an immutable snapshot and hand the store a complete
//! write set to flush in one transaction.

mod error;
mod memory;
mod patch;
mod postgres;
mod store;
mod types;
mod updater;

pub use error::CvrError;
pub use memory::MemoryCvrStore;
pub use patch::{
    ConfigPatch, PatchOp, RowPatch, VersionedConfigPatch, VersionedRowPatch,
};
pub use postgres::PostgresCvrStore;
pub use store::{CvrStore, StagedWrite};
pub use types::{ClientRecord, CvrSnapshot, DesireState, QueryRecord, RowRecord, RowUpdate};
pub use updater::{ConfigUpdater, QueryUpdater};

/// The maximum number of row records staged or scanned before a page is cut.
///
/// Row-change processing flushes patches to pokers and clears its working
/// map at this bound, and catch-up scans fetch this many records per
/// round-trip, so memory stays proportional to the page, not the result.
pub const CURSOR_PAGE_SIZE: usize = 10_000;
