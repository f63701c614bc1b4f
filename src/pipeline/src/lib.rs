// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Incremental view maintenance over the local replica.
//!
//! The pipeline driver keeps a set of named queries registered against the
//! replica. Adding a query hydrates it — scans the replica and yields every
//! matching row — and records which rows belong to it. Advancing the
//! pipeline consumes one replication delta and yields, per query, the rows
//! that entered or left it. The driver tracks membership only; row delivery
//! state lives in the CVR.

mod driver;
mod error;
mod replica;

pub use driver::{Advancement, PipelineDriver, RowChange};
pub use error::PipelineError;
pub use replica::{MemoryReplica, Replica, ReplicaDelta, TableChange};
