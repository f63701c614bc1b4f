// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The core data representations of Viewport.
//!
//! This crate defines the vocabulary types shared by the CVR store, the
//! pipeline driver, and the view syncer: ordered versions and their cookie
//! encoding, SQL value datums and rows, and the canonical row fingerprint.
//! It has no I/O and no async; everything here is a plain value.

mod error;
mod id;
mod query;
mod row;
mod version;

pub use error::ErrorKind;
pub use id::{ClientGroupId, ClientId, QueryHash, RowId};
pub use query::{Predicate, QuerySpec};
pub use row::{Datum, Row, RowError, RowVersion, ROW_VERSION_COLUMN};
pub use version::{from_lexi, to_lexi, CvrVersion, StateVersion, VersionError};
