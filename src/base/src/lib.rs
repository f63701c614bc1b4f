// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Internal utility library for Viewport.
//!
//! The contents of this crate are not subject to compatibility guarantees of
//! any kind. It collects the small pieces of plumbing that every other crate
//! in the workspace wants: retry policies, named task spawning, and an
//! injectable wall clock.

pub mod now;
pub mod retry;
pub mod task;
