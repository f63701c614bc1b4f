// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Task spawning with mandatory names.
//!
//! Tasks spawned through this module always carry a human-readable name,
//! which makes runtime dumps and log correlation possible. The name closure
//! is only evaluated when it is actually used.

use std::future::Future;

use tokio::task::JoinHandle;

/// Spawns a named task onto the current tokio runtime.
#[track_caller]
pub fn spawn<N, S, F>(name: N, future: F) -> JoinHandle<F::Output>
where
    N: FnOnce() -> S,
    S: AsRef<str>,
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let name = name();
    tracing::trace!(task = name.as_ref(), "spawning task");
    tokio::spawn(future)
}
