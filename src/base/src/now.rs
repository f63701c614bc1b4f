// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Now utilities.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// A type representing the number of milliseconds since the Unix epoch.
pub type EpochMillis = u64;

/// A function that returns the current time.
///
/// Code that needs the wall clock takes a `NowFn` instead of calling
/// [`SystemTime::now`] directly, so tests can inject a deterministic clock.
#[derive(Clone)]
pub struct NowFn(Arc<dyn Fn() -> EpochMillis + Send + Sync>);

impl NowFn {
    /// Returns the current time.
    pub fn now(&self) -> EpochMillis {
        (self.0)()
    }
}

impl std::fmt::Debug for NowFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NowFn").finish_non_exhaustive()
    }
}

impl<F> From<F> for NowFn
where
    F: Fn() -> EpochMillis + Send + Sync + 'static,
{
    fn from(f: F) -> NowFn {
        NowFn(Arc::new(f))
    }
}

/// A [`NowFn`] that reads the system clock.
pub fn system_time() -> NowFn {
    NowFn::from(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before Unix epoch")
            .as_millis()
            .try_into()
            .expect("current time did not fit into u64")
    })
}

/// A [`NowFn`] that always returns zero. Only useful in tests.
pub fn now_zero() -> NowFn {
    NowFn::from(|| 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_injectable_clock() {
        let now = NowFn::from(|| 42);
        assert_eq!(now.now(), 42);
        assert_eq!(now_zero().now(), 0);
        assert!(system_time().now() > 0);
    }
}
