// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Retry utilities.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures::stream::Stream;

/// A policy for retrying fallible asynchronous operations.
///
/// The policy describes an exponential backoff schedule. Use
/// [`Retry::retry_async`] to drive a closure through the schedule, or
/// [`Retry::into_retry_stream`] for loops that need to interleave their own
/// control flow with the backoff sleeps.
#[derive(Debug, Clone)]
pub struct Retry {
    /// The backoff to apply after the first failure.
    pub initial_backoff: Duration,
    /// The multiplier applied to the backoff after each failure.
    pub factor: f64,
    /// The maximum backoff, after clamping.
    pub clamp_backoff: Duration,
    /// The maximum number of attempts, if bounded.
    pub max_tries: Option<usize>,
}

impl Default for Retry {
    fn default() -> Self {
        Retry {
            initial_backoff: Duration::from_millis(125),
            factor: 2.0,
            clamp_backoff: Duration::MAX,
            max_tries: None,
        }
    }
}

/// The state of an in-flight retry operation, handed to each attempt.
#[derive(Debug, Clone, Copy)]
pub struct RetryState {
    /// The zero-indexed attempt number.
    pub i: usize,
    /// The backoff that will be applied if this attempt fails, or `None` if
    /// this is the final attempt.
    pub next_backoff: Option<Duration>,
}

impl Retry {
    /// Sets the initial backoff.
    pub fn initial_backoff(mut self, initial_backoff: Duration) -> Self {
        self.initial_backoff = initial_backoff;
        self
    }

    /// Clamps the backoff to the specified maximum.
    pub fn clamp_backoff(mut self, clamp_backoff: Duration) -> Self {
        self.clamp_backoff = clamp_backoff;
        self
    }

    /// Bounds the number of attempts.
    pub fn max_tries(mut self, max_tries: usize) -> Self {
        self.max_tries = Some(max_tries);
        self
    }

    /// Retries the asynchronous, fallible operation `f` according to this
    /// policy, returning the first success or the error of the final attempt.
    pub async fn retry_async<F, Fut, T, E>(self, mut f: F) -> Result<T, E>
    where
        F: FnMut(RetryState) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut backoff = self.initial_backoff;
        let mut i = 0;
        loop {
            let last = matches!(self.max_tries, Some(max) if i + 1 >= max);
            let state = RetryState {
                i,
                next_backoff: if last { None } else { Some(backoff) },
            };
            match f(state).await {
                Ok(t) => return Ok(t),
                Err(e) if last => return Err(e),
                Err(_) => {
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.mul_f64(self.factor).min(self.clamp_backoff);
                    i += 1;
                }
            }
        }
    }

    /// Converts this policy into a stream that yields once per scheduled
    /// attempt, sleeping the backoff between yields. The first yield is
    /// immediate.
    pub fn into_retry_stream(self) -> RetryStream {
        RetryStream {
            retry: self,
            backoff: None,
            i: 0,
            sleep: None,
        }
    }
}

/// Stream produced by [`Retry::into_retry_stream`].
pub struct RetryStream {
    retry: Retry,
    backoff: Option<Duration>,
    i: usize,
    sleep: Option<Pin<Box<tokio::time::Sleep>>>,
}

impl Stream for RetryStream {
    type Item = RetryState;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        if matches!(self.retry.max_tries, Some(max) if self.i >= max) {
            return std::task::Poll::Ready(None);
        }
        if let Some(backoff) = self.backoff {
            let sleep = self
                .sleep
                .get_or_insert_with(|| Box::pin(tokio::time::sleep(backoff)));
            match sleep.as_mut().poll(cx) {
                std::task::Poll::Pending => return std::task::Poll::Pending,
                std::task::Poll::Ready(()) => {
                    self.sleep = None;
                }
            }
        }
        let state = RetryState {
            i: self.i,
            next_backoff: Some(
                self.backoff
                    .map(|b| b.mul_f64(self.retry.factor).min(self.retry.clamp_backoff))
                    .unwrap_or(self.retry.initial_backoff),
            ),
        };
        self.backoff = state.next_backoff;
        self.i += 1;
        std::task::Poll::Ready(Some(state))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_eventually() {
        let attempts = AtomicUsize::new(0);
        let res: Result<usize, &str> = Retry::default()
            .initial_backoff(Duration::from_millis(1))
            .retry_async(|_| async {
                let i = attempts.fetch_add(1, Ordering::SeqCst);
                if i < 3 {
                    Err("transient")
                } else {
                    Ok(i)
                }
            })
            .await;
        assert_eq!(res, Ok(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_bounded() {
        let res: Result<(), usize> = Retry::default()
            .initial_backoff(Duration::from_millis(1))
            .max_tries(3)
            .retry_async(|state| async move { Err(state.i) })
            .await;
        assert_eq!(res, Err(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stream_counts_attempts() {
        use futures::StreamExt;
        let mut stream = Box::pin(
            Retry::default()
                .initial_backoff(Duration::from_millis(1))
                .max_tries(2)
                .into_retry_stream(),
        );
        assert_eq!(stream.next().await.map(|s| s.i), Some(0));
        assert_eq!(stream.next().await.map(|s| s.i), Some(1));
        assert_eq!(stream.next().await.map(|s| s.i), None);
    }
}
