// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded fixed-interval polling.
//!
//! Every "wait for external state to converge" step goes through
//! [`poll_until`]. Time is read from `tokio::time`, so tests drive it with a
//! paused clock (`#[tokio::test(start_paused = true)]`) instead of sleeping.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

/// A polling wait gave up before its condition held.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("polling timed out after {timeout:?}")]
pub struct PollTimeoutError {
    /// The timeout that was exceeded.
    pub timeout: Duration,
}

/// Poll `retriever` until `condition` holds for its value.
///
/// Returns the first value that satisfied the condition. Errors from
/// `retriever` or `condition` propagate immediately. Once `time_out` has
/// elapsed without success the wait fails with [`PollTimeoutError`]; it never
/// fails earlier than that. The interval is fixed, there is no backoff.
pub async fn poll_until<T, E, R, Fut, C>(
    mut retriever: R,
    mut condition: C,
    sleep_time: Duration,
    time_out: Duration,
) -> Result<T, E>
where
    R: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: FnMut(&T) -> Result<bool, E>,
    E: From<PollTimeoutError>,
{
    let started = Instant::now();
    loop {
        let value = retriever().await?;
        if condition(&value)? {
            return Ok(value);
        }
        if started.elapsed() >= time_out {
            return Err(PollTimeoutError { timeout: time_out }.into());
        }
        tokio::time::sleep(sleep_time).await;
    }
}

/// [`poll_until`] for retrievers that already answer the question.
pub async fn poll_until_true<E, R, Fut>(
    retriever: R,
    sleep_time: Duration,
    time_out: Duration,
) -> Result<(), E>
where
    R: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
    E: From<PollTimeoutError>,
{
    poll_until(retriever, |done| Ok(*done), sleep_time, time_out)
        .await
        .map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq)]
    enum TestError {
        Timeout,
        Retriever(&'static str),
    }

    impl From<PollTimeoutError> for TestError {
        fn from(_: PollTimeoutError) -> Self {
            TestError::Timeout
        }
    }

    fn counter() -> Arc<AtomicU32> {
        Arc::new(AtomicU32::new(0))
    }

    #[tokio::test(start_paused = true)]
    async fn test_converges_before_timeout() {
        let calls = counter();
        let c = calls.clone();
        let started = Instant::now();

        let value = poll_until(
            || {
                let c = c.clone();
                async move { Ok::<_, TestError>(c.fetch_add(1, Ordering::SeqCst) + 1) }
            },
            |n| Ok(*n >= 4),
            Duration::from_secs(2),
            Duration::from_secs(60),
        )
        .await
        .unwrap();

        assert_eq!(value, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_not_before_deadline() {
        let started = Instant::now();

        let result = poll_until_true(
            || async { Ok::<_, TestError>(false) },
            Duration::from_secs(1),
            Duration::from_secs(10),
        )
        .await;

        assert_eq!(result, Err(TestError::Timeout));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(10), "gave up early: {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(12), "gave up late: {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retriever_error_propagates_immediately() {
        let started = Instant::now();

        let result: Result<(), TestError> = poll_until_true(
            || async { Err(TestError::Retriever("boom")) },
            Duration::from_secs(1),
            Duration::from_secs(10),
        )
        .await;

        assert_eq!(result, Err(TestError::Retriever("boom")));
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_condition_error_propagates() {
        let result = poll_until(
            || async { Ok::<_, TestError>("ERROR") },
            |status| {
                if *status == "ERROR" {
                    Err(TestError::Retriever("server error"))
                } else {
                    Ok(false)
                }
            },
            Duration::from_secs(1),
            Duration::from_secs(10),
        )
        .await;

        assert_eq!(result, Err(TestError::Retriever("server error")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_success_does_not_sleep() {
        let started = Instant::now();
        poll_until_true(
            || async { Ok::<_, TestError>(true) },
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}
