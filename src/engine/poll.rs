//! Poll-with-backoff helper.
//!
//! Used wherever the engine waits for an external condition, such as a
//! state lock held by another process.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

/// Timing of a poll loop.
#[derive(Debug, Clone)]
pub struct PollOptions {
    /// Total time to keep polling. Zero polls exactly once.
    pub timeout: Duration,
    /// Delay before the second poll.
    pub initial_interval: Duration,
    /// Upper bound on the delay between polls.
    pub max_interval: Duration,
    /// Growth factor applied to the delay after each poll.
    pub multiplier: f64,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

/// Why a poll loop ended without reaching its target.
#[derive(Debug)]
pub enum PollError<T, E> {
    /// The timeout expired. `last` is the final observed value.
    Timeout {
        /// Last value returned by the poll function.
        last: T,
        /// Time spent polling.
        elapsed: Duration,
    },
    /// The poll function failed.
    Failed(E),
}

/// Calls `poll_fn` until `done` accepts its result, the poll function
/// fails, or `options.timeout` expires.
///
/// # Errors
///
/// Returns [`PollError::Failed`] with the first error from `poll_fn`, or
/// [`PollError::Timeout`] with the last observed value.
pub async fn poll_until<T, E, F, Fut, P>(
    mut poll_fn: F,
    mut done: P,
    options: &PollOptions,
) -> Result<T, PollError<T, E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&T) -> bool,
{
    let start = Instant::now();
    let mut interval = options.initial_interval;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let value = poll_fn().await.map_err(PollError::Failed)?;
        if done(&value) {
            return Ok(value);
        }

        let elapsed = start.elapsed();
        if elapsed >= options.timeout {
            return Err(PollError::Timeout { last: value, elapsed });
        }

        let remaining = options.timeout.saturating_sub(elapsed);
        let delay = interval.min(remaining);
        trace!("Poll attempt {attempt} not done, sleeping {delay:?}");
        tokio::time::sleep(delay).await;

        interval = interval.mul_f64(options.multiplier).min(options.max_interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(timeout: Duration) -> PollOptions {
        PollOptions {
            timeout,
            initial_interval: Duration::from_millis(5),
            max_interval: Duration::from_millis(20),
            multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn test_reaches_target() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<u32, PollError<u32, ()>> = poll_until(
            move || async move { Ok(calls.fetch_add(1, Ordering::SeqCst) + 1) },
            |n| *n >= 3,
            &fast(Duration::from_secs(5)),
        )
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_zero_timeout_polls_once() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<u32, PollError<u32, ()>> = poll_until(
            move || async move { Ok(calls.fetch_add(1, Ordering::SeqCst)) },
            |_| false,
            &fast(Duration::ZERO),
        )
        .await;
        assert!(matches!(result, Err(PollError::Timeout { last: 0, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_stops_polling() {
        let result: Result<u32, PollError<u32, &str>> =
            poll_until(|| async { Err("boom") }, |_| true, &fast(Duration::from_secs(5))).await;
        assert!(matches!(result, Err(PollError::Failed("boom"))));
    }
}
