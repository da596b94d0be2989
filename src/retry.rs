//! Bounded retries for transient failures, with jittered backoff.
use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::chain_warn;
use crate::fresh_transient;
use crate::result::Result;

/// Add up to this fraction of the base delay to our sleep duration
/// when backing off before retrying a failed call.
const RETRY_JITTER_FRAC: f64 = 1.0;

/// Never sleep for longer than this between cancellation checks.
const CANCELLATION_CHECK_PERIOD: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Number of retries after the initial attempt.
    pub limit: u32,
    /// Fixed back-off delay (+ jitter).
    pub delay: Duration,
}

/// Sleeps for `duration`, or until `cancel` fires.
///
/// Returns false if cancelled.
pub(crate) fn cancellable_sleep(duration: Duration, cancel: &CancellationToken) -> bool {
    let deadline = std::time::Instant::now() + duration;

    loop {
        if cancel.is_cancelled() {
            return false;
        }

        let now = std::time::Instant::now();
        if now >= deadline {
            return true;
        }

        std::thread::sleep((deadline - now).min(CANCELLATION_CHECK_PERIOD));
    }
}

/// Calls `body` until it succeeds, fails with a permanent error, or
/// fails transiently more than `policy.limit` times in a row.
///
/// Exhausted retries and cancellation both return transient errors:
/// the caller may try again later.
pub fn retry_transient<T>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    what: &'static str,
    mut body: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut rng = rand::thread_rng();

    for i in 0..=policy.limit {
        if cancel.is_cancelled() {
            return Err(fresh_transient!("operation cancelled", %what));
        }

        match body() {
            Ok(ret) => return Ok(ret),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) if i == policy.limit => {
                return Err(chain_warn!(e, "reached retry limit", %what, limit=policy.limit))
            }
            Err(e) => {
                let jitter_scale = rng.gen_range(1.0..1.0 + RETRY_JITTER_FRAC);
                let backoff = policy.delay.mul_f64(jitter_scale);

                tracing::info!(?e, ?backoff, %what, attempt = i, "backing off after a transient failure");
                cancellable_sleep(backoff, cancel);
            }
        }
    }

    std::unreachable!()
}

#[cfg(test)]
const TEST_POLICY: RetryPolicy = RetryPolicy {
    limit: 3,
    delay: Duration::from_millis(1),
};

#[test]
fn test_retry_until_success() {
    let cancel = CancellationToken::new();
    let mut calls = 0;

    let ret = retry_transient(&TEST_POLICY, &cancel, "test", || {
        calls += 1;
        if calls < 3 {
            Err(fresh_transient!("flaky"))
        } else {
            Ok(calls)
        }
    });

    assert_eq!(ret.expect("should eventually succeed"), 3);
}

#[test]
fn test_retry_stops_on_permanent_error() {
    let cancel = CancellationToken::new();
    let mut calls = 0;

    let ret: Result<()> = retry_transient(&TEST_POLICY, &cancel, "test", || {
        calls += 1;
        Err(crate::fresh_info!("bad request"))
    });

    assert!(!ret.expect_err("should fail").is_transient());
    assert_eq!(calls, 1);
}

#[test]
fn test_retry_limit_is_transient() {
    let cancel = CancellationToken::new();
    let mut calls = 0;

    let ret: Result<()> = retry_transient(&TEST_POLICY, &cancel, "test", || {
        calls += 1;
        Err(fresh_transient!("flaky"))
    });

    assert!(ret.expect_err("should fail").is_transient());
    assert_eq!(calls, 4);
}

#[test]
fn test_retry_cancelled() {
    let cancel = CancellationToken::new();
    cancel.cancel();

    let ret: Result<()> = retry_transient(&TEST_POLICY, &cancel, "test", || {
        panic!("should not be called")
    });
    assert!(ret.expect_err("should fail").is_transient());
}
