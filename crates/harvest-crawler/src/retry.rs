use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::Backoff;

const MAX_DELAY: Duration = Duration::from_secs(30);

/// Attempts left for one operation and the delay policy between them.
#[derive(Debug, Clone, Copy)]
pub struct RetryBudget {
    attempts_remaining: usize,
    base_delay: Duration,
    backoff: Backoff,
    jitter: Duration,
}

impl RetryBudget {
    pub fn new(attempts: usize, base_delay: Duration) -> Self {
        Self {
            attempts_remaining: attempts.max(1),
            base_delay,
            backoff: Backoff::Fixed,
            jitter: Duration::ZERO,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn attempts_remaining(&self) -> usize {
        self.attempts_remaining
    }

    fn delay_after(&self, attempt: usize) -> Duration {
        let delay = match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Exponential => {
                let exp = attempt.saturating_sub(1).min(16) as u32;
                self.base_delay.saturating_mul(2u32.pow(exp)).min(MAX_DELAY)
            }
        };
        delay + jitter(self.jitter)
    }
}

pub(crate) fn jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let millis = max.as_millis().min(u64::MAX as u128) as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
}

/// Sleeps for `delay`, returns `false` if `cancel` fired first.
pub(crate) async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempt(s), last error: {last}")]
    Exhausted { attempts: usize, last: E },

    #[error("cancelled after {attempts} attempt(s), last error: {last}")]
    Cancelled { attempts: usize, last: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> usize {
        match self {
            Self::Exhausted { attempts, .. } | Self::Cancelled { attempts, .. } => *attempts,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    pub fn into_last(self) -> E {
        match self {
            Self::Exhausted { last, .. } | Self::Cancelled { last, .. } => last,
        }
    }
}

/// Runs `op` until it succeeds or `budget` is consumed.
///
/// `op` receives the 1-based attempt number. The delay between attempts is
/// abandoned as soon as `cancel` fires, an attempt already running is never
/// interrupted.
pub async fn retry<T, E, F, Fut>(
    mut budget: RetryBudget,
    cancel: &CancellationToken,
    label: &str,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        budget.attempts_remaining -= 1;

        let last = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if budget.attempts_remaining == 0 {
            log::warn!("{label}: attempt {attempt} failed, no attempts left: {last}");
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last,
            });
        }

        let delay = budget.delay_after(attempt);
        log::warn!("{label}: attempt {attempt} failed, retrying in {delay:?}: {last}");
        if !pause(delay, cancel).await {
            return Err(RetryError::Cancelled {
                attempts: attempt,
                last,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn succeeds_after_failures() {
        let calls = AtomicUsize::new(0);
        let budget = RetryBudget::new(3, Duration::ZERO);
        let res = retry(budget, &CancellationToken::new(), "test", |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(format!("boom {attempt}"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(res.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_budget() {
        let calls = AtomicUsize::new(0);
        let budget = RetryBudget::new(2, Duration::ZERO);
        let res: Result<(), _> = retry(budget, &CancellationToken::new(), "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("nope") }
        })
        .await;
        let err = res.unwrap_err();
        assert!(!err.is_cancelled());
        assert_eq!(err.attempts(), 2);
        assert_eq!(err.into_last(), "nope");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn zero_attempts_still_tries_once() {
        let calls = AtomicUsize::new(0);
        let budget = RetryBudget::new(0, Duration::ZERO);
        let _: Result<(), _> = retry(budget, &CancellationToken::new(), "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("nope") }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_wait() {
        let cancel = CancellationToken::new();
        let budget = RetryBudget::new(5, Duration::from_secs(3600));
        let res: Result<(), _> = retry(budget, &cancel, "test", |_| {
            cancel.cancel();
            async { Err("nope") }
        })
        .await;
        let err = res.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.attempts(), 1);
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let budget =
            RetryBudget::new(3, Duration::from_secs(1)).with_backoff(Backoff::Exponential);
        assert_eq!(budget.delay_after(1), Duration::from_secs(1));
        assert_eq!(budget.delay_after(3), Duration::from_secs(4));
        assert_eq!(budget.delay_after(12), MAX_DELAY);
    }
}
