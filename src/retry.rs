//! Bounded retry loop shared by channel-open, store access and the supervised loops.
//!
//! A [`RetryPolicy`] bounds an operation by attempt count, by wall-clock budget, or both,
//! and spaces attempts with a [`Backoff`]. Errors decide for themselves whether another
//! attempt is worthwhile through [`Transient`]; anything permanent is surfaced at once.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use log::{debug, warn};
use tokio::time::{sleep, Instant};

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// `base * 2^(attempt-1)`, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(d) => d,
            Backoff::Exponential { base, max } => {
                let shift = attempt.saturating_sub(1).min(16);
                base.saturating_mul(1u32 << shift).min(max)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first. `None` leaves only the budget as a bound.
    pub max_attempts: Option<u32>,
    /// Wall-clock budget measured from the first attempt.
    pub budget: Option<Duration>,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Fixed-delay retries inside a wall-clock budget.
    pub fn within(budget: Duration, delay: Duration) -> Self {
        Self {
            max_attempts: None,
            budget: Some(budget),
            backoff: Backoff::Fixed(delay),
        }
    }

    /// Exponential backoff up to `attempts` tries.
    pub fn exponential(attempts: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_attempts: Some(attempts.max(1)),
            budget: None,
            backoff: Backoff::Exponential { base, max },
        }
    }

    /// Exactly one attempt.
    pub fn once() -> Self {
        Self {
            max_attempts: Some(1),
            budget: None,
            backoff: Backoff::Fixed(Duration::ZERO),
        }
    }
}

/// Classification of an error as worth retrying.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// Permanent failure; no further attempts were made.
    #[error("{0}")]
    Fatal(E),
    /// Every allowed attempt failed with a transient error.
    #[error("gave up after {attempts} attempt(s): {last}")]
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Fatal(e) => e,
            RetryError::Exhausted { last, .. } => last,
        }
    }
}

/// Run `op` under `policy`. `op` receives the 1-based attempt number.
pub async fn run<T, E, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, RetryError<E>>
where
    E: Transient + Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let started = Instant::now();
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let err = match op(attempt).await {
            Ok(v) => {
                if attempt > 1 {
                    debug!("{} succeeded on attempt {}", label, attempt);
                }
                return Ok(v);
            }
            Err(e) => e,
        };
        if !err.is_transient() {
            return Err(RetryError::Fatal(err));
        }
        if policy.max_attempts.is_some_and(|max| attempt >= max) {
            return Err(RetryError::Exhausted { attempts: attempt, last: err });
        }
        let delay = policy.backoff.delay(attempt);
        if let Some(budget) = policy.budget {
            if started.elapsed() + delay >= budget {
                return Err(RetryError::Exhausted { attempts: attempt, last: err });
            }
        }
        warn!("{} attempt {} failed: {} (retrying in {:?})", label, attempt, err, delay);
        sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[derive(Debug)]
    struct Flaky(bool);

    impl Display for Flaky {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "flaky(transient={})", self.0)
        }
    }

    impl Transient for Flaky {
        fn is_transient(&self) -> bool {
            self.0
        }
    }

    #[test]
    fn exponential_delay_is_capped() {
        let b = Backoff::Exponential {
            base: Duration::from_millis(250),
            max: Duration::from_secs(5),
        };
        assert_eq!(b.delay(1), Duration::from_millis(250));
        assert_eq!(b.delay(2), Duration::from_millis(500));
        assert_eq!(b.delay(4), Duration::from_secs(2));
        assert_eq!(b.delay(10), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_until_success() {
        let calls = Cell::new(0);
        let policy = RetryPolicy::exponential(5, Duration::from_millis(10), Duration::from_millis(40));
        let out = run(&policy, "test", |_| {
            calls.set(calls.get() + 1);
            let n = calls.get();
            async move { if n < 3 { Err(Flaky(true)) } else { Ok(n) } }
        })
        .await;
        assert_eq!(out.ok(), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_is_not_retried() {
        let calls = Cell::new(0);
        let policy = RetryPolicy::exponential(5, Duration::from_millis(10), Duration::from_millis(40));
        let out: Result<(), _> = run(&policy, "test", |_| {
            calls.set(calls.get() + 1);
            async { Err(Flaky(false)) }
        })
        .await;
        assert!(matches!(out, Err(RetryError::Fatal(_))));
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn budget_bounds_fixed_retries() {
        let calls = Cell::new(0u32);
        let policy = RetryPolicy::within(Duration::from_secs(10), Duration::from_millis(500));
        let started = Instant::now();
        let out: Result<(), _> = run(&policy, "open", |_| {
            calls.set(calls.get() + 1);
            async { Err(Flaky(true)) }
        })
        .await;
        match out {
            Err(RetryError::Exhausted { attempts, .. }) => assert_eq!(attempts, calls.get()),
            other => panic!("expected exhaustion, got {:?}", other.err()),
        }
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(calls.get() >= 19);
    }
}
