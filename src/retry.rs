//! Retry with backoff.
//!
//! [`Retry::run`] re-invokes an operation while it reports
//! [`Failure::Retriable`], sleeping between attempts according to a
//! pluggable [`Backoff`]. The caller decides which errors are retriable
//! when it builds the `Failure`; nothing is inferred from the error value.
//! A cancellation future aborts the loop before the next attempt or in the
//! middle of a wait; its output is returned as [`RetryError::Cancelled`].

use std::fmt;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Computes the wait before retry number `attempt` (0-based).
pub trait Backoff: Send + Sync + fmt::Debug {
    fn delay(&self, attempt: u32) -> Duration;
}

/// `initial * multiplier^attempt`, capped at `max`.
#[derive(Debug, Clone)]
pub struct Exponential {
    pub initial: Duration,
    pub multiplier: u32,
    pub max: Duration,
}

impl Default for Exponential {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(10),
            multiplier: 2,
            max: Duration::from_secs(10),
        }
    }
}

impl Backoff for Exponential {
    fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.checked_pow(attempt).unwrap_or(u32::MAX);
        self.initial
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }
}

/// The same wait before every retry.
#[derive(Debug, Clone)]
pub struct Fixed {
    pub interval: Duration,
}

impl Fixed {
    pub const fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl Backoff for Fixed {
    fn delay(&self, _attempt: u32) -> Duration {
        self.interval
    }
}

/// How an attempt failed.
#[derive(Debug)]
pub enum Failure<E> {
    /// Transient; wait and try again.
    Retriable(E),
    /// Give up immediately.
    Permanent(E),
}

impl<E> Failure<E> {
    /// Classifies `err` with the caller-supplied predicate.
    pub fn classify(err: E, retriable: impl FnOnce(&E) -> bool) -> Self {
        if retriable(&err) {
            Failure::Retriable(err)
        } else {
            Failure::Permanent(err)
        }
    }
}

/// Error returned by [`Retry::run`].
///
/// `C` is the output of the cancellation future.
#[derive(Debug, Error)]
pub enum RetryError<E, C = ()> {
    #[error("operation cancelled")]
    Cancelled(C),

    #[error("{0}")]
    Failed(E),
}

/// Retry policy. Holds only the backoff; each call keeps its own attempt
/// counter, so one value can be shared freely between tasks.
#[derive(Debug, Clone)]
pub struct Retry {
    backoff: Arc<dyn Backoff>,
}

impl Default for Retry {
    fn default() -> Self {
        Self::new(Exponential::default())
    }
}

impl Retry {
    pub fn new(backoff: impl Backoff + 'static) -> Self {
        Self {
            backoff: Arc::new(backoff),
        }
    }

    /// Process-wide default: exponential backoff from 10ms, doubling.
    pub fn global() -> &'static Retry {
        static GLOBAL: OnceLock<Retry> = OnceLock::new();
        GLOBAL.get_or_init(Retry::default)
    }

    /// Runs `op` until it succeeds, fails permanently, or `cancelled`
    /// resolves.
    pub async fn run<T, E, F, Fut, C, X>(&self, cancelled: C, mut op: F) -> Result<T, RetryError<E, X>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Failure<E>>>,
        C: Future<Output = X>,
    {
        tokio::pin!(cancelled);
        let mut attempt: u32 = 0;

        loop {
            tokio::select! {
                biased;
                cause = &mut cancelled => return Err(RetryError::Cancelled(cause)),
                _ = std::future::ready(()) => {}
            }

            match op().await {
                Ok(value) => return Ok(value),
                Err(Failure::Permanent(err)) => return Err(RetryError::Failed(err)),
                Err(Failure::Retriable(_)) => {}
            }

            let delay = self.backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Retriable failure, backing off"
            );

            tokio::select! {
                biased;
                cause = &mut cancelled => return Err(RetryError::Cancelled(cause)),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
