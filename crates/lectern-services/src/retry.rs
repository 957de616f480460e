//! Bounded retry with a cancellable inter-attempt delay

use crate::error::BatchItemError;
use lectern_core::{RetryBackoff, RetrySettings};
use lectern_storage::StorageError;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Delay growth between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed,
    /// Doubles after every failed attempt, capped at `max_delay`.
    Exponential { max_delay: Duration },
}

/// Errors the retry loop can classify.
pub trait Retryable {
    fn is_retryable(&self) -> bool;

    /// Value returned when cancellation interrupts the delay between attempts.
    fn cancelled() -> Self;
}

impl Retryable for StorageError {
    fn is_retryable(&self) -> bool {
        !matches!(self, StorageError::Cancelled | StorageError::InvalidKey(_))
    }

    fn cancelled() -> Self {
        StorageError::Cancelled
    }
}

impl Retryable for BatchItemError {
    fn is_retryable(&self) -> bool {
        match self {
            BatchItemError::Transfer(e) => e.is_retryable(),
            BatchItemError::Catalog(_) => true,
        }
    }

    fn cancelled() -> Self {
        BatchItemError::Transfer(StorageError::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first, at least 1.
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            backoff: Backoff::Fixed,
        }
    }

    pub fn from_settings(settings: &RetrySettings) -> Self {
        let backoff = match settings.backoff {
            RetryBackoff::Fixed => Backoff::Fixed,
            RetryBackoff::Exponential => Backoff::Exponential {
                max_delay: settings.max_delay,
            },
        };
        Self {
            max_attempts: settings.max_attempts.max(1),
            delay: settings.delay,
            backoff,
        }
    }

    /// Delay after failed attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential { max_delay } => {
                let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
                self.delay.saturating_mul(factor).min(max_delay)
            }
        }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or attempts run out.
    ///
    /// Both sides carry the number of attempts made. Cancelling `cancel` during
    /// a delay ends the loop with [`Retryable::cancelled`].
    pub async fn run<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<(T, u32), (E, u32)>
    where
        E: Retryable + Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok((value, attempt)),
                Err(e) if !e.is_retryable() || attempt >= self.max_attempts => {
                    return Err((e, attempt));
                }
                Err(e) => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        error = %e,
                        attempt = attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Attempt failed, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err((E::cancelled(), attempt)),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }
}
