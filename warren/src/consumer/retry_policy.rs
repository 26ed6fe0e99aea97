/*
 * Copyright (c) 2024. Govcraft
 *
 * Licensed under either of
 *   * Apache License, Version 2.0 (the "License");
 *     you may not use this file except in compliance with the License.
 *     You may obtain a copy of the License at http://www.apache.org/licenses/LICENSE-2.0
 *   * MIT license: http://opensource.org/licenses/MIT
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the applicable License for the specific language governing permissions and
 * limitations under that License.
 */

//! Retry with exponential backoff for consumer startup.
//!
//! # Example
//!
//! ```rust,ignore
//! use warren::prelude::*;
//!
//! let policy = RetryPolicy {
//!     tries: 5,
//!     delay_ms: 500,
//!     max_delay_ms: 8_000,
//!     backoff: 2.0,
//!     jitter: 0.25,
//! };
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::common::{BusError, Result};

/// Immutable retry configuration consumed by the consumer supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts. `-1` retries forever.
    pub tries: i32,

    /// Delay before the second attempt in milliseconds.
    pub delay_ms: u64,

    /// Upper bound for the delay in milliseconds, before jitter.
    pub max_delay_ms: u64,

    /// Multiplier applied to the delay after every failed attempt.
    ///
    /// With multiplier 2.0 and a 100ms delay:
    /// - First retry: 100ms
    /// - Second retry: 200ms
    /// - Third retry: 400ms
    pub backoff: f64,

    /// Random extra delay as a fraction of the computed delay.
    ///
    /// `1.0` adds between zero and one full delay on top.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            tries: -1,
            delay_ms: 1_000,
            max_delay_ms: 10_000,
            backoff: 1.0,
            jitter: 1.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that tries exactly once.
    #[must_use]
    pub const fn no_retry() -> Self {
        Self {
            tries: 1,
            delay_ms: 0,
            max_delay_ms: 0,
            backoff: 1.0,
            jitter: 0.0,
        }
    }

    /// True when `tries` is negative.
    #[must_use]
    pub const fn is_unbounded(&self) -> bool {
        self.tries < 0
    }

    /// Whether attempt number `attempt` (1-based) is still within budget.
    #[must_use]
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        self.is_unbounded() || i64::from(attempt) <= i64::from(self.tries)
    }

    /// Delay after `failures` consecutive failures, without jitter.
    #[must_use]
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        #[allow(clippy::cast_precision_loss)]
        let delay_ms = self.delay_ms as f64
            * self
                .backoff
                .powi(i32::try_from(failures - 1).unwrap_or(i32::MAX));
        #[allow(
            clippy::cast_sign_loss,
            clippy::cast_possible_truncation,
            clippy::cast_precision_loss
        )]
        let capped_ms = (delay_ms.min(self.max_delay_ms as f64).max(0.0)) as u64;
        Duration::from_millis(capped_ms)
    }

    /// Delay after `failures` consecutive failures, with random jitter added.
    ///
    /// A jitter that is negative or not finite adds nothing. A delay that
    /// would overflow falls back to `base + max_delay_ms`.
    #[must_use]
    pub fn jittered_delay_for(&self, failures: u32) -> Duration {
        let base = self.delay_for(failures);
        if !self.jitter.is_finite() || self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let extra = rand::rng().random_range(0.0..=self.jitter);
        Duration::try_from_secs_f64(base.as_secs_f64() * extra)
            .ok()
            .and_then(|extra| base.checked_add(extra))
            .unwrap_or_else(|| base.saturating_add(Duration::from_millis(self.max_delay_ms)))
    }

    /// Rejects settings that cannot describe a retry schedule.
    pub fn validate(&self) -> Result<()> {
        if !self.jitter.is_finite() || self.jitter < 0.0 {
            return Err(BusError::Config(format!(
                "retry.jitter must be a finite number >= 0, got {}",
                self.jitter
            )));
        }
        if !self.backoff.is_finite() || self.backoff < 0.0 {
            return Err(BusError::Config(format!(
                "retry.backoff must be a finite number >= 0, got {}",
                self.backoff
            )));
        }
        Ok(())
    }
}

/// Runs `operation` until it succeeds, the policy is exhausted, or `shutdown` fires.
///
/// Fatal errors are returned immediately. When the budget runs out the last
/// error is wrapped in [`BusError::RetriesExhausted`]. A cancelled `shutdown`
/// token interrupts the wait and returns the last error seen.
pub async fn retry_call<T, F, Fut>(
    policy: &RetryPolicy,
    shutdown: &CancellationToken,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if !error.is_retryable() => return Err(error),
            Err(error) => error,
        };

        if !policy.allows_attempt(attempt + 1) {
            warn!(attempts = attempt, error = %error, "retry budget exhausted");
            return Err(BusError::RetriesExhausted {
                attempts: attempt,
                last: Box::new(error),
            });
        }

        let delay = policy.jittered_delay_for(attempt);
        warn!(attempt, ?delay, error = %error, "attempt failed, retrying");
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = shutdown.cancelled() => {
                debug!("retry interrupted by shutdown");
                return Err(error);
            }
        }
    }
}
