/*
 * Copyright (C) 2024 The Nanocloud Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Bounded retry for read-modify-write cycles that can lose an optimistic
//! concurrency race.

use crate::gamestatefulset::k8s::store::StoreError;
use std::fmt::{Debug, Display};
use std::future::Future;
use std::time::Duration;

/// Errors that can report a resource-version conflict.
pub trait ConflictError {
    fn is_conflict(&self) -> bool;
}

impl ConflictError for StoreError {
    fn is_conflict(&self) -> bool {
        StoreError::is_conflict(self)
    }
}

/// Exponential delay between attempts, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub factor: u32,
    pub max: Duration,
}

impl Backoff {
    pub const fn new(initial: Duration, factor: u32, max: Duration) -> Self {
        Self {
            initial,
            factor,
            max,
        }
    }

    /// Delay to wait after the `attempt`-th failure (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let multiplier = self.factor.max(1).saturating_pow(exponent);
        self.initial.saturating_mul(multiplier).min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(10), 2, Duration::from_secs(1))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E: Debug + Display> {
    #[error("aborting update after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
    #[error("{0}")]
    Aborted(E),
}

impl<E: Debug + Display> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Aborted(error) => error,
        }
    }
}

/// Runs `op` until it succeeds, fails with a non-conflict error, or
/// `max_attempts` conflicts have been observed. `op` receives the 0-based
/// attempt number so it can re-read state on retries.
pub async fn with_conflict_retry<T, E, F, Fut>(
    max_attempts: u32,
    backoff: Backoff,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: ConflictError + Debug + Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) if !error.is_conflict() => return Err(RetryError::Aborted(error)),
            Err(error) => {
                attempt += 1;
                if attempt >= max_attempts {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: error,
                    });
                }
                tokio::time::sleep(backoff.delay(attempt)).await;
            }
        }
    }
}
