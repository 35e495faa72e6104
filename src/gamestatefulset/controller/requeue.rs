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

//! Per-workload delayed rechecks.
//!
//! Reconciliation pushes a duration when it wants to look at a workload
//! again later (hook run polling, pause expiry, pre-delete hooks). The worker
//! pops the earliest pending deadline after each sync and schedules a delayed
//! enqueue. This path never touches the error rate limiter.

use crate::gamestatefulset::util::clock::{self, Clock};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub struct DurationStore {
    clock: Arc<dyn Clock>,
    deadlines: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl DurationStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            deadlines: Mutex::new(HashMap::new()),
        }
    }

    /// Requests a recheck of `key` after `after`. An earlier pending deadline
    /// wins over a later one.
    pub fn push(&self, key: &str, after: Duration) {
        let Ok(delta) = chrono::Duration::from_std(after) else {
            return;
        };
        let deadline = self.clock.now() + delta;
        let mut deadlines = self.lock();
        deadlines
            .entry(key.to_string())
            .and_modify(|existing| {
                if deadline < *existing {
                    *existing = deadline;
                }
            })
            .or_insert(deadline);
    }

    /// Removes the pending deadline for `key` and returns the time left until
    /// it. A deadline that already passed yields `Duration::ZERO`, which the
    /// queue turns into an immediate add.
    pub fn pop(&self, key: &str) -> Option<Duration> {
        let deadline = self.lock().remove(key)?;
        Some(clock::remaining(self.clock.as_ref(), deadline).unwrap_or(Duration::ZERO))
    }

    pub fn pending(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, DateTime<Utc>>> {
        self.deadlines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
