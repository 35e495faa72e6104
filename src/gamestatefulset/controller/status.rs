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

//! Status computation helpers and the conflict-safe status writer.

use crate::gamestatefulset::controller::retry::{with_conflict_retry, Backoff, RetryError};
use crate::gamestatefulset::controller::rollout::UpdateStrategy;
use crate::gamestatefulset::controller::runtime::Informer;
use crate::gamestatefulset::k8s::gamestatefulset::{GameStatefulSet, GameStatefulSetStatus};
use crate::gamestatefulset::k8s::store::{ObjectStore, StoreError};
use crate::gamestatefulset::logger::log_debug;
use crate::gamestatefulset::observability::metrics;
use std::sync::{Arc, Mutex};

const COMPONENT: &str = "status";

/// True when `status` differs from what the live object already reports,
/// so a write is needed.
pub fn inconsistent_status(set: &GameStatefulSet, status: &GameStatefulSetStatus) -> bool {
    let Some(live) = set.status.as_ref() else {
        return true;
    };
    status.observed_generation > live.observed_generation
        || status.replicas != live.replicas
        || status.ready_replicas != live.ready_replicas
        || status.current_replicas != live.current_replicas
        || status.updated_replicas != live.updated_replicas
        || status.current_revision != live.current_revision
        || status.update_revision != live.update_revision
        || status.collision_count != live.collision_count
        || status.label_selector != live.label_selector
        || status.canary != live.canary
        || status.pre_delete_hook_conditions != live.pre_delete_hook_conditions
}

/// Declares the rollout converged once every replica is updated and ready.
/// OnDelete workloads never converge on their own.
pub fn complete_rolling_update(set: &GameStatefulSet, status: &mut GameStatefulSetStatus) {
    if UpdateStrategy::for_set(set).is_on_delete() {
        return;
    }
    if status.updated_replicas == status.replicas && status.ready_replicas == status.replicas {
        status.current_replicas = status.updated_replicas;
        status.current_revision = status.update_revision.clone();
    }
}

pub struct StatusUpdater {
    workloads: Arc<dyn ObjectStore<GameStatefulSet>>,
    lister: Arc<Informer<GameStatefulSet>>,
    max_attempts: u32,
    backoff: Backoff,
}

impl StatusUpdater {
    pub fn new(
        workloads: Arc<dyn ObjectStore<GameStatefulSet>>,
        lister: Arc<Informer<GameStatefulSet>>,
        max_attempts: u32,
        backoff: Backoff,
    ) -> Self {
        Self {
            workloads,
            lister,
            max_attempts,
            backoff,
        }
    }

    /// Writes `status` onto `set`. On a conflict the object is re-read from
    /// the cache, or from the store when the cache still holds the version
    /// that was just rejected, and the same payload is written again.
    pub async fn update_status(
        &self,
        set: &GameStatefulSet,
        status: &GameStatefulSetStatus,
    ) -> Result<GameStatefulSet, RetryError<StoreError>> {
        let namespace = set.metadata.namespace();
        let name = set.metadata.name().to_string();
        let rejected = Mutex::new(None::<String>);
        with_conflict_retry(self.max_attempts, self.backoff, |attempt| {
            let namespace = namespace.clone();
            let name = name.clone();
            let rejected = &rejected;
            async move {
                let mut draft = if attempt == 0 {
                    set.clone()
                } else {
                    let stale = lock(rejected).clone();
                    match self.lister.get(&namespace, &name) {
                        Some(cached) if cached.metadata.resource_version != stale => cached,
                        _ => self.workloads.get(&namespace, &name).await?,
                    }
                };
                *lock(rejected) = draft.metadata.resource_version.clone();
                draft.status = Some(status.clone());
                self.workloads.update_status(draft).await
            }
        })
        .await
    }

    /// Completes the rollout if possible and writes the status when it
    /// differs from the live object.
    pub async fn persist_status(
        &self,
        set: &GameStatefulSet,
        mut status: GameStatefulSetStatus,
    ) -> Result<GameStatefulSetStatus, RetryError<StoreError>> {
        complete_rolling_update(set, &mut status);
        metrics::record_workload_status(
            set.metadata.namespace.as_deref(),
            set.metadata.name(),
            &status,
        );
        if !inconsistent_status(set, &status) {
            return Ok(status);
        }
        self.update_status(set, &status).await?;
        log_debug(
            COMPONENT,
            "Updated workload status",
            &[
                ("workload", &set.metadata.key()),
                ("currentRevision", &status.current_revision),
                ("updateRevision", &status.update_revision),
                ("updatedReplicas", &status.updated_replicas.to_string()),
            ],
        );
        Ok(status)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
