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

//! One reconciliation pass over a single workload: revisions, canary gates,
//! pod lifecycle, status, and history.

use crate::gamestatefulset::config::ControllerConfig;
use crate::gamestatefulset::controller::canary::{CanaryContext, CanaryStepper};
use crate::gamestatefulset::controller::history::{
    apply_revision, create_controller_revision, equal_revision, find_equal_revisions,
    new_revision, next_revision, sort_controller_revisions, update_controller_revision,
    HistoryError,
};
use crate::gamestatefulset::controller::identity::{
    get_ordinal, get_pod_revision, identity_matches, is_failed, is_healthy,
    is_running_and_ready, is_terminating, new_versioned_pod, storage_matches,
};
use crate::gamestatefulset::controller::inplace::{
    hot_patch_completed, in_place_update_completed, InPlaceUpdater,
};
use crate::gamestatefulset::controller::pod_control::PodControl;
use crate::gamestatefulset::controller::predelete::{PreDeleteGate, PreDeleteVerdict};
use crate::gamestatefulset::controller::requeue::DurationStore;
use crate::gamestatefulset::controller::retry::RetryError;
use crate::gamestatefulset::controller::rollout::{
    ApplyError, ApplyOutcome, StrategyAppliers, UpdateStrategy,
};
use crate::gamestatefulset::controller::runtime::Informer;
use crate::gamestatefulset::controller::status::StatusUpdater;
use crate::gamestatefulset::k8s::gamestatefulset::{
    GameStatefulSet, GameStatefulSetStatus, PodManagementPolicy,
};
use crate::gamestatefulset::k8s::hookrun::HookRun;
use crate::gamestatefulset::k8s::meta::SelectorError;
use crate::gamestatefulset::k8s::pod::Pod;
use crate::gamestatefulset::k8s::revision::ControllerRevision;
use crate::gamestatefulset::k8s::store::{ResourceStore, StoreError};
use crate::gamestatefulset::logger::{log_debug, log_info};
use crate::gamestatefulset::util::clock::Clock;
use std::collections::BTreeSet;
use std::sync::Arc;

const COMPONENT: &str = "gamestatefulset-control";

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error(transparent)]
    Apply(#[from] ApplyError),
    #[error(transparent)]
    Retry(#[from] RetryError<StoreError>),
    #[error("invalid selector: {0}")]
    Selector(#[from] SelectorError),
}

/// The current and update revisions resolved for one sync.
#[derive(Debug, Clone)]
pub struct RevisionPair {
    pub current: ControllerRevision,
    pub update: ControllerRevision,
    pub collision_count: i32,
}

/// Slot for one ordinal in `[0, replicas)`.
struct Replica {
    pod: Pod,
    /// False until the pod has been written to the store.
    exists: bool,
}

pub struct GameStatefulSetControl {
    store: ResourceStore,
    hook_runs: Arc<Informer<HookRun>>,
    pods: PodControl,
    in_place: InPlaceUpdater,
    status: StatusUpdater,
    stepper: CanaryStepper,
    pre_delete: PreDeleteGate,
    clock: Arc<dyn Clock>,
    config: ControllerConfig,
}

impl GameStatefulSetControl {
    pub fn new(
        store: ResourceStore,
        workloads: Arc<Informer<GameStatefulSet>>,
        hook_runs: Arc<Informer<HookRun>>,
        durations: Arc<DurationStore>,
        clock: Arc<dyn Clock>,
        config: ControllerConfig,
    ) -> Self {
        let backoff = config.retry_backoff;
        Self {
            pods: PodControl::new(&store, config.pod_update_retries, backoff),
            in_place: InPlaceUpdater::new(
                Arc::clone(&store.pods),
                Arc::clone(&clock),
                config.pod_update_retries,
                backoff,
            ),
            status: StatusUpdater::new(
                Arc::clone(&store.workloads),
                workloads,
                config.status_update_retries,
                backoff,
            ),
            stepper: CanaryStepper::new(
                Arc::clone(&store.hook_runs),
                Arc::clone(&durations),
                config.hook_poll_interval,
            ),
            pre_delete: PreDeleteGate::new(
                Arc::clone(&store.hook_runs),
                durations,
                config.hook_poll_interval,
            ),
            hook_runs,
            store,
            clock,
            config,
        }
    }

    /// Reconciles `set` against the pods and revisions it owns. Status is
    /// written even when the pod pass fails; that failure is returned after.
    pub async fn update_game_stateful_set(
        &self,
        set: GameStatefulSet,
        pods: Vec<Pod>,
        revisions: Vec<ControllerRevision>,
    ) -> Result<GameStatefulSetStatus, ControlError> {
        let mut history = revisions;
        sort_controller_revisions(&mut history);
        let resolved = self.get_revisions(&set, &history).await?;
        history.retain(|revision| revision.name() != resolved.update.name());
        history.push(resolved.update.clone());
        sort_controller_revisions(&mut history);

        let hook_runs: Vec<HookRun> = self
            .hook_runs
            .list(Some(&set.metadata.namespace()))
            .into_iter()
            .filter(|run| {
                run.metadata
                    .controller_ref()
                    .is_some_and(|owner| owner.uid == set.metadata.uid())
            })
            .collect();
        let mut ctx = CanaryContext::new(
            &set,
            hook_runs,
            &resolved.current,
            &resolved.update,
            resolved.collision_count,
            self.clock.now(),
        )?;
        let canary_partition = self.stepper.reconcile(&mut ctx, &pods).await?;

        let pass = self
            .update_pods(&mut ctx, &resolved, &history, canary_partition, &pods)
            .await;
        let status = self.status.persist_status(&set, ctx.into_status()).await;
        pass?;
        let status = status?;

        self.truncate_history(&set, &pods, &history, &resolved).await?;
        Ok(status)
    }

    /// Resolves the update revision for the template `set` declares now,
    /// reusing, renumbering or creating a stored revision, and the current
    /// revision named in status.
    async fn get_revisions(
        &self,
        set: &GameStatefulSet,
        history: &[ControllerRevision],
    ) -> Result<RevisionPair, ControlError> {
        let status = set.status_or_default();
        let mut collision_count = status.collision_count.unwrap_or(0);
        let candidate = new_revision(set, next_revision(history), Some(collision_count))?;
        let equal = find_equal_revisions(history, &candidate);

        let update = match (history.last(), equal.last()) {
            (Some(latest), Some(found)) if equal_revision(latest, found) => latest.clone(),
            (_, Some(found)) => {
                log_info(
                    COMPONENT,
                    "Rolling back to an earlier revision",
                    &[
                        ("workload", &set.metadata.key()),
                        ("revision", found.name()),
                    ],
                );
                update_controller_revision(
                    self.store.revisions.as_ref(),
                    found,
                    candidate.revision,
                    self.config.status_update_retries,
                    self.config.retry_backoff,
                )
                .await?
            }
            (_, None) => {
                create_controller_revision(
                    self.store.revisions.as_ref(),
                    set,
                    &candidate,
                    &mut collision_count,
                )
                .await?
            }
        };

        let current = history
            .iter()
            .find(|revision| revision.name() == status.current_revision)
            .cloned()
            .unwrap_or_else(|| update.clone());
        Ok(RevisionPair {
            current,
            update,
            collision_count,
        })
    }

    async fn update_pods(
        &self,
        ctx: &mut CanaryContext,
        revisions: &RevisionPair,
        history: &[ControllerRevision],
        canary_partition: Option<i32>,
        pods: &[Pod],
    ) -> Result<(), ControlError> {
        let set = ctx.set().clone();
        let key = set.metadata.key();
        let current_name = revisions.current.name().to_string();
        let update_name = revisions.update.name().to_string();
        let current_set = apply_revision(&set, &revisions.current)?;
        let update_set = apply_revision(&set, &revisions.update)?;
        let replica_count = usize::try_from(set.replicas()).unwrap_or(0);
        let monotonic = set.spec.pod_management_policy == PodManagementPolicy::OrderedReady;
        let strategy = match canary_partition {
            Some(partition) => UpdateStrategy::for_set(&set)
                .with_partition(partition)
                .clamped(set.replicas()),
            None => UpdateStrategy::for_set(&set),
        };

        let mut slots: Vec<Option<Replica>> = (0..replica_count).map(|_| None).collect();
        let mut condemned: Vec<Pod> = Vec::new();
        {
            let status = &mut ctx.new_status;
            for pod in pods {
                status.replicas += 1;
                if is_running_and_ready(pod) {
                    status.ready_replicas += 1;
                }
                if counts_as_current(pod, &current_name) {
                    status.current_replicas += 1;
                }
                if counts_as_updated(pod, &update_name) {
                    status.updated_replicas += 1;
                }
                match get_ordinal(pod).map(|ordinal| ordinal as usize) {
                    Some(ordinal) if ordinal < replica_count => {
                        slots[ordinal] = Some(Replica {
                            pod: pod.clone(),
                            exists: true,
                        });
                    }
                    Some(_) => condemned.push(pod.clone()),
                    None => {}
                }
            }
        }

        let new_pod = |ordinal: usize| Replica {
            pod: new_versioned_pod(
                &current_set,
                &update_set,
                &current_name,
                &update_name,
                ordinal as u32,
                &strategy,
            ),
            exists: false,
        };
        let mut replicas: Vec<Replica> = slots
            .into_iter()
            .enumerate()
            .map(|(ordinal, slot)| slot.unwrap_or_else(|| new_pod(ordinal)))
            .collect();
        condemned.sort_by(|a, b| get_ordinal(b).cmp(&get_ordinal(a)));

        let first_unhealthy = replicas
            .iter()
            .filter(|replica| replica.exists)
            .map(|replica| &replica.pod)
            .chain(condemned.iter())
            .find(|pod| !is_healthy(pod))
            .map(|pod| pod.metadata.name().to_string());

        if set.metadata.deletion_timestamp.is_some() {
            return Ok(());
        }

        for ordinal in 0..replicas.len() {
            if replicas[ordinal].exists && is_failed(&replicas[ordinal].pod) {
                let failed = replicas[ordinal].pod.clone();
                log_info(
                    COMPONENT,
                    "Recreating failed pod",
                    &[("workload", &key), ("pod", failed.metadata.name())],
                );
                self.pods.delete_pod(&set, &failed).await?;
                if counts_as_current(&failed, &current_name) {
                    ctx.new_status.current_replicas -= 1;
                }
                if counts_as_updated(&failed, &update_name) {
                    ctx.new_status.updated_replicas -= 1;
                }
                ctx.new_status.replicas -= 1;
                replicas[ordinal] = new_pod(ordinal);
            }

            let replica = &replicas[ordinal];
            if !replica.exists {
                let created = self.pods.create_pod(&set, &replica.pod).await?;
                let revision = get_pod_revision(&created);
                ctx.new_status.replicas += 1;
                if revision == current_name {
                    ctx.new_status.current_replicas += 1;
                }
                if revision == update_name {
                    ctx.new_status.updated_replicas += 1;
                }
                replicas[ordinal] = Replica {
                    pod: created,
                    exists: true,
                };
                if monotonic {
                    return Ok(());
                }
                continue;
            }

            let pod = &replica.pod;
            if is_terminating(pod) && monotonic {
                log_debug(
                    COMPONENT,
                    "Waiting for pod to terminate",
                    &[("workload", &key), ("pod", pod.metadata.name())],
                );
                return Ok(());
            }
            if !is_running_and_ready(pod) && monotonic {
                log_debug(
                    COMPONENT,
                    "Waiting for pod to become running and ready",
                    &[("workload", &key), ("pod", pod.metadata.name())],
                );
                return Ok(());
            }
            if is_terminating(pod) || (identity_matches(&set, pod) && storage_matches(&set, pod)) {
                continue;
            }
            let repaired = self.pods.update_pod(&set, pod).await?;
            replicas[ordinal].pod = repaired;
        }

        for target in &condemned {
            if is_terminating(target) {
                if monotonic {
                    return Ok(());
                }
                continue;
            }
            if !is_running_and_ready(target)
                && monotonic
                && first_unhealthy.as_deref() != Some(target.metadata.name())
            {
                log_debug(
                    COMPONENT,
                    "Waiting for unhealthy pod before scaling down",
                    &[
                        ("workload", &key),
                        ("unhealthy", first_unhealthy.as_deref().unwrap_or_default()),
                    ],
                );
                return Ok(());
            }
            if self.pre_delete.check(ctx, target).await? == PreDeleteVerdict::Wait {
                if monotonic {
                    return Ok(());
                }
                continue;
            }
            log_info(
                COMPONENT,
                "Scaling down pod",
                &[("workload", &key), ("pod", target.metadata.name())],
            );
            self.pods.delete_pod(&set, target).await?;
            if counts_as_current(target, &current_name) {
                ctx.new_status.current_replicas -= 1;
            }
            if counts_as_updated(target, &update_name) {
                ctx.new_status.updated_replicas -= 1;
            }
            if monotonic {
                return Ok(());
            }
        }

        if strategy.is_on_delete() || ctx.has_add_pause() {
            return Ok(());
        }

        let appliers = StrategyAppliers {
            pods: &self.pods,
            in_place: &self.in_place,
        };
        let partition = usize::try_from(strategy.partition()).unwrap_or(0);
        for ordinal in (partition..replicas.len()).rev() {
            let pod = &replicas[ordinal].pod;
            let revision = get_pod_revision(pod).to_string();
            if revision != update_name && !is_terminating(pod) {
                if matches!(strategy, UpdateStrategy::RollingUpdate { .. })
                    && self.pre_delete.check(ctx, pod).await? == PreDeleteVerdict::Wait
                {
                    return Ok(());
                }
                let old_revision = history.iter().find(|candidate| candidate.name() == revision);
                log_info(
                    COMPONENT,
                    "Updating pod to the update revision",
                    &[
                        ("workload", &key),
                        ("pod", pod.metadata.name()),
                        ("strategy", strategy.name()),
                        ("revision", &update_name),
                    ],
                );
                let outcome = strategy
                    .apply(&appliers, &set, pod, old_revision, &revisions.update)
                    .await?;
                if matches!(outcome, ApplyOutcome::Recreating) && revision == current_name {
                    ctx.new_status.current_replicas -= 1;
                }
                return Ok(());
            }
            if !is_healthy(pod) || !in_place_update_completed(pod) || !hot_patch_completed(pod) {
                log_debug(
                    COMPONENT,
                    "Waiting for updated pod to become healthy",
                    &[("workload", &key), ("pod", pod.metadata.name())],
                );
                return Ok(());
            }
        }
        Ok(())
    }

    /// Deletes the oldest revisions no pod references, keeping
    /// `revisionHistoryLimit` of them.
    async fn truncate_history(
        &self,
        set: &GameStatefulSet,
        pods: &[Pod],
        history: &[ControllerRevision],
        revisions: &RevisionPair,
    ) -> Result<(), StoreError> {
        let mut live: BTreeSet<&str> = pods.iter().map(get_pod_revision).collect();
        live.insert(revisions.current.name());
        live.insert(revisions.update.name());
        let stale: Vec<&ControllerRevision> = history
            .iter()
            .filter(|revision| !live.contains(revision.name()))
            .collect();
        let limit = usize::try_from(set.revision_history_limit()).unwrap_or(0);
        if stale.len() <= limit {
            return Ok(());
        }
        for revision in &stale[..stale.len() - limit] {
            match self
                .store
                .revisions
                .delete(&revision.metadata.namespace(), revision.name())
                .await
            {
                Ok(()) => log_debug(
                    COMPONENT,
                    "Deleted stale revision",
                    &[
                        ("workload", &set.metadata.key()),
                        ("revision", revision.name()),
                    ],
                ),
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

/// A live pod labelled with the current revision.
fn counts_as_current(pod: &Pod, current_name: &str) -> bool {
    !is_terminating(pod) && get_pod_revision(pod) == current_name
}

/// A live pod on the update revision whose in-place and hot-patch updates
/// have both landed. Removing a pod undoes exactly what counting added.
fn counts_as_updated(pod: &Pod, update_name: &str) -> bool {
    !is_terminating(pod)
        && get_pod_revision(pod) == update_name
        && in_place_update_completed(pod)
        && hot_patch_completed(pod)
}

#[cfg(test)]
mod tests {
    use crate::gamestatefulset::controller::identity::get_pod_revision;
    use crate::gamestatefulset::controller::inplace::{
        HotPatchUpdateState, LastContainerStatus, HOT_PATCH_STATE_ANNOTATION,
    };
    use crate::gamestatefulset::k8s::gamestatefulset::{GameStatefulSet, PodManagementPolicy};
    use crate::gamestatefulset::k8s::pod::{PodStatus, POD_FAILED};
    use crate::gamestatefulset::k8s::store::{ObjectStore, StoreError, StoreOperation};
    use crate::gamestatefulset::test_support::{game_stateful_set, ControllerHarness};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn set_image(image: &'static str) -> impl FnOnce(&mut GameStatefulSet) {
        move |set| set.spec.template.spec.containers[0].image = Some(image.to_string())
    }

    #[tokio::test]
    async fn ordered_ready_creates_one_pod_per_ready_predecessor() {
        let harness = ControllerHarness::new();
        harness.create(game_stateful_set("web", 3)).await;

        harness.sync("web").await.expect("sync");
        assert_eq!(harness.pods().await.len(), 1);
        harness.sync("web").await.expect("sync");
        assert_eq!(harness.pods().await.len(), 1, "web-0 is not ready yet");

        harness.run_kubelet().await;
        harness.sync("web").await.expect("sync");
        let names: Vec<String> = harness
            .pods()
            .await
            .iter()
            .map(|pod| pod.metadata.name().to_string())
            .collect();
        assert_eq!(names, vec!["web-0", "web-1"]);
    }

    #[tokio::test]
    async fn parallel_policy_creates_every_missing_pod_at_once() {
        let harness = ControllerHarness::new();
        let mut set = game_stateful_set("web", 3);
        set.spec.pod_management_policy = PodManagementPolicy::Parallel;
        harness.create(set).await;

        harness.sync("web").await.expect("sync");
        assert_eq!(harness.pods().await.len(), 3);
    }

    #[tokio::test]
    async fn status_is_written_when_the_pod_pass_fails() {
        let harness = ControllerHarness::new();
        harness.create(game_stateful_set("web", 1)).await;
        harness.stores.pods.fail_next(
            StoreOperation::Create,
            StoreError::Unavailable("injected".to_string()),
        );

        assert!(harness.sync("web").await.is_err());
        let status = harness.workload("web").await.status.expect("status written");
        assert_eq!(status.replicas, 0);
        assert!(!status.update_revision.is_empty());
        assert_eq!(status.current_revision, status.update_revision);
    }

    #[tokio::test]
    async fn failed_pod_is_replaced_in_one_pass() {
        let harness = ControllerHarness::new();
        harness.create(game_stateful_set("web", 1)).await;
        harness.settle("web").await;
        let before = harness.pods().await.remove(0);

        let mut failed = before.clone();
        failed.status = Some(PodStatus {
            phase: Some(POD_FAILED.to_string()),
            ..Default::default()
        });
        harness.stores.pods.update_status(failed).await.expect("fail pod");

        harness.sync("web").await.expect("sync");
        let after = harness.pods().await;
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].metadata.name(), "web-0");
        assert_ne!(after[0].metadata.uid(), before.metadata.uid());
        assert_eq!(get_pod_revision(&after[0]), get_pod_revision(&before));
    }

    #[tokio::test]
    async fn failed_pod_with_pending_hot_patch_keeps_updated_count() {
        let harness = ControllerHarness::new();
        harness.create(game_stateful_set("web", 1)).await;
        harness.settle("web").await;

        let mut pod = harness.pods().await.remove(0);
        let image_id = pod
            .container_status("game")
            .and_then(|status| status.image_id.clone())
            .expect("image id");
        let state = HotPatchUpdateState {
            revision: get_pod_revision(&pod).to_string(),
            update_timestamp: Utc::now(),
            last_container_statuses: BTreeMap::from([(
                "game".to_string(),
                LastContainerStatus { image_id },
            )]),
        };
        pod.metadata.annotations.insert(
            HOT_PATCH_STATE_ANNOTATION.to_string(),
            serde_json::to_string(&state).expect("encode state"),
        );
        let mut pod = harness.stores.pods.update(pod).await.expect("annotate pod");
        pod.status = Some(PodStatus {
            phase: Some(POD_FAILED.to_string()),
            ..Default::default()
        });
        harness.stores.pods.update_status(pod).await.expect("fail pod");

        harness.sync("web").await.expect("sync");
        let status = harness.workload("web").await.status.expect("status");
        assert_eq!(status.replicas, 1);
        assert_eq!(status.current_replicas, 1);
        assert_eq!(status.updated_replicas, 1);
    }

    #[tokio::test]
    async fn rollback_reuses_the_stored_revision() {
        let harness = ControllerHarness::new();
        harness.create(game_stateful_set("web", 1)).await;
        harness.settle("web").await;
        let original = harness.workload("web").await.status.expect("status").update_revision;

        harness.edit("web", set_image("game:v2")).await;
        harness.settle("web").await;
        let second = harness.workload("web").await.status.expect("status").update_revision;
        assert_ne!(second, original);

        harness.edit("web", set_image("game:v1")).await;
        harness.settle("web").await;
        let status = harness.workload("web").await.status.expect("status");
        assert_eq!(status.update_revision, original);
        assert_eq!(status.current_revision, original);

        let revisions = harness.stores.revisions.list(Some("default")).await.expect("list");
        assert_eq!(revisions.len(), 2);
        let reused = revisions
            .iter()
            .find(|revision| revision.name() == original)
            .expect("original kept");
        assert_eq!(reused.revision, 3);
    }

    #[tokio::test]
    async fn stale_revisions_beyond_the_limit_are_deleted() {
        let harness = ControllerHarness::new();
        let mut set = game_stateful_set("web", 1);
        set.spec.revision_history_limit = Some(1);
        harness.create(set).await;
        harness.settle("web").await;

        for image in ["game:v2", "game:v3", "game:v4"] {
            harness.edit("web", set_image(image)).await;
            harness.settle("web").await;
        }

        let status = harness.workload("web").await.status.expect("status");
        let mut names: Vec<String> = harness
            .stores
            .revisions
            .list(Some("default"))
            .await
            .expect("list")
            .iter()
            .map(|revision| revision.name().to_string())
            .collect();
        names.sort();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&status.update_revision));
    }
}
