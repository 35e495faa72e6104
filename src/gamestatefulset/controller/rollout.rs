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

//! Update strategies as a closed set, and the single entry point that moves
//! one pod from its revision to the update revision.

use crate::gamestatefulset::controller::history::{apply_revision, HistoryError};
use crate::gamestatefulset::controller::inplace::{
    compute_update_spec, InPlaceError, InPlaceUpdater, UpdateKind,
};
use crate::gamestatefulset::controller::pod_control::PodControl;
use crate::gamestatefulset::k8s::gamestatefulset::{
    GameStatefulSet, GameStatefulSetUpdateStrategy, UpdateStrategyType,
};
use crate::gamestatefulset::k8s::pod::Pod;
use crate::gamestatefulset::k8s::revision::ControllerRevision;
use crate::gamestatefulset::k8s::store::StoreError;
use crate::gamestatefulset::logger::log_warn;
use crate::gamestatefulset::observability::metrics;

const COMPONENT: &str = "rollout";

/// Which of the two live revisions a pod should be built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevisionTarget {
    Current,
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStrategy {
    RollingUpdate { partition: i32 },
    OnDelete,
    InPlaceUpdate { partition: i32 },
    HotPatchUpdate { partition: i32 },
}

impl Default for UpdateStrategy {
    fn default() -> Self {
        UpdateStrategy::RollingUpdate { partition: 0 }
    }
}

impl UpdateStrategy {
    pub fn from_spec(spec: &GameStatefulSetUpdateStrategy) -> Self {
        let partition = spec
            .rolling_update
            .as_ref()
            .and_then(|rolling| rolling.partition)
            .unwrap_or(0);
        match spec.r#type {
            UpdateStrategyType::RollingUpdate => UpdateStrategy::RollingUpdate { partition },
            UpdateStrategyType::OnDelete => UpdateStrategy::OnDelete,
            UpdateStrategyType::InPlaceUpdate => UpdateStrategy::InPlaceUpdate { partition },
            UpdateStrategyType::HotPatchUpdate => UpdateStrategy::HotPatchUpdate { partition },
        }
    }

    /// Strategy declared on `set` with its partition clamped to
    /// `[0, replicas]`.
    pub fn for_set(set: &GameStatefulSet) -> Self {
        Self::from_spec(&set.spec.update_strategy).clamped(set.replicas())
    }

    pub fn name(self) -> &'static str {
        match self {
            UpdateStrategy::RollingUpdate { .. } => "RollingUpdate",
            UpdateStrategy::OnDelete => "OnDelete",
            UpdateStrategy::InPlaceUpdate { .. } => "InPlaceUpdate",
            UpdateStrategy::HotPatchUpdate { .. } => "HotPatchUpdate",
        }
    }

    pub fn partition(self) -> i32 {
        match self {
            UpdateStrategy::RollingUpdate { partition }
            | UpdateStrategy::InPlaceUpdate { partition }
            | UpdateStrategy::HotPatchUpdate { partition } => partition,
            UpdateStrategy::OnDelete => 0,
        }
    }

    pub fn with_partition(self, partition: i32) -> Self {
        match self {
            UpdateStrategy::RollingUpdate { .. } => UpdateStrategy::RollingUpdate { partition },
            UpdateStrategy::InPlaceUpdate { .. } => UpdateStrategy::InPlaceUpdate { partition },
            UpdateStrategy::HotPatchUpdate { .. } => UpdateStrategy::HotPatchUpdate { partition },
            UpdateStrategy::OnDelete => UpdateStrategy::OnDelete,
        }
    }

    pub fn clamped(self, replicas: i32) -> Self {
        self.with_partition(self.partition().clamp(0, replicas.max(0)))
    }

    pub fn is_on_delete(self) -> bool {
        matches!(self, UpdateStrategy::OnDelete)
    }

    /// Ordinals below the partition stay on the current revision; the
    /// partition ordinal and everything above it move to the update revision.
    /// OnDelete always rebuilds at the update revision.
    pub fn revision_for_ordinal(self, ordinal: u32) -> RevisionTarget {
        if self.is_on_delete() {
            return RevisionTarget::Update;
        }
        if i64::from(ordinal) < i64::from(self.partition()) {
            RevisionTarget::Current
        } else {
            RevisionTarget::Update
        }
    }

    /// Moves `pod` towards `new_revision`.
    ///
    /// RollingUpdate deletes the pod so the next sync recreates it. The
    /// in-place strategies patch images on the live pod and fail when the
    /// two revisions differ anywhere else. When the pod's own revision is no
    /// longer in history the pod is recreated instead.
    pub async fn apply(
        self,
        appliers: &StrategyAppliers<'_>,
        set: &GameStatefulSet,
        pod: &Pod,
        old_revision: Option<&ControllerRevision>,
        new_revision: &ControllerRevision,
    ) -> Result<ApplyOutcome, ApplyError> {
        let kind = match self {
            UpdateStrategy::OnDelete => return Ok(ApplyOutcome::Untouched),
            UpdateStrategy::RollingUpdate { .. } => {
                appliers.pods.delete_pod(set, pod).await?;
                return Ok(ApplyOutcome::Recreating);
            }
            UpdateStrategy::InPlaceUpdate { .. } => UpdateKind::InPlace,
            UpdateStrategy::HotPatchUpdate { .. } => UpdateKind::HotPatch,
        };

        let Some(old_revision) = old_revision else {
            log_warn(
                COMPONENT,
                "Pod revision missing from history, recreating pod",
                &[
                    ("workload", &set.metadata.key()),
                    ("pod", pod.metadata.name()),
                ],
            );
            appliers.pods.delete_pod(set, pod).await?;
            return Ok(ApplyOutcome::Recreating);
        };

        let old_set = apply_revision(set, old_revision)?;
        let new_set = apply_revision(set, new_revision)?;
        let result = async {
            let spec = compute_update_spec(
                &old_set.spec.template,
                &new_set.spec.template,
                new_revision.name(),
            )?;
            appliers.in_place.update(pod, &spec, kind).await
        }
        .await;
        metrics::record_inplace_update(kind.as_label(), result.is_ok());
        Ok(ApplyOutcome::Patched(result?))
    }
}

/// Collaborators a strategy needs to touch pods.
pub struct StrategyAppliers<'a> {
    pub pods: &'a PodControl,
    pub in_place: &'a InPlaceUpdater,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// The pod was deleted and will be recreated at its target revision.
    Recreating,
    Patched(Pod),
    Untouched,
}

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error(transparent)]
    InPlace(#[from] InPlaceError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gamestatefulset::controller::history::new_revision;
    use crate::gamestatefulset::controller::identity::get_pod_revision;
    use crate::gamestatefulset::controller::retry::Backoff;
    use crate::gamestatefulset::k8s::gamestatefulset::RollingUpdateStrategy;
    use crate::gamestatefulset::k8s::pod::ResourceRequirements;
    use crate::gamestatefulset::k8s::store::{InMemoryStores, ObjectStore};
    use crate::gamestatefulset::test_support::{game_stateful_set, pod_for};
    use crate::gamestatefulset::util::clock::ManualClock;
    use std::sync::Arc;
    use std::time::Duration;

    fn spec(kind: UpdateStrategyType, partition: Option<i32>) -> GameStatefulSetUpdateStrategy {
        GameStatefulSetUpdateStrategy {
            r#type: kind,
            rolling_update: Some(RollingUpdateStrategy {
                partition,
                paused: false,
            }),
            canary: None,
        }
    }

    #[test]
    fn partition_boundary_pins_lower_ordinals() {
        for kind in [
            UpdateStrategyType::RollingUpdate,
            UpdateStrategyType::InPlaceUpdate,
            UpdateStrategyType::HotPatchUpdate,
        ] {
            let strategy = UpdateStrategy::from_spec(&spec(kind, Some(2)));
            assert_eq!(strategy.revision_for_ordinal(1), RevisionTarget::Current);
            assert_eq!(strategy.revision_for_ordinal(2), RevisionTarget::Update);
            assert_eq!(strategy.revision_for_ordinal(3), RevisionTarget::Update);
        }
    }

    #[test]
    fn missing_partition_updates_everything() {
        let strategy = UpdateStrategy::from_spec(&GameStatefulSetUpdateStrategy::default());
        assert_eq!(strategy, UpdateStrategy::RollingUpdate { partition: 0 });
        assert_eq!(strategy.revision_for_ordinal(0), RevisionTarget::Update);
    }

    #[test]
    fn on_delete_always_targets_update_revision() {
        let strategy = UpdateStrategy::from_spec(&spec(UpdateStrategyType::OnDelete, Some(5)));
        assert!(strategy.is_on_delete());
        assert_eq!(strategy.partition(), 0);
        assert_eq!(strategy.revision_for_ordinal(0), RevisionTarget::Update);
    }

    #[test]
    fn partition_is_clamped_to_replicas() {
        let mut set = game_stateful_set("web", 3);
        set.spec.update_strategy = spec(UpdateStrategyType::RollingUpdate, Some(7));
        assert_eq!(UpdateStrategy::for_set(&set).partition(), 3);
        set.spec.update_strategy = spec(UpdateStrategyType::RollingUpdate, Some(-4));
        assert_eq!(UpdateStrategy::for_set(&set).partition(), 0);
    }

    struct Fixture {
        stores: InMemoryStores,
        pods: PodControl,
        in_place: InPlaceUpdater,
    }

    fn fixture() -> Fixture {
        let stores = InMemoryStores::new();
        let backoff = Backoff::new(Duration::from_millis(1), 2, Duration::from_millis(2));
        let store = stores.resource_store();
        Fixture {
            pods: PodControl::new(&store, 3, backoff),
            in_place: InPlaceUpdater::new(
                Arc::clone(&store.pods),
                Arc::new(ManualClock::default()),
                3,
                backoff,
            ),
            stores,
        }
    }

    #[tokio::test]
    async fn rolling_update_deletes_pod() {
        let fx = fixture();
        let set = game_stateful_set("web", 1);
        let old = new_revision(&set, 1, None).expect("old revision");
        let pod = fx
            .stores
            .pods
            .create(pod_for(&set, 0, old.name()))
            .await
            .expect("seed");
        let appliers = StrategyAppliers {
            pods: &fx.pods,
            in_place: &fx.in_place,
        };
        let outcome = UpdateStrategy::RollingUpdate { partition: 0 }
            .apply(&appliers, &set, &pod, Some(&old), &old)
            .await
            .expect("apply");
        assert_eq!(outcome, ApplyOutcome::Recreating);
        assert!(fx.stores.pods.is_empty());
    }

    #[tokio::test]
    async fn in_place_patches_image_and_revision() {
        let fx = fixture();
        let set = game_stateful_set("web", 1);
        let old = new_revision(&set, 1, None).expect("old revision");
        let mut updated_set = set.clone();
        updated_set.spec.template.spec.containers[0].image = Some("game:v2".to_string());
        let new = new_revision(&updated_set, 2, None).expect("new revision");
        let pod = fx
            .stores
            .pods
            .create(pod_for(&set, 0, old.name()))
            .await
            .expect("seed");

        let appliers = StrategyAppliers {
            pods: &fx.pods,
            in_place: &fx.in_place,
        };
        let outcome = UpdateStrategy::InPlaceUpdate { partition: 0 }
            .apply(&appliers, &updated_set, &pod, Some(&old), &new)
            .await
            .expect("apply");
        let ApplyOutcome::Patched(patched) = outcome else {
            panic!("expected in-place patch, got {outcome:?}");
        };
        assert_eq!(get_pod_revision(&patched), new.name());
        assert_eq!(patched.spec.containers[0].image.as_deref(), Some("game:v2"));
        assert_eq!(patched.metadata.uid, pod.metadata.uid);
    }

    #[tokio::test]
    async fn in_place_rejects_non_image_change() {
        let fx = fixture();
        let set = game_stateful_set("web", 1);
        let old = new_revision(&set, 1, None).expect("old revision");
        let mut updated_set = set.clone();
        updated_set.spec.template.spec.containers[0].resources = Some(ResourceRequirements {
            limits: [("memory".to_string(), "1Gi".to_string())].into_iter().collect(),
            ..Default::default()
        });
        let new = new_revision(&updated_set, 2, None).expect("new revision");
        let pod = fx
            .stores
            .pods
            .create(pod_for(&set, 0, old.name()))
            .await
            .expect("seed");

        let appliers = StrategyAppliers {
            pods: &fx.pods,
            in_place: &fx.in_place,
        };
        let err = UpdateStrategy::HotPatchUpdate { partition: 0 }
            .apply(&appliers, &updated_set, &pod, Some(&old), &new)
            .await
            .expect_err("resource change is not patchable");
        assert!(err.to_string().contains("resources"), "{err}");
        let live = fx.stores.pods.get("default", "web-0").await.expect("pod kept");
        assert_eq!(get_pod_revision(&live), old.name());
    }
}
