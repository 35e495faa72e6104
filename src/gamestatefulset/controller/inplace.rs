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

//! In-place and hot-patch pod updates.
//!
//! Both strategies only support image changes: the new revision's template may
//! differ from the pod's revision in `spec.containers[*].image` and nowhere
//! else. The pod is patched through a fetch-modify-update loop against the
//! live store.

use crate::gamestatefulset::controller::identity::{get_pod_revision, set_pod_revision};
use crate::gamestatefulset::controller::retry::{with_conflict_retry, Backoff, RetryError};
use crate::gamestatefulset::k8s::pod::{Pod, PodTemplateSpec};
use crate::gamestatefulset::k8s::store::{ObjectStore, StoreError};
use crate::gamestatefulset::util::clock::Clock;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

pub const HOT_PATCH_STATE_ANNOTATION: &str = "io.gamestatefulset.hotpatch-update-state";
pub const HOT_PATCH_CONTAINER_LABEL: &str = "io.gamestatefulset.hotpatch.container";

#[derive(Debug, thiserror::Error)]
pub enum InPlaceError {
    #[error("in-place update does not support changing {field}")]
    UnsupportedChange { field: String },
    #[error("failed to compare pod templates: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Update(#[from] RetryError<StoreError>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    InPlace,
    HotPatch,
}

impl UpdateKind {
    pub fn as_label(self) -> &'static str {
        match self {
            UpdateKind::InPlace => "inplace",
            UpdateKind::HotPatch => "hotpatch",
        }
    }
}

/// Changes an in-place update applies to a pod.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateSpec {
    pub revision: String,
    pub container_images: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastContainerStatus {
    #[serde(rename = "imageID")]
    pub image_id: String,
}

/// Annotation payload recording the image IDs a hot patch replaced, so an
/// agent on the node can tell when the patch has landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HotPatchUpdateState {
    pub revision: String,
    pub update_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub last_container_statuses: BTreeMap<String, LastContainerStatus>,
}

pub fn compute_update_spec(
    old: &PodTemplateSpec,
    new: &PodTemplateSpec,
    revision: &str,
) -> Result<UpdateSpec, InPlaceError> {
    let old_value = serde_json::to_value(old)?;
    let new_value = serde_json::to_value(new)?;
    let mut changed = Vec::new();
    diff_paths(String::new(), &old_value, &new_value, &mut changed);

    let mut container_images = BTreeMap::new();
    for path in changed {
        let index = container_image_index(&path)
            .ok_or_else(|| InPlaceError::UnsupportedChange { field: path.clone() })?;
        let container = new.spec.containers.get(index);
        match container.and_then(|c| c.image.as_ref().map(|image| (c, image))) {
            Some((container, image)) => {
                container_images.insert(container.name.clone(), image.clone());
            }
            None => return Err(InPlaceError::UnsupportedChange { field: path }),
        }
    }

    Ok(UpdateSpec {
        revision: revision.to_string(),
        container_images,
    })
}

/// Index `i` when `path` is `/spec/containers/<i>/image`.
fn container_image_index(path: &str) -> Option<usize> {
    let mut segments = path.strip_prefix('/')?.split('/');
    match (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) {
        (Some("spec"), Some("containers"), Some(index), Some("image"), None) => index.parse().ok(),
        _ => None,
    }
}

fn escape_pointer(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

/// Collects JSON-pointer paths where `old` and `new` differ. Arrays of equal
/// length are compared element-wise; anything else that differs is reported
/// at its own path.
fn diff_paths(prefix: String, old: &Value, new: &Value, out: &mut Vec<String>) {
    if old == new {
        return;
    }
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            let keys: BTreeSet<&String> = old_map.keys().chain(new_map.keys()).collect();
            for key in keys {
                let path = format!("{}/{}", prefix, escape_pointer(key));
                diff_paths(
                    path,
                    old_map.get(key).unwrap_or(&Value::Null),
                    new_map.get(key).unwrap_or(&Value::Null),
                    out,
                );
            }
        }
        (Value::Array(old_items), Value::Array(new_items)) if old_items.len() == new_items.len() => {
            for (index, (old_item, new_item)) in old_items.iter().zip(new_items).enumerate() {
                diff_paths(format!("{}/{}", prefix, index), old_item, new_item, out);
            }
        }
        _ => out.push(if prefix.is_empty() { "/".to_string() } else { prefix }),
    }
}

/// Applies [`UpdateSpec`]s to live pods.
pub struct InPlaceUpdater {
    pods: Arc<dyn ObjectStore<Pod>>,
    clock: Arc<dyn Clock>,
    max_attempts: u32,
    backoff: Backoff,
}

impl InPlaceUpdater {
    pub fn new(
        pods: Arc<dyn ObjectStore<Pod>>,
        clock: Arc<dyn Clock>,
        max_attempts: u32,
        backoff: Backoff,
    ) -> Self {
        Self {
            pods,
            clock,
            max_attempts,
            backoff,
        }
    }

    pub async fn update(
        &self,
        pod: &Pod,
        spec: &UpdateSpec,
        kind: UpdateKind,
    ) -> Result<Pod, InPlaceError> {
        let namespace = pod.metadata.namespace();
        let name = pod.metadata.name().to_string();
        let updated = with_conflict_retry(self.max_attempts, self.backoff, |_| {
            let namespace = namespace.clone();
            let name = name.clone();
            async move {
                let fresh = self.pods.get(&namespace, &name).await?;
                let draft = self.patched(&fresh, spec, kind)?;
                self.pods.update(draft).await
            }
        })
        .await?;
        Ok(updated)
    }

    fn patched(&self, fresh: &Pod, spec: &UpdateSpec, kind: UpdateKind) -> Result<Pod, StoreError> {
        let mut draft = fresh.clone();
        set_pod_revision(&mut draft, &spec.revision);
        for container in draft.spec.containers.iter_mut() {
            if let Some(image) = spec.container_images.get(&container.name) {
                container.image = Some(image.clone());
            }
        }

        if kind == UpdateKind::HotPatch {
            let last_container_statuses = spec
                .container_images
                .keys()
                .filter_map(|container| {
                    fresh
                        .container_status(container)
                        .and_then(|status| status.image_id.clone())
                        .map(|image_id| (container.clone(), LastContainerStatus { image_id }))
                })
                .collect();
            let state = HotPatchUpdateState {
                revision: spec.revision.clone(),
                update_timestamp: self.clock.now(),
                last_container_statuses,
            };
            let encoded = serde_json::to_string(&state).map_err(|err| StoreError::Invalid {
                kind: "Pod",
                message: err.to_string(),
            })?;
            draft
                .metadata
                .annotations
                .insert(HOT_PATCH_STATE_ANNOTATION.to_string(), encoded);
            draft
                .metadata
                .labels
                .insert(HOT_PATCH_CONTAINER_LABEL.to_string(), "true".to_string());
        }
        Ok(draft)
    }
}

pub fn hot_patch_state(pod: &Pod) -> Option<HotPatchUpdateState> {
    pod.metadata
        .annotations
        .get(HOT_PATCH_STATE_ANNOTATION)
        .and_then(|raw| serde_json::from_str(raw).ok())
}

/// A hot patch has landed once every recorded container reports an image ID
/// different from the one it had before the patch.
pub fn hot_patch_completed(pod: &Pod) -> bool {
    let Some(state) = hot_patch_state(pod) else {
        return true;
    };
    if state.revision != get_pod_revision(pod) {
        return true;
    }
    state.last_container_statuses.iter().all(|(container, last)| {
        pod.container_status(container)
            .and_then(|status| status.image_id.as_deref())
            .is_some_and(|image_id| image_id != last.image_id)
    })
}

/// An in-place update has landed once no container reports an image other
/// than the one in its spec.
pub fn in_place_update_completed(pod: &Pod) -> bool {
    pod.spec.containers.iter().all(|container| {
        pod.container_status(&container.name)
            .and_then(|status| status.image.as_ref())
            .map_or(true, |image| Some(image) == container.image.as_ref())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gamestatefulset::k8s::pod::{Container, ContainerStatus, PodStatus, ResourceRequirements};
    use crate::gamestatefulset::k8s::store::{MemoryStore, StoreOperation};
    use crate::gamestatefulset::test_support::{game_stateful_set, pod_for};
    use crate::gamestatefulset::util::clock::ManualClock;
    use std::time::Duration;

    fn template(images: &[(&str, &str)]) -> PodTemplateSpec {
        let mut template = PodTemplateSpec::default();
        template.spec.containers = images
            .iter()
            .map(|(name, image)| Container {
                name: name.to_string(),
                image: Some(image.to_string()),
                ..Default::default()
            })
            .collect();
        template
    }

    fn conflict() -> StoreError {
        StoreError::Conflict {
            kind: "Pod",
            key: "default/web-0".to_string(),
        }
    }

    fn updater(store: Arc<MemoryStore<Pod>>, attempts: u32) -> InPlaceUpdater {
        InPlaceUpdater::new(
            store,
            Arc::new(ManualClock::default()),
            attempts,
            Backoff::new(Duration::from_millis(1), 2, Duration::from_millis(2)),
        )
    }

    #[test]
    fn image_only_diff_yields_update_spec() {
        let old = template(&[("game", "game:v1"), ("sidecar", "proxy:v1")]);
        let new = template(&[("game", "game:v2"), ("sidecar", "proxy:v1")]);
        let spec = compute_update_spec(&old, &new, "web-abc").expect("image change supported");
        assert_eq!(spec.revision, "web-abc");
        assert_eq!(spec.container_images.len(), 1);
        assert_eq!(spec.container_images.get("game").map(String::as_str), Some("game:v2"));
    }

    #[test]
    fn resource_change_is_rejected() {
        let old = template(&[("game", "game:v1")]);
        let mut new = template(&[("game", "game:v2")]);
        new.spec.containers[0].resources = Some(ResourceRequirements {
            limits: [("cpu".to_string(), "2".to_string())].into_iter().collect(),
            ..Default::default()
        });
        match compute_update_spec(&old, &new, "rev") {
            Err(InPlaceError::UnsupportedChange { field }) => {
                assert!(field.starts_with("/spec/containers/0/resources"), "{field}");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn label_and_container_count_changes_are_rejected() {
        let old = template(&[("game", "game:v1")]);
        let mut relabeled = old.clone();
        relabeled
            .metadata
            .labels
            .insert("tier".to_string(), "gold".to_string());
        assert!(compute_update_spec(&old, &relabeled, "rev").is_err());

        let grown = template(&[("game", "game:v1"), ("sidecar", "proxy:v1")]);
        assert!(compute_update_spec(&old, &grown, "rev").is_err());
    }

    #[tokio::test]
    async fn in_place_update_retries_conflicts() {
        let store = Arc::new(MemoryStore::<Pod>::new());
        let set = game_stateful_set("web", 1);
        let pod = store.create(pod_for(&set, 0, "web-old")).await.expect("seed");
        store.fail_next(StoreOperation::Update, conflict());
        store.fail_next(StoreOperation::Update, conflict());

        let spec = UpdateSpec {
            revision: "web-new".to_string(),
            container_images: [("game".to_string(), "game:v2".to_string())]
                .into_iter()
                .collect(),
        };
        let updated = updater(store.clone(), 5)
            .update(&pod, &spec, UpdateKind::InPlace)
            .await
            .expect("update lands on third attempt");
        assert_eq!(get_pod_revision(&updated), "web-new");
        assert_eq!(updated.spec.containers[0].image.as_deref(), Some("game:v2"));
        assert!(!updated.metadata.labels.contains_key(HOT_PATCH_CONTAINER_LABEL));
    }

    #[tokio::test]
    async fn exhausted_retries_surface_explicit_error() {
        let store = Arc::new(MemoryStore::<Pod>::new());
        let set = game_stateful_set("web", 1);
        let pod = store.create(pod_for(&set, 0, "web-old")).await.expect("seed");
        for _ in 0..3 {
            store.fail_next(StoreOperation::Update, conflict());
        }
        let err = updater(store, 3)
            .update(&pod, &UpdateSpec::default(), UpdateKind::InPlace)
            .await
            .expect_err("conflicts exhaust the budget");
        assert!(err.to_string().contains("aborting update after 3 attempts"));
    }

    #[tokio::test]
    async fn hot_patch_records_previous_image_ids() {
        let store = Arc::new(MemoryStore::<Pod>::new());
        let set = game_stateful_set("web", 1);
        let pod = store.create(pod_for(&set, 0, "web-old")).await.expect("seed");
        let mut running = pod.clone();
        running.status = Some(PodStatus {
            container_statuses: vec![ContainerStatus {
                name: "game".to_string(),
                image: Some("game:v1".to_string()),
                image_id: Some("sha256:old".to_string()),
                ready: true,
                restart_count: 0,
            }],
            ..Default::default()
        });
        let pod = store.update_status(running).await.expect("status");

        let spec = UpdateSpec {
            revision: "web-new".to_string(),
            container_images: [("game".to_string(), "game:v2".to_string())]
                .into_iter()
                .collect(),
        };
        let mut patched = updater(store, 3)
            .update(&pod, &spec, UpdateKind::HotPatch)
            .await
            .expect("hot patch");
        assert_eq!(
            patched.metadata.labels.get(HOT_PATCH_CONTAINER_LABEL).map(String::as_str),
            Some("true")
        );
        let state = hot_patch_state(&patched).expect("state annotation");
        assert_eq!(state.revision, "web-new");
        assert_eq!(
            state.last_container_statuses.get("game").map(|s| s.image_id.as_str()),
            Some("sha256:old")
        );
        assert!(!hot_patch_completed(&patched));

        if let Some(status) = patched.status.as_mut() {
            status.container_statuses[0].image_id = Some("sha256:new".to_string());
        }
        assert!(hot_patch_completed(&patched));
    }

    #[test]
    fn in_place_completion_follows_reported_images() {
        let set = game_stateful_set("web", 1);
        let mut pod = pod_for(&set, 0, "rev");
        assert!(in_place_update_completed(&pod));
        pod.status = Some(PodStatus {
            container_statuses: vec![ContainerStatus {
                name: "game".to_string(),
                image: Some("game:v0".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        });
        assert!(!in_place_update_completed(&pod));
        if let Some(status) = pod.status.as_mut() {
            status.container_statuses[0].image = Some("game:v1".to_string());
        }
        assert!(in_place_update_completed(&pod));
    }
}
