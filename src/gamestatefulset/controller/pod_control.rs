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

//! Pod and claim mutations issued on behalf of a workload.

use crate::gamestatefulset::controller::identity::{
    get_persistent_volume_claims, identity_matches, storage_matches, update_identity,
    update_storage,
};
use crate::gamestatefulset::controller::retry::{with_conflict_retry, Backoff, RetryError};
use crate::gamestatefulset::k8s::gamestatefulset::GameStatefulSet;
use crate::gamestatefulset::k8s::persistentvolumeclaim::PersistentVolumeClaim;
use crate::gamestatefulset::k8s::pod::Pod;
use crate::gamestatefulset::k8s::store::{ObjectStore, ResourceStore, StoreError};
use crate::gamestatefulset::logger::{log_info, log_warn};
use std::sync::Arc;

const COMPONENT: &str = "pod-control";

pub struct PodControl {
    pods: Arc<dyn ObjectStore<Pod>>,
    claims: Arc<dyn ObjectStore<PersistentVolumeClaim>>,
    max_attempts: u32,
    backoff: Backoff,
}

impl PodControl {
    pub fn new(store: &ResourceStore, max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            pods: Arc::clone(&store.pods),
            claims: Arc::clone(&store.claims),
            max_attempts,
            backoff,
        }
    }

    /// Creates the pod's claims, then the pod itself.
    pub async fn create_pod(&self, set: &GameStatefulSet, pod: &Pod) -> Result<Pod, StoreError> {
        self.create_persistent_volume_claims(set, pod).await?;
        let created = self.pods.create(pod.clone()).await?;
        log_info(
            COMPONENT,
            "Created pod",
            &[
                ("workload", &set.metadata.key()),
                ("pod", created.metadata.name()),
            ],
        );
        Ok(created)
    }

    /// Repairs identity and storage drift on a live pod. A pod that already
    /// matches is returned untouched.
    pub async fn update_pod(
        &self,
        set: &GameStatefulSet,
        pod: &Pod,
    ) -> Result<Pod, RetryError<StoreError>> {
        let namespace = pod.metadata.namespace();
        let name = pod.metadata.name().to_string();
        with_conflict_retry(self.max_attempts, self.backoff, |attempt| {
            let namespace = namespace.clone();
            let name = name.clone();
            async move {
                let mut draft = if attempt == 0 {
                    pod.clone()
                } else {
                    self.pods.get(&namespace, &name).await?
                };
                let mut consistent = true;
                if !identity_matches(set, &draft) {
                    update_identity(set, &mut draft);
                    consistent = false;
                }
                if !storage_matches(set, &draft) {
                    update_storage(set, &mut draft);
                    self.create_persistent_volume_claims(set, &draft).await?;
                    consistent = false;
                }
                if consistent {
                    return Ok(draft);
                }
                let updated = self.pods.update(draft).await?;
                log_info(
                    COMPONENT,
                    "Repaired pod identity",
                    &[("workload", &set.metadata.key()), ("pod", &name)],
                );
                Ok(updated)
            }
        })
        .await
    }

    /// Deletes the pod; a pod that is already gone counts as deleted.
    pub async fn delete_pod(&self, set: &GameStatefulSet, pod: &Pod) -> Result<(), StoreError> {
        let namespace = pod.metadata.namespace();
        match self.pods.delete(&namespace, pod.metadata.name()).await {
            Ok(()) => {
                log_info(
                    COMPONENT,
                    "Deleted pod",
                    &[("workload", &set.metadata.key()), ("pod", pod.metadata.name())],
                );
                Ok(())
            }
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => {
                log_warn(
                    COMPONENT,
                    "Failed to delete pod",
                    &[
                        ("workload", &set.metadata.key()),
                        ("pod", pod.metadata.name()),
                        ("error", &err.to_string()),
                    ],
                );
                Err(err)
            }
        }
    }

    /// Creates every claim the pod mounts that does not exist yet.
    pub async fn create_persistent_volume_claims(
        &self,
        set: &GameStatefulSet,
        pod: &Pod,
    ) -> Result<(), StoreError> {
        for claim in get_persistent_volume_claims(set, pod).into_values() {
            let namespace = claim.metadata.namespace();
            match self.claims.get(&namespace, claim.metadata.name()).await {
                Ok(_) => continue,
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
            let name = claim.metadata.name().to_string();
            match self.claims.create(claim).await {
                Ok(_) => log_info(
                    COMPONENT,
                    "Created persistent volume claim",
                    &[("workload", &set.metadata.key()), ("claim", &name)],
                ),
                Err(err) if err.is_already_exists() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gamestatefulset::controller::identity::{new_game_stateful_set_pod, POD_NAME_LABEL};
    use crate::gamestatefulset::k8s::store::{InMemoryStores, StoreOperation};
    use crate::gamestatefulset::test_support::{claim_template, game_stateful_set};
    use std::time::Duration;

    fn control(stores: &InMemoryStores) -> PodControl {
        PodControl::new(
            &stores.resource_store(),
            3,
            Backoff::new(Duration::from_millis(1), 2, Duration::from_millis(2)),
        )
    }

    #[tokio::test]
    async fn create_pod_creates_claims_first() {
        let stores = InMemoryStores::new();
        let mut set = game_stateful_set("web", 1);
        set.spec.volume_claim_templates = vec![claim_template("data")];
        let pod = new_game_stateful_set_pod(&set, 0);

        control(&stores).create_pod(&set, &pod).await.expect("create");
        assert_eq!(stores.pods.len(), 1);
        let claim = stores.claims.get("default", "data-web-0").await.expect("claim created");
        assert_eq!(claim.metadata.labels.get("app").map(String::as_str), Some("web"));

        // A second pass finds the claim and does not fail on it.
        control(&stores)
            .create_persistent_volume_claims(&set, &pod)
            .await
            .expect("idempotent");
        assert_eq!(stores.claims.len(), 1);
    }

    #[tokio::test]
    async fn update_pod_repairs_identity_label() {
        let stores = InMemoryStores::new();
        let set = game_stateful_set("web", 1);
        let mut pod = new_game_stateful_set_pod(&set, 0);
        pod.metadata.labels.remove(POD_NAME_LABEL);
        let live = stores.pods.create(pod).await.expect("seed");
        stores.pods.fail_next(
            StoreOperation::Update,
            StoreError::Conflict {
                kind: "Pod",
                key: "default/web-0".to_string(),
            },
        );

        let repaired = control(&stores).update_pod(&set, &live).await.expect("repair");
        assert!(identity_matches(&set, &repaired));
    }

    #[tokio::test]
    async fn delete_of_missing_pod_succeeds() {
        let stores = InMemoryStores::new();
        let set = game_stateful_set("web", 1);
        let pod = new_game_stateful_set_pod(&set, 0);
        control(&stores).delete_pod(&set, &pod).await.expect("not found is fine");
    }
}
