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

//! Fixtures shared by unit tests and the scenario suites.

#![allow(dead_code)]

use crate::gamestatefulset::config::ControllerConfig;
use crate::gamestatefulset::controller::gamestatefulset::{GameStatefulSetController, SyncError};
use crate::gamestatefulset::controller::identity::{
    ascending_ordinal, new_game_stateful_set_pod, set_pod_revision,
};
use crate::gamestatefulset::controller::retry::Backoff;
use crate::gamestatefulset::k8s::gamestatefulset::{GameStatefulSet, GameStatefulSetSpec};
use crate::gamestatefulset::k8s::hookrun::{HookRun, HookRunPhase, HookRunStatus};
use crate::gamestatefulset::k8s::meta::{LabelSelector, ObjectMeta};
use crate::gamestatefulset::k8s::persistentvolumeclaim::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, ResourceRequests,
};
use crate::gamestatefulset::k8s::pod::{
    Container, ContainerStatus, Pod, PodCondition, PodSpec, PodStatus, PodTemplateSpec,
    CONDITION_READY, POD_RUNNING,
};
use crate::gamestatefulset::k8s::store::{InMemoryStores, ObjectStore};
use crate::gamestatefulset::util::clock::ManualClock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub const NAMESPACE: &str = "default";

/// Workload `name` selecting `app=name`, with one container `game` running
/// `game:v1`.
pub fn game_stateful_set(name: &str, replicas: i32) -> GameStatefulSet {
    let labels = BTreeMap::from([("app".to_string(), name.to_string())]);
    GameStatefulSet::new(
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            uid: Some(format!("{name}-uid")),
            ..Default::default()
        },
        GameStatefulSetSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: labels.clone(),
                ..Default::default()
            },
            service_name: name.to_string(),
            template: PodTemplateSpec {
                metadata: ObjectMeta {
                    labels,
                    ..Default::default()
                },
                spec: PodSpec {
                    containers: vec![Container {
                        name: "game".to_string(),
                        image: Some("game:v1".to_string()),
                        ..Default::default()
                    }],
                    ..Default::default()
                },
            },
            ..Default::default()
        },
    )
}

pub fn claim_template(name: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: PersistentVolumeClaimSpec {
            resources: Some(ResourceRequests {
                requests: BTreeMap::from([("storage".to_string(), "1Gi".to_string())]),
            }),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn pod_for(set: &GameStatefulSet, ordinal: u32, revision: &str) -> Pod {
    let mut pod = new_game_stateful_set_pod(set, ordinal);
    set_pod_revision(&mut pod, revision);
    pod
}

pub fn ready_pod_for(set: &GameStatefulSet, ordinal: u32, revision: &str) -> Pod {
    let mut pod = pod_for(set, ordinal, revision);
    pod.status = Some(kubelet_status(&pod));
    pod
}

/// Status a node agent would report for a running, ready pod: every
/// container runs the image in its spec.
pub fn kubelet_status(pod: &Pod) -> PodStatus {
    PodStatus {
        phase: Some(POD_RUNNING.to_string()),
        conditions: vec![PodCondition {
            condition_type: CONDITION_READY.to_string(),
            status: "True".to_string(),
        }],
        container_statuses: pod
            .spec
            .containers
            .iter()
            .map(|container| ContainerStatus {
                name: container.name.clone(),
                image: container.image.clone(),
                image_id: container.image.as_ref().map(|image| format!("sha256:{image}")),
                ready: true,
                restart_count: 0,
            })
            .collect(),
        pod_ip: None,
    }
}

/// A controller wired to in-memory stores and a manual clock.
pub struct ControllerHarness {
    pub stores: InMemoryStores,
    pub clock: Arc<ManualClock>,
    pub controller: Arc<GameStatefulSetController>,
}

impl Default for ControllerHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerHarness {
    pub fn new() -> Self {
        Self::with_config(ControllerConfig {
            retry_backoff: Backoff::new(Duration::from_millis(1), 2, Duration::from_millis(4)),
            ..ControllerConfig::default()
        })
    }

    pub fn with_config(config: ControllerConfig) -> Self {
        let stores = InMemoryStores::new();
        let clock = Arc::new(ManualClock::default());
        let controller = Arc::new(GameStatefulSetController::new(
            stores.resource_store(),
            clock.clone(),
            config,
        ));
        Self {
            stores,
            clock,
            controller,
        }
    }

    pub async fn create(&self, set: GameStatefulSet) -> GameStatefulSet {
        self.stores.workloads.create(set).await.expect("create workload")
    }

    pub async fn workload(&self, name: &str) -> GameStatefulSet {
        self.stores
            .workloads
            .get(NAMESPACE, name)
            .await
            .expect("workload exists")
    }

    /// Applies `mutate` to the live workload and stores the result.
    pub async fn edit(&self, name: &str, mutate: impl FnOnce(&mut GameStatefulSet)) {
        let mut set = self.workload(name).await;
        mutate(&mut set);
        self.stores.workloads.update(set).await.expect("update workload");
    }

    /// Pods in the namespace, by ordinal.
    pub async fn pods(&self) -> Vec<Pod> {
        let mut pods = self.stores.pods.list(Some(NAMESPACE)).await.expect("list pods");
        pods.sort_by(ascending_ordinal);
        pods
    }

    pub async fn hook_runs(&self) -> Vec<HookRun> {
        self.stores
            .hook_runs
            .list(Some(NAMESPACE))
            .await
            .expect("list hook runs")
    }

    pub async fn set_hook_run_phase(&self, name: &str, phase: HookRunPhase) {
        let mut run = self
            .stores
            .hook_runs
            .get(NAMESPACE, name)
            .await
            .expect("hook run exists");
        run.status = Some(HookRunStatus {
            phase,
            message: None,
        });
        self.stores
            .hook_runs
            .update_status(run)
            .await
            .expect("hook run status");
    }

    /// Refreshes the caches and syncs `name` once.
    pub async fn sync(&self, name: &str) -> Result<(), SyncError> {
        self.controller.relist().await.expect("relist");
        self.controller.sync(&format!("{NAMESPACE}/{name}")).await
    }

    /// Plays the node agent: every pod becomes running and ready, with
    /// container statuses matching its spec. Returns whether anything changed.
    pub async fn run_kubelet(&self) -> bool {
        let mut changed = false;
        for pod in self.pods().await {
            let status = kubelet_status(&pod);
            if pod.status.as_ref() == Some(&status) {
                continue;
            }
            let mut draft = pod;
            draft.status = Some(status);
            self.stores
                .pods
                .update_status(draft)
                .await
                .expect("pod status");
            changed = true;
        }
        changed
    }

    /// Alternates syncs and node-agent passes until a round changes nothing.
    /// Returns the number of rounds taken.
    pub async fn settle(&self, name: &str) -> usize {
        for round in 1..=64 {
            let before = self.fingerprint().await;
            self.sync(name).await.expect("sync");
            self.run_kubelet().await;
            if self.fingerprint().await == before {
                return round;
            }
        }
        panic!("workload {name} did not settle");
    }

    async fn fingerprint(&self) -> Vec<(String, Option<String>)> {
        let mut versions: Vec<(String, Option<String>)> = self
            .pods()
            .await
            .into_iter()
            .map(|pod| (pod.metadata.key(), pod.metadata.resource_version))
            .collect();
        for set in self
            .stores
            .workloads
            .list(Some(NAMESPACE))
            .await
            .expect("list workloads")
        {
            versions.push((set.metadata.key(), set.metadata.resource_version));
        }
        for run in self.hook_runs().await {
            versions.push((run.metadata.key(), run.metadata.resource_version));
        }
        versions
    }
}
