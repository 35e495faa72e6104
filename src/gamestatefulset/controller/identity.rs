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

//! Pod identity and storage rules for ordinal workloads.
//!
//! A member pod is named `{set}-{ordinal}`, carries the pod-name label, and
//! mounts one claim per volume claim template named
//! `{template}-{set}-{ordinal}`.

use crate::gamestatefulset::controller::rollout::{RevisionTarget, UpdateStrategy};
use crate::gamestatefulset::k8s::gamestatefulset::GameStatefulSet;
use crate::gamestatefulset::k8s::meta::{controller_owner_ref, ObjectMeta};
use crate::gamestatefulset::k8s::persistentvolumeclaim::PersistentVolumeClaim;
use crate::gamestatefulset::k8s::pod::{
    PersistentVolumeClaimVolumeSource, Pod, Volume, POD_FAILED, POD_RUNNING,
};
use std::cmp::Ordering;
use std::collections::BTreeMap;

pub const POD_NAME_LABEL: &str = "statefulset.kubernetes.io/pod-name";
pub const CONTROLLER_REVISION_HASH_LABEL: &str = "controller-revision-hash";

/// Splits `name` into the parent name and the trailing ordinal.
///
/// Returns `(None, None)` when the name has no `-N` suffix made only of ASCII
/// digits, or when the suffix does not fit an ordinal.
pub fn get_parent_name_and_ordinal(name: &str) -> (Option<&str>, Option<u32>) {
    let Some((parent, suffix)) = name.rsplit_once('-') else {
        return (None, None);
    };
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return (None, None);
    }
    match suffix.parse::<u32>() {
        Ok(ordinal) if ordinal <= i32::MAX as u32 => (Some(parent), Some(ordinal)),
        _ => (None, None),
    }
}

pub fn get_parent_name(pod: &Pod) -> Option<&str> {
    get_parent_name_and_ordinal(pod.metadata.name()).0
}

pub fn get_ordinal(pod: &Pod) -> Option<u32> {
    get_parent_name_and_ordinal(pod.metadata.name()).1
}

pub fn pod_name(set: &GameStatefulSet, ordinal: u32) -> String {
    format!("{}-{}", set.metadata.name(), ordinal)
}

pub fn persistent_volume_claim_name(
    set: &GameStatefulSet,
    claim: &PersistentVolumeClaim,
    ordinal: u32,
) -> String {
    format!("{}-{}-{}", claim.metadata.name(), set.metadata.name(), ordinal)
}

/// True if the pod's name parses as `{set}-{N}`.
pub fn is_member_of(set: &GameStatefulSet, pod: &Pod) -> bool {
    get_parent_name(pod) == Some(set.metadata.name())
}

pub fn identity_matches(set: &GameStatefulSet, pod: &Pod) -> bool {
    let (parent, ordinal) = get_parent_name_and_ordinal(pod.metadata.name());
    let Some(ordinal) = ordinal else {
        return false;
    };
    parent == Some(set.metadata.name())
        && pod.metadata.name() == pod_name(set, ordinal)
        && pod.metadata.namespace() == set.metadata.namespace()
        && pod.metadata.labels.get(POD_NAME_LABEL).map(String::as_str) == Some(pod.metadata.name())
}

pub fn storage_matches(set: &GameStatefulSet, pod: &Pod) -> bool {
    let Some(ordinal) = get_ordinal(pod) else {
        return false;
    };
    let volumes: BTreeMap<&str, &Volume> = pod
        .spec
        .volumes
        .iter()
        .map(|volume| (volume.name.as_str(), volume))
        .collect();
    set.spec.volume_claim_templates.iter().all(|claim| {
        volumes
            .get(claim.metadata.name())
            .and_then(|volume| volume.persistent_volume_claim.as_ref())
            .is_some_and(|source| {
                source.claim_name == persistent_volume_claim_name(set, claim, ordinal)
            })
    })
}

/// Claims the pod needs, keyed by template name.
pub fn get_persistent_volume_claims(
    set: &GameStatefulSet,
    pod: &Pod,
) -> BTreeMap<String, PersistentVolumeClaim> {
    let Some(ordinal) = get_ordinal(pod) else {
        return BTreeMap::new();
    };
    set.spec
        .volume_claim_templates
        .iter()
        .map(|template| {
            let mut claim = template.clone();
            claim.metadata = ObjectMeta {
                name: Some(persistent_volume_claim_name(set, template, ordinal)),
                namespace: Some(set.metadata.namespace()),
                labels: set.spec.selector.match_labels.clone(),
                annotations: template.metadata.annotations.clone(),
                ..Default::default()
            };
            claim.status = None;
            (template.metadata.name().to_string(), claim)
        })
        .collect()
}

/// Rewrites the pod's volumes so every claim template is mounted from its
/// ordinal claim. Volumes unrelated to the templates are kept.
pub fn update_storage(set: &GameStatefulSet, pod: &mut Pod) {
    let claims = get_persistent_volume_claims(set, pod);
    let mut volumes: Vec<Volume> = claims
        .iter()
        .map(|(template, claim)| Volume {
            name: template.clone(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim.metadata.name().to_string(),
                read_only: false,
            }),
            empty_dir: None,
        })
        .collect();
    for volume in pod.spec.volumes.drain(..) {
        if !claims.contains_key(&volume.name) {
            volumes.push(volume);
        }
    }
    pod.spec.volumes = volumes;
}

pub fn update_identity(set: &GameStatefulSet, pod: &mut Pod) {
    let Some(ordinal) = get_ordinal(pod) else {
        return;
    };
    let name = pod_name(set, ordinal);
    pod.metadata.name = Some(name.clone());
    pod.metadata.namespace = Some(set.metadata.namespace());
    pod.metadata.labels.insert(POD_NAME_LABEL.to_string(), name);
}

fn init_identity(set: &GameStatefulSet, pod: &mut Pod) {
    update_identity(set, pod);
    pod.spec.hostname = pod.metadata.name.clone();
    if !set.spec.service_name.is_empty() {
        pod.spec.subdomain = Some(set.spec.service_name.clone());
    }
}

/// Builds the pod for `ordinal` from the set's template.
pub fn new_game_stateful_set_pod(set: &GameStatefulSet, ordinal: u32) -> Pod {
    let template = &set.spec.template;
    let mut pod = Pod {
        metadata: ObjectMeta {
            name: Some(pod_name(set, ordinal)),
            namespace: Some(set.metadata.namespace()),
            labels: template.metadata.labels.clone(),
            annotations: template.metadata.annotations.clone(),
            owner_references: vec![controller_owner_ref(set)],
            ..Default::default()
        },
        spec: template.spec.clone(),
        ..Default::default()
    };
    init_identity(set, &mut pod);
    update_storage(set, &mut pod);
    pod
}

/// Builds the pod for `ordinal` at the revision the strategy selects for it:
/// ordinals pinned below the partition come from `current_set`, the rest from
/// `update_set`.
pub fn new_versioned_pod(
    current_set: &GameStatefulSet,
    update_set: &GameStatefulSet,
    current_revision: &str,
    update_revision: &str,
    ordinal: u32,
    strategy: &UpdateStrategy,
) -> Pod {
    let (set, revision) = match strategy.revision_for_ordinal(ordinal) {
        RevisionTarget::Current => (current_set, current_revision),
        RevisionTarget::Update => (update_set, update_revision),
    };
    let mut pod = new_game_stateful_set_pod(set, ordinal);
    set_pod_revision(&mut pod, revision);
    pod
}

pub fn set_pod_revision(pod: &mut Pod, revision: &str) {
    pod.metadata.labels.insert(
        CONTROLLER_REVISION_HASH_LABEL.to_string(),
        revision.to_string(),
    );
}

pub fn get_pod_revision(pod: &Pod) -> &str {
    pod.metadata
        .labels
        .get(CONTROLLER_REVISION_HASH_LABEL)
        .map(String::as_str)
        .unwrap_or_default()
}

pub fn is_failed(pod: &Pod) -> bool {
    pod.phase() == Some(POD_FAILED)
}

pub fn is_running_and_ready(pod: &Pod) -> bool {
    pod.phase() == Some(POD_RUNNING) && pod.is_ready_condition_true()
}

pub fn is_terminating(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

pub fn is_healthy(pod: &Pod) -> bool {
    is_running_and_ready(pod) && !is_terminating(pod)
}

/// Orders pods by ordinal; pods without an ordinal sort first.
pub fn ascending_ordinal(a: &Pod, b: &Pod) -> Ordering {
    get_ordinal(a).cmp(&get_ordinal(b))
}

/// Orders overlapping workloads oldest first, name breaking ties.
pub fn sort_overlapping_sets(sets: &mut [GameStatefulSet]) {
    sets.sort_by(|a, b| {
        a.metadata
            .creation_timestamp
            .cmp(&b.metadata.creation_timestamp)
            .then_with(|| a.metadata.name().cmp(b.metadata.name()))
    });
}
