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

//! Revision history: patches, hashing, and the create/update helpers for
//! `ControllerRevision` objects.

use crate::gamestatefulset::controller::identity::CONTROLLER_REVISION_HASH_LABEL;
use crate::gamestatefulset::controller::retry::{with_conflict_retry, Backoff, RetryError};
use crate::gamestatefulset::k8s::gamestatefulset::GameStatefulSet;
use crate::gamestatefulset::k8s::meta::{controller_owner_ref, ObjectMeta};
use crate::gamestatefulset::k8s::revision::ControllerRevision;
use crate::gamestatefulset::k8s::store::{ObjectStore, StoreError};
use serde_json::{json, Map, Value};
use sha1::{Digest, Sha1};
use std::fmt::Write;

const PATCH_DIRECTIVE: &str = "$patch";
const MAX_REVISION_PREFIX_LEN: usize = 223;
const REVISION_HASH_LEN: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("failed to encode revision: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("workload {0} has no spec.template to snapshot")]
    MissingTemplate(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Retry(#[from] RetryError<StoreError>),
}

/// Structural patch stored in a revision: `{"spec":{"template":{..,"$patch":"replace"}}}`.
pub fn revision_patch(set: &GameStatefulSet) -> Result<Vec<u8>, HistoryError> {
    let value = serde_json::to_value(set)?;
    let mut template = value
        .get("spec")
        .and_then(|spec| spec.get("template"))
        .cloned()
        .ok_or_else(|| HistoryError::MissingTemplate(set.metadata.key()))?;
    if let Value::Object(map) = &mut template {
        map.insert(
            PATCH_DIRECTIVE.to_string(),
            Value::String("replace".to_string()),
        );
    }
    let patch = json!({ "spec": { "template": template } });
    Ok(serde_json::to_vec(&patch)?)
}

/// Builds an unsaved revision snapshotting `set`'s current template.
pub fn new_revision(
    set: &GameStatefulSet,
    revision: i64,
    collision_count: Option<i32>,
) -> Result<ControllerRevision, HistoryError> {
    let patch = revision_patch(set)?;
    let data: Value = serde_json::from_slice(&patch)?;
    let mut snapshot = ControllerRevision {
        metadata: ObjectMeta {
            namespace: Some(set.metadata.namespace()),
            labels: set.spec.template.metadata.labels.clone(),
            owner_references: vec![controller_owner_ref(set)],
            ..Default::default()
        },
        data,
        revision,
        ..Default::default()
    };
    let hash = hash_controller_revision(&snapshot, collision_count)?;
    snapshot.metadata.name = Some(controller_revision_name(set.metadata.name(), &hash));
    snapshot
        .metadata
        .labels
        .insert(CONTROLLER_REVISION_HASH_LABEL.to_string(), hash);
    Ok(snapshot)
}

/// Short content hash of the revision data, salted with the collision count.
pub fn hash_controller_revision(
    revision: &ControllerRevision,
    collision_count: Option<i32>,
) -> Result<String, HistoryError> {
    let mut hasher = Sha1::new();
    hasher.update(revision.raw_data()?);
    if let Some(count) = collision_count {
        hasher.update(count.to_le_bytes());
    }
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(REVISION_HASH_LEN);
    for byte in digest.iter() {
        let _ = write!(&mut hex, "{:02x}", byte);
        if hex.len() >= REVISION_HASH_LEN {
            break;
        }
    }
    hex.truncate(REVISION_HASH_LEN);
    Ok(hex)
}

pub fn controller_revision_name(prefix: &str, hash: &str) -> String {
    let prefix = if prefix.len() > MAX_REVISION_PREFIX_LEN {
        let mut end = MAX_REVISION_PREFIX_LEN;
        while !prefix.is_char_boundary(end) {
            end -= 1;
        }
        &prefix[..end]
    } else {
        prefix
    };
    format!("{}-{}", prefix, hash)
}

/// Reconstructs the workload as it looked at `revision` by merging the
/// stored patch over a copy of `set`.
pub fn apply_revision(
    set: &GameStatefulSet,
    revision: &ControllerRevision,
) -> Result<GameStatefulSet, HistoryError> {
    let mut value = serde_json::to_value(set)?;
    strategic_merge(&mut value, &revision.data);
    Ok(serde_json::from_value(value)?)
}

/// Merge used for revision patches. Objects merge key by key, `null` removes a
/// key, arrays and scalars replace, and an object carrying
/// `"$patch": "replace"` replaces the target object wholesale.
pub fn strategic_merge(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    let replace = patch_map.get(PATCH_DIRECTIVE).and_then(Value::as_str) == Some("replace");
    if replace || !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let Value::Object(target_map) = target else {
        return;
    };
    for (key, value) in patch_map {
        if key == PATCH_DIRECTIVE {
            continue;
        }
        if value.is_null() {
            target_map.remove(key);
            continue;
        }
        match target_map.get_mut(key) {
            Some(existing) if value.is_object() => strategic_merge(existing, value),
            _ => {
                let mut fresh = Value::Null;
                strategic_merge(&mut fresh, value);
                target_map.insert(key.clone(), fresh);
            }
        }
    }
}

/// True when `revision` snapshots exactly the template `set` declares now.
pub fn revision_matches(
    set: &GameStatefulSet,
    revision: &ControllerRevision,
) -> Result<bool, HistoryError> {
    Ok(revision_patch(set)? == revision.raw_data()?)
}

pub fn equal_revision(left: &ControllerRevision, right: &ControllerRevision) -> bool {
    let left_hash = left.metadata.labels.get(CONTROLLER_REVISION_HASH_LABEL);
    let right_hash = right.metadata.labels.get(CONTROLLER_REVISION_HASH_LABEL);
    if left_hash.is_some() && right_hash.is_some() && left_hash != right_hash {
        return false;
    }
    match (left.raw_data(), right.raw_data()) {
        (Ok(left), Ok(right)) => left == right,
        _ => false,
    }
}

pub fn find_equal_revisions<'a>(
    revisions: &'a [ControllerRevision],
    needle: &ControllerRevision,
) -> Vec<&'a ControllerRevision> {
    revisions
        .iter()
        .filter(|revision| equal_revision(revision, needle))
        .collect()
}

/// Next revision number for a history sorted by ascending revision.
pub fn next_revision(sorted: &[ControllerRevision]) -> i64 {
    sorted.last().map_or(1, |last| last.revision + 1)
}

pub fn sort_controller_revisions(revisions: &mut [ControllerRevision]) {
    revisions.sort_by(|a, b| {
        a.revision
            .cmp(&b.revision)
            .then_with(|| {
                a.metadata
                    .creation_timestamp
                    .cmp(&b.metadata.creation_timestamp)
            })
            .then_with(|| a.name().cmp(b.name()))
    });
}

/// Persists `revision`, bumping `collision_count` until its name is free or
/// taken by an equal revision.
pub async fn create_controller_revision(
    store: &dyn ObjectStore<ControllerRevision>,
    parent: &GameStatefulSet,
    revision: &ControllerRevision,
    collision_count: &mut i32,
) -> Result<ControllerRevision, HistoryError> {
    let namespace = parent.metadata.namespace();
    loop {
        let hash = hash_controller_revision(revision, Some(*collision_count))?;
        let mut candidate = revision.clone();
        candidate.metadata.name = Some(controller_revision_name(parent.metadata.name(), &hash));
        candidate.metadata.namespace = Some(namespace.clone());
        candidate
            .metadata
            .labels
            .insert(CONTROLLER_REVISION_HASH_LABEL.to_string(), hash);

        match store.create(candidate.clone()).await {
            Ok(created) => return Ok(created),
            Err(err) if err.is_already_exists() => {
                let existing = store.get(&namespace, candidate.name()).await?;
                if equal_revision(&existing, &candidate) {
                    return Ok(existing);
                }
                *collision_count += 1;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

/// Moves an existing revision to number `new_revision`, used when a rollback
/// re-selects an older snapshot.
pub async fn update_controller_revision(
    store: &dyn ObjectStore<ControllerRevision>,
    revision: &ControllerRevision,
    new_revision: i64,
    max_attempts: u32,
    backoff: Backoff,
) -> Result<ControllerRevision, HistoryError> {
    let namespace = revision.metadata.namespace();
    let name = revision.name().to_string();
    let updated = with_conflict_retry(max_attempts, backoff, |attempt| {
        let namespace = namespace.clone();
        let name = name.clone();
        let initial = revision.clone();
        async move {
            let mut current = if attempt == 0 {
                initial
            } else {
                store.get(&namespace, &name).await?
            };
            if current.revision == new_revision {
                return Ok(current);
            }
            current.revision = new_revision;
            store.update(current).await
        }
    })
    .await?;
    Ok(updated)
}
