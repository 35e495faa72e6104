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

//! Controller-reference bookkeeping: adopting orphans that match a workload's
//! selector and releasing owned objects that stopped matching.

use crate::gamestatefulset::controller::identity::is_member_of;
use crate::gamestatefulset::k8s::gamestatefulset::GameStatefulSet;
use crate::gamestatefulset::k8s::meta::{controller_owner_ref, Resource, Selector};
use crate::gamestatefulset::k8s::pod::Pod;
use crate::gamestatefulset::k8s::revision::ControllerRevision;
use crate::gamestatefulset::k8s::store::{ObjectStore, StoreError};
use crate::gamestatefulset::logger::{log_info, log_warn};

const COMPONENT: &str = "ownership";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OwnershipError {
    #[error("original {key} is gone: got uid {found}, wanted {expected}")]
    OwnerReplaced {
        key: String,
        expected: String,
        found: String,
    },
    #[error("{0} has just been deleted")]
    OwnerDeleted(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl OwnershipError {
    /// True when the workload this claim pass acts for no longer exists in
    /// the form that was listed, so nothing may be adopted on its behalf.
    pub fn is_owner_gone(&self) -> bool {
        matches!(
            self,
            OwnershipError::OwnerReplaced { .. } | OwnershipError::OwnerDeleted(_)
        )
    }
}

/// Claims objects for one workload during one sync.
///
/// Adoption is only allowed after a fresh read of the workload confirms its
/// UID and that it is not being deleted. The read happens at most once per
/// manager.
pub struct RefManager<'a> {
    set: &'a GameStatefulSet,
    selector: &'a Selector,
    workloads: &'a dyn ObjectStore<GameStatefulSet>,
    can_adopt: Option<Result<(), OwnershipError>>,
}

impl<'a> RefManager<'a> {
    pub fn new(
        set: &'a GameStatefulSet,
        selector: &'a Selector,
        workloads: &'a dyn ObjectStore<GameStatefulSet>,
    ) -> Self {
        Self {
            set,
            selector,
            workloads,
            can_adopt: None,
        }
    }

    /// Pods owned by the workload after adopting orphans named `{set}-{N}`
    /// that match the selector and releasing owned pods that no longer match.
    pub async fn claim_pods(
        &mut self,
        pods: Vec<Pod>,
        store: &dyn ObjectStore<Pod>,
    ) -> Result<Vec<Pod>, OwnershipError> {
        let set = self.set;
        let selector = self.selector;
        self.claim(pods, store, |pod| {
            is_member_of(set, pod) && selector.matches(&pod.metadata.labels)
        })
        .await
    }

    /// Revisions owned by the workload after adopting matching orphans.
    pub async fn claim_revisions(
        &mut self,
        revisions: Vec<ControllerRevision>,
        store: &dyn ObjectStore<ControllerRevision>,
    ) -> Result<Vec<ControllerRevision>, OwnershipError> {
        let selector = self.selector;
        self.claim(revisions, store, |revision| {
            selector.matches(&revision.metadata.labels)
        })
        .await
    }

    async fn claim<T, F>(
        &mut self,
        objects: Vec<T>,
        store: &dyn ObjectStore<T>,
        matches: F,
    ) -> Result<Vec<T>, OwnershipError>
    where
        T: Resource,
        F: Fn(&T) -> bool,
    {
        let owner_uid = self.set.metadata.uid().to_string();
        let owner_deleting = self.set.metadata.deletion_timestamp.is_some();
        let mut claimed = Vec::new();
        for object in objects {
            let owned = object
                .metadata()
                .controller_ref()
                .map(|owner| owner.uid == owner_uid);
            let terminating = object.metadata().deletion_timestamp.is_some();
            match owned {
                Some(false) => continue,
                Some(true) => {
                    if matches(&object) {
                        claimed.push(object);
                    } else if !owner_deleting {
                        self.release(object, store).await?;
                    }
                }
                None => {
                    if owner_deleting || terminating || !matches(&object) {
                        continue;
                    }
                    self.check_can_adopt().await?;
                    if let Some(adopted) = self.adopt(object, store).await? {
                        claimed.push(adopted);
                    }
                }
            }
        }
        Ok(claimed)
    }

    async fn check_can_adopt(&mut self) -> Result<(), OwnershipError> {
        if let Some(result) = &self.can_adopt {
            return result.clone();
        }
        let result = self.fresh_owner_check().await;
        self.can_adopt = Some(result.clone());
        result
    }

    async fn fresh_owner_check(&self) -> Result<(), OwnershipError> {
        let key = self.set.metadata.key();
        let fresh = match self
            .workloads
            .get(&self.set.metadata.namespace(), self.set.metadata.name())
            .await
        {
            Ok(fresh) => fresh,
            Err(err) if err.is_not_found() => return Err(OwnershipError::OwnerDeleted(key)),
            Err(err) => return Err(err.into()),
        };
        if fresh.metadata.uid() != self.set.metadata.uid() {
            return Err(OwnershipError::OwnerReplaced {
                key,
                expected: self.set.metadata.uid().to_string(),
                found: fresh.metadata.uid().to_string(),
            });
        }
        if fresh.metadata.deletion_timestamp.is_some() {
            return Err(OwnershipError::OwnerDeleted(key));
        }
        Ok(())
    }

    async fn adopt<T: Resource>(
        &self,
        object: T,
        store: &dyn ObjectStore<T>,
    ) -> Result<Option<T>, OwnershipError> {
        let name = object.metadata().name().to_string();
        let mut draft = object;
        draft
            .metadata_mut()
            .owner_references
            .push(controller_owner_ref(self.set));
        match store.update(draft).await {
            Ok(adopted) => {
                log_info(
                    COMPONENT,
                    "Adopted orphan",
                    &[
                        ("workload", &self.set.metadata.key()),
                        ("kind", T::KIND),
                        ("name", &name),
                    ],
                );
                Ok(Some(adopted))
            }
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn release<T: Resource>(
        &self,
        object: T,
        store: &dyn ObjectStore<T>,
    ) -> Result<(), OwnershipError> {
        let owner_uid = self.set.metadata.uid().to_string();
        let name = object.metadata().name().to_string();
        let mut draft = object;
        draft
            .metadata_mut()
            .owner_references
            .retain(|owner| owner.uid != owner_uid);
        match store.update(draft).await {
            Ok(_) => {
                log_info(
                    COMPONENT,
                    "Released object that no longer matches the selector",
                    &[
                        ("workload", &self.set.metadata.key()),
                        ("kind", T::KIND),
                        ("name", &name),
                    ],
                );
                Ok(())
            }
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => {
                log_warn(
                    COMPONENT,
                    "Failed to release object",
                    &[
                        ("workload", &self.set.metadata.key()),
                        ("name", &name),
                        ("error", &err.to_string()),
                    ],
                );
                Err(err.into())
            }
        }
    }
}
