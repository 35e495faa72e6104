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

//! Resource store capability consumed by the controller, plus the in-memory
//! implementation used by tests and embedded deployments.

use super::gamestatefulset::GameStatefulSet;
use super::hookrun::HookRun;
use super::meta::{normalize_namespace, Resource};
use super::persistentvolumeclaim::PersistentVolumeClaim;
use super::pod::Pod;
use super::revision::ControllerRevision;
use chrono::Utc;
use rand::{rngs::OsRng, RngCore};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

const WATCH_CHANNEL_CAPACITY: usize = 256;

static RESOURCE_VERSION: AtomicU64 = AtomicU64::new(1);

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} \"{key}\" not found")]
    NotFound { kind: &'static str, key: String },
    #[error("{kind} \"{key}\" already exists")]
    AlreadyExists { kind: &'static str, key: String },
    #[error("operation cannot be fulfilled on {kind} \"{key}\": the object has been modified")]
    Conflict { kind: &'static str, key: String },
    #[error("invalid {kind}: {message}")]
    Invalid { kind: &'static str, message: String },
    #[error("resource store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists { .. })
    }
}

/// Change notification emitted by a store watch.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<T> {
    Added(T),
    Modified(T),
    Deleted(T),
}

impl<T> WatchEvent<T> {
    pub fn object(&self) -> &T {
        match self {
            WatchEvent::Added(object) | WatchEvent::Modified(object) | WatchEvent::Deleted(object) => {
                object
            }
        }
    }
}

/// Keyed object store with optimistic concurrency on `resourceVersion`.
///
/// `update` never touches the status subresource and `update_status` never
/// touches anything else.
pub trait ObjectStore<T: Resource>: Send + Sync {
    fn get<'a>(&'a self, namespace: &'a str, name: &'a str) -> StoreFuture<'a, T>;

    fn list<'a>(&'a self, namespace: Option<&'a str>) -> StoreFuture<'a, Vec<T>>;

    fn create<'a>(&'a self, object: T) -> StoreFuture<'a, T>;

    fn update<'a>(&'a self, object: T) -> StoreFuture<'a, T>;

    fn update_status<'a>(&'a self, object: T) -> StoreFuture<'a, T>;

    fn delete<'a>(&'a self, namespace: &'a str, name: &'a str) -> StoreFuture<'a, ()>;

    fn watch(&self) -> broadcast::Receiver<WatchEvent<T>>;
}

/// One store handle per kind the controller reads or writes.
#[derive(Clone)]
pub struct ResourceStore {
    pub workloads: Arc<dyn ObjectStore<GameStatefulSet>>,
    pub pods: Arc<dyn ObjectStore<Pod>>,
    pub revisions: Arc<dyn ObjectStore<ControllerRevision>>,
    pub hook_runs: Arc<dyn ObjectStore<HookRun>>,
    pub claims: Arc<dyn ObjectStore<PersistentVolumeClaim>>,
}

/// Concrete in-memory stores, kept around so tests can seed objects and
/// inject failures while the controller sees the trait objects.
#[derive(Clone)]
pub struct InMemoryStores {
    pub workloads: Arc<MemoryStore<GameStatefulSet>>,
    pub pods: Arc<MemoryStore<Pod>>,
    pub revisions: Arc<MemoryStore<ControllerRevision>>,
    pub hook_runs: Arc<MemoryStore<HookRun>>,
    pub claims: Arc<MemoryStore<PersistentVolumeClaim>>,
}

impl InMemoryStores {
    pub fn new() -> Self {
        Self {
            workloads: Arc::new(MemoryStore::new()),
            pods: Arc::new(MemoryStore::new()),
            revisions: Arc::new(MemoryStore::new()),
            hook_runs: Arc::new(MemoryStore::new()),
            claims: Arc::new(MemoryStore::new()),
        }
    }

    pub fn resource_store(&self) -> ResourceStore {
        ResourceStore {
            workloads: self.workloads.clone(),
            pods: self.pods.clone(),
            revisions: self.revisions.clone(),
            hook_runs: self.hook_runs.clone(),
            claims: self.claims.clone(),
        }
    }
}

impl Default for InMemoryStores {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOperation {
    Get,
    List,
    Create,
    Update,
    UpdateStatus,
    Delete,
}

type ObjectKey = (String, String);

pub struct MemoryStore<T: Resource> {
    objects: Mutex<BTreeMap<ObjectKey, T>>,
    failures: Mutex<VecDeque<(StoreOperation, StoreError)>>,
    sender: broadcast::Sender<WatchEvent<T>>,
}

impl<T: Resource> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Resource> MemoryStore<T> {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            objects: Mutex::new(BTreeMap::new()),
            failures: Mutex::new(VecDeque::new()),
            sender,
        }
    }

    /// Makes the next `operation` call fail with `error`.
    pub fn fail_next(&self, operation: StoreOperation, error: StoreError) {
        lock(&self.failures).push_back((operation, error));
    }

    /// Number of stored objects, across namespaces.
    pub fn len(&self) -> usize {
        lock(&self.objects).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn injected(&self, operation: StoreOperation) -> Result<(), StoreError> {
        let mut failures = lock(&self.failures);
        match failures.iter().position(|(op, _)| *op == operation) {
            Some(index) => match failures.remove(index) {
                Some((_, error)) => Err(error),
                None => Ok(()),
            },
            None => Ok(()),
        }
    }

    fn object_key(object: &T) -> Result<ObjectKey, StoreError> {
        let meta = object.metadata();
        match meta.name.as_deref() {
            Some(name) if !name.is_empty() => Ok((meta.namespace(), name.to_string())),
            _ => Err(StoreError::Invalid {
                kind: T::KIND,
                message: "metadata.name is required".to_string(),
            }),
        }
    }

    fn get_sync(&self, namespace: &str, name: &str) -> Result<T, StoreError> {
        self.injected(StoreOperation::Get)?;
        let key = (normalize_namespace(Some(namespace)), name.to_string());
        lock(&self.objects)
            .get(&key)
            .cloned()
            .ok_or_else(|| not_found::<T>(&key))
    }

    fn list_sync(&self, namespace: Option<&str>) -> Result<Vec<T>, StoreError> {
        self.injected(StoreOperation::List)?;
        let namespace = namespace.map(|ns| normalize_namespace(Some(ns)));
        Ok(lock(&self.objects)
            .iter()
            .filter(|((ns, _), _)| namespace.as_ref().map_or(true, |target| target == ns))
            .map(|(_, object)| object.clone())
            .collect())
    }

    fn create_sync(&self, mut object: T) -> Result<T, StoreError> {
        self.injected(StoreOperation::Create)?;
        let key = Self::object_key(&object)?;
        let mut objects = lock(&self.objects);
        if objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: T::KIND,
                key: format!("{}/{}", key.0, key.1),
            });
        }
        let meta = object.metadata_mut();
        meta.namespace = Some(key.0.clone());
        meta.uid = Some(random_uid());
        meta.resource_version = Some(next_resource_version());
        meta.generation = Some(1);
        meta.creation_timestamp = Some(Utc::now());
        objects.insert(key, object.clone());
        drop(objects);
        let _ = self.sender.send(WatchEvent::Added(object.clone()));
        Ok(object)
    }

    fn update_sync(&self, mut object: T) -> Result<T, StoreError> {
        self.injected(StoreOperation::Update)?;
        let key = Self::object_key(&object)?;
        let mut objects = lock(&self.objects);
        let stored = objects.get(&key).ok_or_else(|| not_found::<T>(&key))?;
        check_resource_version::<T>(stored, &object, &key)?;

        let spec_changed = spec_of(stored) != spec_of(&object);
        let stored_meta = stored.metadata().clone();
        object.copy_status_from(stored);
        let meta = object.metadata_mut();
        meta.namespace = Some(key.0.clone());
        meta.uid = stored_meta.uid;
        meta.creation_timestamp = stored_meta.creation_timestamp;
        meta.deletion_timestamp = stored_meta.deletion_timestamp;
        let generation = stored_meta.generation.unwrap_or(1);
        meta.generation = Some(if spec_changed { generation + 1 } else { generation });
        meta.resource_version = Some(next_resource_version());
        objects.insert(key, object.clone());
        drop(objects);
        let _ = self.sender.send(WatchEvent::Modified(object.clone()));
        Ok(object)
    }

    fn update_status_sync(&self, object: T) -> Result<T, StoreError> {
        self.injected(StoreOperation::UpdateStatus)?;
        let key = Self::object_key(&object)?;
        let mut objects = lock(&self.objects);
        let stored = objects.get(&key).ok_or_else(|| not_found::<T>(&key))?;
        check_resource_version::<T>(stored, &object, &key)?;

        let mut updated = stored.clone();
        updated.copy_status_from(&object);
        updated.metadata_mut().resource_version = Some(next_resource_version());
        objects.insert(key, updated.clone());
        drop(objects);
        let _ = self.sender.send(WatchEvent::Modified(updated.clone()));
        Ok(updated)
    }

    fn delete_sync(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.injected(StoreOperation::Delete)?;
        let key = (normalize_namespace(Some(namespace)), name.to_string());
        let removed = lock(&self.objects)
            .remove(&key)
            .ok_or_else(|| not_found::<T>(&key))?;
        let _ = self.sender.send(WatchEvent::Deleted(removed));
        Ok(())
    }
}

impl<T: Resource> ObjectStore<T> for MemoryStore<T> {
    fn get<'a>(&'a self, namespace: &'a str, name: &'a str) -> StoreFuture<'a, T> {
        Box::pin(async move { self.get_sync(namespace, name) })
    }

    fn list<'a>(&'a self, namespace: Option<&'a str>) -> StoreFuture<'a, Vec<T>> {
        Box::pin(async move { self.list_sync(namespace) })
    }

    fn create<'a>(&'a self, object: T) -> StoreFuture<'a, T> {
        Box::pin(async move { self.create_sync(object) })
    }

    fn update<'a>(&'a self, object: T) -> StoreFuture<'a, T> {
        Box::pin(async move { self.update_sync(object) })
    }

    fn update_status<'a>(&'a self, object: T) -> StoreFuture<'a, T> {
        Box::pin(async move { self.update_status_sync(object) })
    }

    fn delete<'a>(&'a self, namespace: &'a str, name: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move { self.delete_sync(namespace, name) })
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent<T>> {
        self.sender.subscribe()
    }
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn not_found<T: Resource>(key: &ObjectKey) -> StoreError {
    StoreError::NotFound {
        kind: T::KIND,
        key: format!("{}/{}", key.0, key.1),
    }
}

fn check_resource_version<T: Resource>(
    stored: &T,
    incoming: &T,
    key: &ObjectKey,
) -> Result<(), StoreError> {
    match incoming.metadata().resource_version.as_deref() {
        Some(version) if Some(version) != stored.metadata().resource_version.as_deref() => {
            Err(StoreError::Conflict {
                kind: T::KIND,
                key: format!("{}/{}", key.0, key.1),
            })
        }
        _ => Ok(()),
    }
}

/// Serialized object without `metadata` and `status`; a change here bumps
/// `metadata.generation`.
fn spec_of<T: Resource>(object: &T) -> Option<Value> {
    let mut value = serde_json::to_value(object).ok()?;
    if let Some(map) = value.as_object_mut() {
        map.remove("metadata");
        map.remove("status");
    }
    Some(value)
}

fn next_resource_version() -> String {
    RESOURCE_VERSION.fetch_add(1, Ordering::Relaxed).to_string()
}

fn random_uid() -> String {
    let mut data = [0u8; 16];
    OsRng.fill_bytes(&mut data);
    let mut output = String::with_capacity(36);
    for (index, byte) in data.iter().enumerate() {
        if matches!(index, 4 | 6 | 8 | 10) {
            output.push('-');
        }
        let _ = write!(&mut output, "{:02x}", byte);
    }
    output
}
