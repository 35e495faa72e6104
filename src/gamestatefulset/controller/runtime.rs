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

//! Controller runtime pieces: the deduplicating rate-limited work queue and
//! the informer caches fed by store watches.

use crate::gamestatefulset::k8s::meta::{normalize_namespace, Resource};
use crate::gamestatefulset::k8s::pod::Pod;
use crate::gamestatefulset::k8s::store::WatchEvent;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::Notify;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Per-item exponential backoff: `base * 2^failures`, capped at `max`.
#[derive(Debug)]
pub struct ItemExponentialFailureRateLimiter<K> {
    base: Duration,
    max: Duration,
    failures: HashMap<K, u32>,
}

impl<K: Eq + Hash + Clone> ItemExponentialFailureRateLimiter<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: HashMap::new(),
        }
    }

    pub fn when(&mut self, item: &K) -> Duration {
        let failures = self.failures.entry(item.clone()).or_insert(0);
        let exponent = *failures;
        *failures = failures.saturating_add(1);
        let multiplier = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base.saturating_mul(multiplier).min(self.max)
    }

    pub fn num_requeues(&self, item: &K) -> u32 {
        self.failures.get(item).copied().unwrap_or(0)
    }

    pub fn forget(&mut self, item: &K) {
        self.failures.remove(item);
    }
}

struct QueueState<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    shutting_down: bool,
}

struct WorkQueueInner<K> {
    state: Mutex<QueueState<K>>,
    limiter: Mutex<ItemExponentialFailureRateLimiter<K>>,
    notify: Notify,
}

/// Work queue with the delivery guarantees controllers rely on:
///
/// * an item added several times before it is picked up is delivered once;
/// * an item is never handed to two workers at the same time. Re-adding an
///   item that is being processed parks it until [`WorkQueue::done`].
#[derive(Clone)]
pub struct WorkQueue<K> {
    inner: Arc<WorkQueueInner<K>>,
}

impl<K> WorkQueue<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::with_rate_limiter(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }

    pub fn with_rate_limiter(base: Duration, max: Duration) -> Self {
        Self {
            inner: Arc::new(WorkQueueInner {
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                limiter: Mutex::new(ItemExponentialFailureRateLimiter::new(base, max)),
                notify: Notify::new(),
            }),
        }
    }

    pub fn add(&self, item: K) {
        let mut state = lock(&self.inner.state);
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Adds `item` once `delay` has elapsed.
    pub fn add_after(&self, item: K, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Adds `item` after its per-item backoff.
    pub fn add_rate_limited(&self, item: K) {
        let delay = lock(&self.inner.limiter).when(&item);
        self.add_after(item, delay);
    }

    /// Clears the failure history of `item`.
    pub fn forget(&self, item: &K) {
        lock(&self.inner.limiter).forget(item);
    }

    pub fn num_requeues(&self, item: &K) -> u32 {
        lock(&self.inner.limiter).num_requeues(item)
    }

    /// Waits for the next item. Returns `None` once the queue is shut down
    /// and drained of waiting workers.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = lock(&self.inner.state);
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.inner.notify.notify_one();
                    }
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Marks `item` as finished. If it was re-added while processing it goes
    /// back on the queue.
    pub fn done(&self, item: &K) {
        let mut state = lock(&self.inner.state);
        state.processing.remove(item);
        if state.dirty.contains(item) && !state.shutting_down {
            state.queue.push_back(item.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    pub fn shut_down(&self) {
        lock(&self.inner.state).shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        lock(&self.inner.state).shutting_down
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.state).queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K> Default for WorkQueue<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Object removed from the cache, either observed directly or inferred after
/// a missed watch window.
#[derive(Debug, Clone, PartialEq)]
pub enum DeletedObject<T> {
    Known(T),
    Tombstone { key: String, last_known: Option<T> },
}

impl<T> DeletedObject<T> {
    pub fn object(&self) -> Option<&T> {
        match self {
            DeletedObject::Known(object) => Some(object),
            DeletedObject::Tombstone { last_known, .. } => last_known.as_ref(),
        }
    }
}

/// Event handed to the controller's handlers once the cache is updated.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectEvent<T> {
    Added(T),
    Updated { old: T, new: T },
    Deleted(DeletedObject<T>),
}

pub type PodEvent = ObjectEvent<Pod>;

/// Read-only cache of one resource kind. Getters return owned copies, so a
/// caller can never mutate cached state in place.
pub struct Informer<T: Resource> {
    cache: RwLock<HashMap<String, T>>,
}

impl<T: Resource> Default for Informer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Resource> Informer<T> {
    pub fn new() -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<T> {
        let key = format!("{}/{}", normalize_namespace(Some(namespace)), name);
        self.read().get(&key).cloned()
    }

    pub fn list(&self, namespace: Option<&str>) -> Vec<T> {
        let namespace = namespace.map(|ns| normalize_namespace(Some(ns)));
        let mut items: Vec<T> = self
            .read()
            .values()
            .filter(|object| {
                namespace
                    .as_ref()
                    .map_or(true, |target| object.metadata().namespace() == *target)
            })
            .cloned()
            .collect();
        items.sort_by_key(|object| object.key());
        items
    }

    /// Applies a watch event and returns the handler-facing event.
    pub fn observe(&self, event: WatchEvent<T>) -> ObjectEvent<T> {
        let mut cache = self.write();
        match event {
            WatchEvent::Added(object) | WatchEvent::Modified(object) => {
                match cache.insert(object.key(), object.clone()) {
                    Some(old) => ObjectEvent::Updated { old, new: object },
                    None => ObjectEvent::Added(object),
                }
            }
            WatchEvent::Deleted(object) => {
                cache.remove(&object.key());
                ObjectEvent::Deleted(DeletedObject::Known(object))
            }
        }
    }

    /// Replaces the cache with a fresh listing. Objects that vanished come
    /// back as tombstones carrying their last cached state.
    pub fn replace(&self, objects: Vec<T>) -> Vec<ObjectEvent<T>> {
        let fresh: HashMap<String, T> = objects
            .into_iter()
            .map(|object| (object.key(), object))
            .collect();
        let mut cache = self.write();
        let mut previous = std::mem::take(&mut *cache);
        let mut events = Vec::new();
        for (key, object) in &fresh {
            match previous.remove(key) {
                Some(old)
                    if old.metadata().resource_version == object.metadata().resource_version => {}
                Some(old) => events.push(ObjectEvent::Updated {
                    old,
                    new: object.clone(),
                }),
                None => events.push(ObjectEvent::Added(object.clone())),
            }
        }
        for (key, old) in previous {
            events.push(ObjectEvent::Deleted(DeletedObject::Tombstone {
                key,
                last_known: Some(old),
            }));
        }
        *cache = fresh;
        events
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, T>> {
        self.cache.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, T>> {
        self.cache
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
