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

//! The GameStatefulSet controller: informer caches fed by store watches, the
//! event handlers mapping changes to workload keys, and the worker loop.

use crate::gamestatefulset::config::ControllerConfig;
use crate::gamestatefulset::controller::control::{ControlError, GameStatefulSetControl};
use crate::gamestatefulset::controller::identity::sort_overlapping_sets;
use crate::gamestatefulset::controller::ownership::{OwnershipError, RefManager};
use crate::gamestatefulset::controller::requeue::DurationStore;
use crate::gamestatefulset::controller::runtime::{
    DeletedObject, Informer, ObjectEvent, PodEvent, WorkQueue,
};
use crate::gamestatefulset::k8s::gamestatefulset::GameStatefulSet;
use crate::gamestatefulset::k8s::hookrun::HookRun;
use crate::gamestatefulset::k8s::meta::{OwnerReference, Resource};
use crate::gamestatefulset::k8s::pod::Pod;
use crate::gamestatefulset::k8s::revision::ControllerRevision;
use crate::gamestatefulset::k8s::store::{ObjectStore, ResourceStore, StoreError, WatchEvent};
use crate::gamestatefulset::logger::{self, log_debug, log_error, log_info, log_warn, LogFormat};
use crate::gamestatefulset::observability::metrics::{self, ControllerReconcileResult};
use crate::gamestatefulset::observability::tracing::sync_span;
use crate::gamestatefulset::util::clock::Clock;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "gamestatefulset-controller";
const CONTROLLER: &str = "gamestatefulset";

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Ownership(#[from] OwnershipError),
    #[error(transparent)]
    Control(#[from] ControlError),
}

pub struct GameStatefulSetController {
    store: ResourceStore,
    workloads: Arc<Informer<GameStatefulSet>>,
    pods: Arc<Informer<Pod>>,
    revisions: Arc<Informer<ControllerRevision>>,
    hook_runs: Arc<Informer<HookRun>>,
    queue: WorkQueue<String>,
    durations: Arc<DurationStore>,
    control: GameStatefulSetControl,
    workers: usize,
    log_format: LogFormat,
}

impl GameStatefulSetController {
    pub fn new(store: ResourceStore, clock: Arc<dyn Clock>, config: ControllerConfig) -> Self {
        let workloads = Arc::new(Informer::new());
        let hook_runs = Arc::new(Informer::new());
        let durations = Arc::new(DurationStore::new(Arc::clone(&clock)));
        let queue = WorkQueue::with_rate_limiter(config.queue_base_delay, config.queue_max_delay);
        let workers = config.workers.max(1);
        let log_format = config.log_format;
        let control = GameStatefulSetControl::new(
            store.clone(),
            Arc::clone(&workloads),
            Arc::clone(&hook_runs),
            Arc::clone(&durations),
            clock,
            config,
        );
        Self {
            store,
            workloads,
            pods: Arc::new(Informer::new()),
            revisions: Arc::new(Informer::new()),
            hook_runs,
            queue,
            durations,
            control,
            workers,
            log_format,
        }
    }

    pub fn queue(&self) -> &WorkQueue<String> {
        &self.queue
    }

    /// Applies the configured log format, then runs watches and the
    /// configured number of sync loops until `shutdown` fires. In-flight syncs
    /// finish before this returns.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), StoreError> {
        logger::init(self.log_format);
        let workload_events = self.store.workloads.watch();
        let pod_events = self.store.pods.watch();
        let revision_events = self.store.revisions.watch();
        let hook_run_events = self.store.hook_runs.watch();
        self.relist().await?;
        log_info(
            COMPONENT,
            "Starting controller",
            &[("workers", &self.workers.to_string())],
        );

        let mut handles = Vec::new();
        let controller = Arc::clone(&self);
        handles.push(tokio::spawn(run_watch(
            workload_events,
            Arc::clone(&self.store.workloads),
            Arc::clone(&self.workloads),
            shutdown.clone(),
            move |event| controller.handle_workload_event(event),
        )));
        let controller = Arc::clone(&self);
        handles.push(tokio::spawn(run_watch(
            pod_events,
            Arc::clone(&self.store.pods),
            Arc::clone(&self.pods),
            shutdown.clone(),
            move |event| controller.handle_pod_event(event),
        )));
        handles.push(tokio::spawn(run_watch(
            revision_events,
            Arc::clone(&self.store.revisions),
            Arc::clone(&self.revisions),
            shutdown.clone(),
            |_| {},
        )));
        let controller = Arc::clone(&self);
        handles.push(tokio::spawn(run_watch(
            hook_run_events,
            Arc::clone(&self.store.hook_runs),
            Arc::clone(&self.hook_runs),
            shutdown.clone(),
            move |event| controller.handle_hook_run_event(event),
        )));
        for _ in 0..self.workers {
            let controller = Arc::clone(&self);
            handles.push(tokio::spawn(async move {
                while controller.process_next_work_item().await {}
            }));
        }

        shutdown.cancelled().await;
        log_info(COMPONENT, "Shutting down controller", &[]);
        self.queue.shut_down();
        join_all(handles).await;
        Ok(())
    }

    /// Lists every kind from the store, replaces the caches, and feeds the
    /// resulting events (tombstones included) through the handlers.
    pub async fn relist(&self) -> Result<(), StoreError> {
        for event in relist(self.store.workloads.as_ref(), &self.workloads).await? {
            self.handle_workload_event(event);
        }
        for event in relist(self.store.pods.as_ref(), &self.pods).await? {
            self.handle_pod_event(event);
        }
        relist(self.store.revisions.as_ref(), &self.revisions).await?;
        for event in relist(self.store.hook_runs.as_ref(), &self.hook_runs).await? {
            self.handle_hook_run_event(event);
        }
        Ok(())
    }

    /// Takes one key off the queue and syncs it. Returns `false` once the
    /// queue has shut down.
    pub async fn process_next_work_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        metrics::set_workqueue_depth(self.queue.len());
        match self.sync(&key).await {
            Ok(()) => self.queue.forget(&key),
            Err(err) => {
                log_error(
                    COMPONENT,
                    "Error syncing workload, requeuing",
                    &[("key", &key), ("error", &err.to_string())],
                );
                self.queue.add_rate_limited(key.clone());
            }
        }
        self.queue.done(&key);
        true
    }

    /// Reconciles the workload stored under `namespace/name`.
    pub async fn sync(&self, key: &str) -> Result<(), SyncError> {
        let started = Instant::now();
        let result = sync_span(key, self.sync_workload(key)).await;
        metrics::observe_sync_duration(CONTROLLER, started.elapsed());
        metrics::record_controller_reconcile(
            CONTROLLER,
            if result.is_ok() {
                ControllerReconcileResult::Success
            } else {
                ControllerReconcileResult::Error
            },
        );
        if let Some(delay) = self.durations.pop(key) {
            self.queue.add_after(key.to_string(), delay);
        }
        result
    }

    async fn sync_workload(&self, key: &str) -> Result<(), SyncError> {
        let Some((namespace, name)) = split_key(key) else {
            log_warn(COMPONENT, "Dropping malformed key", &[("key", key)]);
            return Ok(());
        };
        let Some(set) = self.workloads.get(namespace, name) else {
            log_debug(COMPONENT, "Workload has been deleted", &[("key", key)]);
            metrics::clear_workload(Some(namespace), name);
            return Ok(());
        };
        let selector = match set.spec.selector.to_selector() {
            Ok(selector) if !selector.is_empty() => selector,
            Ok(_) => {
                log_warn(
                    COMPONENT,
                    "Workload has an empty selector, skipping",
                    &[("key", key)],
                );
                return Ok(());
            }
            Err(err) => {
                log_warn(
                    COMPONENT,
                    "Workload has an invalid selector, skipping",
                    &[("key", key), ("error", &err.to_string())],
                );
                return Ok(());
            }
        };

        let mut manager = RefManager::new(&set, &selector, self.store.workloads.as_ref());
        let claimed = async {
            let revisions = manager
                .claim_revisions(
                    self.revisions.list(Some(namespace)),
                    self.store.revisions.as_ref(),
                )
                .await?;
            let pods = manager
                .claim_pods(self.pods.list(Some(namespace)), self.store.pods.as_ref())
                .await?;
            Ok::<_, OwnershipError>((revisions, pods))
        }
        .await;
        let (revisions, pods) = match claimed {
            Ok(claimed) => claimed,
            Err(err) if err.is_owner_gone() => {
                log_info(
                    COMPONENT,
                    "Workload changed during adoption, skipping sync",
                    &[("key", key), ("reason", &err.to_string())],
                );
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let status = self
            .control
            .update_game_stateful_set(set.clone(), pods, revisions)
            .await?;
        log_debug(
            COMPONENT,
            "Synced workload",
            &[
                ("key", key),
                ("replicas", &status.replicas.to_string()),
                ("readyReplicas", &status.ready_replicas.to_string()),
                ("updatedReplicas", &status.updated_replicas.to_string()),
            ],
        );
        Ok(())
    }

    fn enqueue(&self, set: &GameStatefulSet) {
        self.queue.add(set.metadata.key());
    }

    pub fn handle_workload_event(&self, event: ObjectEvent<GameStatefulSet>) {
        match event {
            ObjectEvent::Added(set) | ObjectEvent::Updated { new: set, .. } => self.enqueue(&set),
            ObjectEvent::Deleted(DeletedObject::Known(set)) => self.enqueue(&set),
            ObjectEvent::Deleted(DeletedObject::Tombstone { key, .. }) => self.queue.add(key),
        }
    }

    pub fn handle_hook_run_event(&self, event: ObjectEvent<HookRun>) {
        let run = match &event {
            ObjectEvent::Added(run) | ObjectEvent::Updated { new: run, .. } => Some(run),
            ObjectEvent::Deleted(deleted) => deleted.object(),
        };
        let Some(run) = run else {
            return;
        };
        if let Some(set) = run
            .metadata
            .controller_ref()
            .and_then(|owner| self.resolve_controller_ref(&run.metadata.namespace(), owner))
        {
            self.enqueue(&set);
        }
    }

    pub fn handle_pod_event(&self, event: PodEvent) {
        match event {
            ObjectEvent::Added(pod) => self.add_pod(pod),
            ObjectEvent::Updated { old, new } => self.update_pod(old, new),
            ObjectEvent::Deleted(deleted) => self.delete_pod(deleted),
        }
    }

    fn add_pod(&self, pod: Pod) {
        if pod.metadata.deletion_timestamp.is_some() {
            self.delete_pod(DeletedObject::Known(pod));
            return;
        }
        if let Some(owner) = pod.metadata.controller_ref() {
            if let Some(set) = self.resolve_controller_ref(&pod.metadata.namespace(), owner) {
                self.enqueue(&set);
            }
            return;
        }
        for set in self.get_pod_game_stateful_sets(&pod) {
            self.enqueue(&set);
        }
    }

    fn update_pod(&self, old: Pod, new: Pod) {
        if old.metadata.resource_version == new.metadata.resource_version {
            return;
        }
        let labels_changed = old.metadata.labels != new.metadata.labels;
        if new.metadata.deletion_timestamp.is_some() {
            if labels_changed {
                self.delete_pod(DeletedObject::Known(old));
            }
            self.delete_pod(DeletedObject::Known(new));
            return;
        }

        let old_ref = old.metadata.controller_ref();
        let new_ref = new.metadata.controller_ref();
        let ref_changed = old_ref != new_ref;
        if ref_changed {
            if let Some(set) =
                old_ref.and_then(|owner| self.resolve_controller_ref(&old.metadata.namespace(), owner))
            {
                self.enqueue(&set);
            }
        }
        if let Some(owner) = new_ref {
            if let Some(set) = self.resolve_controller_ref(&new.metadata.namespace(), owner) {
                self.enqueue(&set);
            }
            return;
        }
        if labels_changed || ref_changed {
            for set in self.get_pod_game_stateful_sets(&new) {
                self.enqueue(&set);
            }
        }
    }

    fn delete_pod(&self, deleted: DeletedObject<Pod>) {
        let Some(pod) = deleted.object() else {
            if let DeletedObject::Tombstone { key, .. } = &deleted {
                log_warn(
                    COMPONENT,
                    "Tombstone carries no pod, dropping event",
                    &[("key", key)],
                );
            }
            return;
        };
        let Some(owner) = pod.metadata.controller_ref() else {
            return;
        };
        if let Some(set) = self.resolve_controller_ref(&pod.metadata.namespace(), owner) {
            self.enqueue(&set);
        }
    }

    /// The cached workload `owner` points at, provided its UID still matches.
    fn resolve_controller_ref(
        &self,
        namespace: &str,
        owner: &OwnerReference,
    ) -> Option<GameStatefulSet> {
        if owner.kind != GameStatefulSet::KIND {
            return None;
        }
        self.workloads
            .get(namespace, &owner.name)
            .filter(|set| set.metadata.uid() == owner.uid)
    }

    /// Workloads in the pod's namespace whose selector matches it, oldest
    /// first.
    fn get_pod_game_stateful_sets(&self, pod: &Pod) -> Vec<GameStatefulSet> {
        if pod.metadata.labels.is_empty() {
            return Vec::new();
        }
        let mut sets: Vec<GameStatefulSet> = self
            .workloads
            .list(Some(&pod.metadata.namespace()))
            .into_iter()
            .filter(|set| {
                set.spec
                    .selector
                    .to_selector()
                    .is_ok_and(|selector| selector.matches(&pod.metadata.labels))
            })
            .collect();
        if sets.len() > 1 {
            sort_overlapping_sets(&mut sets);
            let names: Vec<&str> = sets.iter().map(|set| set.metadata.name()).collect();
            log_error(
                COMPONENT,
                "More than one workload selects pod; fix the overlapping selectors",
                &[
                    ("pod", &pod.metadata.key()),
                    ("workloads", &names.join(",")),
                ],
            );
        }
        sets
    }
}

fn split_key(key: &str) -> Option<(&str, &str)> {
    match key.split_once('/') {
        Some((namespace, name))
            if !namespace.is_empty() && !name.is_empty() && !name.contains('/') =>
        {
            Some((namespace, name))
        }
        _ => None,
    }
}

async fn relist<T: Resource>(
    store: &dyn ObjectStore<T>,
    informer: &Informer<T>,
) -> Result<Vec<ObjectEvent<T>>, StoreError> {
    let objects = store.list(None).await?;
    Ok(informer.replace(objects))
}

/// Feeds one store watch into `informer` and `handle`. A lagged receiver
/// relists the kind so missed deletes come back as tombstones.
async fn run_watch<T, H>(
    receiver: broadcast::Receiver<WatchEvent<T>>,
    store: Arc<dyn ObjectStore<T>>,
    informer: Arc<Informer<T>>,
    shutdown: CancellationToken,
    handle: H,
) where
    T: Resource,
    H: Fn(ObjectEvent<T>) + Send + Sync + 'static,
{
    let mut events = BroadcastStream::new(receiver);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            next = events.next() => match next {
                Some(Ok(event)) => handle(informer.observe(event)),
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    log_warn(
                        COMPONENT,
                        "Watch lagged, relisting",
                        &[("kind", T::KIND), ("skipped", &skipped.to_string())],
                    );
                    match relist(store.as_ref(), &informer).await {
                        Ok(replayed) => replayed.into_iter().for_each(&handle),
                        Err(err) => log_error(
                            COMPONENT,
                            "Relist failed",
                            &[("kind", T::KIND), ("error", &err.to_string())],
                        ),
                    }
                }
                None => break,
            },
        }
    }
}
