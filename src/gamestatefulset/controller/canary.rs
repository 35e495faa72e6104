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

//! Canary gating.
//!
//! A [`CanaryContext`] lives for one sync. It sorts the workload's hook runs,
//! seeds the status the sync will write, and collects pause reasons. The
//! [`CanaryStepper`] walks `updateStrategy.canary.steps` and decides the
//! partition the rollout may use in this sync.

use crate::gamestatefulset::controller::identity::{get_ordinal, get_pod_revision, is_healthy};
use crate::gamestatefulset::controller::inplace::{hot_patch_completed, in_place_update_completed};
use crate::gamestatefulset::controller::requeue::DurationStore;
use crate::gamestatefulset::controller::rollout::UpdateStrategy;
use crate::gamestatefulset::k8s::gamestatefulset::{
    CanaryStatus, GameStatefulSet, GameStatefulSetStatus, HookStep, PauseReason, PauseReasonKind,
};
use crate::gamestatefulset::k8s::hookrun::{HookRun, HookRunPhase, HookRunSpec};
use crate::gamestatefulset::k8s::meta::{controller_owner_ref, ObjectMeta, SelectorError};
use crate::gamestatefulset::k8s::pod::Pod;
use crate::gamestatefulset::k8s::revision::ControllerRevision;
use crate::gamestatefulset::k8s::store::{ObjectStore, StoreError};
use crate::gamestatefulset::logger::{log_info, log_warn};
use crate::gamestatefulset::observability::metrics;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub const HOOK_RUN_TYPE_LABEL: &str = "gamestatefulset.io/hookrun-type";
pub const HOOK_RUN_REVISION_LABEL: &str = "gamestatefulset.io/revision";
pub const HOOK_RUN_STEP_INDEX_LABEL: &str = "gamestatefulset.io/step-index";
pub const HOOK_RUN_POD_LABEL: &str = "gamestatefulset.io/pod-name";
pub const HOOK_RUN_TYPE_CANARY_STEP: &str = "canary-step";
pub const HOOK_RUN_TYPE_PRE_DELETE: &str = "pre-delete";

const COMPONENT: &str = "canary";

fn label<'a>(run: &'a HookRun, key: &str) -> Option<&'a str> {
    run.metadata.labels.get(key).map(String::as_str)
}

pub fn is_canary_step_run(run: &HookRun) -> bool {
    label(run, HOOK_RUN_TYPE_LABEL) == Some(HOOK_RUN_TYPE_CANARY_STEP)
}

pub fn is_pre_delete_run(run: &HookRun) -> bool {
    label(run, HOOK_RUN_TYPE_LABEL) == Some(HOOK_RUN_TYPE_PRE_DELETE)
}

fn step_index_of(run: &HookRun) -> Option<usize> {
    label(run, HOOK_RUN_STEP_INDEX_LABEL).and_then(|raw| raw.parse().ok())
}

/// Hook run owned by `set`, stamped with the labels used to find it again.
pub fn new_hook_run(
    set: &GameStatefulSet,
    name: String,
    hook: &HookStep,
    labels: BTreeMap<String, String>,
) -> HookRun {
    HookRun {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(set.metadata.namespace()),
            labels,
            owner_references: vec![controller_owner_ref(set)],
            ..Default::default()
        },
        spec: HookRunSpec {
            template_name: hook.template_name.clone(),
            args: hook.args.clone(),
            terminate: false,
        },
        ..Default::default()
    }
}

/// Per-sync view of a workload's rollout gates.
#[derive(Debug, Clone)]
pub struct CanaryContext {
    set: GameStatefulSet,
    prior: GameStatefulSetStatus,
    prior_step_index: Option<usize>,
    pub current_hook_runs: Vec<HookRun>,
    pub other_hook_runs: Vec<HookRun>,
    pub pre_delete_hook_runs: Vec<HookRun>,
    pub new_status: GameStatefulSetStatus,
    pub label_selector: String,
    step_index: usize,
    current_step_hook_run: Option<String>,
    pause_reasons: Vec<PauseReason>,
    now: DateTime<Utc>,
}

impl CanaryContext {
    /// `hook_runs` must already be restricted to runs owned by `set`.
    pub fn new(
        set: &GameStatefulSet,
        hook_runs: Vec<HookRun>,
        current_revision: &ControllerRevision,
        update_revision: &ControllerRevision,
        collision_count: i32,
        now: DateTime<Utc>,
    ) -> Result<Self, SelectorError> {
        let label_selector = set.spec.selector.to_selector()?.to_string();
        let prior = set.status_or_default();
        let update_name = update_revision.name().to_string();

        let mut current_hook_runs = Vec::new();
        let mut other_hook_runs = Vec::new();
        let mut pre_delete_hook_runs = Vec::new();
        for run in hook_runs {
            if is_pre_delete_run(&run) {
                pre_delete_hook_runs.push(run);
            } else if label(&run, HOOK_RUN_REVISION_LABEL) == Some(update_name.as_str()) {
                current_hook_runs.push(run);
            } else if is_canary_step_run(&run) {
                other_hook_runs.push(run);
            }
        }

        let same_rollout = prior.update_revision == update_name;
        let prior_canary = prior.canary.clone().unwrap_or_default();
        let prior_step_index = prior_canary
            .current_step_index
            .filter(|_| same_rollout)
            .and_then(|index| usize::try_from(index).ok());

        let new_status = GameStatefulSetStatus {
            observed_generation: set.metadata.generation.unwrap_or_default(),
            current_revision: current_revision.name().to_string(),
            update_revision: update_name,
            collision_count: Some(collision_count),
            label_selector: label_selector.clone(),
            pre_delete_hook_conditions: prior.pre_delete_hook_conditions.clone(),
            ..Default::default()
        };

        let mut context = Self {
            set: set.clone(),
            prior,
            prior_step_index,
            current_hook_runs: Vec::new(),
            other_hook_runs,
            pre_delete_hook_runs,
            new_status,
            label_selector,
            step_index: prior_step_index.unwrap_or(0),
            current_step_hook_run: None,
            pause_reasons: Vec::new(),
            now,
        };
        context.set_current_hook_runs(current_hook_runs);
        Ok(context)
    }

    pub fn set(&self) -> &GameStatefulSet {
        &self.set
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn update_revision(&self) -> &str {
        &self.new_status.update_revision
    }

    pub fn current_step_index(&self) -> usize {
        self.step_index
    }

    pub fn set_current_step_index(&mut self, index: usize) {
        if index != self.step_index {
            self.step_index = index;
            self.refresh_current_step_hook_run();
        }
    }

    /// Replaces the tracked hook runs of the active rollout.
    pub fn set_current_hook_runs(&mut self, runs: Vec<HookRun>) {
        self.current_hook_runs = runs;
        self.refresh_current_step_hook_run();
    }

    pub fn current_step_hook_run(&self) -> Option<&str> {
        self.current_step_hook_run.as_deref()
    }

    fn refresh_current_step_hook_run(&mut self) {
        let index = self.step_index;
        self.current_step_hook_run = self
            .current_hook_runs
            .iter()
            .find(|run| is_canary_step_run(run) && step_index_of(run) == Some(index))
            .map(|run| run.metadata.name().to_string());
    }

    /// Records a pause. A reason already present in the previous status
    /// keeps its original start time. Returns the start time in effect.
    pub fn add_pause_condition(&mut self, reason: PauseReasonKind) -> DateTime<Utc> {
        if let Some(existing) = self.pause_reasons.iter().find(|p| p.reason == reason) {
            return existing.start_time;
        }
        let start_time = self.prior_pause_start(reason).unwrap_or(self.now);
        self.pause_reasons.push(PauseReason { reason, start_time });
        start_time
    }

    pub fn has_add_pause(&self) -> bool {
        !self.pause_reasons.is_empty()
    }

    pub fn pause_reasons(&self) -> &[PauseReason] {
        &self.pause_reasons
    }

    fn prior_pause_start(&self, reason: PauseReasonKind) -> Option<DateTime<Utc>> {
        if reason == PauseReasonKind::CanaryPauseStep && self.prior_step_index != Some(self.step_index)
        {
            return None;
        }
        self.prior
            .canary
            .as_ref()?
            .pause_reasons
            .iter()
            .find(|p| p.reason == reason)
            .map(|p| p.start_time)
    }

    /// Start of the pause step at the current index, as it will be recorded.
    fn pause_step_start(&self) -> DateTime<Utc> {
        self.prior_pause_start(PauseReasonKind::CanaryPauseStep)
            .unwrap_or(self.now)
    }

    fn rollout_pending(&self) -> bool {
        self.new_status.current_revision != self.new_status.update_revision
    }

    /// Status to persist, with the canary block folded in.
    pub fn into_status(self) -> GameStatefulSetStatus {
        let has_steps = !self.set.spec.update_strategy.canary_steps().is_empty();
        let in_progress = has_steps && self.rollout_pending();
        let mut status = self.new_status;
        status.canary = if in_progress || !self.pause_reasons.is_empty() {
            Some(CanaryStatus {
                current_step_index: in_progress
                    .then(|| i32::try_from(self.step_index).unwrap_or(i32::MAX)),
                current_step_hook_run: self.current_step_hook_run.filter(|_| in_progress),
                pause_reasons: self.pause_reasons,
            })
        } else {
            None
        };
        status
    }
}

enum HookVerdict {
    Passed,
    Failed,
    Running,
}

/// Drives the canary steps of a workload.
pub struct CanaryStepper {
    hook_runs: Arc<dyn ObjectStore<HookRun>>,
    durations: Arc<DurationStore>,
    poll_interval: Duration,
}

impl CanaryStepper {
    pub fn new(
        hook_runs: Arc<dyn ObjectStore<HookRun>>,
        durations: Arc<DurationStore>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            hook_runs,
            durations,
            poll_interval,
        }
    }

    /// Evaluates pause flags and canary steps. Returns the partition the
    /// rollout is limited to, or `None` when the declared strategy applies.
    pub async fn reconcile(
        &self,
        ctx: &mut CanaryContext,
        pods: &[Pod],
    ) -> Result<Option<i32>, StoreError> {
        let set = ctx.set().clone();
        let key = set.metadata.key();
        if set.spec.update_strategy.is_paused() {
            ctx.add_pause_condition(PauseReasonKind::Paused);
        }
        self.terminate_stale_runs(ctx).await?;

        let steps = set.spec.update_strategy.canary_steps();
        let strategy = UpdateStrategy::from_spec(&set.spec.update_strategy);
        if steps.is_empty() || strategy.is_on_delete() || !ctx.rollout_pending() {
            return Ok(None);
        }

        let replicas = set.replicas();
        let mut index = ctx.current_step_index().min(steps.len());
        let mut partition = steps[..index]
            .iter()
            .filter_map(|step| step.partition)
            .last()
            .map_or(replicas, |p| p.clamp(0, replicas));

        while index < steps.len() {
            ctx.set_current_step_index(index);
            let step = &steps[index];
            if let Some(step_partition) = step.partition {
                partition = step_partition.clamp(0, replicas);
                if !partition_rolled_out(pods, ctx.update_revision(), partition, replicas) {
                    break;
                }
            } else if let Some(pause) = step.pause.as_ref() {
                let start = ctx.pause_step_start();
                let Some(seconds) = pause.duration else {
                    ctx.add_pause_condition(PauseReasonKind::CanaryPauseStep);
                    break;
                };
                let deadline = start + chrono::Duration::seconds(seconds.max(0));
                if ctx.now() < deadline {
                    ctx.add_pause_condition(PauseReasonKind::CanaryPauseStep);
                    if let Ok(left) = (deadline - ctx.now()).to_std() {
                        self.durations.push(&key, left);
                    }
                    break;
                }
            } else if let Some(hook) = step.hook.as_ref() {
                match self.step_hook_run(ctx, index, hook).await? {
                    HookVerdict::Passed => {}
                    HookVerdict::Failed => {
                        ctx.add_pause_condition(PauseReasonKind::CanaryHookFailed);
                        break;
                    }
                    HookVerdict::Running => {
                        self.durations.push(&key, self.poll_interval);
                        break;
                    }
                }
            }
            index += 1;
        }

        ctx.set_current_step_index(index);
        if index >= steps.len() {
            return Ok(None);
        }
        Ok(Some(partition))
    }

    async fn step_hook_run(
        &self,
        ctx: &mut CanaryContext,
        index: usize,
        hook: &HookStep,
    ) -> Result<HookVerdict, StoreError> {
        let existing = ctx
            .current_hook_runs
            .iter()
            .find(|run| is_canary_step_run(run) && step_index_of(run) == Some(index))
            .cloned();
        let run = match existing {
            Some(run) => run,
            None => {
                let created = self.create_step_run(ctx, index, hook).await?;
                let mut runs = ctx.current_hook_runs.clone();
                runs.push(created.clone());
                ctx.set_current_hook_runs(runs);
                created
            }
        };

        let phase = run.phase();
        if phase == HookRunPhase::Successful {
            return Ok(HookVerdict::Passed);
        }
        if phase.is_failure() {
            log_warn(
                COMPONENT,
                "Canary hook run failed, pausing rollout",
                &[
                    ("workload", &ctx.set().metadata.key()),
                    ("hookrun", run.metadata.name()),
                    ("phase", phase.as_str()),
                ],
            );
            return Ok(HookVerdict::Failed);
        }
        Ok(HookVerdict::Running)
    }

    async fn create_step_run(
        &self,
        ctx: &CanaryContext,
        index: usize,
        hook: &HookStep,
    ) -> Result<HookRun, StoreError> {
        let set = ctx.set();
        let name = format!("{}-canary-{}", ctx.update_revision(), index);
        let labels = BTreeMap::from([
            (
                HOOK_RUN_TYPE_LABEL.to_string(),
                HOOK_RUN_TYPE_CANARY_STEP.to_string(),
            ),
            (
                HOOK_RUN_REVISION_LABEL.to_string(),
                ctx.update_revision().to_string(),
            ),
            (HOOK_RUN_STEP_INDEX_LABEL.to_string(), index.to_string()),
        ]);
        let run = new_hook_run(set, name, hook, labels);
        match self.hook_runs.create(run.clone()).await {
            Ok(created) => {
                metrics::record_hook_run_created(HOOK_RUN_TYPE_CANARY_STEP);
                log_info(
                    COMPONENT,
                    "Created canary hook run",
                    &[
                        ("workload", &set.metadata.key()),
                        ("hookrun", created.metadata.name()),
                        ("step", &index.to_string()),
                    ],
                );
                Ok(created)
            }
            Err(err) if err.is_already_exists() => {
                self.hook_runs
                    .get(&run.metadata.namespace(), run.metadata.name())
                    .await
            }
            Err(err) => Err(err),
        }
    }

    /// Asks still-running canary runs of superseded revisions to stop.
    async fn terminate_stale_runs(&self, ctx: &CanaryContext) -> Result<(), StoreError> {
        for run in &ctx.other_hook_runs {
            if run.phase().is_completed() || run.spec.terminate {
                continue;
            }
            let mut draft = run.clone();
            draft.spec.terminate = true;
            match self.hook_runs.update(draft).await {
                Ok(_) => log_info(
                    COMPONENT,
                    "Terminated stale canary hook run",
                    &[
                        ("workload", &ctx.set().metadata.key()),
                        ("hookrun", run.metadata.name()),
                    ],
                ),
                Err(err) if err.is_not_found() || err.is_conflict() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

/// True when every ordinal in `[partition, replicas)` runs the update
/// revision, is healthy, and has finished any in-place image swap.
pub fn partition_rolled_out(pods: &[Pod], update_revision: &str, partition: i32, replicas: i32) -> bool {
    let start = u32::try_from(partition.max(0)).unwrap_or(0);
    let end = u32::try_from(replicas.max(0)).unwrap_or(0);
    (start..end).all(|ordinal| {
        pods.iter()
            .find(|pod| get_ordinal(pod) == Some(ordinal))
            .is_some_and(|pod| {
                get_pod_revision(pod) == update_revision
                    && is_healthy(pod)
                    && in_place_update_completed(pod)
                    && hot_patch_completed(pod)
            })
    })
}
