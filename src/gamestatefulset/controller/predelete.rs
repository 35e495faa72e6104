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

//! Pre-delete hooks: a pod is only deleted for an update or a scale-down
//! once a `pre-delete` hook run for it has succeeded.

use crate::gamestatefulset::controller::canary::{
    new_hook_run, CanaryContext, HOOK_RUN_POD_LABEL, HOOK_RUN_REVISION_LABEL, HOOK_RUN_TYPE_LABEL,
    HOOK_RUN_TYPE_PRE_DELETE,
};
use crate::gamestatefulset::controller::identity::get_pod_revision;
use crate::gamestatefulset::controller::requeue::DurationStore;
use crate::gamestatefulset::k8s::gamestatefulset::{PauseReasonKind, PreDeleteHookCondition};
use crate::gamestatefulset::k8s::hookrun::{HookRun, HookRunPhase};
use crate::gamestatefulset::k8s::pod::Pod;
use crate::gamestatefulset::k8s::store::{ObjectStore, StoreError};
use crate::gamestatefulset::logger::{log_info, log_warn};
use crate::gamestatefulset::observability::metrics;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const COMPONENT: &str = "pre-delete";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreDeleteVerdict {
    Proceed,
    Wait,
}

pub struct PreDeleteGate {
    hook_runs: Arc<dyn ObjectStore<HookRun>>,
    durations: Arc<DurationStore>,
    poll_interval: Duration,
}

impl PreDeleteGate {
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

    /// Decides whether `pod` may be deleted now. Without a configured hook
    /// every pod may go.
    pub async fn check(
        &self,
        ctx: &mut CanaryContext,
        pod: &Pod,
    ) -> Result<PreDeleteVerdict, StoreError> {
        let Some(hook) = ctx
            .set()
            .spec
            .pre_delete_update_strategy
            .as_ref()
            .and_then(|strategy| strategy.hook.clone())
        else {
            return Ok(PreDeleteVerdict::Proceed);
        };

        let pod_name = pod.metadata.name().to_string();
        let revision = get_pod_revision(pod).to_string();
        let key = ctx.set().metadata.key();
        let existing = ctx
            .pre_delete_hook_runs
            .iter()
            .find(|run| {
                run.metadata.labels.get(HOOK_RUN_POD_LABEL) == Some(&pod_name)
                    && run.metadata.labels.get(HOOK_RUN_REVISION_LABEL) == Some(&revision)
            })
            .cloned();

        let run = match existing {
            Some(run) => run,
            None => {
                let labels = BTreeMap::from([
                    (
                        HOOK_RUN_TYPE_LABEL.to_string(),
                        HOOK_RUN_TYPE_PRE_DELETE.to_string(),
                    ),
                    (HOOK_RUN_REVISION_LABEL.to_string(), revision.clone()),
                    (HOOK_RUN_POD_LABEL.to_string(), pod_name.clone()),
                ]);
                let name = pre_delete_run_name(&pod_name, &revision);
                let run = new_hook_run(ctx.set(), name, &hook, labels);
                let created = match self.hook_runs.create(run.clone()).await {
                    Ok(created) => {
                        metrics::record_hook_run_created(HOOK_RUN_TYPE_PRE_DELETE);
                        log_info(
                            COMPONENT,
                            "Created pre-delete hook run",
                            &[("workload", &key), ("pod", &pod_name)],
                        );
                        created
                    }
                    Err(err) if err.is_already_exists() => {
                        self.hook_runs
                            .get(&run.metadata.namespace(), run.metadata.name())
                            .await?
                    }
                    Err(err) => return Err(err),
                };
                ctx.pre_delete_hook_runs.push(created.clone());
                created
            }
        };

        let phase = run.phase();
        if phase == HookRunPhase::Successful {
            ctx.new_status
                .pre_delete_hook_conditions
                .retain(|condition| condition.pod_name != pod_name);
            return Ok(PreDeleteVerdict::Proceed);
        }

        record_condition(ctx, &pod_name, &run);
        if phase.is_failure() {
            log_warn(
                COMPONENT,
                "Pre-delete hook run failed, keeping pod",
                &[
                    ("workload", &key),
                    ("pod", &pod_name),
                    ("phase", phase.as_str()),
                ],
            );
            ctx.add_pause_condition(PauseReasonKind::PreDeleteHookFailed);
        } else {
            self.durations.push(&key, self.poll_interval);
        }
        Ok(PreDeleteVerdict::Wait)
    }
}

/// Hook run name for `pod` at `revision`. The revision is already prefixed
/// with the workload name, so only its hash suffix is kept.
fn pre_delete_run_name(pod_name: &str, revision: &str) -> String {
    let hash = revision.rsplit_once('-').map_or(revision, |(_, hash)| hash);
    format!("{}-{}-predelete", pod_name, hash)
}

fn record_condition(ctx: &mut CanaryContext, pod_name: &str, run: &HookRun) {
    let phase = run.phase().as_str().to_string();
    let now = ctx.now();
    let conditions = &mut ctx.new_status.pre_delete_hook_conditions;
    match conditions
        .iter_mut()
        .find(|condition| condition.pod_name == pod_name)
    {
        Some(condition) => {
            if condition.hook_run_name != run.metadata.name() {
                condition.hook_run_name = run.metadata.name().to_string();
                condition.start_time = now;
            }
            condition.phase = phase;
        }
        None => conditions.push(PreDeleteHookCondition {
            pod_name: pod_name.to_string(),
            hook_run_name: run.metadata.name().to_string(),
            phase,
            start_time: now,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gamestatefulset::controller::history::new_revision;
    use crate::gamestatefulset::k8s::gamestatefulset::{HookStep, PreDeleteUpdateStrategy};
    use crate::gamestatefulset::k8s::hookrun::HookRunStatus;
    use crate::gamestatefulset::k8s::store::MemoryStore;
    use crate::gamestatefulset::test_support::{game_stateful_set, ready_pod_for};
    use crate::gamestatefulset::util::clock::{Clock, ManualClock};

    fn gate(runs: Arc<MemoryStore<HookRun>>, durations: Arc<DurationStore>) -> PreDeleteGate {
        PreDeleteGate::new(runs, durations, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn without_hook_pods_are_released() {
        let set = game_stateful_set("web", 1);
        let revision = new_revision(&set, 1, None).expect("revision");
        let clock = Arc::new(ManualClock::default());
        let mut ctx = CanaryContext::new(&set, Vec::new(), &revision, &revision, 0, clock.now())
            .expect("context");
        let runs = Arc::new(MemoryStore::new());
        let verdict = gate(runs.clone(), Arc::new(DurationStore::new(clock)))
            .check(&mut ctx, &ready_pod_for(&set, 0, revision.name()))
            .await
            .expect("check");
        assert_eq!(verdict, PreDeleteVerdict::Proceed);
        assert!(runs.is_empty());
    }

    #[tokio::test]
    async fn hook_gates_delete_until_success() {
        let mut set = game_stateful_set("web", 1);
        set.spec.pre_delete_update_strategy = Some(PreDeleteUpdateStrategy {
            hook: Some(HookStep {
                template_name: "drain-players".to_string(),
                args: Vec::new(),
            }),
        });
        let revision = new_revision(&set, 1, None).expect("revision");
        let pod = ready_pod_for(&set, 0, revision.name());
        let clock = Arc::new(ManualClock::default());
        let durations = Arc::new(DurationStore::new(clock.clone()));
        let runs = Arc::new(MemoryStore::<HookRun>::new());

        let mut ctx = CanaryContext::new(&set, Vec::new(), &revision, &revision, 0, clock.now())
            .expect("context");
        let verdict = gate(runs.clone(), durations.clone())
            .check(&mut ctx, &pod)
            .await
            .expect("check");
        assert_eq!(verdict, PreDeleteVerdict::Wait);
        assert!(durations.pending(&set.metadata.key()));
        assert_eq!(ctx.new_status.pre_delete_hook_conditions.len(), 1);
        assert_eq!(ctx.new_status.pre_delete_hook_conditions[0].phase, "Pending");
        assert_eq!(runs.len(), 1);

        let mut created = runs.list(None).await.expect("list").remove(0);
        assert!(created.metadata.name().starts_with("web-0-"));
        created.status = Some(HookRunStatus {
            phase: HookRunPhase::Failed,
            message: None,
        });
        let mut ctx = CanaryContext::new(&set, vec![created.clone()], &revision, &revision, 0, clock.now())
            .expect("context");
        let verdict = gate(runs.clone(), durations.clone())
            .check(&mut ctx, &pod)
            .await
            .expect("check");
        assert_eq!(verdict, PreDeleteVerdict::Wait);
        assert_eq!(ctx.pause_reasons()[0].reason, PauseReasonKind::PreDeleteHookFailed);

        created.status = Some(HookRunStatus {
            phase: HookRunPhase::Successful,
            message: None,
        });
        set.status = Some(ctx.into_status());
        let mut ctx = CanaryContext::new(&set, vec![created], &revision, &revision, 0, clock.now())
            .expect("context");
        assert_eq!(ctx.new_status.pre_delete_hook_conditions.len(), 1);
        let verdict = gate(runs.clone(), durations)
            .check(&mut ctx, &pod)
            .await
            .expect("check");
        assert_eq!(verdict, PreDeleteVerdict::Proceed);
        assert!(ctx.new_status.pre_delete_hook_conditions.is_empty());
        assert_eq!(runs.len(), 1);
    }
}
