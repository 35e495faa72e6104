use gamestatefulset::gamestatefulset::controller::canary::{
    HOOK_RUN_POD_LABEL, HOOK_RUN_TYPE_LABEL, HOOK_RUN_TYPE_PRE_DELETE,
};
use gamestatefulset::gamestatefulset::controller::identity::get_pod_revision;
use gamestatefulset::gamestatefulset::k8s::gamestatefulset::{
    CanaryPause, CanaryStep, CanaryStrategy, GameStatefulSet, HookStep, PauseReasonKind,
    PreDeleteUpdateStrategy,
};
use gamestatefulset::gamestatefulset::k8s::hookrun::{HookRun, HookRunPhase};
use gamestatefulset::gamestatefulset::test_support::{game_stateful_set, ControllerHarness};
use std::time::Duration;

fn hook(template: &str) -> HookStep {
    HookStep {
        template_name: template.to_string(),
        args: Vec::new(),
    }
}

fn canary_set(name: &str) -> GameStatefulSet {
    let mut set = game_stateful_set(name, 3);
    set.spec.update_strategy.canary = Some(CanaryStrategy {
        steps: vec![
            CanaryStep {
                partition: Some(2),
                ..Default::default()
            },
            CanaryStep {
                pause: Some(CanaryPause { duration: Some(60) }),
                ..Default::default()
            },
            CanaryStep {
                hook: Some(hook("smoke-test")),
                ..Default::default()
            },
        ],
    });
    set
}

fn bump_image(set: &mut GameStatefulSet) {
    set.spec.template.spec.containers[0].image = Some("game:v2".to_string());
}

fn pre_delete_runs(runs: &[HookRun]) -> Vec<&HookRun> {
    runs.iter()
        .filter(|run| {
            run.metadata.labels.get(HOOK_RUN_TYPE_LABEL).map(String::as_str)
                == Some(HOOK_RUN_TYPE_PRE_DELETE)
        })
        .collect()
}

#[tokio::test]
async fn canary_steps_gate_the_rollout() {
    let harness = ControllerHarness::new();
    harness.create(canary_set("web")).await;
    harness.settle("web").await;
    let first = harness.workload("web").await.status.expect("status");
    assert!(first.canary.is_none(), "initial rollout has nothing to gate");

    harness.edit("web", bump_image).await;
    harness.settle("web").await;

    let paused = harness.workload("web").await.status.expect("status");
    let canary = paused.canary.clone().expect("canary status");
    assert_eq!(canary.current_step_index, Some(1));
    assert!(canary
        .pause_reasons
        .iter()
        .any(|reason| reason.reason == PauseReasonKind::CanaryPauseStep));
    let revisions: Vec<String> = harness
        .pods()
        .await
        .iter()
        .map(|pod| get_pod_revision(pod).to_string())
        .collect();
    assert_eq!(
        revisions,
        vec![
            first.update_revision.clone(),
            first.update_revision.clone(),
            paused.update_revision.clone(),
        ]
    );

    harness.clock.advance(Duration::from_secs(61));
    harness.settle("web").await;

    let hooked = harness.workload("web").await.status.expect("status");
    let canary = hooked.canary.clone().expect("canary status");
    let run_name = format!("{}-canary-2", hooked.update_revision);
    assert_eq!(canary.current_step_index, Some(2));
    assert_eq!(canary.current_step_hook_run.as_deref(), Some(run_name.as_str()));
    assert!(canary.pause_reasons.is_empty());
    let runs = harness.hook_runs().await;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].metadata.name(), run_name);
    assert_eq!(runs[0].spec.template_name, "smoke-test");
    assert_eq!(hooked.updated_replicas, 1);

    harness
        .set_hook_run_phase(&run_name, HookRunPhase::Successful)
        .await;
    harness.settle("web").await;

    let done = harness.workload("web").await.status.expect("status");
    assert!(done.canary.is_none());
    assert_eq!(done.current_revision, done.update_revision);
    assert_eq!(done.updated_replicas, 3);
    for pod in harness.pods().await {
        assert_eq!(get_pod_revision(&pod), done.update_revision);
    }
}

#[tokio::test]
async fn failed_canary_hook_pauses_the_rollout() {
    let harness = ControllerHarness::new();
    let mut set = game_stateful_set("web", 2);
    set.spec.update_strategy.canary = Some(CanaryStrategy {
        steps: vec![
            CanaryStep {
                partition: Some(1),
                ..Default::default()
            },
            CanaryStep {
                hook: Some(hook("smoke-test")),
                ..Default::default()
            },
        ],
    });
    harness.create(set).await;
    harness.settle("web").await;
    let first = harness.workload("web").await.status.expect("status");

    harness.edit("web", bump_image).await;
    harness.settle("web").await;
    let status = harness.workload("web").await.status.expect("status");
    let run_name = format!("{}-canary-1", status.update_revision);
    harness
        .set_hook_run_phase(&run_name, HookRunPhase::Failed)
        .await;
    harness.settle("web").await;

    let failed = harness.workload("web").await.status.expect("status");
    let canary = failed.canary.expect("canary status");
    assert!(canary
        .pause_reasons
        .iter()
        .any(|reason| reason.reason == PauseReasonKind::CanaryHookFailed));
    let pods = harness.pods().await;
    assert_eq!(get_pod_revision(&pods[0]), first.update_revision);
    assert_eq!(get_pod_revision(&pods[1]), failed.update_revision);
}

#[tokio::test]
async fn pre_delete_hook_gates_scale_down() {
    let harness = ControllerHarness::new();
    let mut set = game_stateful_set("web", 2);
    set.spec.pre_delete_update_strategy = Some(PreDeleteUpdateStrategy {
        hook: Some(hook("drain-players")),
    });
    harness.create(set).await;
    harness.settle("web").await;

    harness.edit("web", |set| set.spec.replicas = Some(1)).await;
    harness.settle("web").await;

    assert_eq!(harness.pods().await.len(), 2, "web-1 waits for its hook");
    let runs = harness.hook_runs().await;
    let gating = pre_delete_runs(&runs);
    assert_eq!(gating.len(), 1);
    assert_eq!(
        gating[0]
            .metadata
            .labels
            .get(HOOK_RUN_POD_LABEL)
            .map(String::as_str),
        Some("web-1")
    );
    assert_eq!(gating[0].spec.template_name, "drain-players");
    let status = harness.workload("web").await.status.expect("status");
    assert_eq!(status.pre_delete_hook_conditions.len(), 1);
    assert_eq!(status.pre_delete_hook_conditions[0].pod_name, "web-1");

    let run_name = gating[0].metadata.name().to_string();
    harness
        .set_hook_run_phase(&run_name, HookRunPhase::Successful)
        .await;
    harness.settle("web").await;

    let pods = harness.pods().await;
    assert_eq!(pods.len(), 1);
    assert_eq!(pods[0].metadata.name(), "web-0");
    let status = harness.workload("web").await.status.expect("status");
    assert!(status.pre_delete_hook_conditions.is_empty());
}
