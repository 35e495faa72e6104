use gamestatefulset::gamestatefulset::controller::control::ControlError;
use gamestatefulset::gamestatefulset::controller::gamestatefulset::SyncError;
use gamestatefulset::gamestatefulset::controller::identity::get_pod_revision;
use gamestatefulset::gamestatefulset::controller::inplace::{
    hot_patch_state, InPlaceError, HOT_PATCH_CONTAINER_LABEL,
};
use gamestatefulset::gamestatefulset::controller::rollout::ApplyError;
use gamestatefulset::gamestatefulset::k8s::gamestatefulset::{
    GameStatefulSet, PodManagementPolicy, UpdateStrategyType,
};
use gamestatefulset::gamestatefulset::test_support::{game_stateful_set, ControllerHarness};

fn in_place_set(name: &str, replicas: i32, kind: UpdateStrategyType) -> GameStatefulSet {
    let mut set = game_stateful_set(name, replicas);
    set.spec.update_strategy.r#type = kind;
    set
}

fn bump_image(set: &mut GameStatefulSet) {
    set.spec.template.spec.containers[0].image = Some("game:v2".to_string());
}

async fn uids(harness: &ControllerHarness) -> Vec<String> {
    harness
        .pods()
        .await
        .iter()
        .map(|pod| pod.metadata.uid().to_string())
        .collect()
}

#[tokio::test]
async fn in_place_update_keeps_pod_identity() {
    let harness = ControllerHarness::new();
    harness
        .create(in_place_set("web", 3, UpdateStrategyType::InPlaceUpdate))
        .await;
    harness.settle("web").await;
    let before = uids(&harness).await;

    harness.edit("web", bump_image).await;
    harness.settle("web").await;

    assert_eq!(uids(&harness).await, before);
    let status = harness.workload("web").await.status.expect("status");
    assert_eq!(status.updated_replicas, 3);
    assert_eq!(status.current_revision, status.update_revision);
    for pod in harness.pods().await {
        assert_eq!(get_pod_revision(&pod), status.update_revision);
        assert_eq!(pod.spec.containers[0].image.as_deref(), Some("game:v2"));
        let running = pod.container_status("game").expect("container status");
        assert_eq!(running.image.as_deref(), Some("game:v2"));
    }
}

#[tokio::test]
async fn patched_pod_counts_as_updated_only_once_its_image_runs() {
    let harness = ControllerHarness::new();
    let mut set = in_place_set("web", 2, UpdateStrategyType::InPlaceUpdate);
    set.spec.pod_management_policy = PodManagementPolicy::Parallel;
    harness.create(set).await;
    harness.settle("web").await;

    harness.edit("web", bump_image).await;
    harness.sync("web").await.expect("patch web-1");
    let pods = harness.pods().await;
    let status = harness.workload("web").await.status.expect("status");
    assert_eq!(get_pod_revision(&pods[1]), status.update_revision);
    assert_eq!(pods[1].spec.containers[0].image.as_deref(), Some("game:v2"));
    assert_eq!(get_pod_revision(&pods[0]), status.current_revision);

    harness.sync("web").await.expect("waits for kubelet");
    let status = harness.workload("web").await.status.expect("status");
    assert_eq!(status.updated_replicas, 0);
    assert_eq!(get_pod_revision(&harness.pods().await[0]), status.current_revision);

    harness.run_kubelet().await;
    harness.sync("web").await.expect("sync");
    let status = harness.workload("web").await.status.expect("status");
    assert_eq!(status.updated_replicas, 1);
}

#[tokio::test]
async fn in_place_update_rejects_changes_beyond_images() {
    let harness = ControllerHarness::new();
    harness
        .create(in_place_set("web", 2, UpdateStrategyType::InPlaceUpdate))
        .await;
    harness.settle("web").await;
    let before = harness.pods().await;

    harness
        .edit("web", |set| {
            set.spec.template.spec.containers[0].command = vec!["/serve".to_string()];
        })
        .await;
    let err = harness.sync("web").await.expect_err("unsupported change");
    assert!(matches!(
        err,
        SyncError::Control(ControlError::Apply(ApplyError::InPlace(
            InPlaceError::UnsupportedChange { .. }
        )))
    ));

    let after = harness.pods().await;
    for (old, new) in before.iter().zip(&after) {
        assert_eq!(old.metadata.uid(), new.metadata.uid());
        assert_eq!(get_pod_revision(old), get_pod_revision(new));
        assert_eq!(new.spec.containers[0].command, Vec::<String>::new());
    }
}

#[tokio::test]
async fn hot_patch_records_replaced_image_ids() {
    let harness = ControllerHarness::new();
    harness
        .create(in_place_set("web", 1, UpdateStrategyType::HotPatchUpdate))
        .await;
    harness.settle("web").await;
    let before = harness.pods().await.remove(0);
    let old_image_id = before
        .container_status("game")
        .and_then(|status| status.image_id.clone())
        .expect("image id");

    harness.edit("web", bump_image).await;
    harness.sync("web").await.expect("sync");

    let patched = harness.pods().await.remove(0);
    assert_eq!(patched.metadata.uid(), before.metadata.uid());
    assert_eq!(
        patched
            .metadata
            .labels
            .get(HOT_PATCH_CONTAINER_LABEL)
            .map(String::as_str),
        Some("true")
    );
    let state = hot_patch_state(&patched).expect("hot patch state");
    assert_eq!(state.revision, get_pod_revision(&patched));
    assert_eq!(state.last_container_statuses["game"].image_id, old_image_id);

    harness.settle("web").await;
    let status = harness.workload("web").await.status.expect("status");
    assert_eq!(status.updated_replicas, 1);
    assert_eq!(status.current_revision, status.update_revision);
}
