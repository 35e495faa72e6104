use gamestatefulset::gamestatefulset::controller::identity::get_pod_revision;
use gamestatefulset::gamestatefulset::k8s::gamestatefulset::{
    GameStatefulSet, PodManagementPolicy, RollingUpdateStrategy, UpdateStrategyType,
};
use gamestatefulset::gamestatefulset::k8s::store::ObjectStore;
use gamestatefulset::gamestatefulset::test_support::{game_stateful_set, ControllerHarness};

fn revisions_by_pod(pods: &[gamestatefulset::gamestatefulset::k8s::pod::Pod]) -> Vec<(String, String)> {
    pods.iter()
        .map(|pod| {
            (
                pod.metadata.name().to_string(),
                get_pod_revision(pod).to_string(),
            )
        })
        .collect()
}

fn bump_image(set: &mut GameStatefulSet) {
    set.spec.template.spec.containers[0].image = Some("game:v2".to_string());
}

#[tokio::test]
async fn partitioned_rolling_update_stops_at_the_partition() {
    let harness = ControllerHarness::new();
    let mut set = game_stateful_set("web", 3);
    set.spec.update_strategy.rolling_update = Some(RollingUpdateStrategy {
        partition: Some(2),
        paused: false,
    });
    harness.create(set).await;
    harness.settle("web").await;
    let first = harness.workload("web").await.status.expect("status");
    assert_eq!(first.ready_replicas, 3);

    harness.edit("web", bump_image).await;
    harness.settle("web").await;

    let status = harness.workload("web").await.status.expect("status");
    assert_ne!(status.update_revision, first.update_revision);
    assert_eq!(status.current_revision, first.current_revision);
    assert_eq!(status.updated_replicas, 1);
    assert_eq!(status.current_replicas, 2);
    assert_eq!(
        revisions_by_pod(&harness.pods().await),
        vec![
            ("web-0".to_string(), first.update_revision.clone()),
            ("web-1".to_string(), first.update_revision.clone()),
            ("web-2".to_string(), status.update_revision.clone()),
        ]
    );

    harness
        .edit("web", |set| {
            if let Some(rolling) = set.spec.update_strategy.rolling_update.as_mut() {
                rolling.partition = Some(0);
            }
        })
        .await;
    harness.settle("web").await;

    let done = harness.workload("web").await.status.expect("status");
    assert_eq!(done.current_revision, status.update_revision);
    assert_eq!(done.update_revision, status.update_revision);
    assert_eq!(done.updated_replicas, 3);
    assert_eq!(done.current_replicas, 3);
    for pod in harness.pods().await {
        assert_eq!(get_pod_revision(&pod), done.update_revision);
        assert_eq!(pod.spec.containers[0].image.as_deref(), Some("game:v2"));
    }
}

#[tokio::test]
async fn rolling_update_replaces_highest_ordinal_first() {
    let harness = ControllerHarness::new();
    harness.create(game_stateful_set("web", 3)).await;
    harness.settle("web").await;
    let before: Vec<String> = harness
        .pods()
        .await
        .iter()
        .map(|pod| pod.metadata.uid().to_string())
        .collect();

    harness.edit("web", bump_image).await;
    harness.sync("web").await.expect("sync");

    let pods = harness.pods().await;
    let names: Vec<&str> = pods.iter().map(|pod| pod.metadata.name()).collect();
    assert_eq!(names, vec!["web-0", "web-1"], "web-2 goes first");
    assert_eq!(pods[0].metadata.uid(), before[0]);
    assert_eq!(pods[1].metadata.uid(), before[1]);
}

#[tokio::test]
async fn scale_down_removes_one_pod_per_sync_from_the_top() {
    let harness = ControllerHarness::new();
    harness.create(game_stateful_set("web", 3)).await;
    harness.settle("web").await;

    harness.edit("web", |set| set.spec.replicas = Some(1)).await;
    harness.sync("web").await.expect("sync");
    let names: Vec<String> = harness
        .pods()
        .await
        .iter()
        .map(|pod| pod.metadata.name().to_string())
        .collect();
    assert_eq!(names, vec!["web-0", "web-1"]);

    harness.sync("web").await.expect("sync");
    let remaining = harness.pods().await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].metadata.name(), "web-0");

    harness.settle("web").await;
    let status = harness.workload("web").await.status.expect("status");
    assert_eq!(status.replicas, 1);
    assert_eq!(status.ready_replicas, 1);
}

#[tokio::test]
async fn on_delete_waits_for_manual_deletion() {
    let harness = ControllerHarness::new();
    let mut set = game_stateful_set("web", 2);
    set.spec.update_strategy.r#type = UpdateStrategyType::OnDelete;
    harness.create(set).await;
    harness.settle("web").await;
    let first = harness.workload("web").await.status.expect("status");

    harness.edit("web", bump_image).await;
    harness.settle("web").await;
    let status = harness.workload("web").await.status.expect("status");
    assert_eq!(status.updated_replicas, 0);
    for pod in harness.pods().await {
        assert_eq!(get_pod_revision(&pod), first.update_revision);
    }

    harness
        .stores
        .pods
        .delete("default", "web-1")
        .await
        .expect("manual delete");
    harness.settle("web").await;

    let pods = harness.pods().await;
    assert_eq!(get_pod_revision(&pods[0]), first.update_revision);
    assert_eq!(get_pod_revision(&pods[1]), status.update_revision);
    assert_eq!(pods[1].spec.containers[0].image.as_deref(), Some("game:v2"));
    let after = harness.workload("web").await.status.expect("status");
    assert_eq!(after.updated_replicas, 1);
    assert_eq!(after.current_revision, first.current_revision);
}

#[tokio::test]
async fn parallel_policy_scales_without_waiting() {
    let harness = ControllerHarness::new();
    let mut set = game_stateful_set("web", 4);
    set.spec.pod_management_policy = PodManagementPolicy::Parallel;
    harness.create(set).await;

    harness.sync("web").await.expect("sync");
    assert_eq!(harness.pods().await.len(), 4);

    harness.edit("web", |set| set.spec.replicas = Some(1)).await;
    harness.sync("web").await.expect("sync");
    let names: Vec<String> = harness
        .pods()
        .await
        .iter()
        .map(|pod| pod.metadata.name().to_string())
        .collect();
    assert_eq!(names, vec!["web-0"]);
}
