use gamestatefulset::gamestatefulset::controller::identity::new_game_stateful_set_pod;
use gamestatefulset::gamestatefulset::k8s::gamestatefulset::GameStatefulSet;
use gamestatefulset::gamestatefulset::k8s::store::ObjectStore;
use gamestatefulset::gamestatefulset::test_support::{game_stateful_set, ControllerHarness};

async fn seed_orphans(harness: &ControllerHarness, set: &GameStatefulSet, ordinals: &[u32]) {
    for &ordinal in ordinals {
        let mut pod = new_game_stateful_set_pod(set, ordinal);
        pod.metadata.owner_references.clear();
        harness.stores.pods.create(pod).await.expect("seed orphan");
    }
}

#[tokio::test]
async fn orphans_are_adopted_instead_of_duplicated() {
    let harness = ControllerHarness::new();
    let set = harness.create(game_stateful_set("web", 2)).await;
    seed_orphans(&harness, &set, &[0, 1]).await;
    let before: Vec<String> = harness
        .pods()
        .await
        .iter()
        .map(|pod| pod.metadata.uid().to_string())
        .collect();

    harness.sync("web").await.expect("sync");

    let pods = harness.pods().await;
    assert_eq!(pods.len(), 2);
    for (pod, uid) in pods.iter().zip(&before) {
        assert_eq!(pod.metadata.uid(), uid, "{} kept", pod.metadata.name());
        let owner = pod.metadata.controller_ref().expect("adopted");
        assert_eq!(owner.uid, set.metadata.uid());
    }
}

#[tokio::test]
async fn recreated_workload_does_not_adopt_through_a_stale_cache() {
    let harness = ControllerHarness::new();
    let original = harness.create(game_stateful_set("web", 2)).await;
    seed_orphans(&harness, &original, &[0]).await;
    harness.controller.relist().await.expect("relist");

    // Replace the workload behind the cache's back.
    harness
        .stores
        .workloads
        .delete("default", "web")
        .await
        .expect("delete workload");
    let replacement = harness.create(game_stateful_set("web", 2)).await;
    assert_ne!(replacement.metadata.uid(), original.metadata.uid());

    harness
        .controller
        .sync("default/web")
        .await
        .expect("stale owner is not an error");
    let pods = harness.pods().await;
    assert_eq!(pods.len(), 1);
    assert!(pods[0].metadata.controller_ref().is_none());

    harness.sync("web").await.expect("sync");
    let adopted = harness.pods().await.remove(0);
    let owner = adopted.metadata.controller_ref().expect("adopted");
    assert_eq!(owner.uid, replacement.metadata.uid());
}

#[tokio::test]
async fn pods_of_another_owner_are_left_alone() {
    let harness = ControllerHarness::new();
    let set = harness.create(game_stateful_set("web", 1)).await;
    let mut foreign = new_game_stateful_set_pod(&set, 0);
    foreign.metadata.owner_references[0].uid = "someone-else".to_string();
    harness.stores.pods.create(foreign).await.expect("seed");

    let err = harness.sync("web").await;
    let pods = harness.pods().await;
    assert_eq!(pods.len(), 1);
    assert_eq!(
        pods[0].metadata.controller_ref().map(|owner| owner.uid.as_str()),
        Some("someone-else")
    );
    assert!(err.is_err(), "the slot is taken, so creating web-0 fails");
}
