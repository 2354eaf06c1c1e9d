use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use vmtune_api::{ApiStatus, PolicyAuthorizer, ReconfigurationApi};
use vmtune_compute::{HostProfile, ReconfigurationService};
use vmtune_core::{InstanceId, RequestContext, ResourceKind, ResourceLimits};
use vmtune_test_utils::{running_instance, Harness, HOST};

fn api(harness: &Harness) -> ReconfigurationApi {
    ReconfigurationApi::new(
        ReconfigurationService::new(harness.services.clone()),
        Arc::new(PolicyAuthorizer::default()),
        &ResourceLimits::default(),
    )
    .unwrap()
}

fn member() -> RequestContext {
    RequestContext::new("alice", "p1").with_roles(["member"])
}

fn id(raw: &str) -> InstanceId {
    InstanceId::from(raw)
}

fn delayed_harness(lock_wait: Duration) -> Harness {
    Harness::builder()
        .instance(running_instance("A"))
        .host(HOST, HostProfile::default().with_apply_delay(Duration::from_millis(100)))
        .lock_wait(lock_wait)
        .build()
}

#[tokio::test]
async fn hotplug_running_instance_is_read_back() {
    let harness = Harness::standard();
    let api = api(&harness);
    let vcpus = api.endpoint(ResourceKind::Vcpus);

    let before = vcpus.read(&member(), &id("A")).await;
    assert_eq!(before.status, ApiStatus::Ok);
    assert_eq!(before.body, json!({"id": "A", "vcpus": 2}));

    let response = vcpus
        .action(&member(), &id("A"), &json!({"setVcpus": {"vcpus": 4}}))
        .await;
    assert_eq!(response.code(), 202);
    assert!(response.body.is_null());

    api.quiesce(&id("A")).await;
    let after = vcpus.read(&member(), &id("A")).await;
    assert_eq!(after.body, json!({"id": "A", "vcpus": 4}));
    assert_eq!(harness.quota.stats().committed, 1);
}

#[tokio::test(start_paused = true)]
async fn accepted_change_is_not_applied_synchronously() {
    let harness = Harness::builder()
        .instance(running_instance("A"))
        .host(HOST, HostProfile::default().with_apply_delay(Duration::from_millis(500)))
        .build();
    let api = api(&harness);
    let memory = api.endpoint(ResourceKind::Memory);

    let response = memory
        .action(&member(), &id("A"), &json!({"setMem": {"mem": 4096}}))
        .await;
    assert_eq!(response.status, ApiStatus::Accepted);
    assert_eq!(memory.read(&member(), &id("A")).await.body, json!({"id": "A", "mem": 2048}));

    api.quiesce(&id("A")).await;
    assert_eq!(memory.read(&member(), &id("A")).await.body, json!({"id": "A", "mem": 4096}));
}

#[tokio::test]
async fn shutoff_instance_conflicts_and_keeps_memory() {
    let harness = Harness::standard();
    let api = api(&harness);
    let memory = api.endpoint(ResourceKind::Memory);

    let response = memory
        .action(&member(), &id("B"), &json!({"setMem": {"mem": 4096}}))
        .await;
    assert_eq!(response.code(), 409);
    assert_eq!(
        response.message(),
        Some("Cannot 'setMem' instance B while it is in power_state shutdown")
    );

    let after = memory.read(&member(), &id("B")).await;
    assert_eq!(after.body, json!({"id": "B", "mem": 2048}));
    assert_eq!(harness.quota.stats().reserved, 0);
}

#[tokio::test]
async fn unknown_instance_is_not_found_without_side_effects() {
    let harness = Harness::standard();
    let api = api(&harness);
    let vcpus = api.endpoint(ResourceKind::Vcpus);

    let response = vcpus
        .action(&member(), &id("Z"), &json!({"setVcpus": {"vcpus": 4}}))
        .await;
    assert_eq!(response.code(), 404);
    assert!(response.body.get("itemNotFound").is_some());
    assert_eq!(harness.quota.stats().reserved, 0);

    assert_eq!(vcpus.read(&member(), &id("Z")).await.code(), 404);
}

#[tokio::test]
async fn hostless_instance_is_not_found_for_actions_only() {
    let mut homeless = running_instance("H");
    homeless.host = None;
    let harness = Harness::builder().instance(homeless).host(HOST, HostProfile::default()).build();
    let api = api(&harness);
    let vcpus = api.endpoint(ResourceKind::Vcpus);

    assert_eq!(vcpus.read(&member(), &id("H")).await.code(), 200);
    let response = vcpus
        .action(&member(), &id("H"), &json!({"setVcpus": {"vcpus": 4}}))
        .await;
    assert_eq!(response.code(), 404);
    assert_eq!(harness.quota.stats().reserved, 0);
}

#[tokio::test]
async fn agent_rejection_is_conflict_and_releases_hold_once() {
    let harness = Harness::standard();
    let api = api(&harness);

    let response = api
        .endpoint(ResourceKind::Vcpus)
        .action(&member(), &id("A"), &json!({"setVcpus": {"vcpus": 33}}))
        .await;
    assert_eq!(response.code(), 409);

    let stats = harness.quota.stats();
    assert_eq!((stats.reserved, stats.rolled_back, stats.committed), (1, 1, 0));
    assert_eq!(harness.instance("A").await.vcpus, 2);
}

#[tokio::test]
async fn unsupported_backend_is_not_implemented() {
    let profile = HostProfile {
        mem_hottune: false,
        ..HostProfile::default()
    };
    let harness = Harness::builder().instance(running_instance("A")).host(HOST, profile).build();
    let api = api(&harness);

    let response = api
        .endpoint(ResourceKind::Memory)
        .action(&member(), &id("A"), &json!({"setMem": {"mem": 4096}}))
        .await;
    assert_eq!(response.code(), 501);
    assert_eq!(response.message(), Some("Unable to set mem on instance"));
    assert_eq!(harness.quota.stats().outstanding(), 0);
}

#[tokio::test]
async fn schema_failures_never_reach_dispatch() {
    let harness = Harness::standard();
    let api = api(&harness);
    let vcpus = api.endpoint(ResourceKind::Vcpus);

    for body in [
        json!({"setVcpus": {"vcpus": 0}}),
        json!({"setVcpus": {"vcpus": 65}}),
        json!({"setVcpus": {"cpus": 4}}),
        json!({"setMem": {"mem": 4096}}),
    ] {
        let response = vcpus.action(&member(), &id("A"), &body).await;
        assert_eq!(response.code(), 400, "{body}");
        assert!(response.body.get("badRequest").is_some());
    }
    assert_eq!(harness.quota.stats().reserved, 0);
    assert!(harness.locks.is_empty());
}

#[tokio::test]
async fn unchanged_value_is_bad_request() {
    let harness = Harness::standard();
    let api = api(&harness);

    let response = api
        .endpoint(ResourceKind::Memory)
        .action(&member(), &id("A"), &json!({"setMem": {"mem": 2048}}))
        .await;
    assert_eq!(response.code(), 400);
    assert_eq!(harness.quota.stats().reserved, 0);
}

#[tokio::test]
async fn caller_without_role_is_forbidden() {
    let harness = Harness::standard();
    let api = api(&harness);
    let vcpus = api.endpoint(ResourceKind::Vcpus);
    let stranger = RequestContext::new("mallory", "p9");

    assert_eq!(vcpus.read(&stranger, &id("A")).await.code(), 403);
    let response = vcpus
        .action(&stranger, &id("A"), &json!({"setVcpus": {"vcpus": 4}}))
        .await;
    assert_eq!(response.code(), 403);
    assert_eq!(
        response.message(),
        Some("Policy doesn't allow os-server-cpu-hotplug to be performed.")
    );
}

#[tokio::test]
async fn reads_never_mutate() {
    let harness = Harness::standard();
    let api = api(&harness);
    let before = harness.repo.list();

    for kind in [ResourceKind::Vcpus, ResourceKind::Memory] {
        for raw in ["A", "B", "Z"] {
            let _ = api.endpoint(kind).read(&member(), &id(raw)).await;
        }
    }

    assert_eq!(harness.repo.list(), before);
    assert_eq!(harness.quota.stats().reserved, 0);
}

#[tokio::test]
async fn concurrent_requests_are_serialized() {
    let harness = delayed_harness(Duration::from_secs(5));
    let api = api(&harness);
    let vcpus = api.endpoint(ResourceKind::Vcpus);

    let (caller, target) = (member(), id("A"));
    let (body_4, body_8) = (
        json!({"setVcpus": {"vcpus": 4}}),
        json!({"setVcpus": {"vcpus": 8}}),
    );
    let (first, second) = tokio::join!(
        vcpus.action(&caller, &target, &body_4),
        vcpus.action(&caller, &target, &body_8),
    );
    assert_eq!((first.code(), second.code()), (202, 202));

    api.quiesce(&id("A")).await;
    assert_eq!(harness.instance("A").await.vcpus, 8);

    let stats = harness.quota.stats();
    assert_eq!((stats.committed, stats.outstanding()), (2, 0));
}

#[tokio::test(start_paused = true)]
async fn overlapping_request_past_lock_wait_is_conflict() {
    let harness = delayed_harness(Duration::from_millis(50));
    let api = api(&harness);
    let vcpus = api.endpoint(ResourceKind::Vcpus);

    let (caller, target) = (member(), id("A"));
    let (body_4, body_8) = (
        json!({"setVcpus": {"vcpus": 4}}),
        json!({"setVcpus": {"vcpus": 8}}),
    );
    let (first, second) = tokio::join!(
        vcpus.action(&caller, &target, &body_4),
        vcpus.action(&caller, &target, &body_8),
    );
    assert_eq!(first.code(), 202);
    assert_eq!(second.code(), 409);
    assert!(second.body.get("conflictingRequest").is_some());

    api.quiesce(&id("A")).await;
    assert_eq!(harness.instance("A").await.vcpus, 4);
    assert_eq!(harness.quota.stats().reserved, 1);
}
