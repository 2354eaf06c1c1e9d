use pretty_assertions::assert_eq;
use std::time::Duration;
use vmtune_compute::{HostProfile, QuotaReservationService, ReconfigurationService, Reservation};
use vmtune_conductor::{Conductor, Task, TaskError, TaskPhase};
use vmtune_core::{
    ComputeError, HostRef, InstanceId, Operation, ProjectId, ReconfigurationRequest,
    RequestContext, ResourceDelta, ResourceKind, TaskState,
};
use vmtune_test_utils::{large_flavor, running_instance, small_flavor, Harness, HOST, OTHER_HOST};

fn ctx() -> RequestContext {
    RequestContext::new("alice", "p1").with_roles(["admin"])
}

fn id(raw: &str) -> InstanceId {
    InstanceId::from(raw)
}

async fn hotplug(harness: &Harness, raw: &str, vcpus: u64) {
    let service = ReconfigurationService::new(harness.services.clone());
    service
        .reconfigure(&id(raw), ReconfigurationRequest::new(ResourceKind::Vcpus, vcpus))
        .await
        .unwrap();
    harness.quiesce(raw).await;
    assert_eq!(u64::from(harness.instance(raw).await.vcpus), vcpus);
}

#[tokio::test]
async fn live_resize_running_instance_completes() {
    let harness = Harness::standard();
    let conductor = Conductor::new(harness.services.clone());

    let reservation = conductor.reserve_for_flavor(&id("A"), &large_flavor()).await.unwrap();
    let summary = conductor
        .live_resize(ctx(), None, id("A"), large_flavor(), Some(reservation))
        .await
        .unwrap();

    assert_eq!(summary.phase, TaskPhase::Completed);
    assert_eq!(summary.operation, Operation::LiveResize);

    let a = harness.instance("A").await;
    assert_eq!((a.vcpus, a.memory_mb), (4, 8192));
    assert_eq!(a.flavor, large_flavor());
    assert_eq!(a.task_state, None);

    let stats = harness.quota.stats();
    assert_eq!((stats.committed, stats.outstanding()), (1, 0));
    assert!(!harness.locks.is_held(&id("A")));
}

#[tokio::test]
async fn live_resize_of_shutdown_instance_releases_hold() {
    let harness = Harness::standard();
    let conductor = Conductor::new(harness.services.clone());

    let reservation = conductor.reserve_for_flavor(&id("B"), &large_flavor()).await.unwrap();
    let err = conductor
        .live_resize(ctx(), None, id("B"), large_flavor(), Some(reservation))
        .await
        .unwrap_err();

    assert!(matches!(
        err.as_compute(),
        Some(ComputeError::InvalidState { attr: "power_state", .. })
    ));
    let b = harness.instance("B").await;
    assert_eq!(b.flavor, small_flavor());
    assert_eq!(b.task_state, None);
    assert_eq!(harness.quota.stats().rolled_back, 1);
    assert_eq!(harness.quota.stats().outstanding(), 0);
}

#[tokio::test]
async fn live_resize_of_unknown_instance_releases_hold() {
    let harness = Harness::standard();
    let conductor = Conductor::new(harness.services.clone());

    let reservation = harness
        .quota
        .reserve(&ProjectId::from("p1"), ResourceDelta::new(2, 6144))
        .await
        .unwrap();
    let err = conductor
        .live_resize(ctx(), None, id("Z"), large_flavor(), Some(reservation))
        .await
        .unwrap_err();

    assert!(err.as_compute().is_some_and(ComputeError::is_not_found));
    assert_eq!(harness.quota.stats().rolled_back, 1);
}

#[tokio::test]
async fn execute_twice_is_refused() {
    let harness = Harness::standard();
    let conductor = Conductor::new(harness.services.clone());

    let mut task = conductor.live_resize_task(ctx(), None, id("A"), large_flavor(), None);
    task.execute().await.unwrap();

    let err = task.execute().await.unwrap_err();
    assert_eq!(err, TaskError::AlreadyExecuted { task: task.id() });
    assert_eq!(task.phase(), TaskPhase::Completed);
}

#[tokio::test]
async fn rollback_outside_execution_is_refused() {
    let harness = Harness::standard();
    let conductor = Conductor::new(harness.services.clone());

    let mut task = conductor.resize_task(ctx(), id("A"), large_flavor(), None);
    assert!(matches!(
        task.rollback().await,
        Err(TaskError::InvalidPhase { phase: TaskPhase::Pending, .. })
    ));

    task.execute().await.unwrap();
    assert!(matches!(
        task.rollback().await,
        Err(TaskError::InvalidPhase { phase: TaskPhase::Completed, .. })
    ));
    assert_eq!(harness.instance("A").await.flavor, large_flavor());
}

#[tokio::test]
async fn failed_apply_is_rolled_back() {
    let harness = Harness::builder()
        .instance(running_instance("A"))
        .host(HOST, HostProfile::default().failing())
        .build();
    let conductor = Conductor::new(harness.services.clone());

    let reservation = conductor.reserve_for_flavor(&id("A"), &large_flavor()).await.unwrap();
    let mut task =
        conductor.live_resize_task(ctx(), None, id("A"), large_flavor(), Some(reservation));
    let err = conductor.safe_execute(&mut task).await.unwrap_err();

    assert!(matches!(err, TaskError::Compute(ComputeError::SetFailed { .. })));
    assert_eq!(task.phase(), TaskPhase::RolledBack);

    let a = harness.instance("A").await;
    assert_eq!(a.flavor, small_flavor());
    assert_eq!(a.task_state, None);
    assert_eq!(harness.quota.stats().rolled_back, 1);
    assert!(!harness.locks.is_held(&id("A")));
}

#[tokio::test]
async fn applied_change_is_reverted_when_commit_fails() {
    let harness = Harness::standard();
    let conductor = Conductor::new(harness.services.clone());

    // Never reserved through the quota service, so commit refuses it.
    let forged = Reservation::new(ProjectId::from("p1"), ResourceDelta::new(2, 6144));
    let mut task = conductor.live_resize_task(ctx(), None, id("A"), large_flavor(), Some(forged));
    let err = conductor.safe_execute(&mut task).await.unwrap_err();

    assert!(matches!(err, TaskError::Compute(ComputeError::Reservation(_))));
    assert_eq!(task.phase(), TaskPhase::RolledBack);

    let a = harness.instance("A").await;
    assert_eq!(a.flavor, small_flavor());
    assert_eq!((a.vcpus, a.memory_mb), (2, 2048));
}

#[tokio::test]
async fn unrecoverable_rollback_is_reported() {
    let harness = Harness::standard();
    let conductor = Conductor::new(harness.services.clone());

    let forged = Reservation::new(ProjectId::from("p1"), ResourceDelta::new(2, 6144));
    let mut task = conductor.live_resize_task(ctx(), None, id("A"), large_flavor(), Some(forged));
    task.execute().await.unwrap_err();

    harness.bus.deregister_host(&HostRef::from(HOST));
    let err = task.rollback().await.unwrap_err();

    assert!(err.needs_reconciliation());
    assert!(matches!(err, TaskError::RollbackFailed { original: None, .. }));
    assert_eq!(task.phase(), TaskPhase::Failed);

    let a = harness.instance("A").await;
    assert_eq!(a.flavor, large_flavor());
    assert_eq!(a.task_state, Some(TaskState::LiveResizing));

    drop(task);
    assert!(harness.locks.is_fenced(&id("A")));
    assert!(harness.locks.is_held(&id("A")));

    let service = ReconfigurationService::new(harness.services.clone());
    let refused = service
        .reconfigure(&id("A"), ReconfigurationRequest::new(ResourceKind::Vcpus, 8))
        .await
        .unwrap_err();
    assert_eq!(refused, ComputeError::InstanceBusy { id: id("A") });

    assert!(harness.locks.lift_fence(&id("A")));
    assert!(!harness.locks.is_held(&id("A")));
}

#[tokio::test]
async fn recovered_rollback_leaves_no_fence() {
    let harness = Harness::standard();
    let conductor = Conductor::new(harness.services.clone());
    harness.bus.deregister_host(&HostRef::from(HOST));
    harness.bus.register_host(HOST, HostProfile::default().failing());

    let mut task = conductor.migrate_task(ctx(), id("A"), HostRef::from(OTHER_HOST));
    task.execute().await.unwrap_err();
    harness.bus.deregister_host(&HostRef::from(HOST));

    // Nothing moved, so rollback only has the marker to clear.
    assert!(task.rollback().await.is_ok());
    assert!(!harness.locks.is_fenced(&id("A")));
    assert_eq!(harness.instance("A").await.task_state, None);
}

#[tokio::test]
async fn rollback_restores_hotplugged_vcpus() {
    let harness = Harness::standard();
    let conductor = Conductor::new(harness.services.clone());
    hotplug(&harness, "A", 3).await;

    let forged = Reservation::new(ProjectId::from("p1"), ResourceDelta::new(1, 6144));
    let mut task = conductor.live_resize_task(ctx(), None, id("A"), large_flavor(), Some(forged));
    let err = conductor.safe_execute(&mut task).await.unwrap_err();

    assert!(matches!(err, TaskError::Compute(ComputeError::Reservation(_))));
    assert_eq!(task.phase(), TaskPhase::RolledBack);

    let a = harness.instance("A").await;
    assert_eq!(a.flavor, small_flavor());
    assert_eq!((a.vcpus, a.memory_mb), (3, 2048));
    assert_eq!(a.task_state, None);
    assert!(!harness.locks.is_held(&id("A")));
}

#[tokio::test]
async fn live_resize_after_hotplug_charges_only_the_change() {
    let harness = Harness::standard();
    let conductor = Conductor::new(harness.services.clone());
    let project = ProjectId::from("p1");
    hotplug(&harness, "A", 4).await;
    assert_eq!(harness.quota.usage(&project).in_use, ResourceDelta::new(2, 0));

    let reservation = conductor.reserve_for_flavor(&id("A"), &large_flavor()).await.unwrap();
    assert_eq!(harness.quota.usage(&project).reserved, ResourceDelta::new(0, 6144));
    conductor
        .live_resize(ctx(), None, id("A"), large_flavor(), Some(reservation))
        .await
        .unwrap();

    let usage = harness.quota.usage(&project);
    assert_eq!(usage.in_use, ResourceDelta::new(2, 6144));
    assert_eq!(usage.reserved, ResourceDelta::default());
}

#[tokio::test]
async fn missing_capability_is_not_supported() {
    let profile = HostProfile {
        live_resize: false,
        ..HostProfile::default()
    };
    let harness = Harness::builder()
        .instance(running_instance("A"))
        .host(HOST, profile)
        .build();
    let conductor = Conductor::new(harness.services.clone());

    let reservation = conductor.reserve_for_flavor(&id("A"), &large_flavor()).await.unwrap();
    let err = conductor
        .live_resize(ctx(), None, id("A"), large_flavor(), Some(reservation))
        .await
        .unwrap_err();

    assert!(matches!(
        err.as_compute(),
        Some(ComputeError::NotSupported { operation: Operation::LiveResize, .. })
    ));
    assert_eq!(harness.quota.stats().outstanding(), 0);
    assert_eq!(harness.instance("A").await.task_state, None);
}

#[tokio::test]
async fn busy_instance_is_conflict() {
    let harness = Harness::standard();
    let conductor = Conductor::new(harness.services.clone());
    let _held = harness.locks.acquire(&id("A")).await.unwrap();

    let reservation = conductor.reserve_for_flavor(&id("A"), &large_flavor()).await.unwrap();
    let err = conductor
        .live_resize(ctx(), None, id("A"), large_flavor(), Some(reservation))
        .await
        .unwrap_err();

    assert!(matches!(err.as_compute(), Some(ComputeError::InstanceBusy { .. })));
    assert_eq!(harness.quota.stats().rolled_back, 1);
    assert_eq!(harness.instance("A").await.flavor, small_flavor());
}

#[tokio::test(start_paused = true)]
async fn in_flight_task_marks_instance() {
    let harness = Harness::builder()
        .instance(running_instance("A"))
        .host(HOST, HostProfile::default().with_apply_delay(Duration::from_millis(500)))
        .build();
    let conductor = Conductor::new(harness.services.clone());

    let mut task = conductor.live_resize_task(ctx(), None, id("A"), large_flavor(), None);
    let running = tokio::spawn(async move {
        task.execute().await.unwrap();
        task
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.instance("A").await.task_state, Some(TaskState::LiveResizing));
    assert!(harness.locks.is_held(&id("A")));

    let task = running.await.unwrap();
    assert_eq!(task.phase(), TaskPhase::Completed);
    assert_eq!(harness.instance("A").await.task_state, None);
}

#[tokio::test]
async fn migrate_moves_instance() {
    let harness = Harness::standard();
    let conductor = Conductor::new(harness.services.clone());

    let summary = conductor
        .migrate(ctx(), id("A"), HostRef::from(OTHER_HOST))
        .await
        .unwrap();

    assert_eq!(summary.phase, TaskPhase::Completed);
    assert_eq!(harness.instance("A").await.host, Some(HostRef::from(OTHER_HOST)));
}

#[tokio::test]
async fn migrate_to_current_host_fails_cleanly() {
    let harness = Harness::standard();
    let conductor = Conductor::new(harness.services.clone());

    let mut task = conductor.migrate_task(ctx(), id("A"), HostRef::from(HOST));
    let err = conductor.safe_execute(&mut task).await.unwrap_err();

    assert!(matches!(err, TaskError::Compute(ComputeError::SetFailed { .. })));
    assert_eq!(task.phase(), TaskPhase::RolledBack);

    let a = harness.instance("A").await;
    assert_eq!(a.host, Some(HostRef::from(HOST)));
    assert_eq!(a.task_state, None);
}

#[tokio::test]
async fn cold_resize_accepts_shutdown_instance() {
    let harness = Harness::standard();
    let conductor = Conductor::new(harness.services.clone());

    let reservation = conductor.reserve_for_flavor(&id("B"), &large_flavor()).await.unwrap();
    let summary = conductor
        .resize(ctx(), id("B"), large_flavor(), Some(reservation))
        .await
        .unwrap();

    assert_eq!(summary.phase, TaskPhase::Completed);
    assert_eq!(harness.instance("B").await.flavor, large_flavor());
    assert_eq!(harness.quota.stats().committed, 1);
}
