use std::sync::Arc;

use trellis_core::config::{ConcurrencyConfig, EngineConfig};
use trellis_core::event::{EventBus, NodeEvent};
use trellis_core::status::Status;
use trellis_core::types::{NodeExecution, StepCategory};
use trellis_engine::NodeExecutionService;
use trellis_store::{NodeExecutionStore, SqliteStore};
use trellis_test_utils::{child_of, execution, group, retry_of, PLAN_EXECUTION_ID};

fn memory_service() -> NodeExecutionService {
    NodeExecutionService::new(NodeExecutionStore::in_memory(), Arc::new(EventBus::default()))
}

fn sqlite_service(dir: &tempfile::TempDir) -> NodeExecutionService {
    let backend = SqliteStore::open(&dir.path().join("executions.db")).expect("open sqlite");
    NodeExecutionService::new(
        NodeExecutionStore::new(Arc::new(backend), ConcurrencyConfig::default()),
        Arc::new(EventBus::default()),
    )
}

async fn save_then_get(svc: &NodeExecutionService) {
    let node = execution(PLAN_EXECUTION_ID, "build", Status::Queued);
    let saved = svc.save(node.clone()).await.unwrap();
    let loaded = svc.get(&node.id).await.unwrap();

    assert_eq!(loaded, saved);
    assert_eq!(loaded, NodeExecution { version: 1, ..node });
}

async fn fork_descendants(svc: &NodeExecutionService) {
    let p = svc
        .save(group(PLAN_EXECUTION_ID, "fork", StepCategory::Fork, Status::Running))
        .await
        .unwrap();
    for name in ["c1", "c2", "c3"] {
        svc.save(child_of(&p, name, Status::Running)).await.unwrap();
    }

    let mut with_root: Vec<String> = svc
        .find_all_descendants(PLAN_EXECUTION_ID, &p.id, &[Status::Running], true)
        .await
        .unwrap()
        .iter()
        .map(|n| n.identifier().to_string())
        .collect();
    with_root.sort();
    assert_eq!(with_root, vec!["c1", "c2", "c3", "fork"]);

    let without_root = svc
        .find_all_descendants(PLAN_EXECUTION_ID, &p.id, &[Status::Running], false)
        .await
        .unwrap();
    assert_eq!(without_root.len(), 3);
    assert!(without_root.iter().all(|n| n.id != p.id));
}

async fn error_out_k_of_n(svc: &NodeExecutionService) {
    let active = [Status::Queued, Status::Running, Status::Running, Status::Queued];
    let terminal = [Status::Succeeded, Status::Failed, Status::Aborted];
    let mut terminal_ids = Vec::new();
    for (i, s) in active.iter().enumerate() {
        svc.save(execution(PLAN_EXECUTION_ID, &format!("active-{}", i), *s))
            .await
            .unwrap();
    }
    for (i, s) in terminal.iter().enumerate() {
        let n = svc
            .save(execution(PLAN_EXECUTION_ID, &format!("done-{}", i), *s))
            .await
            .unwrap();
        terminal_ids.push((n.id, *s));
    }

    assert_eq!(svc.error_out_active_nodes(PLAN_EXECUTION_ID).await.unwrap(), active.len());
    assert_eq!(
        svc.fetch_by_status(PLAN_EXECUTION_ID, Status::Errored).await.unwrap().len(),
        active.len()
    );
    for (id, status) in terminal_ids {
        let n = svc.get(&id).await.unwrap();
        assert_eq!(n.status, status);
        assert_eq!(n.version, 1);
    }
    assert_eq!(svc.error_out_active_nodes(PLAN_EXECUTION_ID).await.unwrap(), 0);
}

async fn retried_twice(svc: &NodeExecutionService) {
    let root = svc
        .save(execution(PLAN_EXECUTION_ID, "root", Status::Running))
        .await
        .unwrap();
    let first = svc.save(child_of(&root, "flaky", Status::Failed)).await.unwrap();
    let second = svc
        .retry_node(&first.id, retry_of(&first).with_status(Status::Failed))
        .await
        .unwrap()
        .attempt;
    let third = svc
        .retry_node(&second.id, retry_of(&second).with_status(Status::Running))
        .await
        .unwrap()
        .attempt;

    let live = svc
        .get_by_plan_node(PLAN_EXECUTION_ID, &first.plan_node.id)
        .await
        .unwrap();
    assert_eq!(live.id, third.id);
    assert_eq!(live.retry_ids, vec![first.id.clone(), second.id.clone()]);

    let children = svc.fetch_direct_children(PLAN_EXECUTION_ID, &root.id).await.unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].id, third.id);

    let descendants = svc
        .find_all_descendants(PLAN_EXECUTION_ID, &root.id, &[], false)
        .await
        .unwrap();
    assert_eq!(descendants.len(), 1);

    assert!(svc
        .fetch_by_status(PLAN_EXECUTION_ID, Status::Failed)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(
        svc.get_by_identifier(PLAN_EXECUTION_ID, "flaky")
            .await
            .unwrap()
            .map(|n| n.id),
        Some(third.id.clone())
    );
    assert_eq!(svc.fetch_all(PLAN_EXECUTION_ID).await.unwrap().len(), 4);
}

async fn timeout_round_trip(svc: &NodeExecutionService) {
    let node = svc
        .save(execution(PLAN_EXECUTION_ID, "wait", Status::Running))
        .await
        .unwrap();
    svc.attach_timeout_instance(&node.id, "timeout-1").await.unwrap();
    svc.attach_timeout_instance(&node.id, "timeout-2").await.unwrap();

    assert!(svc.remove_timeout_instances(&node.id).await.unwrap());
    assert!(svc.timeout_instances(&node.id).await.unwrap().is_empty());
    assert!(svc.remove_timeout_instances(&node.id).await.unwrap());
    assert!(svc.get(&node.id).await.unwrap().timeout_instance_ids.is_empty());
}

async fn discontinue_sole_running_leaf(svc: &NodeExecutionService) {
    let r = svc
        .save(execution(PLAN_EXECUTION_ID, "R", Status::Running))
        .await
        .unwrap();
    let a = svc.save(child_of(&r, "A", Status::Running)).await.unwrap();
    let b = svc.save(child_of(&r, "B", Status::Succeeded)).await.unwrap();

    let changed = svc
        .mark_all_leaves_discontinuing(PLAN_EXECUTION_ID, &[Status::Running])
        .await
        .unwrap();
    assert_eq!(changed, 1);
    assert_eq!(svc.get(&a.id).await.unwrap().status, Status::Discontinuing);
    assert_eq!(svc.get(&r.id).await.unwrap().status, Status::Running);
    assert_eq!(svc.get(&b.id).await.unwrap().status, Status::Succeeded);
}

async fn transition_outside_from_set(svc: &NodeExecutionService) {
    let node = svc
        .save(execution(PLAN_EXECUTION_ID, "step", Status::Running))
        .await
        .unwrap();
    for from in [[Status::Queued], [Status::Discontinuing]] {
        let outcome = svc.transition(&node.id, &from, Status::Aborted).await.unwrap();
        assert!(!outcome.is_updated());
    }
    let loaded = svc.get(&node.id).await.unwrap();
    assert_eq!(loaded.status, Status::Running);
    assert_eq!(loaded.version, 1);
}

#[tokio::test]
async fn test_save_then_get() {
    save_then_get(&memory_service()).await;
    let dir = tempfile::tempdir().unwrap();
    save_then_get(&sqlite_service(&dir)).await;
}

#[tokio::test]
async fn test_fork_descendants() {
    fork_descendants(&memory_service()).await;
    let dir = tempfile::tempdir().unwrap();
    fork_descendants(&sqlite_service(&dir)).await;
}

#[tokio::test]
async fn test_error_out_active_nodes() {
    error_out_k_of_n(&memory_service()).await;
    let dir = tempfile::tempdir().unwrap();
    error_out_k_of_n(&sqlite_service(&dir)).await;
}

#[tokio::test]
async fn test_retry_exclusion() {
    retried_twice(&memory_service()).await;
    let dir = tempfile::tempdir().unwrap();
    retried_twice(&sqlite_service(&dir)).await;
}

#[tokio::test]
async fn test_timeout_instances() {
    timeout_round_trip(&memory_service()).await;
    let dir = tempfile::tempdir().unwrap();
    timeout_round_trip(&sqlite_service(&dir)).await;
}

#[tokio::test]
async fn test_discontinue_sole_running_leaf() {
    discontinue_sole_running_leaf(&memory_service()).await;
    let dir = tempfile::tempdir().unwrap();
    discontinue_sole_running_leaf(&sqlite_service(&dir)).await;
}

#[tokio::test]
async fn test_transition_outside_from_set_is_idempotent() {
    transition_outside_from_set(&memory_service()).await;
    let dir = tempfile::tempdir().unwrap();
    transition_outside_from_set(&sqlite_service(&dir)).await;
}

#[tokio::test]
async fn test_service_from_sqlite_config_persists() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("executions.db");
    let toml = format!("[store]\nbackend = \"sqlite\"\npath = \"{}\"\n", path.display());
    let config = EngineConfig::from_toml(&toml).unwrap();

    let node_id = {
        let svc = NodeExecutionService::from_config(&config).unwrap();
        let node = svc
            .save(execution(PLAN_EXECUTION_ID, "build", Status::Queued))
            .await
            .unwrap();
        svc.transition(&node.id, &[], Status::Running).await.unwrap();
        node.id
    };

    let reopened = NodeExecutionService::from_config(&config).unwrap();
    let loaded = reopened.get(&node_id).await.unwrap();
    assert_eq!(loaded.status, Status::Running);
    assert_eq!(loaded.version, 2);
    assert!(loaded.start_ts.is_some());
}

#[tokio::test]
async fn test_cascade_event_stream() {
    let svc = memory_service();
    let mut rx = svc.subscribe();

    let stage = svc
        .save(group(PLAN_EXECUTION_ID, "stage", StepCategory::Stage, Status::Running))
        .await
        .unwrap();
    let step = svc.save(child_of(&stage, "step", Status::Running)).await.unwrap();
    svc.mark_all_leaves_discontinuing(PLAN_EXECUTION_ID, &[]).await.unwrap();
    svc.transition(&step.id, &[Status::Discontinuing], Status::Aborted)
        .await
        .unwrap();
    assert!(svc.is_subtree_complete(PLAN_EXECUTION_ID, &stage.id).await.unwrap());
    svc.transition(&stage.id, &[], Status::Aborted).await.unwrap();

    let mut statuses = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let NodeEvent::StatusUpdated { node, previous } = event {
            statuses.push((node.identifier().to_string(), previous, node.status));
        }
    }
    assert_eq!(
        statuses,
        vec![
            ("step".to_string(), Status::Running, Status::Discontinuing),
            ("step".to_string(), Status::Discontinuing, Status::Aborted),
            ("stage".to_string(), Status::Running, Status::Aborted),
        ]
    );
}
