// Bulk orchestrator integration tests
// Worker pool dispatch, partial failure, cancellation and progress tracking

use serde_json::{json, Value};
use shopfloor::bulk::{
    BulkOperationOrchestrator, BulkStatus, CancelError, OperationResult, OperationType, ProgressEvent, UnitError,
};
use shopfloor::gateway::{ActionGateway, InMemoryStore, MutationKind, StoreFailure};
use shopfloor::workflow::EntityId;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn licence_ids(count: usize) -> Vec<EntityId> {
    (1..=count).map(|n| EntityId::new(format!("lic-{n}"))).collect()
}

fn seeded_store(ids: &[EntityId], latency: Duration) -> Arc<InMemoryStore> {
    Arc::new(InMemoryStore::new().with_records(ids.to_vec()).with_latency(latency))
}

fn orchestrator_over(store: Arc<InMemoryStore>, concurrency: usize) -> BulkOperationOrchestrator {
    BulkOperationOrchestrator::new(Arc::new(ActionGateway::new(store))).with_concurrency(concurrency)
}

#[tokio::test(start_paused = true)]
async fn test_partial_failure_still_completes() {
    let ids = licence_ids(5);
    let store = seeded_store(&ids, Duration::from_millis(20));
    store.fail_always(ids[2].clone(), StoreFailure::Reject { code: 422, message: "expired card".into() });
    let orchestrator = orchestrator_over(store, 2);

    let operation = orchestrator
        .submit(OperationType::Renew, ids.clone(), json!({"months": 12}))
        .unwrap();
    let finished = orchestrator.tracker().wait_for_terminal(operation.id).await.unwrap();

    assert_eq!(finished.status, BulkStatus::Completed);
    assert_eq!(finished.progress.total, 5);
    assert_eq!(finished.progress.completed_count, 5);
    assert_eq!(finished.progress.success_count, 4);
    assert_eq!(finished.progress.error_count, 1);
    assert_eq!(
        finished.progress.results[&ids[2]],
        OperationResult::Error {
            reason: UnitError::Rejected { code: 422, message: "expired card".into() }
        }
    );
    assert_eq!(finished.failed_target_ids(), vec![ids[2].clone()]);
}

#[tokio::test]
async fn test_every_unit_failing_marks_operation_failed() {
    let ids = licence_ids(3);
    let store = seeded_store(&ids, Duration::ZERO);
    for id in &ids {
        store.fail_always(id.clone(), StoreFailure::Unavailable("connection refused".into()));
    }
    let orchestrator = orchestrator_over(store, 4);

    let operation = orchestrator.submit(OperationType::Suspend, ids, Value::Null).unwrap();
    let finished = orchestrator.tracker().wait_for_terminal(operation.id).await.unwrap();

    assert_eq!(finished.status, BulkStatus::Failed);
    assert_eq!(finished.progress.success_count, 0);
    assert_eq!(finished.progress.error_count, 3);
    assert!(finished.progress.is_consistent());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_mid_flight_keeps_completed_units() {
    let ids = licence_ids(10);
    let store = seeded_store(&ids, Duration::from_millis(50));
    let orchestrator = orchestrator_over(store, 2);
    let tracker = orchestrator.tracker();

    let operation = orchestrator.submit(OperationType::Renew, ids, Value::Null).unwrap();
    let mut updates = tracker.watch(operation.id).unwrap();
    updates
        .wait_for(|operation| operation.progress.completed_count >= 3)
        .await
        .unwrap();

    orchestrator.cancel(operation.id).unwrap();
    // Repeating the request while draining is accepted.
    orchestrator.cancel(operation.id).unwrap();

    let finished = tracker.wait_for_terminal(operation.id).await.unwrap();
    assert_eq!(finished.status, BulkStatus::Cancelled);
    assert!(finished.cancel_requested);
    assert!((3..=10).contains(&finished.progress.completed_count));
    assert!(finished.progress.completed_count < 10);
    assert_eq!(finished.progress.results.len(), finished.progress.completed_count);
    assert!(finished.progress.is_consistent());
    assert_eq!(
        finished.unprocessed_target_ids().len(),
        10 - finished.progress.completed_count
    );

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(tracker.snapshot(operation.id).unwrap(), finished.progress);
    assert!(matches!(
        orchestrator.cancel(operation.id),
        Err(CancelError::NotCancellable { status: BulkStatus::Cancelled, .. })
    ));
}

#[tokio::test]
async fn test_unknown_target_is_recorded_as_not_found() {
    let ids = licence_ids(3);
    let store = seeded_store(&ids[..2], Duration::ZERO);
    let orchestrator = orchestrator_over(store, 2);

    let operation = orchestrator.submit(OperationType::Delete, ids.clone(), Value::Null).unwrap();
    let finished = orchestrator.tracker().wait_for_terminal(operation.id).await.unwrap();

    assert_eq!(finished.status, BulkStatus::Completed);
    assert_eq!(
        finished.progress.results[&ids[2]],
        OperationResult::Error { reason: UnitError::NotFound }
    );
}

#[tokio::test]
async fn test_dispatch_starts_in_input_order() {
    let ids: Vec<EntityId> = ["delta", "alpha", "charlie", "bravo", "echo", "foxtrot"]
        .into_iter()
        .map(EntityId::from)
        .collect();
    let store = seeded_store(&ids, Duration::ZERO);
    let orchestrator = orchestrator_over(store.clone(), 1);

    let operation = orchestrator.submit(OperationType::Suspend, ids.clone(), Value::Null).unwrap();
    orchestrator.tracker().wait_for_terminal(operation.id).await.unwrap();

    let calls: Vec<EntityId> = store.calls().into_iter().map(|(id, _)| id).collect();
    assert_eq!(calls, ids);
    assert!(store.calls().iter().all(|(_, kind)| *kind == MutationKind::Update));
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_bound_is_respected() {
    let ids = licence_ids(8);
    let store = seeded_store(&ids, Duration::from_millis(100));
    let orchestrator = orchestrator_over(store.clone(), 3);

    let operation = orchestrator.submit(OperationType::Renew, ids, Value::Null).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.calls().len(), 3);

    let finished = orchestrator.tracker().wait_for_terminal(operation.id).await.unwrap();
    assert_eq!(finished.progress.success_count, 8);
    assert_eq!(finished.concurrency, 3);
}

#[tokio::test(start_paused = true)]
async fn test_operations_have_independent_worker_pools() {
    let slow_ids = licence_ids(4);
    let fast_ids: Vec<EntityId> = (1..=2).map(|n| EntityId::new(format!("seat-{n}"))).collect();
    let store = seeded_store(&slow_ids, Duration::ZERO);
    for id in &slow_ids {
        store.set_latency(id.clone(), Duration::from_secs(10));
    }
    for id in &fast_ids {
        store.insert_record(id.clone(), json!({}));
    }
    let orchestrator = orchestrator_over(store, 1);

    let slow = orchestrator.submit(OperationType::Renew, slow_ids, Value::Null).unwrap();
    let fast = orchestrator.submit(OperationType::Renew, fast_ids, Value::Null).unwrap();

    let finished = orchestrator.tracker().wait_for_terminal(fast.id).await.unwrap();
    assert_eq!(finished.status, BulkStatus::Completed);
    assert_eq!(orchestrator.result(slow.id).unwrap().status, BulkStatus::Running);
}

#[tokio::test(start_paused = true)]
async fn test_batch_timeout_marks_undispatched_units() {
    let ids = licence_ids(6);
    let store = seeded_store(&ids, Duration::from_millis(100));
    let orchestrator = orchestrator_over(store.clone(), 2).with_batch_timeout(Duration::from_millis(150));

    let operation = orchestrator.submit(OperationType::Renew, ids.clone(), Value::Null).unwrap();
    let finished = orchestrator.tracker().wait_for_terminal(operation.id).await.unwrap();

    // Two waves start before the ceiling (t=0 and t=100ms); the rest never dispatch.
    assert_eq!(store.calls().len(), 4);
    assert_eq!(finished.status, BulkStatus::Completed);
    assert_eq!(finished.progress.completed_count, 6);
    assert_eq!(finished.progress.success_count, 4);
    for id in &ids[4..] {
        assert_eq!(
            finished.progress.results[id],
            OperationResult::Error { reason: UnitError::BatchTimedOut }
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_batch_ceiling_expires_units_while_one_hangs() {
    let ids = licence_ids(3);
    let store = seeded_store(&ids, Duration::ZERO);
    store.fail_always(ids[0].clone(), StoreFailure::Hang);
    let gateway = ActionGateway::new(store).with_timeout(Duration::from_secs(5));
    let orchestrator = BulkOperationOrchestrator::new(Arc::new(gateway))
        .with_concurrency(1)
        .with_batch_timeout(Duration::from_millis(200));
    let tracker = orchestrator.tracker();
    let started = tokio::time::Instant::now();

    let operation = orchestrator.submit(OperationType::Renew, ids.clone(), Value::Null).unwrap();
    let mut updates = tracker.watch(operation.id).unwrap();
    let expired = updates
        .wait_for(|operation| operation.progress.completed_count == 2)
        .await
        .unwrap()
        .clone();

    // The hanging unit is still in flight when the other two expire.
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(expired.status, BulkStatus::Running);
    assert!(!expired.progress.results.contains_key(&ids[0]));
    for id in &ids[1..] {
        assert_eq!(
            expired.progress.results[id],
            OperationResult::Error { reason: UnitError::BatchTimedOut }
        );
    }

    let finished = tracker.wait_for_terminal(operation.id).await.unwrap();
    assert_eq!(
        finished.progress.results[&ids[0]],
        OperationResult::Error { reason: UnitError::Timeout { after_ms: 5_000 } }
    );
    assert_eq!(finished.status, BulkStatus::Failed);
    assert!(finished.progress.is_consistent());
}

#[tokio::test]
async fn test_cancel_after_last_unit_keeps_real_status() {
    let ids = licence_ids(3);
    let store = seeded_store(&ids, Duration::ZERO);
    let orchestrator = Arc::new(orchestrator_over(store, 1));
    let tracker = orchestrator.tracker();

    let operation = orchestrator.submit(OperationType::Renew, ids, Value::Null).unwrap();
    let id = operation.id;
    let late_cancel: Arc<Mutex<Option<Result<(), CancelError>>>> = Arc::default();
    let (canceller, outcome) = (orchestrator.clone(), late_cancel.clone());
    tracker
        .subscribe(id, move |event| {
            if event.unit.is_some() && event.view.completed_count == event.view.total {
                *outcome.lock().unwrap() = Some(canceller.cancel(id));
            }
        })
        .unwrap();

    let finished = tracker.wait_for_terminal(id).await.unwrap();

    assert_eq!(finished.status, BulkStatus::Completed);
    assert!(!finished.cancel_requested);
    assert_eq!(finished.progress.success_count, 3);
    assert!(matches!(
        late_cancel.lock().unwrap().clone(),
        Some(Err(CancelError::NotCancellable { status: BulkStatus::Running, .. }))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_subscriber_sees_each_unit_once_and_monotonic_counts() {
    let ids = licence_ids(6);
    let store = seeded_store(&ids, Duration::from_millis(10));
    store.fail_always(ids[1].clone(), StoreFailure::Reject { code: 400, message: "bad plan".into() });
    let orchestrator = orchestrator_over(store, 3);
    let tracker = orchestrator.tracker();

    let operation = orchestrator.submit(OperationType::Renew, ids.clone(), Value::Null).unwrap();
    let events: Arc<Mutex<Vec<ProgressEvent>>> = Arc::default();
    let sink = events.clone();
    tracker
        .subscribe(operation.id, move |event| sink.lock().unwrap().push(event.clone()))
        .unwrap();

    let finished = tracker.wait_for_terminal(operation.id).await.unwrap();
    let events = events.lock().unwrap();

    let units: Vec<&EntityId> = events.iter().filter_map(|event| event.unit.as_ref().map(|(id, _)| id)).collect();
    assert_eq!(units.len(), 6);
    let mut distinct = units.clone();
    distinct.sort();
    distinct.dedup();
    assert_eq!(distinct.len(), 6);

    let counts: Vec<usize> = events.iter().map(|event| event.view.completed_count).collect();
    assert!(counts.windows(2).all(|pair| pair[0] <= pair[1]));
    assert!(events
        .iter()
        .all(|event| event.view.completed_count == event.view.success_count + event.view.error_count));

    let last = events.last().unwrap();
    assert!(last.is_terminal());
    assert_eq!(last.view.status, finished.status);
    assert_eq!(events.iter().filter(|event| event.is_terminal()).count(), 1);
}

#[tokio::test]
async fn test_list_and_remove_finished_operations() {
    let ids = licence_ids(2);
    let store = seeded_store(&ids, Duration::ZERO);
    let orchestrator = orchestrator_over(store, 2);

    let first = orchestrator.submit(OperationType::Renew, ids.clone(), Value::Null).unwrap();
    let second = orchestrator
        .submit(OperationType::Custom("transfer".into()), ids, json!({"to": "acme"}))
        .unwrap();
    let tracker = orchestrator.tracker();
    tracker.wait_for_terminal(first.id).await.unwrap();
    tracker.wait_for_terminal(second.id).await.unwrap();

    let listed: Vec<_> = orchestrator.list().into_iter().map(|operation| operation.id).collect();
    assert_eq!(listed.len(), 2);
    assert!(listed.contains(&first.id) && listed.contains(&second.id));

    orchestrator.remove(first.id).unwrap();
    assert_eq!(orchestrator.list().len(), 1);
    assert!(tracker.snapshot(first.id).is_err());
}
