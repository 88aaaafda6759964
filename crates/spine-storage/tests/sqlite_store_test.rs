//! SQLite backend integration tests
//!
//! Runs against `sqlite::memory:` so no external services are needed; a
//! couple of cases use a temp file to cover the create-if-missing path.

use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use spine_core::partition::PartitionKey;
use spine_core::quality::QualityReport;
use spine_core::stage;
use spine_core::Lane;
use spine_storage::{
    AnomalyFilter, ManifestWrite, NewAnomaly, NewWorkItem, QualityEntry, ReadinessEntry,
    RejectEntry, Severity, SpineStore, SqliteSpineStore, StoreError, WorkItemFilter,
    WorkItemState, WorkflowCheckpoint,
};

async fn store() -> SqliteSpineStore {
    SqliteSpineStore::connect("sqlite::memory:").await.unwrap()
}

fn partition(tier: &str) -> PartitionKey {
    PartitionKey::new()
        .with("week_ending", "2025-12-26")
        .with("tier", tier)
}

// =============================================================================
// Manifest
// =============================================================================

#[tokio::test]
async fn test_manifest_upsert_same_capture() {
    let store = store().await;
    let p = partition("T1");

    store
        .record_completion(
            ManifestWrite::new("finra", "finra.ingest", p.clone(), stage::RAW, "c1", 10)
                .with_content_hash("aaaa")
                .with_execution_id(Uuid::now_v7()),
        )
        .await
        .unwrap();
    store
        .record_completion(
            ManifestWrite::new("finra", "finra.ingest", p.clone(), stage::RAW, "c1", 12)
                .with_content_hash("bbbb"),
        )
        .await
        .unwrap();

    let entry = store
        .query_manifest("finra", &p, Some(stage::RAW))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.row_count, 12);
    assert_eq!(entry.content_hash.as_deref(), Some("bbbb"));
    assert_eq!(entry.stage_rank, 10);

    let history = store
        .manifest_history("finra", "finra.ingest", &p)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn test_manifest_new_capture_coexists_and_latest_wins() {
    let store = store().await;
    let p = partition("T1");

    for (cid, rows) in [("finra:p:20251229", 48_765), ("finra:p:20251230", 50_123)] {
        store
            .record_completion(ManifestWrite::new(
                "finra",
                "finra.ingest",
                p.clone(),
                stage::RAW,
                cid,
                rows,
            ))
            .await
            .unwrap();
    }

    let history = store
        .manifest_history("finra", "finra.ingest", &p)
        .await
        .unwrap();
    assert_eq!(history.len(), 2);

    let latest = store
        .latest_capture("finra", "finra.ingest", &p)
        .await
        .unwrap();
    assert_eq!(latest.as_deref(), Some("finra:p:20251230"));

    let entry = store
        .query_manifest("finra", &p, Some(stage::RAW))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.row_count, 50_123);
}

#[tokio::test]
async fn test_query_manifest_without_stage_filter() {
    let store = store().await;
    let p = partition("T1");

    store
        .record_completion(ManifestWrite::new(
            "finra", "finra.ingest", p.clone(), stage::RAW, "c1", 10,
        ))
        .await
        .unwrap();
    store
        .record_completion(ManifestWrite::new(
            "finra", "finra.normalize", p.clone(), stage::NORMALIZED, "c1", 9,
        ))
        .await
        .unwrap();

    assert!(store.query_manifest("finra", &p, None).await.unwrap().is_some());
    assert!(store
        .query_manifest("finra", &p, Some(stage::COMPUTED))
        .await
        .unwrap()
        .is_none());
    assert!(store
        .query_manifest("other_domain", &p, None)
        .await
        .unwrap()
        .is_none());
}

// =============================================================================
// Work queue
// =============================================================================

#[tokio::test]
async fn test_queue_full_lifecycle() {
    let store = store().await;
    let id = store
        .enqueue(
            NewWorkItem::new("finra", "finra.ingest", partition("T1"))
                .with_params(spine_core::Params::new().with("force", true))
                .with_max_attempts(2),
        )
        .await
        .unwrap();

    // Duplicate rejected by the unique index
    let err = store
        .enqueue(NewWorkItem::new("finra", "finra.ingest", partition("T1")))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::DuplicateWorkItem { .. }));

    // Claim stamps the lock and bumps the attempt
    let claimed = store.claim("worker-1", None).await.unwrap().unwrap();
    assert_eq!(claimed.id, id);
    assert_eq!(claimed.state, WorkItemState::Running);
    assert_eq!(claimed.attempt_count, 1);
    assert_eq!(claimed.params.get_bool("force"), Some(true));
    assert!(store.claim("worker-2", None).await.unwrap().is_none());

    // First failure: retry_wait with 5-minute backoff
    let state = store.fail(id, "upstream 503").await.unwrap();
    assert_eq!(state, WorkItemState::RetryWait);
    let item = store.get_work_item(id).await.unwrap();
    let wait = item.next_attempt_at.unwrap() - item.updated_at;
    assert_eq!(wait.num_seconds(), 300);
    assert!(item.locked_by.is_none());

    // Manual retry short-circuits the backoff; second failure exhausts
    store.retry(id).await.unwrap();
    store.claim("worker-1", None).await.unwrap().unwrap();
    let state = store.fail(id, "upstream 503 again").await.unwrap();
    assert_eq!(state, WorkItemState::Failed);

    // Manual retry resets even a Failed item
    store.retry(id).await.unwrap();
    let item = store.get_work_item(id).await.unwrap();
    assert_eq!(item.state, WorkItemState::Pending);
}

#[tokio::test]
async fn test_queue_claim_priority_and_lanes() {
    let store = store().await;
    store
        .enqueue(
            NewWorkItem::new("d", "p", partition("T1"))
                .with_priority(1)
                .with_lane(Lane::Backfill),
        )
        .await
        .unwrap();
    let high = store
        .enqueue(NewWorkItem::new("d", "p", partition("T2")).with_priority(9))
        .await
        .unwrap();

    // Lane filter hides the backfill item
    let claimed = store
        .claim("w", Some(&[Lane::Normal]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, high);

    let claimed = store
        .claim("w", Some(&[Lane::Backfill]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.lane, Lane::Backfill);
}

#[tokio::test]
async fn test_queue_cancel_and_invalid_transitions() {
    let store = store().await;
    let id = store
        .enqueue(NewWorkItem::new("d", "p", partition("T1")))
        .await
        .unwrap();

    store.cancel(id).await.unwrap();
    assert_eq!(
        store.get_work_item(id).await.unwrap().state,
        WorkItemState::Cancelled
    );

    // Cancelled items cannot be completed
    let err = store.complete(id).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidTransition { .. }));

    let missing = store.get_work_item(Uuid::now_v7()).await.unwrap_err();
    assert!(matches!(missing, StoreError::WorkItemNotFound(_)));
}

#[tokio::test]
async fn test_queue_reap_stale_locks() {
    let store = store().await;
    let id = store
        .enqueue(NewWorkItem::new("d", "p", partition("T1")))
        .await
        .unwrap();
    store.claim("w", None).await.unwrap().unwrap();
    store.assign_execution(id, Uuid::now_v7()).await.unwrap();

    // Fresh locks survive a sweep with a generous threshold
    let reaped = store.reap_stale(Duration::from_secs(3600)).await.unwrap();
    assert!(reaped.is_empty());

    // Zero threshold reaps everything running
    let reaped = store.reap_stale(Duration::from_secs(0)).await.unwrap();
    assert_eq!(reaped, vec![id]);

    let item = store.get_work_item(id).await.unwrap();
    assert_eq!(item.state, WorkItemState::Pending);
    assert!(item.locked_by.is_none());
    assert!(item.current_execution_id.is_none());
}

#[tokio::test]
async fn test_list_work_items_filters() {
    let store = store().await;
    store
        .enqueue(NewWorkItem::new("finra", "p", partition("T1")))
        .await
        .unwrap();
    store
        .enqueue(NewWorkItem::new("prices", "p", partition("T2")))
        .await
        .unwrap();

    let finra = store
        .list_work_items(WorkItemFilter {
            domain: Some("finra".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(finra.len(), 1);

    let pending = store
        .list_work_items(WorkItemFilter {
            state: Some(WorkItemState::Pending),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(pending.len(), 2);
}

// =============================================================================
// Capture rows
// =============================================================================

#[tokio::test]
async fn test_capture_replace_is_scoped_and_idempotent() {
    let store = store().await;
    let p = partition("T1");
    let monday = vec![
        json!({"symbol": "AAPL", "qty": 100}),
        json!({"symbol": "MSFT", "qty": 50}),
    ];

    store
        .replace_capture("otc_weekly", &p, "c_mon", &monday)
        .await
        .unwrap();
    store
        .replace_capture("otc_weekly", &p, "c_tue", &[json!({"symbol": "AAPL", "qty": 120})])
        .await
        .unwrap();

    // Same-day replay: same rows, no duplicates
    store
        .replace_capture("otc_weekly", &p, "c_mon", &monday)
        .await
        .unwrap();
    assert_eq!(
        store.capture_rows("otc_weekly", &p, "c_mon").await.unwrap().len(),
        2
    );
    // Tuesday's capture untouched
    assert_eq!(
        store.capture_rows("otc_weekly", &p, "c_tue").await.unwrap().len(),
        1
    );
    assert_eq!(
        store.dataset_captures("otc_weekly", &p).await.unwrap(),
        vec!["c_mon", "c_tue"]
    );
}

// =============================================================================
// Quality / rejects / anomalies / readiness
// =============================================================================

#[tokio::test]
async fn test_quality_latest_wins() {
    let store = store().await;
    let p = partition("T1");

    for passed in [false, true] {
        store
            .record_quality(QualityEntry {
                domain: "finra".to_string(),
                pipeline: "finra.ingest".to_string(),
                partition: p.clone(),
                stage: stage::RAW.to_string(),
                capture_id: "c1".to_string(),
                report: QualityReport {
                    passed,
                    ..QualityReport::passing(10)
                },
                recorded_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    let latest = store
        .get_quality("finra", &p, stage::RAW)
        .await
        .unwrap()
        .unwrap();
    assert!(latest.report.passed);
}

#[tokio::test]
async fn test_rejects_accumulate() {
    let store = store().await;
    let p = partition("T1");

    let reject = |reason: &str| RejectEntry {
        domain: "finra".to_string(),
        pipeline: "finra.ingest".to_string(),
        partition: p.clone(),
        capture_id: "c1".to_string(),
        row: json!({"symbol": "", "qty": -1}),
        reason: reason.to_string(),
        rejected_at: Utc::now(),
    };

    store.record_rejects(vec![reject("empty symbol")]).await.unwrap();
    store.record_rejects(vec![reject("negative quantity")]).await.unwrap();

    let all = store.list_rejects("finra", Some(&p), Some("c1")).await.unwrap();
    assert_eq!(all.len(), 2);

    let none = store.list_rejects("finra", Some(&p), Some("c2")).await.unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn test_anomaly_lifecycle() {
    let store = store().await;
    let p = partition("T1");

    let id = store
        .record_anomaly(NewAnomaly::error(
            "finra",
            p.clone(),
            spine_core::ErrorCategory::Transient,
            "503 from upstream",
        ))
        .await
        .unwrap();

    let unresolved = store
        .list_anomalies(AnomalyFilter {
            domain: Some("finra".to_string()),
            unresolved_only: true,
            min_severity: Some(Severity::Error),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(unresolved.len(), 1);
    assert_eq!(unresolved[0].category, spine_core::ErrorCategory::Transient);

    store.resolve_anomaly(id).await.unwrap();
    let unresolved = store
        .list_anomalies(AnomalyFilter {
            unresolved_only: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(unresolved.is_empty());

    let err = store.resolve_anomaly(Uuid::now_v7()).await.unwrap_err();
    assert!(matches!(err, StoreError::AnomalyNotFound(_)));
}

#[tokio::test]
async fn test_readiness_upsert() {
    let store = store().await;
    let p = PartitionKey::new().with("week_ending", "2025-12-26");

    store
        .set_readiness(ReadinessEntry {
            domain: "finra".to_string(),
            partition: p.clone(),
            is_ready: false,
            blocking_issues: vec!["missing COMPUTED".to_string()],
            evaluated_at: Utc::now(),
        })
        .await
        .unwrap();
    store
        .set_readiness(ReadinessEntry {
            domain: "finra".to_string(),
            partition: p.clone(),
            is_ready: true,
            blocking_issues: vec![],
            evaluated_at: Utc::now(),
        })
        .await
        .unwrap();

    let entry = store.get_readiness("finra", &p).await.unwrap().unwrap();
    assert!(entry.is_ready);
}

// =============================================================================
// Checkpoints
// =============================================================================

#[tokio::test]
async fn test_checkpoint_upsert_and_sweep() {
    let store = store().await;
    let run_id = Uuid::now_v7();

    let checkpoint = WorkflowCheckpoint {
        run_id,
        workflow_name: "weekly".to_string(),
        step_name: "fetch".to_string(),
        context_snapshot: json!({"params": {"tier": "T1"}}),
        created_at: Utc::now(),
        expires_at: None,
    };
    store.save_checkpoint(checkpoint.clone()).await.unwrap();
    store
        .save_checkpoint(WorkflowCheckpoint {
            step_name: "validate".to_string(),
            ..checkpoint
        })
        .await
        .unwrap();

    let loaded = store.load_checkpoint(run_id).await.unwrap().unwrap();
    assert_eq!(loaded.step_name, "validate");
    assert_eq!(loaded.context_snapshot["params"]["tier"], json!("T1"));

    // TTL sweep removes only expired rows
    store
        .save_checkpoint(WorkflowCheckpoint {
            run_id: Uuid::now_v7(),
            workflow_name: "weekly".to_string(),
            step_name: "stale".to_string(),
            context_snapshot: json!({}),
            created_at: Utc::now(),
            expires_at: Some(Utc::now() - chrono::Duration::hours(1)),
        })
        .await
        .unwrap();

    let swept = store.sweep_expired_checkpoints(Utc::now()).await.unwrap();
    assert_eq!(swept, 1);
    assert!(store.load_checkpoint(run_id).await.unwrap().is_some());

    store.delete_checkpoint(run_id).await.unwrap();
    assert!(store.load_checkpoint(run_id).await.unwrap().is_none());
}

// =============================================================================
// File-backed database
// =============================================================================

#[tokio::test]
async fn test_file_database_created_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("spine.db");
    let url = format!("sqlite://{}", path.display());

    {
        let store = SqliteSpineStore::connect(&url).await.unwrap();
        store
            .record_completion(ManifestWrite::new(
                "finra",
                "finra.ingest",
                partition("T1"),
                stage::RAW,
                "c1",
                10,
            ))
            .await
            .unwrap();
    }
    assert!(path.exists());

    // Reconnect and read back
    let store = SqliteSpineStore::connect(&url).await.unwrap();
    let entry = store
        .query_manifest("finra", &partition("T1"), Some(stage::RAW))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.row_count, 10);
}
