//! In-memory implementation of SpineStore for testing

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use spine_core::partition::PartitionKey;
use spine_core::Lane;

use super::store::*;

type ManifestKey = (String, String, String, String, String);

/// In-memory implementation of SpineStore
///
/// Primarily for tests. Stores all data in memory with the same semantics
/// as the SQLite implementation.
///
/// # Example
///
/// ```
/// use spine_storage::MemorySpineStore;
///
/// let store = MemorySpineStore::new();
/// ```
pub struct MemorySpineStore {
    manifest: RwLock<HashMap<ManifestKey, ManifestEntry>>,
    quality: RwLock<Vec<QualityEntry>>,
    rejects: RwLock<Vec<RejectEntry>>,
    anomalies: RwLock<HashMap<Uuid, AnomalyEntry>>,
    readiness: RwLock<HashMap<(String, String), ReadinessEntry>>,
    capture_data: RwLock<HashMap<(String, String, String), Vec<Value>>>,
    work_items: RwLock<HashMap<Uuid, WorkItem>>,
    checkpoints: RwLock<HashMap<Uuid, WorkflowCheckpoint>>,
}

impl MemorySpineStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            manifest: RwLock::new(HashMap::new()),
            quality: RwLock::new(Vec::new()),
            rejects: RwLock::new(Vec::new()),
            anomalies: RwLock::new(HashMap::new()),
            readiness: RwLock::new(HashMap::new()),
            capture_data: RwLock::new(HashMap::new()),
            work_items: RwLock::new(HashMap::new()),
            checkpoints: RwLock::new(HashMap::new()),
        }
    }

    /// Number of manifest rows
    pub fn manifest_count(&self) -> usize {
        self.manifest.read().len()
    }

    /// Number of work items in Pending
    pub fn pending_count(&self) -> usize {
        self.work_items
            .read()
            .values()
            .filter(|i| i.state == WorkItemState::Pending)
            .count()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.manifest.write().clear();
        self.quality.write().clear();
        self.rejects.write().clear();
        self.anomalies.write().clear();
        self.readiness.write().clear();
        self.capture_data.write().clear();
        self.work_items.write().clear();
        self.checkpoints.write().clear();
    }

    fn manifest_key(entry: &ManifestEntry) -> ManifestKey {
        (
            entry.domain.clone(),
            entry.pipeline.clone(),
            entry.partition.canonical(),
            entry.stage.clone(),
            entry.capture_id.clone(),
        )
    }
}

impl Default for MemorySpineStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SpineStore for MemorySpineStore {
    // =========================================================================
    // Manifest
    // =========================================================================

    async fn record_completion(&self, write: ManifestWrite) -> Result<(), StoreError> {
        let entry = write.into_entry(Utc::now());
        let key = Self::manifest_key(&entry);
        self.manifest.write().insert(key, entry);
        Ok(())
    }

    async fn query_manifest(
        &self,
        domain: &str,
        partition: &PartitionKey,
        stage: Option<&str>,
    ) -> Result<Option<ManifestEntry>, StoreError> {
        let canonical = partition.canonical();
        let manifest = self.manifest.read();
        let best = manifest
            .values()
            .filter(|e| e.domain == domain && e.partition.canonical() == canonical)
            .filter(|e| stage.map_or(true, |s| e.stage == s))
            .max_by(|a, b| {
                (&a.capture_id, a.updated_at).cmp(&(&b.capture_id, b.updated_at))
            });
        Ok(best.cloned())
    }

    async fn latest_capture(
        &self,
        domain: &str,
        pipeline: &str,
        partition: &PartitionKey,
    ) -> Result<Option<String>, StoreError> {
        let canonical = partition.canonical();
        let manifest = self.manifest.read();
        Ok(manifest
            .values()
            .filter(|e| {
                e.domain == domain
                    && e.pipeline == pipeline
                    && e.partition.canonical() == canonical
            })
            .map(|e| e.capture_id.clone())
            .max())
    }

    async fn manifest_history(
        &self,
        domain: &str,
        pipeline: &str,
        partition: &PartitionKey,
    ) -> Result<Vec<ManifestEntry>, StoreError> {
        let canonical = partition.canonical();
        let manifest = self.manifest.read();
        let mut rows: Vec<ManifestEntry> = manifest
            .values()
            .filter(|e| {
                e.domain == domain
                    && e.pipeline == pipeline
                    && e.partition.canonical() == canonical
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| (&a.capture_id, a.updated_at).cmp(&(&b.capture_id, b.updated_at)));
        Ok(rows)
    }

    // =========================================================================
    // Quality / Rejects / Anomalies / Readiness
    // =========================================================================

    async fn record_quality(&self, entry: QualityEntry) -> Result<(), StoreError> {
        self.quality.write().push(entry);
        Ok(())
    }

    async fn get_quality(
        &self,
        domain: &str,
        partition: &PartitionKey,
        stage: &str,
    ) -> Result<Option<QualityEntry>, StoreError> {
        let canonical = partition.canonical();
        let quality = self.quality.read();
        Ok(quality
            .iter()
            .filter(|q| {
                q.domain == domain && q.stage == stage && q.partition.canonical() == canonical
            })
            .max_by_key(|q| q.recorded_at)
            .cloned())
    }

    async fn record_rejects(&self, mut rejects: Vec<RejectEntry>) -> Result<(), StoreError> {
        self.rejects.write().append(&mut rejects);
        Ok(())
    }

    async fn list_rejects(
        &self,
        domain: &str,
        partition: Option<&PartitionKey>,
        capture_id: Option<&str>,
    ) -> Result<Vec<RejectEntry>, StoreError> {
        let canonical = partition.map(PartitionKey::canonical);
        let rejects = self.rejects.read();
        Ok(rejects
            .iter()
            .filter(|r| r.domain == domain)
            .filter(|r| {
                canonical
                    .as_deref()
                    .map_or(true, |p| r.partition.canonical() == p)
            })
            .filter(|r| capture_id.map_or(true, |c| r.capture_id == c))
            .cloned()
            .collect())
    }

    async fn record_anomaly(&self, anomaly: NewAnomaly) -> Result<Uuid, StoreError> {
        let id = Uuid::now_v7();
        let entry = AnomalyEntry {
            id,
            domain: anomaly.domain,
            partition: anomaly.partition,
            severity: anomaly.severity,
            category: anomaly.category,
            message: anomaly.message,
            detected_at: Utc::now(),
            resolved_at: None,
        };
        self.anomalies.write().insert(id, entry);
        Ok(id)
    }

    async fn resolve_anomaly(&self, id: Uuid) -> Result<(), StoreError> {
        let mut anomalies = self.anomalies.write();
        let entry = anomalies.get_mut(&id).ok_or(StoreError::AnomalyNotFound(id))?;
        entry.resolved_at = Some(Utc::now());
        Ok(())
    }

    async fn list_anomalies(
        &self,
        filter: AnomalyFilter,
    ) -> Result<Vec<AnomalyEntry>, StoreError> {
        let canonical = filter.partition.as_ref().map(PartitionKey::canonical);
        let anomalies = self.anomalies.read();
        let mut rows: Vec<AnomalyEntry> = anomalies
            .values()
            .filter(|a| filter.domain.as_deref().map_or(true, |d| a.domain == d))
            .filter(|a| {
                canonical.as_deref().map_or(true, |p| {
                    a.partition.as_ref().map_or(false, |ap| ap.canonical() == p)
                })
            })
            .filter(|a| !filter.unresolved_only || a.resolved_at.is_none())
            .filter(|a| filter.min_severity.map_or(true, |s| a.severity >= s))
            .cloned()
            .collect();
        rows.sort_by_key(|a| a.detected_at);
        Ok(rows)
    }

    async fn set_readiness(&self, entry: ReadinessEntry) -> Result<(), StoreError> {
        let key = (entry.domain.clone(), entry.partition.canonical());
        self.readiness.write().insert(key, entry);
        Ok(())
    }

    async fn get_readiness(
        &self,
        domain: &str,
        partition: &PartitionKey,
    ) -> Result<Option<ReadinessEntry>, StoreError> {
        let key = (domain.to_string(), partition.canonical());
        Ok(self.readiness.read().get(&key).cloned())
    }

    // =========================================================================
    // Capture Rows
    // =========================================================================

    async fn replace_capture(
        &self,
        dataset: &str,
        partition: &PartitionKey,
        capture_id: &str,
        rows: &[Value],
    ) -> Result<u64, StoreError> {
        let key = (
            dataset.to_string(),
            partition.canonical(),
            capture_id.to_string(),
        );
        self.capture_data.write().insert(key, rows.to_vec());
        Ok(rows.len() as u64)
    }

    async fn capture_rows(
        &self,
        dataset: &str,
        partition: &PartitionKey,
        capture_id: &str,
    ) -> Result<Vec<Value>, StoreError> {
        let key = (
            dataset.to_string(),
            partition.canonical(),
            capture_id.to_string(),
        );
        Ok(self.capture_data.read().get(&key).cloned().unwrap_or_default())
    }

    async fn dataset_captures(
        &self,
        dataset: &str,
        partition: &PartitionKey,
    ) -> Result<Vec<String>, StoreError> {
        let canonical = partition.canonical();
        let data = self.capture_data.read();
        let mut captures: Vec<String> = data
            .keys()
            .filter(|(d, p, _)| d == dataset && *p == canonical)
            .map(|(_, _, c)| c.clone())
            .collect();
        captures.sort();
        Ok(captures)
    }

    // =========================================================================
    // Work Queue
    // =========================================================================

    async fn enqueue(&self, item: NewWorkItem) -> Result<Uuid, StoreError> {
        let mut items = self.work_items.write();

        let duplicate = items.values().any(|existing| {
            existing.domain == item.domain
                && existing.pipeline == item.pipeline
                && existing.partition == item.partition
        });
        if duplicate {
            return Err(StoreError::DuplicateWorkItem {
                domain: item.domain,
                pipeline: item.pipeline,
                partition: item.partition.canonical(),
            });
        }

        let now = Utc::now();
        let id = Uuid::now_v7();
        items.insert(
            id,
            WorkItem {
                id,
                domain: item.domain,
                pipeline: item.pipeline,
                partition: item.partition,
                params: item.params,
                priority: item.priority,
                lane: item.lane,
                state: WorkItemState::Pending,
                attempt_count: 0,
                max_attempts: item.max_attempts,
                next_attempt_at: None,
                locked_by: None,
                locked_at: None,
                last_error: None,
                current_execution_id: None,
                desired_at: item.desired_at.unwrap_or(now),
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    async fn claim(
        &self,
        worker_id: &str,
        lanes: Option<&[Lane]>,
    ) -> Result<Option<WorkItem>, StoreError> {
        let now = Utc::now();
        let mut items = self.work_items.write();

        let eligible = |item: &WorkItem| -> bool {
            let lane_ok = lanes.map_or(true, |ls| ls.contains(&item.lane));
            let due = match item.state {
                WorkItemState::Pending => item.desired_at <= now,
                WorkItemState::RetryWait => {
                    item.next_attempt_at.map_or(false, |at| at <= now)
                }
                _ => false,
            };
            lane_ok && due
        };

        let chosen = items
            .values()
            .filter(|i| eligible(i))
            .min_by(|a, b| {
                // priority descending, then desired_at / created_at ascending
                b.priority
                    .cmp(&a.priority)
                    .then(a.desired_at.cmp(&b.desired_at))
                    .then(a.created_at.cmp(&b.created_at))
            })
            .map(|i| i.id);

        let Some(id) = chosen else {
            return Ok(None);
        };

        let item = items.get_mut(&id).expect("chosen id exists");
        item.state = WorkItemState::Running;
        item.locked_by = Some(worker_id.to_string());
        item.locked_at = Some(now);
        item.attempt_count += 1;
        item.next_attempt_at = None;
        item.updated_at = now;
        Ok(Some(item.clone()))
    }

    async fn assign_execution(&self, id: Uuid, execution_id: Uuid) -> Result<(), StoreError> {
        let mut items = self.work_items.write();
        let item = items.get_mut(&id).ok_or(StoreError::WorkItemNotFound(id))?;
        item.current_execution_id = Some(execution_id);
        item.updated_at = Utc::now();
        Ok(())
    }

    async fn complete(&self, id: Uuid) -> Result<(), StoreError> {
        let mut items = self.work_items.write();
        let item = items.get_mut(&id).ok_or(StoreError::WorkItemNotFound(id))?;
        if item.state != WorkItemState::Running {
            return Err(StoreError::InvalidTransition {
                action: "complete",
                state: item.state,
            });
        }
        item.state = WorkItemState::Complete;
        item.locked_by = None;
        item.locked_at = None;
        item.updated_at = Utc::now();
        Ok(())
    }

    async fn fail(&self, id: Uuid, error: &str) -> Result<WorkItemState, StoreError> {
        let now = Utc::now();
        let mut items = self.work_items.write();
        let item = items.get_mut(&id).ok_or(StoreError::WorkItemNotFound(id))?;
        if item.state != WorkItemState::Running {
            return Err(StoreError::InvalidTransition {
                action: "fail",
                state: item.state,
            });
        }

        item.last_error = Some(error.to_string());
        item.locked_by = None;
        item.locked_at = None;
        item.current_execution_id = None;
        item.updated_at = now;

        if item.attempt_count >= item.max_attempts {
            item.state = WorkItemState::Failed;
        } else {
            item.state = WorkItemState::RetryWait;
            item.next_attempt_at = Some(now + retry_backoff(item.attempt_count));
        }
        Ok(item.state)
    }

    async fn retry(&self, id: Uuid) -> Result<(), StoreError> {
        let mut items = self.work_items.write();
        let item = items.get_mut(&id).ok_or(StoreError::WorkItemNotFound(id))?;
        match item.state {
            WorkItemState::RetryWait | WorkItemState::Failed | WorkItemState::Cancelled => {
                item.state = WorkItemState::Pending;
                item.next_attempt_at = None;
                item.updated_at = Utc::now();
                Ok(())
            }
            state => Err(StoreError::InvalidTransition {
                action: "retry",
                state,
            }),
        }
    }

    async fn cancel(&self, id: Uuid) -> Result<(), StoreError> {
        let mut items = self.work_items.write();
        let item = items.get_mut(&id).ok_or(StoreError::WorkItemNotFound(id))?;
        match item.state {
            WorkItemState::Pending | WorkItemState::RetryWait => {
                item.state = WorkItemState::Cancelled;
                item.next_attempt_at = None;
                item.updated_at = Utc::now();
                Ok(())
            }
            state => Err(StoreError::InvalidTransition {
                action: "cancel",
                state,
            }),
        }
    }

    async fn get_work_item(&self, id: Uuid) -> Result<WorkItem, StoreError> {
        self.work_items
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::WorkItemNotFound(id))
    }

    async fn list_work_items(
        &self,
        filter: WorkItemFilter,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let items = self.work_items.read();
        let mut rows: Vec<WorkItem> = items
            .values()
            .filter(|i| filter.domain.as_deref().map_or(true, |d| i.domain == d))
            .filter(|i| filter.state.map_or(true, |s| i.state == s))
            .filter(|i| filter.lane.map_or(true, |l| i.lane == l))
            .cloned()
            .collect();
        rows.sort_by_key(|i| i.created_at);
        Ok(rows)
    }

    async fn reap_stale(&self, stale_threshold: Duration) -> Result<Vec<Uuid>, StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(stale_threshold)
                .map_err(|e| StoreError::Database(e.to_string()))?;
        let mut reaped = Vec::new();
        let mut items = self.work_items.write();
        for item in items.values_mut() {
            if item.state == WorkItemState::Running
                && item.locked_at.map_or(true, |at| at < cutoff)
            {
                item.state = WorkItemState::Pending;
                item.locked_by = None;
                item.locked_at = None;
                item.current_execution_id = None;
                item.updated_at = Utc::now();
                reaped.push(item.id);
            }
        }
        Ok(reaped)
    }

    // =========================================================================
    // Checkpoints
    // =========================================================================

    async fn save_checkpoint(&self, checkpoint: WorkflowCheckpoint) -> Result<(), StoreError> {
        self.checkpoints
            .write()
            .insert(checkpoint.run_id, checkpoint);
        Ok(())
    }

    async fn load_checkpoint(
        &self,
        run_id: Uuid,
    ) -> Result<Option<WorkflowCheckpoint>, StoreError> {
        Ok(self.checkpoints.read().get(&run_id).cloned())
    }

    async fn delete_checkpoint(&self, run_id: Uuid) -> Result<(), StoreError> {
        self.checkpoints.write().remove(&run_id);
        Ok(())
    }

    async fn sweep_expired_checkpoints(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut checkpoints = self.checkpoints.write();
        let before = checkpoints.len();
        checkpoints.retain(|_, cp| cp.expires_at.map_or(true, |at| at > now));
        Ok((before - checkpoints.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spine_core::stage;

    fn partition(tier: &str) -> PartitionKey {
        PartitionKey::new()
            .with("week_ending", "2025-12-22")
            .with("tier", tier)
    }

    #[tokio::test]
    async fn test_manifest_same_capture_upserts() {
        let store = MemorySpineStore::new();
        let p = partition("T1");

        let write = ManifestWrite::new("finra", "finra.ingest", p.clone(), stage::RAW, "c1", 10)
            .with_content_hash("aaaa");
        store.record_completion(write).await.unwrap();

        let write = ManifestWrite::new("finra", "finra.ingest", p.clone(), stage::RAW, "c1", 12)
            .with_content_hash("bbbb");
        store.record_completion(write).await.unwrap();

        assert_eq!(store.manifest_count(), 1);
        let entry = store
            .query_manifest("finra", &p, Some(stage::RAW))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.row_count, 12);
        assert_eq!(entry.content_hash.as_deref(), Some("bbbb"));
    }

    #[tokio::test]
    async fn test_manifest_new_capture_coexists() {
        let store = MemorySpineStore::new();
        let p = partition("T1");

        store
            .record_completion(ManifestWrite::new(
                "finra", "finra.ingest", p.clone(), stage::RAW, "finra:p:20251229", 10,
            ))
            .await
            .unwrap();
        store
            .record_completion(ManifestWrite::new(
                "finra", "finra.ingest", p.clone(), stage::RAW, "finra:p:20251230", 11,
            ))
            .await
            .unwrap();

        assert_eq!(store.manifest_count(), 2);
        let latest = store
            .latest_capture("finra", "finra.ingest", &p)
            .await
            .unwrap();
        assert_eq!(latest.as_deref(), Some("finra:p:20251230"));

        let history = store
            .manifest_history("finra", "finra.ingest", &p)
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].capture_id, "finra:p:20251229");
    }

    #[tokio::test]
    async fn test_queue_claim_and_complete() {
        let store = MemorySpineStore::new();
        let id = store
            .enqueue(NewWorkItem::new("finra", "finra.ingest", partition("T1")))
            .await
            .unwrap();

        let claimed = store.claim("worker-1", None).await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.state, WorkItemState::Running);
        assert_eq!(claimed.attempt_count, 1);
        assert_eq!(claimed.locked_by.as_deref(), Some("worker-1"));

        // Nothing else to claim while running
        assert!(store.claim("worker-2", None).await.unwrap().is_none());

        store.complete(id).await.unwrap();
        let item = store.get_work_item(id).await.unwrap();
        assert_eq!(item.state, WorkItemState::Complete);
    }

    #[tokio::test]
    async fn test_queue_duplicate_enqueue_rejected() {
        let store = MemorySpineStore::new();
        store
            .enqueue(NewWorkItem::new("finra", "finra.ingest", partition("T1")))
            .await
            .unwrap();

        let err = store
            .enqueue(NewWorkItem::new("finra", "finra.ingest", partition("T1")))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateWorkItem { .. }));

        // Different partition is fine
        store
            .enqueue(NewWorkItem::new("finra", "finra.ingest", partition("T2")))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_queue_fail_backoff_then_exhaustion() {
        let store = MemorySpineStore::new();
        let id = store
            .enqueue(
                NewWorkItem::new("finra", "finra.ingest", partition("T1")).with_max_attempts(2),
            )
            .await
            .unwrap();

        store.claim("w", None).await.unwrap().unwrap();
        let state = store.fail(id, "upstream 503").await.unwrap();
        assert_eq!(state, WorkItemState::RetryWait);

        let item = store.get_work_item(id).await.unwrap();
        let wait = item.next_attempt_at.unwrap() - item.updated_at;
        assert_eq!(wait.num_seconds(), 300);

        // Not yet claimable (backoff in the future)
        assert!(store.claim("w", None).await.unwrap().is_none());

        // Manual retry makes it immediately pending
        store.retry(id).await.unwrap();
        store.claim("w", None).await.unwrap().unwrap();

        let state = store.fail(id, "upstream 503 again").await.unwrap();
        assert_eq!(state, WorkItemState::Failed);
    }

    #[tokio::test]
    async fn test_queue_cancel_only_waiting_states() {
        let store = MemorySpineStore::new();
        let id = store
            .enqueue(NewWorkItem::new("finra", "finra.ingest", partition("T1")))
            .await
            .unwrap();

        store.claim("w", None).await.unwrap();
        let err = store.cancel(id).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        store.complete(id).await.unwrap();
        let id2 = store
            .enqueue(NewWorkItem::new("finra", "finra.normalize", partition("T1")))
            .await
            .unwrap();
        store.cancel(id2).await.unwrap();
        assert_eq!(
            store.get_work_item(id2).await.unwrap().state,
            WorkItemState::Cancelled
        );
    }

    #[tokio::test]
    async fn test_queue_priority_ordering() {
        let store = MemorySpineStore::new();
        store
            .enqueue(NewWorkItem::new("d", "p", partition("T1")).with_priority(1))
            .await
            .unwrap();
        let high = store
            .enqueue(NewWorkItem::new("d", "p", partition("T2")).with_priority(5))
            .await
            .unwrap();

        let claimed = store.claim("w", None).await.unwrap().unwrap();
        assert_eq!(claimed.id, high);
    }

    #[tokio::test]
    async fn test_queue_lane_filter() {
        let store = MemorySpineStore::new();
        store
            .enqueue(NewWorkItem::new("d", "p", partition("T1")).with_lane(Lane::Backfill))
            .await
            .unwrap();

        assert!(store
            .claim("w", Some(&[Lane::Normal]))
            .await
            .unwrap()
            .is_none());
        assert!(store
            .claim("w", Some(&[Lane::Normal, Lane::Backfill]))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_reap_stale_requeues() {
        let store = MemorySpineStore::new();
        let id = store
            .enqueue(NewWorkItem::new("d", "p", partition("T1")))
            .await
            .unwrap();
        store.claim("w", None).await.unwrap();
        store.assign_execution(id, Uuid::now_v7()).await.unwrap();

        // Zero threshold: everything running is stale
        let reaped = store.reap_stale(Duration::from_secs(0)).await.unwrap();
        assert_eq!(reaped, vec![id]);

        let item = store.get_work_item(id).await.unwrap();
        assert_eq!(item.state, WorkItemState::Pending);
        assert!(item.locked_by.is_none());
        assert!(item.current_execution_id.is_none());
    }

    #[tokio::test]
    async fn test_capture_rows_replace_is_scoped() {
        let store = MemorySpineStore::new();
        let p = partition("T1");
        let rows = vec![serde_json::json!({"symbol": "AAPL", "qty": 100})];

        store
            .replace_capture("otc_weekly", &p, "c_mon", &rows)
            .await
            .unwrap();
        store
            .replace_capture("otc_weekly", &p, "c_tue", &rows)
            .await
            .unwrap();

        // Replaying Monday's capture does not touch Tuesday's
        let replay = vec![
            serde_json::json!({"symbol": "AAPL", "qty": 100}),
            serde_json::json!({"symbol": "MSFT", "qty": 50}),
        ];
        store
            .replace_capture("otc_weekly", &p, "c_mon", &replay)
            .await
            .unwrap();

        assert_eq!(store.capture_rows("otc_weekly", &p, "c_mon").await.unwrap().len(), 2);
        assert_eq!(store.capture_rows("otc_weekly", &p, "c_tue").await.unwrap().len(), 1);
        assert_eq!(
            store.dataset_captures("otc_weekly", &p).await.unwrap(),
            vec!["c_mon", "c_tue"]
        );
    }

    #[tokio::test]
    async fn test_anomaly_filters() {
        let store = MemorySpineStore::new();
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
        store
            .record_anomaly(NewAnomaly {
                domain: "finra".into(),
                partition: None,
                severity: Severity::Info,
                category: spine_core::ErrorCategory::Internal,
                message: "sweep started".into(),
            })
            .await
            .unwrap();

        let errors = store
            .list_anomalies(AnomalyFilter {
                domain: Some("finra".into()),
                min_severity: Some(Severity::Error),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(errors.len(), 1);

        store.resolve_anomaly(id).await.unwrap();
        let unresolved = store
            .list_anomalies(AnomalyFilter {
                unresolved_only: true,
                min_severity: Some(Severity::Error),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(unresolved.is_empty());
    }

    #[tokio::test]
    async fn test_checkpoint_upsert_and_sweep() {
        let store = MemorySpineStore::new();
        let run_id = Uuid::now_v7();

        let cp = WorkflowCheckpoint {
            run_id,
            workflow_name: "weekly_ingest".into(),
            step_name: "fetch".into(),
            context_snapshot: serde_json::json!({"params": {}}),
            created_at: Utc::now(),
            expires_at: None,
        };
        store.save_checkpoint(cp.clone()).await.unwrap();

        let advanced = WorkflowCheckpoint {
            step_name: "validate".into(),
            ..cp
        };
        store.save_checkpoint(advanced).await.unwrap();

        let loaded = store.load_checkpoint(run_id).await.unwrap().unwrap();
        assert_eq!(loaded.step_name, "validate");

        // Expired checkpoints sweep away
        let expired = WorkflowCheckpoint {
            run_id: Uuid::now_v7(),
            workflow_name: "weekly_ingest".into(),
            step_name: "fetch".into(),
            context_snapshot: serde_json::json!({}),
            created_at: Utc::now(),
            expires_at: Some(Utc::now() - chrono::Duration::hours(1)),
        };
        store.save_checkpoint(expired).await.unwrap();
        let swept = store.sweep_expired_checkpoints(Utc::now()).await.unwrap();
        assert_eq!(swept, 1);
        assert!(store.load_checkpoint(run_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_readiness_upsert() {
        let store = MemorySpineStore::new();
        let p = partition("T1");

        store
            .set_readiness(ReadinessEntry {
                domain: "finra".into(),
                partition: p.clone(),
                is_ready: false,
                blocking_issues: vec!["missing NORMALIZED for tier T2".into()],
                evaluated_at: Utc::now(),
            })
            .await
            .unwrap();

        store
            .set_readiness(ReadinessEntry {
                domain: "finra".into(),
                partition: p.clone(),
                is_ready: true,
                blocking_issues: vec![],
                evaluated_at: Utc::now(),
            })
            .await
            .unwrap();

        let entry = store.get_readiness("finra", &p).await.unwrap().unwrap();
        assert!(entry.is_ready);
        assert!(entry.blocking_issues.is_empty());
    }
}
