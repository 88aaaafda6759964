//! SQLite implementation of SpineStore
//!
//! Backed by sqlx. SQLite has no `FOR UPDATE SKIP LOCKED`; the claim path
//! uses a guarded UPDATE (`WHERE id = ? AND state = ?`) so exactly one
//! caller wins each item. Timestamps are stored as fixed-width RFC 3339
//! UTC text, which keeps lexicographic and chronological order identical.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{debug, error, info};
use uuid::Uuid;

use spine_core::error::ErrorCategory;
use spine_core::partition::PartitionKey;
use spine_core::Lane;

use super::store::*;

fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("bad timestamp {s:?}: {e}")))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    s.as_deref().map(parse_ts).transpose()
}

fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::Serialization(format!("bad uuid {s:?}: {e}")))
}

fn parse_partition(s: &str) -> Result<PartitionKey, StoreError> {
    PartitionKey::from_canonical(s).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn parse_json(s: &str) -> Result<Value, StoreError> {
    serde_json::from_str(s).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

/// SQLite-backed implementation of SpineStore
///
/// # Example
///
/// ```ignore
/// let store = SqliteSpineStore::connect("sqlite://spine.db").await?;
/// ```
pub struct SqliteSpineStore {
    pool: SqlitePool,
}

impl SqliteSpineStore {
    /// Connect to a SQLite database, creating the file and schema if needed
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(db_err)?
            .create_if_missing(true);

        // A shared in-memory database exists per-connection; a pool of one
        // keeps every caller on the same database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(db_err)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        info!(database_url, "sqlite store ready");
        Ok(Self { pool })
    }

    /// Wrap an existing pool (schema must already be applied)
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn map_manifest(row: &SqliteRow) -> Result<ManifestEntry, StoreError> {
        let execution_id: Option<String> = row.try_get("execution_id").map_err(db_err)?;
        Ok(ManifestEntry {
            domain: row.try_get("domain").map_err(db_err)?,
            pipeline: row.try_get("pipeline").map_err(db_err)?,
            partition: parse_partition(row.try_get::<String, _>("partition_key").map_err(db_err)?.as_str())?,
            stage: row.try_get("stage").map_err(db_err)?,
            stage_rank: row.try_get("stage_rank").map_err(db_err)?,
            capture_id: row.try_get("capture_id").map_err(db_err)?,
            row_count: row.try_get::<i64, _>("row_count").map_err(db_err)? as u64,
            content_hash: row.try_get("content_hash").map_err(db_err)?,
            execution_id: execution_id.as_deref().map(parse_uuid).transpose()?,
            updated_at: parse_ts(row.try_get::<String, _>("updated_at").map_err(db_err)?.as_str())?,
        })
    }

    fn map_work_item(row: &SqliteRow) -> Result<WorkItem, StoreError> {
        let state: String = row.try_get("state").map_err(db_err)?;
        let lane: String = row.try_get("lane").map_err(db_err)?;
        let execution_id: Option<String> = row.try_get("current_execution_id").map_err(db_err)?;
        let params: String = row.try_get("params").map_err(db_err)?;

        Ok(WorkItem {
            id: parse_uuid(row.try_get::<String, _>("id").map_err(db_err)?.as_str())?,
            domain: row.try_get("domain").map_err(db_err)?,
            pipeline: row.try_get("pipeline").map_err(db_err)?,
            partition: parse_partition(row.try_get::<String, _>("partition_key").map_err(db_err)?.as_str())?,
            params: serde_json::from_str(&params)
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            priority: row.try_get("priority").map_err(db_err)?,
            lane: lane.parse().map_err(StoreError::Serialization)?,
            state: state.parse().map_err(StoreError::Serialization)?,
            attempt_count: row.try_get::<i64, _>("attempt_count").map_err(db_err)? as u32,
            max_attempts: row.try_get::<i64, _>("max_attempts").map_err(db_err)? as u32,
            next_attempt_at: parse_opt_ts(row.try_get("next_attempt_at").map_err(db_err)?)?,
            locked_by: row.try_get("locked_by").map_err(db_err)?,
            locked_at: parse_opt_ts(row.try_get("locked_at").map_err(db_err)?)?,
            last_error: row.try_get("last_error").map_err(db_err)?,
            current_execution_id: execution_id.as_deref().map(parse_uuid).transpose()?,
            desired_at: parse_ts(row.try_get::<String, _>("desired_at").map_err(db_err)?.as_str())?,
            created_at: parse_ts(row.try_get::<String, _>("created_at").map_err(db_err)?.as_str())?,
            updated_at: parse_ts(row.try_get::<String, _>("updated_at").map_err(db_err)?.as_str())?,
        })
    }

    async fn fetch_work_item(&self, id: Uuid) -> Result<WorkItem, StoreError> {
        let row = sqlx::query("SELECT * FROM core_work_items WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::WorkItemNotFound(id))?;
        Self::map_work_item(&row)
    }
}

#[async_trait]
impl SpineStore for SqliteSpineStore {
    // =========================================================================
    // Manifest
    // =========================================================================

    async fn record_completion(&self, write: ManifestWrite) -> Result<(), StoreError> {
        let entry = write.into_entry(Utc::now());
        sqlx::query(
            r#"
            INSERT INTO core_manifest
                (domain, pipeline, partition_key, stage, stage_rank, capture_id,
                 row_count, content_hash, execution_id, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (domain, pipeline, partition_key, stage, capture_id)
            DO UPDATE SET
                row_count = excluded.row_count,
                content_hash = excluded.content_hash,
                execution_id = excluded.execution_id,
                stage_rank = excluded.stage_rank,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&entry.domain)
        .bind(&entry.pipeline)
        .bind(entry.partition.canonical())
        .bind(&entry.stage)
        .bind(entry.stage_rank)
        .bind(&entry.capture_id)
        .bind(entry.row_count as i64)
        .bind(&entry.content_hash)
        .bind(entry.execution_id.map(|id| id.to_string()))
        .bind(fmt_ts(entry.updated_at))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to record manifest completion: {e}");
            db_err(e)
        })?;
        Ok(())
    }

    async fn query_manifest(
        &self,
        domain: &str,
        partition: &PartitionKey,
        stage: Option<&str>,
    ) -> Result<Option<ManifestEntry>, StoreError> {
        let row = match stage {
            Some(stage) => {
                sqlx::query(
                    r#"
                    SELECT * FROM core_manifest
                    WHERE domain = ? AND partition_key = ? AND stage = ?
                    ORDER BY capture_id DESC, updated_at DESC
                    LIMIT 1
                    "#,
                )
                .bind(domain)
                .bind(partition.canonical())
                .bind(stage)
                .fetch_optional(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT * FROM core_manifest
                    WHERE domain = ? AND partition_key = ?
                    ORDER BY capture_id DESC, updated_at DESC
                    LIMIT 1
                    "#,
                )
                .bind(domain)
                .bind(partition.canonical())
                .fetch_optional(&self.pool)
                .await
            }
        }
        .map_err(db_err)?;

        row.as_ref().map(Self::map_manifest).transpose()
    }

    async fn latest_capture(
        &self,
        domain: &str,
        pipeline: &str,
        partition: &PartitionKey,
    ) -> Result<Option<String>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT MAX(capture_id) AS capture_id FROM core_manifest
            WHERE domain = ? AND pipeline = ? AND partition_key = ?
            "#,
        )
        .bind(domain)
        .bind(pipeline)
        .bind(partition.canonical())
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        row.try_get("capture_id").map_err(db_err)
    }

    async fn manifest_history(
        &self,
        domain: &str,
        pipeline: &str,
        partition: &PartitionKey,
    ) -> Result<Vec<ManifestEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM core_manifest
            WHERE domain = ? AND pipeline = ? AND partition_key = ?
            ORDER BY capture_id ASC, updated_at ASC
            "#,
        )
        .bind(domain)
        .bind(pipeline)
        .bind(partition.canonical())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(Self::map_manifest).collect()
    }

    // =========================================================================
    // Quality / Rejects / Anomalies / Readiness
    // =========================================================================

    async fn record_quality(&self, entry: QualityEntry) -> Result<(), StoreError> {
        let report = serde_json::to_string(&entry.report)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO core_quality
                (domain, pipeline, partition_key, stage, capture_id, report, recorded_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.domain)
        .bind(&entry.pipeline)
        .bind(entry.partition.canonical())
        .bind(&entry.stage)
        .bind(&entry.capture_id)
        .bind(report)
        .bind(fmt_ts(entry.recorded_at))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_quality(
        &self,
        domain: &str,
        partition: &PartitionKey,
        stage: &str,
    ) -> Result<Option<QualityEntry>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM core_quality
            WHERE domain = ? AND partition_key = ? AND stage = ?
            ORDER BY recorded_at DESC
            LIMIT 1
            "#,
        )
        .bind(domain)
        .bind(partition.canonical())
        .bind(stage)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(|row| -> Result<QualityEntry, StoreError> {
            let report: String = row.try_get("report").map_err(db_err)?;
            Ok(QualityEntry {
                domain: row.try_get("domain").map_err(db_err)?,
                pipeline: row.try_get("pipeline").map_err(db_err)?,
                partition: parse_partition(
                    row.try_get::<String, _>("partition_key").map_err(db_err)?.as_str(),
                )?,
                stage: row.try_get("stage").map_err(db_err)?,
                capture_id: row.try_get("capture_id").map_err(db_err)?,
                report: serde_json::from_str(&report)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?,
                recorded_at: parse_ts(
                    row.try_get::<String, _>("recorded_at").map_err(db_err)?.as_str(),
                )?,
            })
        })
        .transpose()
    }

    async fn record_rejects(&self, rejects: Vec<RejectEntry>) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for reject in rejects {
            let row_json = serde_json::to_string(&reject.row)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            sqlx::query(
                r#"
                INSERT INTO core_rejects
                    (domain, pipeline, partition_key, capture_id, row, reason, rejected_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&reject.domain)
            .bind(&reject.pipeline)
            .bind(reject.partition.canonical())
            .bind(&reject.capture_id)
            .bind(row_json)
            .bind(&reject.reason)
            .bind(fmt_ts(reject.rejected_at))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)
    }

    async fn list_rejects(
        &self,
        domain: &str,
        partition: Option<&PartitionKey>,
        capture_id: Option<&str>,
    ) -> Result<Vec<RejectEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM core_rejects WHERE domain = ? ORDER BY rejected_at ASC",
        )
        .bind(domain)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let canonical = partition.map(PartitionKey::canonical);
        let mut out = Vec::new();
        for row in rows {
            let partition_key: String = row.try_get("partition_key").map_err(db_err)?;
            if canonical.as_deref().map_or(false, |p| p != partition_key) {
                continue;
            }
            let row_capture: String = row.try_get("capture_id").map_err(db_err)?;
            if capture_id.map_or(false, |c| c != row_capture) {
                continue;
            }
            let row_json: String = row.try_get("row").map_err(db_err)?;
            out.push(RejectEntry {
                domain: row.try_get("domain").map_err(db_err)?,
                pipeline: row.try_get("pipeline").map_err(db_err)?,
                partition: parse_partition(&partition_key)?,
                capture_id: row_capture,
                row: parse_json(&row_json)?,
                reason: row.try_get("reason").map_err(db_err)?,
                rejected_at: parse_ts(
                    row.try_get::<String, _>("rejected_at").map_err(db_err)?.as_str(),
                )?,
            });
        }
        Ok(out)
    }

    async fn record_anomaly(&self, anomaly: NewAnomaly) -> Result<Uuid, StoreError> {
        let id = Uuid::now_v7();
        sqlx::query(
            r#"
            INSERT INTO core_anomalies
                (id, domain, partition_key, severity, category, message, detected_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(&anomaly.domain)
        .bind(anomaly.partition.as_ref().map(PartitionKey::canonical))
        .bind(anomaly.severity.as_str())
        .bind(anomaly.category.as_str())
        .bind(&anomaly.message)
        .bind(fmt_ts(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        debug!(%id, domain = anomaly.domain, "anomaly recorded");
        Ok(id)
    }

    async fn resolve_anomaly(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE core_anomalies SET resolved_at = ? WHERE id = ?")
            .bind(fmt_ts(Utc::now()))
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::AnomalyNotFound(id));
        }
        Ok(())
    }

    async fn list_anomalies(
        &self,
        filter: AnomalyFilter,
    ) -> Result<Vec<AnomalyEntry>, StoreError> {
        let rows = sqlx::query("SELECT * FROM core_anomalies ORDER BY detected_at ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        let canonical = filter.partition.as_ref().map(PartitionKey::canonical);
        let mut out = Vec::new();
        for row in rows {
            let domain: String = row.try_get("domain").map_err(db_err)?;
            if filter.domain.as_deref().map_or(false, |d| d != domain) {
                continue;
            }
            let partition_key: Option<String> = row.try_get("partition_key").map_err(db_err)?;
            if let Some(wanted) = canonical.as_deref() {
                if partition_key.as_deref() != Some(wanted) {
                    continue;
                }
            }
            let severity: Severity = row
                .try_get::<String, _>("severity")
                .map_err(db_err)?
                .parse()
                .map_err(StoreError::Serialization)?;
            if filter.min_severity.map_or(false, |min| severity < min) {
                continue;
            }
            let resolved_at = parse_opt_ts(row.try_get("resolved_at").map_err(db_err)?)?;
            if filter.unresolved_only && resolved_at.is_some() {
                continue;
            }
            let category: ErrorCategory = row
                .try_get::<String, _>("category")
                .map_err(db_err)?
                .parse()
                .map_err(StoreError::Serialization)?;

            out.push(AnomalyEntry {
                id: parse_uuid(row.try_get::<String, _>("id").map_err(db_err)?.as_str())?,
                domain,
                partition: partition_key.as_deref().map(parse_partition).transpose()?,
                severity,
                category,
                message: row.try_get("message").map_err(db_err)?,
                detected_at: parse_ts(
                    row.try_get::<String, _>("detected_at").map_err(db_err)?.as_str(),
                )?,
                resolved_at,
            });
        }
        Ok(out)
    }

    async fn set_readiness(&self, entry: ReadinessEntry) -> Result<(), StoreError> {
        let issues = serde_json::to_string(&entry.blocking_issues)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO core_data_readiness
                (domain, partition_key, is_ready, blocking_issues, evaluated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (domain, partition_key)
            DO UPDATE SET
                is_ready = excluded.is_ready,
                blocking_issues = excluded.blocking_issues,
                evaluated_at = excluded.evaluated_at
            "#,
        )
        .bind(&entry.domain)
        .bind(entry.partition.canonical())
        .bind(entry.is_ready as i64)
        .bind(issues)
        .bind(fmt_ts(entry.evaluated_at))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_readiness(
        &self,
        domain: &str,
        partition: &PartitionKey,
    ) -> Result<Option<ReadinessEntry>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM core_data_readiness WHERE domain = ? AND partition_key = ?",
        )
        .bind(domain)
        .bind(partition.canonical())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(|row| -> Result<ReadinessEntry, StoreError> {
            let issues: String = row.try_get("blocking_issues").map_err(db_err)?;
            Ok(ReadinessEntry {
                domain: row.try_get("domain").map_err(db_err)?,
                partition: parse_partition(
                    row.try_get::<String, _>("partition_key").map_err(db_err)?.as_str(),
                )?,
                is_ready: row.try_get::<i64, _>("is_ready").map_err(db_err)? != 0,
                blocking_issues: serde_json::from_str(&issues)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?,
                evaluated_at: parse_ts(
                    row.try_get::<String, _>("evaluated_at").map_err(db_err)?.as_str(),
                )?,
            })
        })
        .transpose()
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
        // Delete-then-insert in one transaction: all-or-nothing replay per
        // partition, scoped to this capture only.
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let canonical = partition.canonical();

        sqlx::query(
            "DELETE FROM core_capture_rows WHERE dataset = ? AND partition_key = ? AND capture_id = ?",
        )
        .bind(dataset)
        .bind(&canonical)
        .bind(capture_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let now = fmt_ts(Utc::now());
        for row in rows {
            let row_json = serde_json::to_string(row)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            sqlx::query(
                r#"
                INSERT INTO core_capture_rows (dataset, partition_key, capture_id, row, captured_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(dataset)
            .bind(&canonical)
            .bind(capture_id)
            .bind(row_json)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(rows.len() as u64)
    }

    async fn capture_rows(
        &self,
        dataset: &str,
        partition: &PartitionKey,
        capture_id: &str,
    ) -> Result<Vec<Value>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT row FROM core_capture_rows
            WHERE dataset = ? AND partition_key = ? AND capture_id = ?
            ORDER BY rowid ASC
            "#,
        )
        .bind(dataset)
        .bind(partition.canonical())
        .bind(capture_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                let text: String = row.try_get("row").map_err(db_err)?;
                parse_json(&text)
            })
            .collect()
    }

    async fn dataset_captures(
        &self,
        dataset: &str,
        partition: &PartitionKey,
    ) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT capture_id FROM core_capture_rows
            WHERE dataset = ? AND partition_key = ?
            ORDER BY capture_id ASC
            "#,
        )
        .bind(dataset)
        .bind(partition.canonical())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| row.try_get("capture_id").map_err(db_err))
            .collect()
    }

    // =========================================================================
    // Work Queue
    // =========================================================================

    async fn enqueue(&self, item: NewWorkItem) -> Result<Uuid, StoreError> {
        let id = Uuid::now_v7();
        let now = Utc::now();
        let params = serde_json::to_string(&item.params)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let result = sqlx::query(
            r#"
            INSERT INTO core_work_items
                (id, domain, pipeline, partition_key, params, priority, lane, state,
                 attempt_count, max_attempts, desired_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', 0, ?, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(&item.domain)
        .bind(&item.pipeline)
        .bind(item.partition.canonical())
        .bind(params)
        .bind(item.priority)
        .bind(item.lane.as_str())
        .bind(item.max_attempts as i64)
        .bind(fmt_ts(item.desired_at.unwrap_or(now)))
        .bind(fmt_ts(now))
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(id),
            Err(e) => {
                let unique = e
                    .as_database_error()
                    .map_or(false, |db| db.is_unique_violation());
                if unique {
                    Err(StoreError::DuplicateWorkItem {
                        domain: item.domain,
                        pipeline: item.pipeline,
                        partition: item.partition.canonical(),
                    })
                } else {
                    Err(db_err(e))
                }
            }
        }
    }

    async fn claim(
        &self,
        worker_id: &str,
        lanes: Option<&[Lane]>,
    ) -> Result<Option<WorkItem>, StoreError> {
        let now = Utc::now();

        let rows = sqlx::query(
            r#"
            SELECT * FROM core_work_items
            WHERE state IN ('pending', 'retry_wait')
            ORDER BY priority DESC, desired_at ASC, created_at ASC
            LIMIT 20
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        for row in &rows {
            let mut item = Self::map_work_item(row)?;

            if let Some(lanes) = lanes {
                if !lanes.contains(&item.lane) {
                    continue;
                }
            }
            let due = match item.state {
                WorkItemState::Pending => item.desired_at <= now,
                WorkItemState::RetryWait => item.next_attempt_at.map_or(false, |at| at <= now),
                _ => false,
            };
            if !due {
                continue;
            }

            // Guarded update: only one claimer flips the row out of its
            // waiting state.
            let result = sqlx::query(
                r#"
                UPDATE core_work_items
                SET state = 'running',
                    locked_by = ?,
                    locked_at = ?,
                    attempt_count = attempt_count + 1,
                    next_attempt_at = NULL,
                    updated_at = ?
                WHERE id = ? AND state = ?
                "#,
            )
            .bind(worker_id)
            .bind(fmt_ts(now))
            .bind(fmt_ts(now))
            .bind(item.id.to_string())
            .bind(item.state.as_str())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

            if result.rows_affected() == 1 {
                item.state = WorkItemState::Running;
                item.locked_by = Some(worker_id.to_string());
                item.locked_at = Some(now);
                item.attempt_count += 1;
                item.next_attempt_at = None;
                item.updated_at = now;
                return Ok(Some(item));
            }
        }
        Ok(None)
    }

    async fn assign_execution(&self, id: Uuid, execution_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE core_work_items SET current_execution_id = ?, updated_at = ? WHERE id = ?",
        )
        .bind(execution_id.to_string())
        .bind(fmt_ts(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::WorkItemNotFound(id));
        }
        Ok(())
    }

    async fn complete(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE core_work_items
            SET state = 'complete', locked_by = NULL, locked_at = NULL, updated_at = ?
            WHERE id = ? AND state = 'running'
            "#,
        )
        .bind(fmt_ts(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            let item = self.fetch_work_item(id).await?;
            return Err(StoreError::InvalidTransition {
                action: "complete",
                state: item.state,
            });
        }
        Ok(())
    }

    async fn fail(&self, id: Uuid, error: &str) -> Result<WorkItemState, StoreError> {
        let now = Utc::now();
        let item = self.fetch_work_item(id).await?;
        if item.state != WorkItemState::Running {
            return Err(StoreError::InvalidTransition {
                action: "fail",
                state: item.state,
            });
        }

        let (state, next_attempt_at) = if item.attempt_count >= item.max_attempts {
            (WorkItemState::Failed, None)
        } else {
            (
                WorkItemState::RetryWait,
                Some(now + retry_backoff(item.attempt_count)),
            )
        };

        let result = sqlx::query(
            r#"
            UPDATE core_work_items
            SET state = ?, next_attempt_at = ?, last_error = ?,
                locked_by = NULL, locked_at = NULL, current_execution_id = NULL,
                updated_at = ?
            WHERE id = ? AND state = 'running'
            "#,
        )
        .bind(state.as_str())
        .bind(next_attempt_at.map(fmt_ts))
        .bind(error)
        .bind(fmt_ts(now))
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            let item = self.fetch_work_item(id).await?;
            return Err(StoreError::InvalidTransition {
                action: "fail",
                state: item.state,
            });
        }
        Ok(state)
    }

    async fn retry(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE core_work_items
            SET state = 'pending', next_attempt_at = NULL, updated_at = ?
            WHERE id = ? AND state IN ('retry_wait', 'failed', 'cancelled')
            "#,
        )
        .bind(fmt_ts(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            let item = self.fetch_work_item(id).await?;
            return Err(StoreError::InvalidTransition {
                action: "retry",
                state: item.state,
            });
        }
        Ok(())
    }

    async fn cancel(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE core_work_items
            SET state = 'cancelled', next_attempt_at = NULL, updated_at = ?
            WHERE id = ? AND state IN ('pending', 'retry_wait')
            "#,
        )
        .bind(fmt_ts(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            let item = self.fetch_work_item(id).await?;
            return Err(StoreError::InvalidTransition {
                action: "cancel",
                state: item.state,
            });
        }
        Ok(())
    }

    async fn get_work_item(&self, id: Uuid) -> Result<WorkItem, StoreError> {
        self.fetch_work_item(id).await
    }

    async fn list_work_items(
        &self,
        filter: WorkItemFilter,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let rows = sqlx::query("SELECT * FROM core_work_items ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        let mut out = Vec::new();
        for row in &rows {
            let item = Self::map_work_item(row)?;
            if filter.domain.as_deref().map_or(false, |d| d != item.domain) {
                continue;
            }
            if filter.state.map_or(false, |s| s != item.state) {
                continue;
            }
            if filter.lane.map_or(false, |l| l != item.lane) {
                continue;
            }
            out.push(item);
        }
        Ok(out)
    }

    async fn reap_stale(&self, stale_threshold: Duration) -> Result<Vec<Uuid>, StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(stale_threshold)
                .map_err(|e| StoreError::Database(e.to_string()))?;

        let rows = sqlx::query("SELECT * FROM core_work_items WHERE state = 'running'")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        let mut reaped = Vec::new();
        for row in &rows {
            let item = Self::map_work_item(row)?;
            if item.locked_at.map_or(false, |at| at >= cutoff) {
                continue;
            }
            let result = sqlx::query(
                r#"
                UPDATE core_work_items
                SET state = 'pending', locked_by = NULL, locked_at = NULL,
                    current_execution_id = NULL, updated_at = ?
                WHERE id = ? AND state = 'running'
                "#,
            )
            .bind(fmt_ts(Utc::now()))
            .bind(item.id.to_string())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
            if result.rows_affected() == 1 {
                reaped.push(item.id);
            }
        }
        Ok(reaped)
    }

    // =========================================================================
    // Checkpoints
    // =========================================================================

    async fn save_checkpoint(&self, checkpoint: WorkflowCheckpoint) -> Result<(), StoreError> {
        let snapshot = serde_json::to_string(&checkpoint.context_snapshot)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO core_workflow_checkpoints
                (run_id, workflow_name, step_name, context_snapshot, created_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (run_id)
            DO UPDATE SET
                workflow_name = excluded.workflow_name,
                step_name = excluded.step_name,
                context_snapshot = excluded.context_snapshot,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(checkpoint.run_id.to_string())
        .bind(&checkpoint.workflow_name)
        .bind(&checkpoint.step_name)
        .bind(snapshot)
        .bind(fmt_ts(checkpoint.created_at))
        .bind(checkpoint.expires_at.map(fmt_ts))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn load_checkpoint(
        &self,
        run_id: Uuid,
    ) -> Result<Option<WorkflowCheckpoint>, StoreError> {
        let row = sqlx::query("SELECT * FROM core_workflow_checkpoints WHERE run_id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.map(|row| -> Result<WorkflowCheckpoint, StoreError> {
            let snapshot: String = row.try_get("context_snapshot").map_err(db_err)?;
            Ok(WorkflowCheckpoint {
                run_id,
                workflow_name: row.try_get("workflow_name").map_err(db_err)?,
                step_name: row.try_get("step_name").map_err(db_err)?,
                context_snapshot: parse_json(&snapshot)?,
                created_at: parse_ts(
                    row.try_get::<String, _>("created_at").map_err(db_err)?.as_str(),
                )?,
                expires_at: parse_opt_ts(row.try_get("expires_at").map_err(db_err)?)?,
            })
        })
        .transpose()
    }

    async fn delete_checkpoint(&self, run_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM core_workflow_checkpoints WHERE run_id = ?")
            .bind(run_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn sweep_expired_checkpoints(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM core_workflow_checkpoints WHERE expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(fmt_ts(now))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }
}
