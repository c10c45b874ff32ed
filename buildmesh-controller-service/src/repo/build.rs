// Copyright 2025 Buildmesh Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::model::{Build, BuildLogEntry};
use crate::repo::RepoError;
use crate::storage::ObjectRef;
use async_trait::async_trait;
use buildmesh_common::model::{BuildId, BuildStatus, LogLevel, Platform, TokenSecret, WorkerId};
use chrono::{DateTime, Utc};
use sqlx::{Pool, Row};
use std::str::FromStr;
use std::sync::Arc;

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct BuildRecord {
    pub id: String,
    pub platform: String,
    pub status: String,
    pub worker_id: Option<String>,
    pub access_token: String,
    pub source_ref: String,
    pub certs_ref: Option<String>,
    pub result_ref: Option<String>,
    pub error_message: Option<String>,
    pub sequence: i64,
    pub submitted_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<BuildRecord> for Build {
    type Error = String;

    fn try_from(value: BuildRecord) -> Result<Self, Self::Error> {
        Ok(Build {
            id: BuildId(value.id),
            platform: Platform::from_str(&value.platform)?,
            status: BuildStatus::from_str(&value.status)?,
            worker_id: value.worker_id.map(WorkerId),
            access_token: TokenSecret::new(value.access_token),
            source_ref: ObjectRef(value.source_ref),
            certs_ref: value.certs_ref.map(ObjectRef),
            result_ref: value.result_ref.map(ObjectRef),
            error_message: value.error_message,
            sequence: value.sequence,
            submitted_at: value.submitted_at,
            assigned_at: value.assigned_at,
            started_at: value.started_at,
            last_heartbeat_at: value.last_heartbeat_at,
            completed_at: value.completed_at,
        })
    }
}

impl From<&Build> for BuildRecord {
    fn from(value: &Build) -> Self {
        Self {
            id: value.id.0.clone(),
            platform: value.platform.as_str().to_string(),
            status: value.status.as_str().to_string(),
            worker_id: value.worker_id.as_ref().map(|w| w.0.clone()),
            access_token: value.access_token.value.clone(),
            source_ref: value.source_ref.0.clone(),
            certs_ref: value.certs_ref.as_ref().map(|r| r.0.clone()),
            result_ref: value.result_ref.as_ref().map(|r| r.0.clone()),
            error_message: value.error_message.clone(),
            sequence: value.sequence,
            submitted_at: value.submitted_at,
            assigned_at: value.assigned_at,
            started_at: value.started_at,
            last_heartbeat_at: value.last_heartbeat_at,
            completed_at: value.completed_at,
        }
    }
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct BuildLogRecord {
    pub id: i64,
    pub build_id: String,
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub message: String,
}

impl TryFrom<BuildLogRecord> for BuildLogEntry {
    type Error = String;

    fn try_from(value: BuildLogRecord) -> Result<Self, Self::Error> {
        Ok(BuildLogEntry {
            timestamp: value.timestamp,
            level: LogLevel::from_str(&value.level)?,
            message: value.message,
        })
    }
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct CpuSnapshotRecord {
    pub id: i64,
    pub build_id: String,
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_mb: f64,
}

/// Persistent build catalog. Every state transition goes through one of the
/// guarded updates below; a `false` return means the guard did not match
/// (wrong state or wrong worker), and nothing was changed.
#[async_trait]
pub trait BuildRepo: Send + Sync {
    /// Inserts as a fresh row; the creation `sequence` is assigned by the
    /// database. Returns the stored record.
    async fn insert(&self, build: &BuildRecord) -> Result<BuildRecord, RepoError>;

    async fn get(&self, id: &str) -> Result<Option<BuildRecord>, RepoError>;

    async fn list_all(&self) -> Result<Vec<BuildRecord>, RepoError>;

    /// Builds in `assigned` or `building`.
    async fn list_active(&self) -> Result<Vec<BuildRecord>, RepoError>;

    /// The build a worker currently holds, if any.
    async fn get_active_by_worker(&self, worker_id: &str)
        -> Result<Option<BuildRecord>, RepoError>;

    /// Atomically claims the oldest pending build for `worker_id` and records
    /// the assignment log line in the same transaction. Concurrent callers
    /// observe disjoint builds or `None`.
    async fn claim_next_pending(
        &self,
        worker_id: &str,
        worker_name: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<BuildRecord>, RepoError>;

    /// `assigned -> building`.
    async fn mark_building(&self, id: &str, now: DateTime<Utc>) -> Result<bool, RepoError>;

    async fn record_heartbeat(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RepoError>;

    /// `{assigned, building} -> completed`, bound to the reporting worker.
    async fn complete(
        &self,
        id: &str,
        worker_id: &str,
        result_ref: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RepoError>;

    /// `{assigned, building} -> failed`, bound to the reporting worker.
    async fn fail(
        &self,
        id: &str,
        worker_id: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RepoError>;

    /// `{pending, assigned, building} -> failed` with a cancellation message,
    /// regardless of holder. Returns the pre-cancellation record.
    async fn cancel(
        &self,
        id: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<BuildRecord>, RepoError>;

    /// `{assigned, building} -> pending`, clearing the worker binding. Only
    /// the liveness monitor and startup restore call this.
    async fn requeue(&self, id: &str) -> Result<bool, RepoError>;

    /// Active builds whose last heartbeat (or assignment, if none yet) is
    /// older than `cutoff`.
    async fn list_heartbeat_expired(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<BuildRecord>, RepoError>;

    async fn append_logs(
        &self,
        build_id: &str,
        entries: &[(DateTime<Utc>, String, String)],
    ) -> Result<(), RepoError>;

    async fn get_logs(&self, build_id: &str) -> Result<Vec<BuildLogRecord>, RepoError>;

    async fn insert_cpu_snapshot(&self, snapshot: &CpuSnapshotRecord) -> Result<(), RepoError>;

    async fn count_by_status(&self) -> Result<Vec<(String, i64)>, RepoError>;
}

pub struct DbBuildRepo<DB: sqlx::Database> {
    db_pool: Arc<Pool<DB>>,
}

impl<DB: sqlx::Database> DbBuildRepo<DB> {
    pub fn new(db_pool: Arc<Pool<DB>>) -> Self {
        Self { db_pool }
    }
}

const INSERT_BUILD: &str = r#"
  INSERT INTO builds
    (id, platform, status, worker_id, access_token, source_ref, certs_ref,
     result_ref, error_message, sequence, submitted_at, assigned_at,
     started_at, last_heartbeat_at, completed_at)
  VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9,
     (SELECT COALESCE(MAX(sequence), 0) + 1 FROM builds),
     $10, $11, $12, $13, $14)
  RETURNING *
"#;

const INSERT_LOG: &str =
    "INSERT INTO build_logs (build_id, timestamp, level, message) VALUES ($1, $2, $3, $4)";

const ASSIGN_BUILD: &str = r#"
  UPDATE builds
  SET status = 'assigned', worker_id = $1, assigned_at = $2, last_heartbeat_at = $2
  WHERE id = $3
  RETURNING *
"#;

#[async_trait]
impl BuildRepo for DbBuildRepo<sqlx::Postgres> {
    async fn insert(&self, build: &BuildRecord) -> Result<BuildRecord, RepoError> {
        let record = sqlx::query_as::<_, BuildRecord>(INSERT_BUILD)
            .bind(&build.id)
            .bind(&build.platform)
            .bind(&build.status)
            .bind(&build.worker_id)
            .bind(&build.access_token)
            .bind(&build.source_ref)
            .bind(&build.certs_ref)
            .bind(&build.result_ref)
            .bind(&build.error_message)
            .bind(build.submitted_at)
            .bind(build.assigned_at)
            .bind(build.started_at)
            .bind(build.last_heartbeat_at)
            .bind(build.completed_at)
            .fetch_one(&*self.db_pool)
            .await?;
        Ok(record)
    }

    async fn get(&self, id: &str) -> Result<Option<BuildRecord>, RepoError> {
        sqlx::query_as::<_, BuildRecord>("SELECT * FROM builds WHERE id = $1")
            .bind(id)
            .fetch_optional(&*self.db_pool)
            .await
            .map_err(|e| e.into())
    }

    async fn list_all(&self) -> Result<Vec<BuildRecord>, RepoError> {
        sqlx::query_as::<_, BuildRecord>("SELECT * FROM builds ORDER BY submitted_at ASC, id ASC")
            .fetch_all(&*self.db_pool)
            .await
            .map_err(|e| e.into())
    }

    async fn list_active(&self) -> Result<Vec<BuildRecord>, RepoError> {
        sqlx::query_as::<_, BuildRecord>(
            "SELECT * FROM builds WHERE status IN ('assigned', 'building') ORDER BY assigned_at ASC",
        )
        .fetch_all(&*self.db_pool)
        .await
        .map_err(|e| e.into())
    }

    async fn get_active_by_worker(
        &self,
        worker_id: &str,
    ) -> Result<Option<BuildRecord>, RepoError> {
        sqlx::query_as::<_, BuildRecord>(
            "SELECT * FROM builds WHERE worker_id = $1 AND status IN ('assigned', 'building')",
        )
        .bind(worker_id)
        .fetch_optional(&*self.db_pool)
        .await
        .map_err(|e| e.into())
    }

    async fn claim_next_pending(
        &self,
        worker_id: &str,
        worker_name: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<BuildRecord>, RepoError> {
        let mut tx = self.db_pool.begin().await?;

        let picked = sqlx::query_as::<_, BuildRecord>(
            r#"
              SELECT * FROM builds
              WHERE status = 'pending'
              ORDER BY submitted_at ASC, id ASC
              LIMIT 1
              FOR UPDATE SKIP LOCKED
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some(picked) = picked else {
            tx.commit().await?;
            return Ok(None);
        };

        let assigned = sqlx::query_as::<_, BuildRecord>(ASSIGN_BUILD)
            .bind(worker_id)
            .bind(now)
            .bind(&picked.id)
            .fetch_one(&mut *tx)
            .await?;

        sqlx::query(INSERT_LOG)
            .bind(&picked.id)
            .bind(now)
            .bind("info")
            .bind(format!("Assigned to worker {worker_name}"))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(assigned))
    }

    async fn mark_building(&self, id: &str, now: DateTime<Utc>) -> Result<bool, RepoError> {
        let result = sqlx::query(
            "UPDATE builds SET status = 'building', started_at = $2 WHERE id = $1 AND status = 'assigned'",
        )
        .bind(id)
        .bind(now)
        .execute(&*self.db_pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_heartbeat(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RepoError> {
        let result = sqlx::query(
            r#"
              UPDATE builds SET last_heartbeat_at = $3
              WHERE id = $1 AND worker_id = $2 AND status IN ('assigned', 'building')
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(now)
        .execute(&*self.db_pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn complete(
        &self,
        id: &str,
        worker_id: &str,
        result_ref: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RepoError> {
        let result = sqlx::query(
            r#"
              UPDATE builds
              SET status = 'completed', result_ref = $3, completed_at = $4
              WHERE id = $1 AND worker_id = $2 AND status IN ('assigned', 'building')
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(result_ref)
        .bind(now)
        .execute(&*self.db_pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn fail(
        &self,
        id: &str,
        worker_id: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RepoError> {
        let result = sqlx::query(
            r#"
              UPDATE builds
              SET status = 'failed', error_message = $3, completed_at = $4
              WHERE id = $1 AND worker_id = $2 AND status IN ('assigned', 'building')
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(message)
        .bind(now)
        .execute(&*self.db_pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn cancel(
        &self,
        id: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<BuildRecord>, RepoError> {
        let mut tx = self.db_pool.begin().await?;

        let before = sqlx::query_as::<_, BuildRecord>("SELECT * FROM builds WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(before) = before else {
            tx.commit().await?;
            return Ok(None);
        };

        let result = sqlx::query(
            r#"
              UPDATE builds
              SET status = 'failed', error_message = $2, completed_at = $3
              WHERE id = $1 AND status IN ('pending', 'assigned', 'building')
            "#,
        )
        .bind(id)
        .bind(message)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        if result.rows_affected() > 0 {
            Ok(Some(before))
        } else {
            Ok(None)
        }
    }

    async fn requeue(&self, id: &str) -> Result<bool, RepoError> {
        let result = sqlx::query(
            r#"
              UPDATE builds
              SET status = 'pending', worker_id = NULL, assigned_at = NULL,
                  started_at = NULL, last_heartbeat_at = NULL
              WHERE id = $1 AND status IN ('assigned', 'building')
            "#,
        )
        .bind(id)
        .execute(&*self.db_pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_heartbeat_expired(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<BuildRecord>, RepoError> {
        sqlx::query_as::<_, BuildRecord>(
            r#"
              SELECT * FROM builds
              WHERE status IN ('assigned', 'building')
                AND COALESCE(last_heartbeat_at, assigned_at) < $1
            "#,
        )
        .bind(cutoff)
        .fetch_all(&*self.db_pool)
        .await
        .map_err(|e| e.into())
    }

    async fn append_logs(
        &self,
        build_id: &str,
        entries: &[(DateTime<Utc>, String, String)],
    ) -> Result<(), RepoError> {
        let mut tx = self.db_pool.begin().await?;
        for (timestamp, level, message) in entries {
            sqlx::query(INSERT_LOG)
                .bind(build_id)
                .bind(timestamp)
                .bind(level)
                .bind(message)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_logs(&self, build_id: &str) -> Result<Vec<BuildLogRecord>, RepoError> {
        sqlx::query_as::<_, BuildLogRecord>(
            "SELECT * FROM build_logs WHERE build_id = $1 ORDER BY id ASC",
        )
        .bind(build_id)
        .fetch_all(&*self.db_pool)
        .await
        .map_err(|e| e.into())
    }

    async fn insert_cpu_snapshot(&self, snapshot: &CpuSnapshotRecord) -> Result<(), RepoError> {
        sqlx::query(
            r#"
              INSERT INTO cpu_snapshots (build_id, timestamp, cpu_percent, memory_mb)
              VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&snapshot.build_id)
        .bind(snapshot.timestamp)
        .bind(snapshot.cpu_percent)
        .bind(snapshot.memory_mb)
        .execute(&*self.db_pool)
        .await?;
        Ok(())
    }

    async fn count_by_status(&self) -> Result<Vec<(String, i64)>, RepoError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS total FROM builds GROUP BY status")
            .fetch_all(&*self.db_pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("status"), row.get("total")))
            .collect())
    }
}

#[async_trait]
impl BuildRepo for DbBuildRepo<sqlx::Sqlite> {
    async fn insert(&self, build: &BuildRecord) -> Result<BuildRecord, RepoError> {
        let record = sqlx::query_as::<_, BuildRecord>(INSERT_BUILD)
            .bind(&build.id)
            .bind(&build.platform)
            .bind(&build.status)
            .bind(&build.worker_id)
            .bind(&build.access_token)
            .bind(&build.source_ref)
            .bind(&build.certs_ref)
            .bind(&build.result_ref)
            .bind(&build.error_message)
            .bind(build.submitted_at)
            .bind(build.assigned_at)
            .bind(build.started_at)
            .bind(build.last_heartbeat_at)
            .bind(build.completed_at)
            .fetch_one(&*self.db_pool)
            .await?;
        Ok(record)
    }

    async fn get(&self, id: &str) -> Result<Option<BuildRecord>, RepoError> {
        sqlx::query_as::<_, BuildRecord>("SELECT * FROM builds WHERE id = $1")
            .bind(id)
            .fetch_optional(&*self.db_pool)
            .await
            .map_err(|e| e.into())
    }

    async fn list_all(&self) -> Result<Vec<BuildRecord>, RepoError> {
        sqlx::query_as::<_, BuildRecord>("SELECT * FROM builds ORDER BY submitted_at ASC, id ASC")
            .fetch_all(&*self.db_pool)
            .await
            .map_err(|e| e.into())
    }

    async fn list_active(&self) -> Result<Vec<BuildRecord>, RepoError> {
        sqlx::query_as::<_, BuildRecord>(
            "SELECT * FROM builds WHERE status IN ('assigned', 'building') ORDER BY assigned_at ASC",
        )
        .fetch_all(&*self.db_pool)
        .await
        .map_err(|e| e.into())
    }

    async fn get_active_by_worker(
        &self,
        worker_id: &str,
    ) -> Result<Option<BuildRecord>, RepoError> {
        sqlx::query_as::<_, BuildRecord>(
            "SELECT * FROM builds WHERE worker_id = $1 AND status IN ('assigned', 'building')",
        )
        .bind(worker_id)
        .fetch_optional(&*self.db_pool)
        .await
        .map_err(|e| e.into())
    }

    async fn claim_next_pending(
        &self,
        worker_id: &str,
        worker_name: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<BuildRecord>, RepoError> {
        // No row locks on sqlite; the single-writer lock serializes claimers,
        // so picking and assigning in one statement is atomic.
        let mut tx = self.db_pool.begin().await?;

        let assigned = sqlx::query_as::<_, BuildRecord>(
            r#"
              UPDATE builds
              SET status = 'assigned', worker_id = $1, assigned_at = $2, last_heartbeat_at = $2
              WHERE id = (
                SELECT id FROM builds
                WHERE status = 'pending'
                ORDER BY submitted_at ASC, id ASC
                LIMIT 1
              )
              RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(assigned) = &assigned {
            sqlx::query(INSERT_LOG)
                .bind(&assigned.id)
                .bind(now)
                .bind("info")
                .bind(format!("Assigned to worker {worker_name}"))
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(assigned)
    }

    async fn mark_building(&self, id: &str, now: DateTime<Utc>) -> Result<bool, RepoError> {
        let result = sqlx::query(
            "UPDATE builds SET status = 'building', started_at = $2 WHERE id = $1 AND status = 'assigned'",
        )
        .bind(id)
        .bind(now)
        .execute(&*self.db_pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_heartbeat(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RepoError> {
        let result = sqlx::query(
            r#"
              UPDATE builds SET last_heartbeat_at = $3
              WHERE id = $1 AND worker_id = $2 AND status IN ('assigned', 'building')
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(now)
        .execute(&*self.db_pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn complete(
        &self,
        id: &str,
        worker_id: &str,
        result_ref: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RepoError> {
        let result = sqlx::query(
            r#"
              UPDATE builds
              SET status = 'completed', result_ref = $3, completed_at = $4
              WHERE id = $1 AND worker_id = $2 AND status IN ('assigned', 'building')
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(result_ref)
        .bind(now)
        .execute(&*self.db_pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn fail(
        &self,
        id: &str,
        worker_id: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RepoError> {
        let result = sqlx::query(
            r#"
              UPDATE builds
              SET status = 'failed', error_message = $3, completed_at = $4
              WHERE id = $1 AND worker_id = $2 AND status IN ('assigned', 'building')
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(message)
        .bind(now)
        .execute(&*self.db_pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn cancel(
        &self,
        id: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<BuildRecord>, RepoError> {
        let mut tx = self.db_pool.begin().await?;

        let before = sqlx::query_as::<_, BuildRecord>("SELECT * FROM builds WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(before) = before else {
            tx.commit().await?;
            return Ok(None);
        };

        let result = sqlx::query(
            r#"
              UPDATE builds
              SET status = 'failed', error_message = $2, completed_at = $3
              WHERE id = $1 AND status IN ('pending', 'assigned', 'building')
            "#,
        )
        .bind(id)
        .bind(message)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        if result.rows_affected() > 0 {
            Ok(Some(before))
        } else {
            Ok(None)
        }
    }

    async fn requeue(&self, id: &str) -> Result<bool, RepoError> {
        let result = sqlx::query(
            r#"
              UPDATE builds
              SET status = 'pending', worker_id = NULL, assigned_at = NULL,
                  started_at = NULL, last_heartbeat_at = NULL
              WHERE id = $1 AND status IN ('assigned', 'building')
            "#,
        )
        .bind(id)
        .execute(&*self.db_pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_heartbeat_expired(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<BuildRecord>, RepoError> {
        sqlx::query_as::<_, BuildRecord>(
            r#"
              SELECT * FROM builds
              WHERE status IN ('assigned', 'building')
                AND COALESCE(last_heartbeat_at, assigned_at) < $1
            "#,
        )
        .bind(cutoff)
        .fetch_all(&*self.db_pool)
        .await
        .map_err(|e| e.into())
    }

    async fn append_logs(
        &self,
        build_id: &str,
        entries: &[(DateTime<Utc>, String, String)],
    ) -> Result<(), RepoError> {
        let mut tx = self.db_pool.begin().await?;
        for (timestamp, level, message) in entries {
            sqlx::query(INSERT_LOG)
                .bind(build_id)
                .bind(timestamp)
                .bind(level)
                .bind(message)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_logs(&self, build_id: &str) -> Result<Vec<BuildLogRecord>, RepoError> {
        sqlx::query_as::<_, BuildLogRecord>(
            "SELECT * FROM build_logs WHERE build_id = $1 ORDER BY id ASC",
        )
        .bind(build_id)
        .fetch_all(&*self.db_pool)
        .await
        .map_err(|e| e.into())
    }

    async fn insert_cpu_snapshot(&self, snapshot: &CpuSnapshotRecord) -> Result<(), RepoError> {
        sqlx::query(
            r#"
              INSERT INTO cpu_snapshots (build_id, timestamp, cpu_percent, memory_mb)
              VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&snapshot.build_id)
        .bind(snapshot.timestamp)
        .bind(snapshot.cpu_percent)
        .bind(snapshot.memory_mb)
        .execute(&*self.db_pool)
        .await?;
        Ok(())
    }

    async fn count_by_status(&self) -> Result<Vec<(String, i64)>, RepoError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS total FROM builds GROUP BY status")
            .fetch_all(&*self.db_pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("status"), row.get("total")))
            .collect())
    }
}
