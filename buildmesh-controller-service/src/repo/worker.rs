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

use crate::model::Worker;
use crate::repo::RepoError;
use async_trait::async_trait;
use buildmesh_common::model::{TokenSecret, WorkerId, WorkerStatus};
use chrono::{DateTime, Utc};
use conditional_trait_gen::trait_gen;
use sqlx::{Pool, Row};
use std::str::FromStr;
use std::sync::Arc;

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct WorkerRecord {
    pub id: String,
    pub name: String,
    pub capabilities: String,
    pub status: String,
    pub access_token: String,
    pub access_token_expires_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub builds_completed: i64,
    pub builds_failed: i64,
    pub registered_at: DateTime<Utc>,
}

impl TryFrom<WorkerRecord> for Worker {
    type Error = String;

    fn try_from(value: WorkerRecord) -> Result<Self, Self::Error> {
        let capabilities = serde_json::from_str(&value.capabilities)
            .map_err(|e| format!("Invalid worker capabilities: {e}"))?;
        Ok(Worker {
            id: WorkerId(value.id),
            name: value.name,
            capabilities,
            status: WorkerStatus::from_str(&value.status)?,
            access_token: TokenSecret::new(value.access_token),
            access_token_expires_at: value.access_token_expires_at,
            last_seen_at: value.last_seen_at,
            builds_completed: value.builds_completed,
            builds_failed: value.builds_failed,
            registered_at: value.registered_at,
        })
    }
}

impl From<&Worker> for WorkerRecord {
    fn from(value: &Worker) -> Self {
        Self {
            id: value.id.0.clone(),
            name: value.name.clone(),
            capabilities: value.capabilities.to_string(),
            status: value.status.as_str().to_string(),
            access_token: value.access_token.value.clone(),
            access_token_expires_at: value.access_token_expires_at,
            last_seen_at: value.last_seen_at,
            builds_completed: value.builds_completed,
            builds_failed: value.builds_failed,
            registered_at: value.registered_at,
        }
    }
}

/// Worker registry. Token rotation is a conditional update keyed on the old
/// token value, so a raced rotation loses cleanly instead of minting two
/// valid tokens.
#[async_trait]
pub trait WorkerRepo: Send + Sync {
    async fn insert(&self, worker: &WorkerRecord) -> Result<(), RepoError>;

    async fn get(&self, id: &str) -> Result<Option<WorkerRecord>, RepoError>;

    async fn list(&self) -> Result<Vec<WorkerRecord>, RepoError>;

    /// Repeat registration: refreshes identity fields and liveness, rotates
    /// the token, and revives an offline worker.
    async fn reregister(
        &self,
        id: &str,
        name: &str,
        capabilities: &str,
        access_token: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, RepoError>;

    /// Swaps `old_token` for `new_token` and extends expiry; `false` when the
    /// old token no longer matches (already rotated or revoked).
    async fn rotate_token(
        &self,
        id: &str,
        old_token: &str,
        new_token: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, RepoError>;

    async fn touch(&self, id: &str, now: DateTime<Utc>) -> Result<(), RepoError>;

    async fn set_status(&self, id: &str, status: &str) -> Result<bool, RepoError>;

    /// Workers whose token expired but who are not yet marked offline.
    async fn list_token_expired(&self, now: DateTime<Utc>) -> Result<Vec<WorkerRecord>, RepoError>;

    /// Workers unseen since `cutoff` and not yet marked offline.
    async fn list_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<WorkerRecord>, RepoError>;

    async fn increment_completed(&self, id: &str) -> Result<(), RepoError>;

    async fn increment_failed(&self, id: &str) -> Result<(), RepoError>;

    async fn count_by_status(&self) -> Result<Vec<(String, i64)>, RepoError>;

    /// Sum of the completion/failure counters across all workers.
    async fn counter_totals(&self) -> Result<(i64, i64), RepoError>;
}

pub struct DbWorkerRepo<DB: sqlx::Database> {
    db_pool: Arc<Pool<DB>>,
}

impl<DB: sqlx::Database> DbWorkerRepo<DB> {
    pub fn new(db_pool: Arc<Pool<DB>>) -> Self {
        Self { db_pool }
    }
}

const INSERT_WORKER: &str = r#"
  INSERT INTO workers
    (id, name, capabilities, status, access_token, access_token_expires_at,
     last_seen_at, builds_completed, builds_failed, registered_at)
  VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
"#;

const REREGISTER_WORKER: &str = r#"
  UPDATE workers
  SET name = $2, capabilities = $3, access_token = $4,
      access_token_expires_at = $5, last_seen_at = $6,
      status = CASE WHEN status = 'offline' THEN 'idle' ELSE status END
  WHERE id = $1
"#;

const ROTATE_TOKEN: &str = r#"
  UPDATE workers
  SET access_token = $3, access_token_expires_at = $4, last_seen_at = $5
  WHERE id = $1 AND access_token = $2
"#;

const COUNTER_TOTALS: &str = r#"
  SELECT CAST(COALESCE(SUM(builds_completed), 0) AS BIGINT) AS completed,
         CAST(COALESCE(SUM(builds_failed), 0) AS BIGINT) AS failed
  FROM workers
"#;

#[trait_gen(sqlx::Postgres -> sqlx::Postgres, sqlx::Sqlite)]
#[async_trait]
impl WorkerRepo for DbWorkerRepo<sqlx::Postgres> {
    async fn insert(&self, worker: &WorkerRecord) -> Result<(), RepoError> {
        sqlx::query(INSERT_WORKER)
            .bind(&worker.id)
            .bind(&worker.name)
            .bind(&worker.capabilities)
            .bind(&worker.status)
            .bind(&worker.access_token)
            .bind(worker.access_token_expires_at)
            .bind(worker.last_seen_at)
            .bind(worker.builds_completed)
            .bind(worker.builds_failed)
            .bind(worker.registered_at)
            .execute(&*self.db_pool)
            .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<WorkerRecord>, RepoError> {
        sqlx::query_as::<_, WorkerRecord>("SELECT * FROM workers WHERE id = $1")
            .bind(id)
            .fetch_optional(&*self.db_pool)
            .await
            .map_err(|e| e.into())
    }

    async fn list(&self) -> Result<Vec<WorkerRecord>, RepoError> {
        sqlx::query_as::<_, WorkerRecord>("SELECT * FROM workers ORDER BY registered_at ASC")
            .fetch_all(&*self.db_pool)
            .await
            .map_err(|e| e.into())
    }

    async fn reregister(
        &self,
        id: &str,
        name: &str,
        capabilities: &str,
        access_token: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, RepoError> {
        let result = sqlx::query(REREGISTER_WORKER)
            .bind(id)
            .bind(name)
            .bind(capabilities)
            .bind(access_token)
            .bind(expires_at)
            .bind(now)
            .execute(&*self.db_pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn rotate_token(
        &self,
        id: &str,
        old_token: &str,
        new_token: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, RepoError> {
        let result = sqlx::query(ROTATE_TOKEN)
            .bind(id)
            .bind(old_token)
            .bind(new_token)
            .bind(expires_at)
            .bind(now)
            .execute(&*self.db_pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn touch(&self, id: &str, now: DateTime<Utc>) -> Result<(), RepoError> {
        sqlx::query("UPDATE workers SET last_seen_at = $2 WHERE id = $1")
            .bind(id)
            .bind(now)
            .execute(&*self.db_pool)
            .await?;
        Ok(())
    }

    async fn set_status(&self, id: &str, status: &str) -> Result<bool, RepoError> {
        let result = sqlx::query("UPDATE workers SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status)
            .execute(&*self.db_pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_token_expired(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<WorkerRecord>, RepoError> {
        sqlx::query_as::<_, WorkerRecord>(
            "SELECT * FROM workers WHERE access_token_expires_at < $1 AND status != 'offline'",
        )
        .bind(now)
        .fetch_all(&*self.db_pool)
        .await
        .map_err(|e| e.into())
    }

    async fn list_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<WorkerRecord>, RepoError> {
        sqlx::query_as::<_, WorkerRecord>(
            "SELECT * FROM workers WHERE last_seen_at < $1 AND status != 'offline'",
        )
        .bind(cutoff)
        .fetch_all(&*self.db_pool)
        .await
        .map_err(|e| e.into())
    }

    async fn increment_completed(&self, id: &str) -> Result<(), RepoError> {
        sqlx::query("UPDATE workers SET builds_completed = builds_completed + 1 WHERE id = $1")
            .bind(id)
            .execute(&*self.db_pool)
            .await?;
        Ok(())
    }

    async fn increment_failed(&self, id: &str) -> Result<(), RepoError> {
        sqlx::query("UPDATE workers SET builds_failed = builds_failed + 1 WHERE id = $1")
            .bind(id)
            .execute(&*self.db_pool)
            .await?;
        Ok(())
    }

    async fn count_by_status(&self) -> Result<Vec<(String, i64)>, RepoError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS total FROM workers GROUP BY status")
            .fetch_all(&*self.db_pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("status"), row.get("total")))
            .collect())
    }

    async fn counter_totals(&self) -> Result<(i64, i64), RepoError> {
        let row = sqlx::query(COUNTER_TOTALS)
            .fetch_one(&*self.db_pool)
            .await?;
        Ok((row.get("completed"), row.get("failed")))
    }
}
