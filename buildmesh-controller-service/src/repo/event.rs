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

use crate::model::{EventType, LifecycleEvent};
use crate::repo::RepoError;
use async_trait::async_trait;
use buildmesh_common::model::{BuildId, WorkerId};
use chrono::{DateTime, Utc};
use conditional_trait_gen::trait_gen;
use sqlx::Pool;
use std::str::FromStr;
use std::sync::Arc;

/// `created_at` is stored as the exact RFC 3339 text that went into the
/// hash, so a verify pass re-hashes the stored bytes rather than a
/// round-tripped timestamp.
#[derive(sqlx::FromRow, Debug, Clone)]
pub struct EventRecord {
    pub sequence: i64,
    pub event_type: String,
    pub build_id: Option<String>,
    pub worker_id: Option<String>,
    pub payload: String,
    pub created_at: String,
    pub previous_hash: String,
    pub event_hash: String,
}

impl TryFrom<EventRecord> for LifecycleEvent {
    type Error = String;

    fn try_from(value: EventRecord) -> Result<Self, Self::Error> {
        let payload = serde_json::from_str(&value.payload)
            .map_err(|e| format!("Invalid event payload: {e}"))?;
        let created_at = DateTime::parse_from_rfc3339(&value.created_at)
            .map_err(|e| format!("Invalid event timestamp: {e}"))?
            .with_timezone(&Utc);
        Ok(LifecycleEvent {
            sequence: value.sequence,
            event_type: EventType::from_str(&value.event_type)?,
            build_id: value.build_id.map(BuildId),
            worker_id: value.worker_id.map(WorkerId),
            payload,
            created_at,
            previous_hash: value.previous_hash,
            event_hash: value.event_hash,
        })
    }
}

/// Append-only store behind the hash chain. The chain itself (hash
/// computation, gapless sequencing with retry) lives in the event service.
#[async_trait]
pub trait EventRepo: Send + Sync {
    /// The highest-sequence event, if any.
    async fn last(&self) -> Result<Option<EventRecord>, RepoError>;

    /// Inserts a fully-formed record. A sequence collision from a concurrent
    /// appender surfaces as [`RepoError::UniqueViolation`].
    async fn append(&self, event: &EventRecord) -> Result<(), RepoError>;

    async fn list_after(&self, after: i64, limit: i64) -> Result<Vec<EventRecord>, RepoError>;

    /// Full scan in sequence order, for chain verification.
    async fn list_all(&self) -> Result<Vec<EventRecord>, RepoError>;
}

pub struct DbEventRepo<DB: sqlx::Database> {
    db_pool: Arc<Pool<DB>>,
}

impl<DB: sqlx::Database> DbEventRepo<DB> {
    pub fn new(db_pool: Arc<Pool<DB>>) -> Self {
        Self { db_pool }
    }
}

const INSERT_EVENT: &str = r#"
  INSERT INTO events
    (sequence, event_type, build_id, worker_id, payload, created_at,
     previous_hash, event_hash)
  VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8)
"#;

#[trait_gen(sqlx::Postgres -> sqlx::Postgres, sqlx::Sqlite)]
#[async_trait]
impl EventRepo for DbEventRepo<sqlx::Postgres> {
    async fn last(&self) -> Result<Option<EventRecord>, RepoError> {
        sqlx::query_as::<_, EventRecord>(
            "SELECT * FROM events ORDER BY sequence DESC LIMIT 1",
        )
        .fetch_optional(&*self.db_pool)
        .await
        .map_err(|e| e.into())
    }

    async fn append(&self, event: &EventRecord) -> Result<(), RepoError> {
        sqlx::query(INSERT_EVENT)
            .bind(event.sequence)
            .bind(&event.event_type)
            .bind(&event.build_id)
            .bind(&event.worker_id)
            .bind(&event.payload)
            .bind(&event.created_at)
            .bind(&event.previous_hash)
            .bind(&event.event_hash)
            .execute(&*self.db_pool)
            .await?;
        Ok(())
    }

    async fn list_after(&self, after: i64, limit: i64) -> Result<Vec<EventRecord>, RepoError> {
        sqlx::query_as::<_, EventRecord>(
            "SELECT * FROM events WHERE sequence > $1 ORDER BY sequence ASC LIMIT $2",
        )
        .bind(after)
        .bind(limit)
        .fetch_all(&*self.db_pool)
        .await
        .map_err(|e| e.into())
    }

    async fn list_all(&self) -> Result<Vec<EventRecord>, RepoError> {
        sqlx::query_as::<_, EventRecord>("SELECT * FROM events ORDER BY sequence ASC")
            .fetch_all(&*self.db_pool)
            .await
            .map_err(|e| e.into())
    }
}
