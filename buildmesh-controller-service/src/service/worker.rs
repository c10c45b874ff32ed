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
use crate::repo::worker::{WorkerRecord, WorkerRepo};
use crate::repo::RepoError;
use buildmesh_common::model::{TokenSecret, WorkerId, WorkerStatus};
use buildmesh_common::SafeDisplay;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Worker not found: {0}")]
    NotFound(WorkerId),
    #[error("Invalid request: {0}")]
    Validation(String),
    #[error("corrupt registry record: {0}")]
    Corrupt(String),
    #[error(transparent)]
    InternalRepoError(#[from] RepoError),
}

impl SafeDisplay for WorkerError {
    fn to_safe_string(&self) -> String {
        match self {
            WorkerError::NotFound(_) | WorkerError::Validation(_) => self.to_string(),
            WorkerError::Corrupt(_) => "internal error".to_string(),
            WorkerError::InternalRepoError(inner) => inner.to_safe_string(),
        }
    }
}

/// Result of a registration call: the worker with its freshly minted token,
/// and whether the id was already known.
pub struct Registration {
    pub worker: Worker,
    pub re_registered: bool,
}

/// Worker registry operations. Registration is idempotent on id: a repeat
/// rotates the token and refreshes liveness without duplicating the row.
pub struct WorkerService {
    worker_repo: Arc<dyn WorkerRepo>,
    token_ttl: Duration,
}

impl WorkerService {
    pub fn new(worker_repo: Arc<dyn WorkerRepo>, token_ttl: std::time::Duration) -> Self {
        Self {
            worker_repo,
            token_ttl: Duration::from_std(token_ttl).unwrap_or_else(|_| Duration::seconds(90)),
        }
    }

    pub async fn register(
        &self,
        id: Option<WorkerId>,
        name: String,
        capabilities: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<Registration, WorkerError> {
        if name.trim().is_empty() {
            return Err(WorkerError::Validation("Worker name is required".to_string()));
        }

        let id = id.unwrap_or_else(WorkerId::generate);
        let token = TokenSecret::generate();
        let expires_at = now + self.token_ttl;
        let capabilities_text = capabilities.to_string();

        let re_registered = self
            .worker_repo
            .reregister(&id.0, &name, &capabilities_text, &token.value, expires_at, now)
            .await?;

        if !re_registered {
            let record = WorkerRecord {
                id: id.0.clone(),
                name: name.clone(),
                capabilities: capabilities_text,
                status: WorkerStatus::Idle.as_str().to_string(),
                access_token: token.value.clone(),
                access_token_expires_at: expires_at,
                last_seen_at: now,
                builds_completed: 0,
                builds_failed: 0,
                registered_at: now,
            };
            match self.worker_repo.insert(&record).await {
                Ok(()) => {}
                // Raced with a concurrent registration of the same id; fall
                // back to the idempotent path.
                Err(RepoError::UniqueViolation(_)) => {
                    self.worker_repo
                        .reregister(
                            &id.0,
                            &name,
                            &record.capabilities,
                            &token.value,
                            expires_at,
                            now,
                        )
                        .await?;
                }
                Err(other) => return Err(other.into()),
            }
        }

        let worker = self.get(&id).await?;
        info!(worker_id = %id, re_registered, "worker registered");
        Ok(Registration {
            worker,
            re_registered,
        })
    }

    pub async fn get(&self, id: &WorkerId) -> Result<Worker, WorkerError> {
        let record = self
            .worker_repo
            .get(&id.0)
            .await?
            .ok_or_else(|| WorkerError::NotFound(id.clone()))?;
        Worker::try_from(record).map_err(WorkerError::Corrupt)
    }
}
