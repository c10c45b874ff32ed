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

use crate::metrics;
use crate::model::{Build, EventType, Worker};
use crate::repo::build::BuildRepo;
use crate::repo::worker::WorkerRepo;
use crate::repo::RepoError;
use crate::service::event::{EventError, EventService};
use buildmesh_common::model::{BuildId, WorkerId, WorkerStatus};
use buildmesh_common::SafeDisplay;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("corrupt catalog record: {0}")]
    Corrupt(String),
    #[error(transparent)]
    InternalRepoError(#[from] RepoError),
    #[error(transparent)]
    InternalEventError(#[from] EventError),
}

impl SafeDisplay for DispatchError {
    fn to_safe_string(&self) -> String {
        match self {
            DispatchError::Corrupt(_) => "internal error".to_string(),
            DispatchError::InternalRepoError(inner) => inner.to_safe_string(),
            DispatchError::InternalEventError(inner) => inner.to_safe_string(),
        }
    }
}

/// Assignment of pending builds to polling workers. The in-process busy
/// index answers "is this worker holding a build" without a query; the
/// catalog's transactional claim stays authoritative, so a stale index can
/// never cause a double assignment.
pub struct DispatchService {
    build_repo: Arc<dyn BuildRepo>,
    worker_repo: Arc<dyn WorkerRepo>,
    event_service: Arc<EventService>,
    busy: Mutex<HashMap<WorkerId, BuildId>>,
}

impl DispatchService {
    pub fn new(
        build_repo: Arc<dyn BuildRepo>,
        worker_repo: Arc<dyn WorkerRepo>,
        event_service: Arc<EventService>,
    ) -> Self {
        Self {
            build_repo,
            worker_repo,
            event_service,
            busy: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_worker_busy(&self, worker_id: &WorkerId) -> bool {
        self.busy.lock().unwrap().contains_key(worker_id)
    }

    fn bind(&self, worker_id: &WorkerId, build_id: &BuildId) {
        self.busy
            .lock()
            .unwrap()
            .insert(worker_id.clone(), build_id.clone());
    }

    /// Drops the worker from the busy index. Called whenever a build leaves
    /// `{assigned, building}` for any reason.
    pub fn release(&self, worker_id: &WorkerId) {
        self.busy.lock().unwrap().remove(worker_id);
    }

    /// Hands the oldest pending build to `worker`, or the build the worker
    /// already holds if it re-polls mid-build. Returns `None` when the queue
    /// is empty. Concurrent claims are disjoint by construction: the final
    /// transition happens inside a single catalog transaction.
    pub async fn claim(
        &self,
        worker: &Worker,
        now: DateTime<Utc>,
    ) -> Result<Option<Build>, DispatchError> {
        // Fast path on the index; the catalog confirms, since the index may
        // be stale.
        if self.is_worker_busy(&worker.id) {
            match self.build_repo.get_active_by_worker(&worker.id.0).await? {
                Some(active) => {
                    let build = Build::try_from(active).map_err(DispatchError::Corrupt)?;
                    self.bind(&worker.id, &build.id);
                    return Ok(Some(build));
                }
                None => self.release(&worker.id),
            }
        }

        let claimed = match self
            .build_repo
            .claim_next_pending(&worker.id.0, &worker.name, now)
            .await
        {
            Ok(claimed) => claimed,
            // The partial unique index rejected a second active build for
            // this worker: a concurrent claim won and already announced the
            // assignment, so just hand that build back.
            Err(RepoError::UniqueViolation(_)) => {
                let Some(active) = self.build_repo.get_active_by_worker(&worker.id.0).await?
                else {
                    return Ok(None);
                };
                let build = Build::try_from(active).map_err(DispatchError::Corrupt)?;
                self.bind(&worker.id, &build.id);
                return Ok(Some(build));
            }
            Err(other) => return Err(other.into()),
        };

        let Some(record) = claimed else {
            return Ok(None);
        };
        let build = Build::try_from(record).map_err(DispatchError::Corrupt)?;

        self.worker_repo
            .set_status(&worker.id.0, WorkerStatus::Building.as_str())
            .await?;
        self.bind(&worker.id, &build.id);

        self.event_service
            .publish(
                EventType::Assigned,
                Some(&build.id),
                Some(&worker.id),
                json!({
                    "platform": build.platform.as_str(),
                    "worker_name": worker.name,
                }),
            )
            .await?;
        metrics::record_build_assigned();

        info!(build_id = %build.id, worker_id = %worker.id, "assigned build");
        Ok(Some(build))
    }

    /// Rebuilds dispatch state from the catalog after a restart: assigned
    /// builds are re-bound to their workers when those still exist, and reset
    /// to pending otherwise. The pending queue needs no rebuilding; it lives
    /// in the catalog.
    pub async fn restore(&self, now: DateTime<Utc>) -> Result<(), DispatchError> {
        let mut rebound = 0usize;
        let mut requeued = 0usize;

        for record in self.build_repo.list_active().await? {
            let build = Build::try_from(record).map_err(DispatchError::Corrupt)?;
            let Some(worker_id) = &build.worker_id else {
                continue;
            };

            let worker_exists = self.worker_repo.get(&worker_id.0).await?.is_some();
            if worker_exists {
                self.bind(worker_id, &build.id);
                rebound += 1;
            } else {
                self.build_repo.requeue(&build.id.0).await?;
                self.build_repo
                    .append_logs(
                        &build.id.0,
                        &[(
                            now,
                            "info".to_string(),
                            "Re-queued at startup: assigned worker is no longer registered"
                                .to_string(),
                        )],
                    )
                    .await?;
                self.event_service
                    .publish(
                        EventType::Requeued,
                        Some(&build.id),
                        Some(worker_id),
                        json!({"reason": "restore"}),
                    )
                    .await?;
                requeued += 1;
            }
        }

        info!(rebound, requeued, "restored dispatch state from catalog");
        Ok(())
    }
}
