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
use crate::model::{Build, EventType};
use crate::repo::build::BuildRepo;
use crate::repo::worker::WorkerRepo;
use crate::repo::RepoError;
use crate::service::dispatch::DispatchService;
use crate::service::event::{EventError, EventService};
use buildmesh_common::model::WorkerStatus;
use buildmesh_common::SafeDisplay;
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum LivenessError {
    #[error("corrupt catalog record: {0}")]
    Corrupt(String),
    #[error(transparent)]
    InternalRepoError(#[from] RepoError),
    #[error(transparent)]
    InternalEventError(#[from] EventError),
}

impl SafeDisplay for LivenessError {
    fn to_safe_string(&self) -> String {
        "internal error".to_string()
    }
}

/// What one sweep did, for logs and tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub requeued_builds: usize,
    pub expired_workers: usize,
    pub stale_workers: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == SweepReport::default()
    }
}

/// Periodic sweep over active builds and registered workers: heartbeat
/// timeouts return builds to the pending queue, expired or unseen workers
/// are demoted to offline. This is the only component that moves a build
/// backwards in its lifecycle.
pub struct LivenessMonitor {
    build_repo: Arc<dyn BuildRepo>,
    worker_repo: Arc<dyn WorkerRepo>,
    event_service: Arc<EventService>,
    dispatch_service: Arc<DispatchService>,
    build_timeout: Duration,
    stale_threshold: Duration,
    sweep_interval: std::time::Duration,
}

impl LivenessMonitor {
    pub fn new(
        build_repo: Arc<dyn BuildRepo>,
        worker_repo: Arc<dyn WorkerRepo>,
        event_service: Arc<EventService>,
        dispatch_service: Arc<DispatchService>,
        build_timeout: std::time::Duration,
        stale_threshold: std::time::Duration,
        sweep_interval: std::time::Duration,
    ) -> Self {
        Self {
            build_repo,
            worker_repo,
            event_service,
            dispatch_service,
            build_timeout: Duration::from_std(build_timeout)
                .unwrap_or_else(|_| Duration::seconds(120)),
            stale_threshold: Duration::from_std(stale_threshold)
                .unwrap_or_else(|_| Duration::seconds(120)),
            sweep_interval,
        }
    }

    /// Runs sweeps until the task is aborted (process shutdown).
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.sweep_once(Utc::now()).await {
                    Ok(report) if !report.is_empty() => {
                        info!(
                            requeued = report.requeued_builds,
                            expired = report.expired_workers,
                            stale = report.stale_workers,
                            "liveness sweep"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!("liveness sweep failed: {e}"),
                }
            }
        })
    }

    /// One full sweep at instant `now`. Exposed separately so tests can run
    /// sweeps against injected clocks without waiting on the ticker.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport, LivenessError> {
        let mut report = SweepReport::default();

        // 1. Builds whose worker stopped responding go back to the queue
        //    head; their submission timestamp keeps their original order.
        let cutoff = now - self.build_timeout;
        for record in self.build_repo.list_heartbeat_expired(cutoff).await? {
            let build = Build::try_from(record).map_err(LivenessError::Corrupt)?;
            let Some(worker_id) = build.worker_id.clone() else {
                continue;
            };

            if !self.build_repo.requeue(&build.id.0).await? {
                // Raced with a completion or cancellation; nothing to do.
                continue;
            }

            self.build_repo
                .append_logs(
                    &build.id.0,
                    &[(
                        now,
                        "error".to_string(),
                        "Build requeued: worker stopped responding".to_string(),
                    )],
                )
                .await?;
            self.worker_repo
                .set_status(&worker_id.0, WorkerStatus::Offline.as_str())
                .await?;
            self.dispatch_service.release(&worker_id);
            self.event_service
                .publish(
                    EventType::Requeued,
                    Some(&build.id),
                    Some(&worker_id),
                    json!({"reason": "heartbeat-timeout"}),
                )
                .await?;
            metrics::record_build_requeued();

            warn!(
                build_id = %build.id,
                worker_id = %worker_id,
                "worker stopped responding, build requeued"
            );
            report.requeued_builds += 1;
        }

        // 2. Workers with expired tokens are demoted; any build they still
        //    hold falls into case (1) on a later sweep.
        for worker in self.worker_repo.list_token_expired(now).await? {
            self.worker_repo
                .set_status(&worker.id, WorkerStatus::Offline.as_str())
                .await?;
            warn!(worker_id = %worker.id, "worker token expired, marked offline");
            report.expired_workers += 1;
        }

        // 3. Workers unseen past the stale threshold.
        let stale_cutoff = now - self.stale_threshold;
        for worker in self.worker_repo.list_stale(stale_cutoff).await? {
            self.worker_repo
                .set_status(&worker.id, WorkerStatus::Offline.as_str())
                .await?;
            warn!(worker_id = %worker.id, "worker unseen past stale threshold, marked offline");
            report.stale_workers += 1;
        }

        Ok(report)
    }
}
