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

use crate::api::{ApiError, ApiTags};
use crate::service::Services;
use buildmesh_common::model::{BuildStatus, WorkerStatus};
use poem_openapi::payload::Json;
use poem_openapi::{Object, OpenApi};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Object)]
pub struct QueueHealth {
    pub pending: i64,
    pub active: i64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Object)]
pub struct StorageHealth {
    pub available: bool,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Object)]
pub struct HealthResponse {
    pub status: String,
    pub queue: QueueHealth,
    pub storage: StorageHealth,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Object)]
pub struct BuildStats {
    pub total: i64,
    pub pending: i64,
    pub assigned: i64,
    pub building: i64,
    pub completed: i64,
    pub failed: i64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Object)]
pub struct WorkerStats {
    pub total: i64,
    pub idle: i64,
    pub building: i64,
    pub offline: i64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Object)]
pub struct StatsResponse {
    pub builds: BuildStats,
    pub workers: WorkerStats,
    pub builds_completed_total: i64,
    pub builds_failed_total: i64,
}

type Result<T> = std::result::Result<T, ApiError>;

pub struct HealthcheckApi {
    services: Services,
}

#[OpenApi(prefix_path = "/", tag = ApiTags::HealthCheck)]
impl HealthcheckApi {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    /// Anonymous liveness probe with queue depth and storage state.
    #[oai(path = "/health", method = "get", operation_id = "health")]
    async fn health(&self) -> Result<Json<HealthResponse>> {
        let counts = self.services.build_service.build_status_counts().await?;
        let count = |status: BuildStatus| counts.get(status.as_str()).copied().unwrap_or(0);

        Ok(Json(HealthResponse {
            status: "ok".to_string(),
            queue: QueueHealth {
                pending: count(BuildStatus::Pending),
                active: count(BuildStatus::Assigned) + count(BuildStatus::Building),
            },
            storage: StorageHealth {
                available: self.services.object_store.available().await,
            },
        }))
    }

    /// Anonymous aggregate counters for public dashboards.
    #[oai(path = "/api/stats", method = "get", operation_id = "stats")]
    async fn stats(&self) -> Result<Json<StatsResponse>> {
        let build_counts = self.services.build_service.build_status_counts().await?;
        let worker_counts = self.services.build_service.worker_status_counts().await?;
        let (completed_total, failed_total) = self
            .services
            .build_service
            .worker_counter_totals()
            .await?;

        let build = |status: BuildStatus| build_counts.get(status.as_str()).copied().unwrap_or(0);
        let worker =
            |status: WorkerStatus| worker_counts.get(status.as_str()).copied().unwrap_or(0);

        Ok(Json(StatsResponse {
            builds: BuildStats {
                total: build_counts.values().sum(),
                pending: build(BuildStatus::Pending),
                assigned: build(BuildStatus::Assigned),
                building: build(BuildStatus::Building),
                completed: build(BuildStatus::Completed),
                failed: build(BuildStatus::Failed),
            },
            workers: WorkerStats {
                total: worker_counts.values().sum(),
                idle: worker(WorkerStatus::Idle),
                building: worker(WorkerStatus::Building),
                offline: worker(WorkerStatus::Offline),
            },
            builds_completed_total: completed_total,
            builds_failed_total: failed_total,
        }))
    }
}
