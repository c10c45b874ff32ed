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

pub mod auth;
pub mod build;
pub mod dispatch;
pub mod event;
pub mod liveness;
pub mod worker;

use crate::config::ControllerServiceConfig;
use crate::db;
use crate::repo::build::{BuildRepo, DbBuildRepo};
use crate::repo::event::{DbEventRepo, EventRepo};
use crate::repo::worker::{DbWorkerRepo, WorkerRepo};
use crate::service::auth::AuthService;
use crate::service::build::BuildService;
use crate::service::dispatch::DispatchService;
use crate::service::event::EventService;
use crate::service::liveness::LivenessMonitor;
use crate::service::worker::WorkerService;
use crate::storage::fs::FileSystemObjectStore;
use crate::storage::ObjectStore;
use buildmesh_common::config::DbConfig;
use buildmesh_common::model::TokenSecret;
use std::sync::Arc;

#[derive(Clone)]
pub struct Services {
    pub auth_service: Arc<AuthService>,
    pub build_service: Arc<BuildService>,
    pub dispatch_service: Arc<DispatchService>,
    pub event_service: Arc<EventService>,
    pub liveness_monitor: Arc<LivenessMonitor>,
    pub worker_service: Arc<WorkerService>,
    pub object_store: Arc<dyn ObjectStore>,
    pub config: Arc<ControllerServiceConfig>,
}

impl Services {
    pub async fn new(config: &ControllerServiceConfig) -> Result<Services, String> {
        config.validate()?;

        let object_store: Arc<dyn ObjectStore> = Arc::new(
            FileSystemObjectStore::new(&config.storage_root)
                .await
                .map_err(|e| format!("Failed to initialize object store: {e}"))?,
        );

        let (build_repo, worker_repo, event_repo): (
            Arc<dyn BuildRepo>,
            Arc<dyn WorkerRepo>,
            Arc<dyn EventRepo>,
        ) = match config.resolved_db()? {
            DbConfig::Postgres(db_config) => {
                let pool = Arc::new(
                    db::create_postgres_pool(&db_config)
                        .await
                        .map_err(|e| format!("Failed to create postgres pool: {e}"))?,
                );
                (
                    Arc::new(DbBuildRepo::new(pool.clone())),
                    Arc::new(DbWorkerRepo::new(pool.clone())),
                    Arc::new(DbEventRepo::new(pool)),
                )
            }
            DbConfig::Sqlite(db_config) => {
                let pool = Arc::new(
                    db::create_sqlite_pool(&db_config)
                        .await
                        .map_err(|e| format!("Failed to create sqlite pool: {e}"))?,
                );
                (
                    Arc::new(DbBuildRepo::new(pool.clone())),
                    Arc::new(DbWorkerRepo::new(pool.clone())),
                    Arc::new(DbEventRepo::new(pool)),
                )
            }
        };

        let event_service = Arc::new(EventService::new(event_repo));
        let dispatch_service = Arc::new(DispatchService::new(
            build_repo.clone(),
            worker_repo.clone(),
            event_service.clone(),
        ));
        let build_service = Arc::new(BuildService::new(
            build_repo.clone(),
            worker_repo.clone(),
            object_store.clone(),
            event_service.clone(),
            dispatch_service.clone(),
        ));
        let auth_service = Arc::new(AuthService::new(
            worker_repo.clone(),
            TokenSecret::new(config.api_key.clone()),
            config.worker_token_ttl(),
        ));
        let worker_service = Arc::new(WorkerService::new(
            worker_repo.clone(),
            config.worker_token_ttl(),
        ));
        let liveness_monitor = Arc::new(LivenessMonitor::new(
            build_repo,
            worker_repo,
            event_service.clone(),
            dispatch_service.clone(),
            config.build_heartbeat_timeout(),
            config.worker_stale_timeout(),
            config.sweep_interval(),
        ));

        Ok(Services {
            auth_service,
            build_service,
            dispatch_service,
            event_service,
            liveness_monitor,
            worker_service,
            object_store,
            config: Arc::new(config.clone()),
        })
    }
}
