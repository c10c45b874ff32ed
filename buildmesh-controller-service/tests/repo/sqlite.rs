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

use crate::common::{self, Deps};
use crate::Tracing;
use assert2::{check, let_assert};
use buildmesh_common::config::DbSqliteConfig;
use buildmesh_controller_service::db;
use buildmesh_controller_service::repo::build::DbBuildRepo;
use buildmesh_controller_service::repo::event::DbEventRepo;
use buildmesh_controller_service::repo::worker::DbWorkerRepo;
use buildmesh_controller_service::service::event::EventService;
use sqlx::{Pool, Sqlite};
use std::sync::Arc;
use test_r::{inherit_test_dep, test};

inherit_test_dep!(Tracing);

// Deps setup ------------------------------------------------------------

pub struct SqliteDb {
    pub pool: Arc<Pool<Sqlite>>,
}

impl SqliteDb {
    pub async fn new() -> Self {
        let db_path = std::env::temp_dir().join(format!("buildmesh-repo-{}.db", nanoid::nanoid!(8)));
        let db_config = DbSqliteConfig {
            database: db_path.to_string_lossy().to_string(),
            max_connections: 8,
        };

        db::sqlite_migrate(&db_config).await.unwrap();
        let pool = db::create_sqlite_pool(&db_config).await.unwrap();
        Self {
            pool: Arc::new(pool),
        }
    }
}

async fn fresh_deps() -> (SqliteDb, Deps) {
    let db = SqliteDb::new().await;
    let deps = Deps {
        build_repo: Arc::new(DbBuildRepo::new(db.pool.clone())),
        worker_repo: Arc::new(DbWorkerRepo::new(db.pool.clone())),
        event_repo: Arc::new(DbEventRepo::new(db.pool.clone())),
    };
    (db, deps)
}

// Common cases ----------------------------------------------------------

#[test]
async fn insert_and_get_build(_tracing: &Tracing) {
    let (_db, deps) = fresh_deps().await;
    common::test_insert_and_get_build(&deps).await;
}

#[test]
async fn claim_picks_oldest_pending(_tracing: &Tracing) {
    let (_db, deps) = fresh_deps().await;
    common::test_claim_picks_oldest_pending(&deps).await;
}

#[test]
async fn second_claim_by_same_worker_is_rejected(_tracing: &Tracing) {
    let (_db, deps) = fresh_deps().await;
    common::test_second_claim_by_same_worker_is_rejected(&deps).await;
}

#[test]
async fn concurrent_claims_are_disjoint(_tracing: &Tracing) {
    let (_db, deps) = fresh_deps().await;
    common::test_concurrent_claims_are_disjoint(&deps).await;
}

#[test]
async fn state_transitions_are_guarded(_tracing: &Tracing) {
    let (_db, deps) = fresh_deps().await;
    common::test_state_transitions_are_guarded(&deps).await;
}

#[test]
async fn requeue_clears_worker_binding(_tracing: &Tracing) {
    let (_db, deps) = fresh_deps().await;
    common::test_requeue_clears_worker_binding(&deps).await;
}

#[test]
async fn heartbeat_expiry_listing(_tracing: &Tracing) {
    let (_db, deps) = fresh_deps().await;
    common::test_heartbeat_expiry_listing(&deps).await;
}

#[test]
async fn worker_registration_and_rotation(_tracing: &Tracing) {
    let (_db, deps) = fresh_deps().await;
    common::test_worker_registration_and_rotation(&deps).await;
}

#[test]
async fn worker_sweep_listings(_tracing: &Tracing) {
    let (_db, deps) = fresh_deps().await;
    common::test_worker_sweep_listings(&deps).await;
}

#[test]
async fn event_chain_append_and_verify(_tracing: &Tracing) {
    let (_db, deps) = fresh_deps().await;
    common::test_event_chain_append_and_verify(&deps).await;
}

#[test]
async fn build_counters(_tracing: &Tracing) {
    let (_db, deps) = fresh_deps().await;
    common::test_build_counters(&deps).await;
}

// Sqlite-only: tampering detection needs raw SQL access -----------------

#[test]
async fn tampered_event_breaks_the_chain(_tracing: &Tracing) {
    let (db, deps) = fresh_deps().await;
    let event_service = EventService::new(deps.event_repo.clone());

    for i in 0..3 {
        event_service
            .publish(
                buildmesh_controller_service::model::EventType::Submitted,
                None,
                None,
                serde_json::json!({"n": i}),
            )
            .await
            .unwrap();
    }
    check!(event_service.verify_chain().await.unwrap().is_none());

    sqlx::query("UPDATE events SET payload = '{\"n\":99}' WHERE sequence = 2")
        .execute(&*db.pool)
        .await
        .unwrap();

    let_assert!(Some(broken) = event_service.verify_chain().await.unwrap());
    check!(broken == 2);
}
