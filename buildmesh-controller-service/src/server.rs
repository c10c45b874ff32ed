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

use buildmesh_common::config::DbConfig;
use buildmesh_common::tracing::init_tracing_with_default_env_filter;
use buildmesh_controller_service::config::{make_config_loader, ControllerServiceConfig};
use buildmesh_controller_service::service::Services;
use buildmesh_controller_service::{api, db, metrics};
use chrono::Utc;
use poem::endpoint::PrometheusExporter;
use poem::listener::TcpListener;
use poem::middleware::Cors;
use poem::EndpointExt;
use tracing::{error, info};

fn main() -> Result<(), std::io::Error> {
    if std::env::args().any(|arg| arg == "--dump-openapi-yaml") {
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?
            .block_on(dump_openapi_yaml())
    } else if let Some(config) = make_config_loader().load_or_dump_config() {
        init_tracing_with_default_env_filter(&config.tracing);
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?
            .block_on(async_main(config))
    } else {
        Ok(())
    }
}

async fn dump_openapi_yaml() -> Result<(), std::io::Error> {
    // A throwaway in-memory setup; nothing is queried while rendering the
    // spec.
    let config = ControllerServiceConfig {
        api_key: "0".repeat(32),
        db: DbConfig::Sqlite(buildmesh_common::config::DbSqliteConfig {
            database: ":memory:".to_string(),
            max_connections: 1,
        }),
        storage_root: std::env::temp_dir().join("buildmesh-openapi-dump"),
        ..ControllerServiceConfig::default()
    };
    let services = Services::new(&config).await.map_err(|e| {
        error!("Services - init error: {}", e);
        std::io::Error::other(e)
    })?;
    let open_api_service = api::make_open_api_service(&services);
    println!("{}", open_api_service.spec_yaml());
    Ok(())
}

async fn async_main(config: ControllerServiceConfig) -> Result<(), std::io::Error> {
    let prometheus_registry = metrics::register_all();

    match config.resolved_db().map_err(std::io::Error::other)? {
        DbConfig::Postgres(db_config) => db::postgres_migrate(&db_config).await.map_err(|e| {
            error!("DB - init error: {}", e);
            std::io::Error::other(format!("Init error: {e:?}"))
        })?,
        DbConfig::Sqlite(db_config) => db::sqlite_migrate(&db_config).await.map_err(|e| {
            error!("DB - init error: {}", e);
            std::io::Error::other(format!("Init error: {e:?}"))
        })?,
    }

    let services = Services::new(&config).await.map_err(|e| {
        error!("Services - init error: {}", e);
        std::io::Error::other(e)
    })?;

    services
        .dispatch_service
        .restore(Utc::now())
        .await
        .map_err(|e| std::io::Error::other(format!("Dispatch restore failed: {e}")))?;

    let _sweeper = services.liveness_monitor.clone().spawn();

    let cors = Cors::new().allow_origin_regex(&config.cors_origin_regex);
    let app = poem::Route::new()
        .nest("/metrics", PrometheusExporter::new(prometheus_registry))
        .nest("/", api::combined_routes(&services))
        .with(cors);

    info!("Starting controller on port {}", config.http_port);
    poem::Server::new(TcpListener::bind(format!("0.0.0.0:{}", config.http_port)))
        .run(app)
        .await
}
