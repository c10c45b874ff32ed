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

use buildmesh_common::config::{DbPostgresConfig, DbSqliteConfig};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{ConnectOptions, Connection, PgConnection, Pool, Postgres, Sqlite};
use std::error::Error;
use std::time::Duration;
use tracing::info;

fn pg_connect_options(config: &DbPostgresConfig) -> PgConnectOptions {
    PgConnectOptions::new()
        .host(config.host.as_str())
        .port(config.port)
        .database(config.database.as_str())
        .username(config.username.as_str())
        .password(config.password.as_str())
}

fn sqlite_connect_options(config: &DbSqliteConfig) -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        .filename(std::path::Path::new(config.database.as_str()))
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(30))
}

pub async fn create_postgres_pool(
    config: &DbPostgresConfig,
) -> Result<Pool<Postgres>, Box<dyn Error>> {
    info!(
        "DB pool: postgresql://{}:{}/{}",
        config.host, config.port, config.database
    );
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(pg_connect_options(config))
        .await
        .map_err(|e| e.into())
}

pub async fn postgres_migrate(config: &DbPostgresConfig) -> Result<(), Box<dyn Error>> {
    info!(
        "DB migration: postgresql://{}:{}/{}",
        config.host, config.port, config.database
    );
    let mut conn = PgConnection::connect_with(&pg_connect_options(config)).await?;
    sqlx::migrate!("./db/migration/postgres")
        .run(&mut conn)
        .await?;
    let _ = conn.close().await;
    Ok(())
}

pub async fn create_sqlite_pool(config: &DbSqliteConfig) -> Result<Pool<Sqlite>, Box<dyn Error>> {
    info!("DB pool: sqlite://{}", config.database);
    SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(sqlite_connect_options(config))
        .await
        .map_err(|e| e.into())
}

pub async fn sqlite_migrate(config: &DbSqliteConfig) -> Result<(), Box<dyn Error>> {
    info!("DB migration: sqlite://{}", config.database);
    let mut conn = sqlite_connect_options(config).connect().await?;
    sqlx::migrate!("./db/migration/sqlite")
        .run(&mut conn)
        .await?;
    let _ = conn.close().await;
    Ok(())
}
