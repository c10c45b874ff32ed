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

use buildmesh_common::config::{ConfigLoader, DbConfig};
use buildmesh_common::tracing::TracingConfig;
use buildmesh_common::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::PathBuf;
use std::time::Duration;

/// The admin pre-shared key must be at least this long.
pub const MIN_API_KEY_LENGTH: usize = 32;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ControllerServiceConfig {
    pub tracing: TracingConfig,
    pub environment: String,
    pub http_port: u16,
    pub db: DbConfig,
    /// Flat `DATABASE_URL` override; takes precedence over `db` when set.
    pub database_url: Option<String>,
    pub storage_root: PathBuf,
    /// Admin pre-shared key (`X-API-Key`). Required, minimum 32 characters.
    pub api_key: String,
    pub worker_token_ttl_seconds: u64,
    pub build_heartbeat_timeout_seconds: u64,
    pub worker_stale_timeout_seconds: u64,
    pub sweep_interval_seconds: u64,
    pub limits: UploadLimitsConfig,
    pub cors_origin_regex: String,
}

impl ControllerServiceConfig {
    pub fn resolved_db(&self) -> Result<DbConfig, String> {
        match &self.database_url {
            Some(url) => DbConfig::from_url(url),
            None => Ok(self.db.clone()),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.api_key.len() < MIN_API_KEY_LENGTH {
            return Err(format!(
                "api_key (CONTROLLER_API_KEY) must be at least {MIN_API_KEY_LENGTH} characters"
            ));
        }
        Ok(())
    }

    pub fn worker_token_ttl(&self) -> Duration {
        Duration::from_secs(self.worker_token_ttl_seconds)
    }

    pub fn build_heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.build_heartbeat_timeout_seconds)
    }

    pub fn worker_stale_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_stale_timeout_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }
}

impl Default for ControllerServiceConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("buildmesh-controller"),
            environment: "dev".to_string(),
            http_port: 8080,
            db: DbConfig::default(),
            database_url: None,
            storage_root: PathBuf::from("storage"),
            api_key: String::new(),
            worker_token_ttl_seconds: 90,
            build_heartbeat_timeout_seconds: 120,
            worker_stale_timeout_seconds: 120,
            sweep_interval_seconds: 5,
            limits: UploadLimitsConfig::default(),
            cors_origin_regex: "https://*.buildmesh.dev".to_string(),
        }
    }
}

impl SafeDisplay for ControllerServiceConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "tracing:");
        let _ = writeln!(&mut result, "{}", self.tracing.to_safe_string_indented());
        let _ = writeln!(&mut result, "environment: {}", self.environment);
        let _ = writeln!(&mut result, "HTTP port: {}", self.http_port);
        let _ = writeln!(&mut result, "DB:");
        let _ = writeln!(&mut result, "{}", self.db.to_safe_string_indented());
        let _ = writeln!(&mut result, "storage root: {}", self.storage_root.display());
        let _ = writeln!(&mut result, "API key: ****");
        let _ = writeln!(
            &mut result,
            "worker token TTL: {}s",
            self.worker_token_ttl_seconds
        );
        let _ = writeln!(
            &mut result,
            "build heartbeat timeout: {}s",
            self.build_heartbeat_timeout_seconds
        );
        let _ = writeln!(
            &mut result,
            "worker stale timeout: {}s",
            self.worker_stale_timeout_seconds
        );
        let _ = writeln!(
            &mut result,
            "sweep interval: {}s",
            self.sweep_interval_seconds
        );
        let _ = writeln!(&mut result, "limits:");
        let _ = writeln!(&mut result, "{}", self.limits.to_safe_string_indented());
        let _ = writeln!(&mut result, "CORS origin regex: {}", self.cors_origin_regex);
        result
    }
}

/// Per-endpoint byte caps for streamed uploads.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadLimitsConfig {
    pub max_source_bytes: u64,
    pub max_certs_bytes: u64,
    pub max_result_bytes: u64,
}

impl Default for UploadLimitsConfig {
    fn default() -> Self {
        Self {
            max_source_bytes: 500 * 1024 * 1024,
            max_certs_bytes: 50 * 1024 * 1024,
            max_result_bytes: 2 * 1024 * 1024 * 1024,
        }
    }
}

impl SafeDisplay for UploadLimitsConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "max source bytes: {}", self.max_source_bytes);
        let _ = writeln!(&mut result, "max certs bytes: {}", self.max_certs_bytes);
        let _ = writeln!(&mut result, "max result bytes: {}", self.max_result_bytes);
        result
    }
}

pub fn make_config_loader() -> ConfigLoader<ControllerServiceConfig> {
    ConfigLoader::new(&PathBuf::from("config/controller-service.toml"))
        .with_env_alias("PORT", "http_port")
        .with_env_alias("CONTROLLER_API_KEY", "api_key")
        .with_env_alias("STORAGE_ROOT", "storage_root")
        .with_env_alias("DATABASE_URL", "database_url")
        .with_env_alias("WORKER_TOKEN_TTL_SECONDS", "worker_token_ttl_seconds")
        .with_env_alias(
            "BUILD_HEARTBEAT_TIMEOUT_SECONDS",
            "build_heartbeat_timeout_seconds",
        )
        .with_env_alias("MAX_SOURCE_BYTES", "limits__max_source_bytes")
        .with_env_alias("MAX_CERTS_BYTES", "limits__max_certs_bytes")
        .with_env_alias("MAX_RESULT_BYTES", "limits__max_result_bytes")
}
