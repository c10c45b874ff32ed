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

use crate::api::{ApiError, ApiTags, ErrorBody};
use crate::model::{Build, LifecycleEvent};
use crate::service::auth::{
    ensure_build_id_header, CallerSecurityScheme, Credentials, WorkerCaller,
};
use crate::service::build::HeartbeatOutcome;
use crate::service::Services;
use buildmesh_common::model::{BuildId, BuildStatus, LogLevel, Platform, WorkerId};
use chrono::{DateTime, Utc};
use poem_openapi::param::{Header, Path, Query};
use poem_openapi::payload::Json;
use poem_openapi::{Object, OpenApi};
use std::str::FromStr;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Object)]
pub struct BuildStatusResponse {
    pub id: String,
    pub platform: Platform,
    pub status: BuildStatus,
    pub worker_id: Option<String>,
    pub sequence: i64,
    pub submitted_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub has_certs: bool,
    pub has_result: bool,
}

impl From<&Build> for BuildStatusResponse {
    fn from(build: &Build) -> Self {
        Self {
            id: build.id.0.clone(),
            platform: build.platform,
            status: build.status,
            worker_id: build.worker_id.as_ref().map(|id| id.0.clone()),
            sequence: build.sequence,
            submitted_at: build.submitted_at,
            assigned_at: build.assigned_at,
            started_at: build.started_at,
            last_heartbeat_at: build.last_heartbeat_at,
            completed_at: build.completed_at,
            error_message: build.error_message.clone(),
            has_certs: build.certs_ref.is_some(),
            has_result: build.result_ref.is_some(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Object)]
pub struct BuildSubmittedResponse {
    pub id: String,
    pub status: BuildStatus,
    pub submitted_at: DateTime<Utc>,
    pub access_token: String,
}

impl From<&Build> for BuildSubmittedResponse {
    fn from(build: &Build) -> Self {
        Self {
            id: build.id.0.clone(),
            status: build.status,
            submitted_at: build.submitted_at,
            access_token: build.access_token.value.clone(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Object)]
pub struct RetryResponse {
    pub id: String,
    pub status: BuildStatus,
    pub access_token: String,
    pub original_build_id: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Object)]
pub struct LogEntryResponse {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Object)]
pub struct LogsResponse {
    pub logs: Vec<LogEntryResponse>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Object)]
pub struct AppendLogEntry {
    pub level: String,
    pub message: String,
}

/// Either a single `{level, message}` entry or a `{logs: [...]}` batch.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Object)]
pub struct AppendLogsRequest {
    pub level: Option<String>,
    pub message: Option<String>,
    pub logs: Option<Vec<AppendLogEntry>>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Object)]
pub struct HeartbeatRequest {
    pub progress: Option<i64>,
}

/// Worker-facing acknowledgement. `token` is the freshly rotated access
/// token when the caller authenticated as a worker.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Object)]
pub struct WorkerAckResponse {
    pub status: String,
    pub token: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Object)]
pub struct TelemetryRequest {
    #[oai(rename = "type")]
    #[serde(rename = "type")]
    pub kind: Option<String>,
    /// Epoch millis or ISO-8601.
    pub timestamp: Option<serde_json::Value>,
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Object)]
pub struct CertsSecureResponse {
    pub p12: String,
    #[oai(rename = "p12Password")]
    #[serde(rename = "p12Password")]
    pub p12_password: String,
    #[oai(rename = "keychainPassword")]
    #[serde(rename = "keychainPassword")]
    pub keychain_password: String,
    #[oai(rename = "provisioningProfiles")]
    #[serde(rename = "provisioningProfiles")]
    pub provisioning_profiles: Vec<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Object)]
pub struct EventResponse {
    pub sequence: i64,
    pub event_type: String,
    pub build_id: Option<String>,
    pub worker_id: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub previous_hash: String,
    pub event_hash: String,
}

impl From<LifecycleEvent> for EventResponse {
    fn from(event: LifecycleEvent) -> Self {
        Self {
            sequence: event.sequence,
            event_type: event.event_type.as_str().to_string(),
            build_id: event.build_id.map(|id| id.0),
            worker_id: event.worker_id.map(|id| id.0),
            payload: event.payload,
            created_at: event.created_at,
            previous_hash: event.previous_hash,
            event_hash: event.event_hash,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Object)]
pub struct EventsResponse {
    pub events: Vec<EventResponse>,
}

type Result<T> = std::result::Result<T, ApiError>;

pub struct BuildApi {
    services: Services,
}

#[OpenApi(prefix_path = "/api", tag = ApiTags::Build)]
impl BuildApi {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    /// Full build record for the owner or an operator. Never includes the
    /// owner token.
    #[oai(
        path = "/builds/:build_id/status",
        method = "get",
        operation_id = "get_build_status"
    )]
    async fn get_build_status(
        &self,
        build_id: Path<String>,
        auth: CallerSecurityScheme,
    ) -> Result<Json<BuildStatusResponse>> {
        let credentials: Credentials = auth.into();
        let build = self.services.build_service.get(&BuildId(build_id.0)).await?;
        self.services
            .auth_service
            .authorize_build_access(&credentials, &build)?;
        Ok(Json((&build).into()))
    }

    /// Whole build log, oldest first.
    #[oai(
        path = "/builds/:build_id/logs",
        method = "get",
        operation_id = "get_build_logs"
    )]
    async fn get_build_logs(
        &self,
        build_id: Path<String>,
        auth: CallerSecurityScheme,
    ) -> Result<Json<LogsResponse>> {
        let credentials: Credentials = auth.into();
        let build_id = BuildId(build_id.0);
        let build = self.services.build_service.get(&build_id).await?;
        self.services
            .auth_service
            .authorize_build_access(&credentials, &build)?;

        let logs = self
            .services
            .build_service
            .get_logs(&build_id)
            .await?
            .into_iter()
            .map(|entry| LogEntryResponse {
                timestamp: entry.timestamp,
                level: entry.level,
                message: entry.message,
            })
            .collect();
        Ok(Json(LogsResponse { logs }))
    }

    /// Worker log ingestion. A single entry with a bad level is rejected; a
    /// batch is filtered silently.
    #[oai(
        path = "/builds/:build_id/logs",
        method = "post",
        operation_id = "append_build_logs"
    )]
    async fn append_build_logs(
        &self,
        build_id: Path<String>,
        body: Json<AppendLogsRequest>,
        auth: CallerSecurityScheme,
    ) -> Result<Json<WorkerAckResponse>> {
        let credentials: Credentials = auth.into();
        let now = Utc::now();
        let build_id = BuildId(build_id.0);
        let build = self.services.build_service.get(&build_id).await?;

        // Validate before rotating: a 400 must not leave the worker holding
        // a token it was never handed back.
        self.services
            .auth_service
            .authorize_worker_for_build(&credentials, &build, now, false)
            .await?;

        let entries: Vec<(LogLevel, String)> = if let Some(batch) = &body.0.logs {
            batch
                .iter()
                .filter_map(|entry| {
                    LogLevel::from_str(&entry.level)
                        .ok()
                        .map(|level| (level, entry.message.clone()))
                })
                .collect()
        } else {
            let level = body.0.level.as_deref().unwrap_or_default();
            let message = body.0.message.clone().unwrap_or_default();
            let level = LogLevel::from_str(level)
                .map_err(|_| ApiError::bad_request(format!("Invalid log level: {level}")))?;
            if message.is_empty() {
                return Err(ApiError::bad_request("Log message is required"));
            }
            vec![(level, message)]
        };

        self.services
            .build_service
            .append_logs(&build, &entries, now)
            .await?;

        let caller = self
            .services
            .auth_service
            .authorize_worker_scope(&credentials, now, true)
            .await?;
        Ok(Json(WorkerAckResponse {
            status: "ok".to_string(),
            token: caller.rotated_token().map(|t| t.value.clone()),
        }))
    }

    /// Owner/operator cancellation; the worker learns of it on its next
    /// heartbeat.
    #[oai(
        path = "/builds/:build_id/cancel",
        method = "post",
        operation_id = "cancel_build"
    )]
    async fn cancel_build(
        &self,
        build_id: Path<String>,
        auth: CallerSecurityScheme,
    ) -> Result<Json<BuildStatusResponse>> {
        let credentials: Credentials = auth.into();
        let build_id = BuildId(build_id.0);
        let build = self.services.build_service.get(&build_id).await?;
        self.services
            .auth_service
            .authorize_build_access(&credentials, &build)?;

        let cancelled = self
            .services
            .build_service
            .cancel(&build_id, Utc::now())
            .await?;
        Ok(Json((&cancelled).into()))
    }

    /// Creates a fresh build sharing the original's stored source and certs.
    #[oai(
        path = "/builds/:build_id/retry",
        method = "post",
        operation_id = "retry_build"
    )]
    async fn retry_build(
        &self,
        build_id: Path<String>,
        auth: CallerSecurityScheme,
    ) -> Result<Json<RetryResponse>> {
        let credentials: Credentials = auth.into();
        let build_id = BuildId(build_id.0);
        let build = self.services.build_service.get(&build_id).await?;
        self.services
            .auth_service
            .authorize_build_access(&credentials, &build)?;

        let retried = self
            .services
            .build_service
            .retry(&build, Utc::now())
            .await?;
        Ok(Json(RetryResponse {
            id: retried.id.0.clone(),
            status: retried.status,
            access_token: retried.access_token.value.clone(),
            original_build_id: build_id.0,
        }))
    }

    /// Builds currently held by workers.
    #[oai(path = "/builds/active", method = "get", operation_id = "get_active_builds")]
    async fn get_active_builds(
        &self,
        auth: CallerSecurityScheme,
    ) -> Result<Json<Vec<BuildStatusResponse>>> {
        let credentials: Credentials = auth.into();
        self.services.auth_service.authorize_admin(&credentials)?;

        let builds = self.services.build_service.list_active().await?;
        Ok(Json(builds.iter().map(|build| build.into()).collect()))
    }

    /// Worker liveness beat. The `status` field tells the worker whether to
    /// keep going (`ok`), tear down (`cancelled`), or treat the build as
    /// gone (`unknown`).
    #[oai(
        path = "/builds/:build_id/heartbeat",
        method = "post",
        operation_id = "heartbeat"
    )]
    async fn heartbeat(
        &self,
        build_id: Path<String>,
        worker_id: Query<Option<String>>,
        body: Json<HeartbeatRequest>,
        auth: CallerSecurityScheme,
    ) -> Result<Json<WorkerAckResponse>> {
        let credentials: Credentials = auth.into();
        let now = Utc::now();
        let build_id = BuildId(build_id.0);

        let caller = self
            .services
            .auth_service
            .authorize_worker_scope(&credentials, now, true)
            .await?;

        let effective_worker = match &caller {
            WorkerCaller::Worker(auth) => {
                if let Some(query_id) = &worker_id.0 {
                    if query_id != &auth.worker.id.0 {
                        return Err(ApiError::Forbidden(Json(ErrorBody {
                            error: "worker_id does not match the presented credentials"
                                .to_string(),
                        })));
                    }
                }
                Some(auth.worker.id.clone())
            }
            WorkerCaller::Admin => worker_id.0.clone().map(WorkerId),
        };

        let outcome = self
            .services
            .build_service
            .heartbeat(&build_id, effective_worker.as_ref(), body.0.progress, now)
            .await?;

        let status = match outcome {
            HeartbeatOutcome::Ok => "ok",
            HeartbeatOutcome::Cancelled => "cancelled",
            HeartbeatOutcome::Unknown => "unknown",
        };
        Ok(Json(WorkerAckResponse {
            status: status.to_string(),
            token: caller.rotated_token().map(|t| t.value.clone()),
        }))
    }

    /// Best-effort worker telemetry; any accepted shape also counts as a
    /// heartbeat. Requires the `X-Build-Id` header to match the path.
    #[oai(
        path = "/builds/:build_id/telemetry",
        method = "post",
        operation_id = "record_telemetry"
    )]
    async fn record_telemetry(
        &self,
        build_id: Path<String>,
        #[oai(name = "X-Build-Id")] build_id_header: Header<Option<String>>,
        body: Json<TelemetryRequest>,
        auth: CallerSecurityScheme,
    ) -> Result<Json<WorkerAckResponse>> {
        let credentials: Credentials = auth.into();
        let now = Utc::now();
        let build_id = BuildId(build_id.0);

        ensure_build_id_header(
            build_id_header.0.map(BuildId).as_ref(),
            &build_id,
        )?;

        let build = self.services.build_service.get(&build_id).await?;
        let caller = self
            .services
            .auth_service
            .authorize_worker_for_build(&credentials, &build, now, true)
            .await?;

        let worker_id = match &caller {
            WorkerCaller::Worker(auth) => Some(auth.worker.id.clone()),
            WorkerCaller::Admin => build.worker_id.clone(),
        };

        if let Some(worker_id) = worker_id {
            let sample = parse_telemetry(&body.0);
            self.services
                .build_service
                .record_telemetry(&build, &worker_id, &sample, now)
                .await?;
        }

        Ok(Json(WorkerAckResponse {
            status: "ok".to_string(),
            token: caller.rotated_token().map(|t| t.value.clone()),
        }))
    }

    /// Signing material for the bound worker. The URL build id must be
    /// repeated in the `X-Build-Id` header; a mismatch is a security event.
    #[oai(
        path = "/builds/:build_id/certs-secure",
        method = "get",
        operation_id = "get_secure_certs"
    )]
    async fn get_secure_certs(
        &self,
        build_id: Path<String>,
        #[oai(name = "X-Build-Id")] build_id_header: Header<Option<String>>,
        auth: CallerSecurityScheme,
    ) -> Result<Json<CertsSecureResponse>> {
        let credentials: Credentials = auth.into();
        let now = Utc::now();
        let build_id = BuildId(build_id.0);

        ensure_build_id_header(
            build_id_header.0.map(BuildId).as_ref(),
            &build_id,
        )?;

        let build = self.services.build_service.get(&build_id).await?;
        self.services
            .auth_service
            .authorize_worker_for_build(&credentials, &build, now, false)
            .await?;

        let bundle = self.services.build_service.secure_certs(&build).await?;
        Ok(Json(CertsSecureResponse {
            p12: bundle.p12,
            p12_password: bundle.p12_password,
            keychain_password: bundle.keychain_password,
            provisioning_profiles: bundle.provisioning_profiles,
        }))
    }

    /// Hash-chained lifecycle events for audit viewers.
    #[oai(path = "/events", method = "get", operation_id = "get_events")]
    async fn get_events(
        &self,
        after: Query<Option<i64>>,
        limit: Query<Option<i64>>,
        auth: CallerSecurityScheme,
    ) -> Result<Json<EventsResponse>> {
        let credentials: Credentials = auth.into();
        self.services.auth_service.authorize_admin(&credentials)?;

        let limit = limit.0.unwrap_or(100).clamp(1, 1000);
        let events = self
            .services
            .event_service
            .list_after(after.0.unwrap_or(0), limit)
            .await?;
        Ok(Json(EventsResponse {
            events: events.into_iter().map(Into::into).collect(),
        }))
    }
}

fn parse_telemetry(request: &TelemetryRequest) -> crate::service::build::TelemetrySample {
    let data = request.data.as_ref();
    let number = |key: &str| data.and_then(|d| d.get(key)).and_then(|v| v.as_f64());
    crate::service::build::TelemetrySample {
        timestamp: request
            .timestamp
            .as_ref()
            .and_then(buildmesh_common::model::flexible_timestamp::parse_value),
        cpu_percent: number("cpu_percent"),
        memory_mb: number("memory_mb"),
    }
}
