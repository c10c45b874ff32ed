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
use crate::service::auth::{CallerSecurityScheme, Credentials, WorkerCaller};
use crate::service::Services;
use buildmesh_common::model::{Platform, WorkerId};
use chrono::{DateTime, Utc};
use poem_openapi::param::Query;
use poem_openapi::payload::Json;
use poem_openapi::{Object, OpenApi};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Object)]
pub struct RegisterWorkerRequest {
    pub id: Option<String>,
    pub name: String,
    pub capabilities: Option<serde_json::Value>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Object)]
pub struct RegisterWorkerResponse {
    pub id: String,
    pub status: String,
    pub access_token: String,
    pub access_token_expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Object)]
pub struct JobInfo {
    pub id: String,
    pub platform: Platform,
    pub source_url: String,
    pub certs_url: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, Object)]
pub struct PollResponse {
    pub job: Option<JobInfo>,
    pub token: Option<String>,
}

type Result<T> = std::result::Result<T, ApiError>;

pub struct WorkerApi {
    services: Services,
}

#[OpenApi(prefix_path = "/api/workers", tag = ApiTags::Worker)]
impl WorkerApi {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    /// Registers a worker (operator action). Idempotent on id: a repeat
    /// rotates the access token and refreshes liveness without duplicating
    /// the row.
    #[oai(path = "/register", method = "post", operation_id = "register_worker")]
    async fn register_worker(
        &self,
        body: Json<RegisterWorkerRequest>,
        auth: CallerSecurityScheme,
    ) -> Result<Json<RegisterWorkerResponse>> {
        let credentials: Credentials = auth.into();
        self.services.auth_service.authorize_admin(&credentials)?;

        let registration = self
            .services
            .worker_service
            .register(
                body.0.id.map(WorkerId),
                body.0.name,
                body.0
                    .capabilities
                    .unwrap_or_else(|| serde_json::json!({})),
                Utc::now(),
            )
            .await?;

        let status = if registration.re_registered {
            "re-registered"
        } else {
            "registered"
        };
        Ok(Json(RegisterWorkerResponse {
            id: registration.worker.id.0.clone(),
            status: status.to_string(),
            access_token: registration.worker.access_token.value.clone(),
            access_token_expires_at: registration.worker.access_token_expires_at,
        }))
    }

    /// Claims the oldest pending build for the polling worker, or returns
    /// `job: null`. Every worker-authenticated poll rotates the access token;
    /// the previous token is invalid as soon as this responds.
    #[oai(path = "/poll", method = "get", operation_id = "poll_for_build")]
    async fn poll_for_build(
        &self,
        worker_id: Query<Option<String>>,
        auth: CallerSecurityScheme,
    ) -> Result<Json<PollResponse>> {
        let credentials: Credentials = auth.into();
        let now = Utc::now();

        let caller = self
            .services
            .auth_service
            .authorize_worker_scope(&credentials, now, true)
            .await?;

        let worker = match &caller {
            WorkerCaller::Worker(auth) => {
                if let Some(query_id) = &worker_id.0 {
                    if query_id != &auth.worker.id.0 {
                        return Err(ApiError::Forbidden(Json(ErrorBody {
                            error: "worker_id does not match the presented credentials"
                                .to_string(),
                        })));
                    }
                }
                auth.worker.clone()
            }
            WorkerCaller::Admin => {
                let id = worker_id.0.clone().ok_or_else(|| {
                    ApiError::bad_request("worker_id query parameter is required")
                })?;
                self.services.worker_service.get(&WorkerId(id)).await?
            }
        };

        let job = self
            .services
            .dispatch_service
            .claim(&worker, now)
            .await?
            .map(|build| JobInfo {
                id: build.id.0.clone(),
                platform: build.platform,
                source_url: format!("/api/builds/{}/source", build.id),
                certs_url: build
                    .certs_ref
                    .as_ref()
                    .map(|_| format!("/api/builds/{}/certs", build.id)),
            });

        Ok(Json(PollResponse {
            job,
            token: caller.rotated_token().map(|t| t.value.clone()),
        }))
    }
}
