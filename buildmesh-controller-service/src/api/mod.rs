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

pub mod build;
pub mod healthcheck;
pub mod transfer;
pub mod worker;

use crate::service::auth::AuthError;
use crate::service::build::BuildError;
use crate::service::dispatch::DispatchError;
use crate::service::event::EventError;
use crate::service::worker::WorkerError;
use crate::service::Services;
use crate::storage::StorageError;
use buildmesh_common::SafeDisplay;
use poem::{EndpointExt, Route};
use poem_openapi::payload::Json;
use poem_openapi::{ApiResponse, Object, OpenApiService, Tags};

#[derive(Tags)]
enum ApiTags {
    Build,
    Worker,
    HealthCheck,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Object)]
pub struct ErrorBody {
    pub error: String,
}

/// Validation failures carry the individual findings alongside the summary.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Object)]
pub struct ErrorsBody {
    pub error: String,
    pub details: Vec<String>,
}

#[derive(ApiResponse, Debug, Clone)]
pub enum ApiError {
    /// Invalid request
    #[oai(status = 400)]
    BadRequest(Json<ErrorsBody>),
    /// Missing or invalid credentials
    #[oai(status = 401)]
    Unauthorized(Json<ErrorBody>),
    /// Credentials do not cover this operation
    #[oai(status = 403)]
    Forbidden(Json<ErrorBody>),
    /// Entity not found
    #[oai(status = 404)]
    NotFound(Json<ErrorBody>),
    /// Byte cap exceeded
    #[oai(status = 413)]
    PayloadTooLarge(Json<ErrorBody>),
    /// Transient contention, retry later
    #[oai(status = 503)]
    Unavailable(Json<ErrorBody>),
    /// Internal server error
    #[oai(status = 500)]
    InternalError(Json<ErrorBody>),
}

impl ApiError {
    pub fn bad_request(error: impl Into<String>) -> Self {
        ApiError::BadRequest(Json(ErrorsBody {
            error: error.into(),
            details: Vec::new(),
        }))
    }

    pub fn validation(error: impl Into<String>, details: Vec<String>) -> Self {
        ApiError::BadRequest(Json(ErrorsBody {
            error: error.into(),
            details,
        }))
    }

    pub fn not_found(error: impl Into<String>) -> Self {
        ApiError::NotFound(Json(ErrorBody {
            error: error.into(),
        }))
    }

    pub fn internal(error: impl SafeDisplay) -> Self {
        ApiError::InternalError(Json(ErrorBody {
            error: error.to_safe_string(),
        }))
    }
}

impl From<AuthError> for ApiError {
    fn from(value: AuthError) -> Self {
        match &value {
            AuthError::MissingCredentials
            | AuthError::InvalidApiKey
            | AuthError::InvalidBuildToken
            | AuthError::UnknownWorker
            | AuthError::InvalidWorkerToken
            | AuthError::WorkerTokenExpired => ApiError::Unauthorized(Json(ErrorBody {
                error: value.to_safe_string(),
            })),
            AuthError::ScopeMismatch
            | AuthError::WorkerBuildMismatch
            | AuthError::BuildIdHeaderMismatch => ApiError::Forbidden(Json(ErrorBody {
                error: value.to_safe_string(),
            })),
            AuthError::Internal(_) | AuthError::InternalRepoError(_) => ApiError::internal(value),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(value: StorageError) -> Self {
        match &value {
            StorageError::PayloadTooLarge { .. } => ApiError::PayloadTooLarge(Json(ErrorBody {
                error: value.to_safe_string(),
            })),
            StorageError::NotFound(_) => ApiError::not_found(value.to_safe_string()),
            StorageError::Security(_) => ApiError::Forbidden(Json(ErrorBody {
                error: value.to_safe_string(),
            })),
            StorageError::Io(_) => ApiError::internal(value),
        }
    }
}

impl From<BuildError> for ApiError {
    fn from(value: BuildError) -> Self {
        match value {
            BuildError::NotFound(_) | BuildError::CertsNotFound => {
                ApiError::not_found(value.to_safe_string())
            }
            BuildError::NotCompleted
            | BuildError::AlreadyFinished
            | BuildError::SourceMissing
            | BuildError::Validation(_)
            | BuildError::StateConflict(_) => ApiError::bad_request(value.to_safe_string()),
            BuildError::Contention => ApiError::Unavailable(Json(ErrorBody {
                error: value.to_safe_string(),
            })),
            BuildError::InternalStorageError(inner) => inner.into(),
            BuildError::InternalEventError(inner) => inner.into(),
            BuildError::Corrupt(_) | BuildError::InternalRepoError(_) => ApiError::internal(value),
        }
    }
}

impl From<WorkerError> for ApiError {
    fn from(value: WorkerError) -> Self {
        match &value {
            WorkerError::NotFound(_) => ApiError::not_found(value.to_safe_string()),
            WorkerError::Validation(_) => ApiError::bad_request(value.to_safe_string()),
            WorkerError::Corrupt(_) | WorkerError::InternalRepoError(_) => {
                ApiError::internal(value)
            }
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(value: DispatchError) -> Self {
        ApiError::internal(value)
    }
}

impl From<EventError> for ApiError {
    fn from(value: EventError) -> Self {
        match &value {
            EventError::Contention => ApiError::Unavailable(Json(ErrorBody {
                error: value.to_safe_string(),
            })),
            _ => ApiError::internal(value),
        }
    }
}

type ApiServices = (
    build::BuildApi,
    worker::WorkerApi,
    healthcheck::HealthcheckApi,
);

pub fn make_open_api_service(services: &Services) -> OpenApiService<ApiServices, ()> {
    OpenApiService::new(
        (
            build::BuildApi::new(services.clone()),
            worker::WorkerApi::new(services.clone()),
            healthcheck::HealthcheckApi::new(services.clone()),
        ),
        "Buildmesh Controller API",
        crate::VERSION,
    )
}

/// The full HTTP surface: the OpenAPI JSON endpoints plus the raw streaming
/// routes that must not buffer their payloads.
pub fn combined_routes(services: &Services) -> impl poem::Endpoint {
    let api_service = make_open_api_service(services);
    let ui = api_service.swagger_ui();
    let spec = api_service.spec_endpoint_yaml();

    Route::new()
        .at("/api/builds/submit", poem::post(transfer::submit_build))
        .at("/api/workers/upload", poem::post(transfer::upload_result))
        .at(
            "/api/builds/:build_id/download",
            poem::get(transfer::download_result),
        )
        .at(
            "/api/builds/:build_id/source",
            poem::get(transfer::download_source),
        )
        .at(
            "/api/builds/:build_id/certs",
            poem::get(transfer::download_certs),
        )
        .nest("/", api_service)
        .nest("/docs", ui)
        .nest("/specs", spec)
        .data(services.clone())
}
