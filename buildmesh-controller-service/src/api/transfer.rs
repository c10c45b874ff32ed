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

//! Streaming ingress and egress. These endpoints live outside the OpenAPI
//! surface so that request bodies flow chunk-by-chunk into the object store
//! and responses stream straight out of it; nothing here buffers a payload.

use crate::api::build::{BuildSubmittedResponse, WorkerAckResponse};
use crate::api::ApiError;
use crate::model::Build;
use crate::service::auth::{ensure_worker_owns_build, Credentials, WorkerCaller};
use crate::service::Services;
use crate::storage::{Bucket, ObjectRef};
use buildmesh_common::model::{BuildId, Platform, WorkerId};
use chrono::Utc;
use poem::http::header;
use poem::web::{Data, Json, Multipart, Path};
use poem::{handler, Body, IntoResponse, Response};
use std::str::FromStr;
use tokio::io::AsyncRead;

fn bad_multipart(error: impl std::fmt::Display) -> ApiError {
    ApiError::bad_request(format!("Invalid multipart payload: {error}"))
}

async fn discard_stored(services: &Services, stored: &[ObjectRef]) {
    for object in stored {
        let _ = services.object_store.delete(object).await;
    }
}

fn stream_response(
    reader: Box<dyn AsyncRead + Send + Unpin>,
    len: u64,
    content_type: &str,
    file_name: &str,
) -> Response {
    let stream = tokio_util::io::ReaderStream::new(reader);
    Response::builder()
        .header(header::CONTENT_LENGTH, len.to_string())
        .header(header::CONTENT_TYPE, content_type)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{file_name}\""),
        )
        .body(Body::from_bytes_stream(stream))
}

// --- Submission ---------------------------------------------------------

#[handler]
pub async fn submit_build(
    Data(services): Data<&Services>,
    credentials: Credentials,
    mut multipart: Multipart,
) -> Response {
    submit_build_inner(services, credentials, &mut multipart)
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

async fn submit_build_inner(
    services: &Services,
    credentials: Credentials,
    multipart: &mut Multipart,
) -> Result<Response, ApiError> {
    services.auth_service.authorize_admin(&credentials)?;

    let build_id = BuildId::new();
    let mut stored: Vec<ObjectRef> = Vec::new();

    let parsed = parse_submission(services, &build_id, multipart, &mut stored).await;
    let (platform, source_ref, certs_ref) = match parsed {
        Ok(parsed) => parsed,
        Err(error) => {
            discard_stored(services, &stored).await;
            return Err(error);
        }
    };

    match services
        .build_service
        .submit(build_id, platform, source_ref, certs_ref, Utc::now())
        .await
    {
        Ok(build) => Ok(Json(BuildSubmittedResponse::from(&build)).into_response()),
        Err(error) => {
            discard_stored(services, &stored).await;
            Err(error.into())
        }
    }
}

async fn parse_submission(
    services: &Services,
    build_id: &BuildId,
    multipart: &mut Multipart,
    stored: &mut Vec<ObjectRef>,
) -> Result<(Platform, ObjectRef, Option<ObjectRef>), ApiError> {
    let limits = &services.config.limits;
    let mut platform: Option<Platform> = None;
    let mut source_ref: Option<ObjectRef> = None;
    let mut certs_ref: Option<ObjectRef> = None;

    while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
        match field.name() {
            Some("platform") => {
                let text = field.text().await.map_err(bad_multipart)?;
                platform = Some(Platform::from_str(text.trim()).map_err(ApiError::bad_request)?);
            }
            Some("source") => {
                let reader = field.into_async_read();
                tokio::pin!(reader);
                let object = services
                    .object_store
                    .put(
                        Bucket::Source,
                        &format!("{build_id}.zip"),
                        &mut reader,
                        limits.max_source_bytes,
                    )
                    .await?;
                stored.push(object.clone());
                source_ref = Some(object);
            }
            Some("certs") => {
                let reader = field.into_async_read();
                tokio::pin!(reader);
                let object = services
                    .object_store
                    .put(
                        Bucket::Certs,
                        &format!("{build_id}.zip"),
                        &mut reader,
                        limits.max_certs_bytes,
                    )
                    .await?;
                stored.push(object.clone());
                certs_ref = Some(object);
            }
            _ => {}
        }
    }

    let mut missing = Vec::new();
    if platform.is_none() {
        missing.push("Field platform is required".to_string());
    }
    if source_ref.is_none() {
        missing.push("Field source is required".to_string());
    }
    match (platform, source_ref) {
        (Some(platform), Some(source_ref)) => Ok((platform, source_ref, certs_ref)),
        _ => Err(ApiError::validation("Invalid submission", missing)),
    }
}

// --- Result upload ------------------------------------------------------

#[handler]
pub async fn upload_result(
    Data(services): Data<&Services>,
    credentials: Credentials,
    mut multipart: Multipart,
) -> Response {
    upload_result_inner(services, credentials, &mut multipart)
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

struct UploadFields {
    build: Option<Build>,
    worker_field: Option<String>,
    success: Option<bool>,
    error_message: Option<String>,
    result_ref: Option<ObjectRef>,
}

async fn upload_result_inner(
    services: &Services,
    credentials: Credentials,
    multipart: &mut Multipart,
) -> Result<Response, ApiError> {
    let now = Utc::now();

    // Identity is checked before any bytes are accepted; the token rotation
    // happens only after the upload fully succeeds, so a failed transfer
    // does not strand the worker with a token it never received.
    let caller = services
        .auth_service
        .authorize_worker_scope(&credentials, now, false)
        .await?;

    let mut stored: Vec<ObjectRef> = Vec::new();
    let outcome = parse_upload(services, &caller, multipart, &mut stored).await;

    let fields = match outcome {
        Ok(fields) => fields,
        Err(error) => {
            discard_stored(services, &stored).await;
            return Err(error);
        }
    };

    match finish_upload(services, &caller, fields, now).await {
        Ok(()) => {
            let token = match &caller {
                WorkerCaller::Admin => None,
                WorkerCaller::Worker(_) => {
                    let rotated = services
                        .auth_service
                        .authorize_worker_scope(&credentials, now, true)
                        .await?;
                    rotated.rotated_token().map(|t| t.value.clone())
                }
            };
            Ok(Json(WorkerAckResponse {
                status: "ok".to_string(),
                token,
            })
            .into_response())
        }
        Err(error) => {
            discard_stored(services, &stored).await;
            Err(error)
        }
    }
}

async fn parse_upload(
    services: &Services,
    caller: &WorkerCaller,
    multipart: &mut Multipart,
    stored: &mut Vec<ObjectRef>,
) -> Result<UploadFields, ApiError> {
    let limits = &services.config.limits;
    let mut fields = UploadFields {
        build: None,
        worker_field: None,
        success: None,
        error_message: None,
        result_ref: None,
    };

    while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
        match field.name() {
            Some("build_id") => {
                let id = field.text().await.map_err(bad_multipart)?;
                let build = services
                    .build_service
                    .get(&BuildId(id.trim().to_string()))
                    .await?;
                ensure_worker_owns_build(caller, &build)?;
                fields.build = Some(build);
            }
            Some("worker_id") => {
                fields.worker_field = Some(field.text().await.map_err(bad_multipart)?);
            }
            Some("success") => {
                let text = field.text().await.map_err(bad_multipart)?;
                fields.success = Some(match text.trim() {
                    "true" => true,
                    "false" => false,
                    other => {
                        return Err(ApiError::bad_request(format!(
                            "Invalid success value: {other}"
                        )))
                    }
                });
            }
            Some("error_message") => {
                fields.error_message = Some(field.text().await.map_err(bad_multipart)?);
            }
            Some("result") => {
                let build = fields.build.as_ref().ok_or_else(|| {
                    ApiError::bad_request("Field build_id must precede the result file")
                })?;
                let reader = field.into_async_read();
                tokio::pin!(reader);
                let object = services
                    .object_store
                    .put(
                        Bucket::Result,
                        &format!("{}.{}", build.id, build.platform.result_extension()),
                        &mut reader,
                        limits.max_result_bytes,
                    )
                    .await?;
                stored.push(object.clone());
                fields.result_ref = Some(object);
            }
            _ => {}
        }
    }

    Ok(fields)
}

async fn finish_upload(
    services: &Services,
    caller: &WorkerCaller,
    fields: UploadFields,
    now: chrono::DateTime<Utc>,
) -> Result<(), ApiError> {
    let build = fields
        .build
        .ok_or_else(|| ApiError::bad_request("Field build_id is required"))?;
    let success = fields
        .success
        .ok_or_else(|| ApiError::bad_request("Field success is required"))?;

    if let (Some(worker_field), WorkerCaller::Worker(auth)) = (&fields.worker_field, caller) {
        if worker_field.trim() != auth.worker.id.0 {
            return Err(ApiError::bad_request(
                "Field worker_id does not match the presented credentials",
            ));
        }
    }

    let reporting_worker = match caller {
        WorkerCaller::Worker(auth) => auth.worker.id.clone(),
        WorkerCaller::Admin => build
            .worker_id
            .clone()
            .or_else(|| fields.worker_field.clone().map(WorkerId))
            .ok_or_else(|| ApiError::bad_request("Field worker_id is required"))?,
    };

    if success {
        let result_ref = fields.result_ref.ok_or_else(|| {
            ApiError::bad_request("Field result is required when success is true")
        })?;
        services
            .build_service
            .complete(&build, &reporting_worker, &result_ref, now)
            .await?;
    } else {
        // A result uploaded alongside a failure report is meaningless.
        if let Some(result_ref) = &fields.result_ref {
            let _ = services.object_store.delete(result_ref).await;
        }
        let message = fields.error_message.ok_or_else(|| {
            ApiError::bad_request("Field error_message is required when success is false")
        })?;
        services
            .build_service
            .fail(&build, &reporting_worker, &message, now)
            .await?;
    }

    Ok(())
}

// --- Downloads ----------------------------------------------------------

#[handler]
pub async fn download_result(
    Path(build_id): Path<String>,
    Data(services): Data<&Services>,
    credentials: Credentials,
) -> Response {
    download_result_inner(services, credentials, build_id)
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

async fn download_result_inner(
    services: &Services,
    credentials: Credentials,
    build_id: String,
) -> Result<Response, ApiError> {
    let build = services.build_service.get(&BuildId(build_id)).await?;
    services
        .auth_service
        .authorize_build_access(&credentials, &build)?;

    let (reader, len) = services.build_service.open_result(&build).await?;
    let file_name = format!("{}.{}", build.id, build.platform.result_extension());
    Ok(stream_response(
        reader,
        len,
        "application/octet-stream",
        &file_name,
    ))
}

#[handler]
pub async fn download_source(
    Path(build_id): Path<String>,
    Data(services): Data<&Services>,
    credentials: Credentials,
) -> Response {
    download_source_inner(services, credentials, build_id)
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

async fn download_source_inner(
    services: &Services,
    credentials: Credentials,
    build_id: String,
) -> Result<Response, ApiError> {
    let build = services.build_service.get(&BuildId(build_id)).await?;
    services
        .auth_service
        .authorize_worker_for_build(&credentials, &build, Utc::now(), false)
        .await?;

    let (reader, len) = services.build_service.open_source(&build).await?;
    let file_name = format!("{}.zip", build.id);
    Ok(stream_response(reader, len, "application/zip", &file_name))
}

#[handler]
pub async fn download_certs(
    Path(build_id): Path<String>,
    Data(services): Data<&Services>,
    credentials: Credentials,
) -> Response {
    download_certs_inner(services, credentials, build_id)
        .await
        .unwrap_or_else(IntoResponse::into_response)
}

async fn download_certs_inner(
    services: &Services,
    credentials: Credentials,
    build_id: String,
) -> Result<Response, ApiError> {
    let build = services.build_service.get(&BuildId(build_id)).await?;
    services
        .auth_service
        .authorize_worker_for_build(&credentials, &build, Utc::now(), false)
        .await?;

    let (reader, len) = services.build_service.open_certs(&build).await?;
    let file_name = format!("{}-certs.zip", build.id);
    Ok(stream_response(reader, len, "application/zip", &file_name))
}
