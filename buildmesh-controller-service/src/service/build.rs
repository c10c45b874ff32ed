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

use crate::metrics;
use crate::model::{Build, BuildLogEntry, CpuSnapshot, EventType};
use crate::repo::build::{BuildRepo, CpuSnapshotRecord};
use crate::repo::worker::WorkerRepo;
use crate::repo::RepoError;
use crate::service::dispatch::DispatchService;
use crate::service::event::{EventError, EventService};
use crate::storage::{ObjectRef, ObjectStore, StorageError};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use buildmesh_common::model::{BuildId, BuildStatus, LogLevel, Platform, TokenSecret, WorkerId, WorkerStatus};
use buildmesh_common::SafeDisplay;
use chrono::{DateTime, Utc};
use futures::AsyncReadExt as FuturesAsyncReadExt;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info};

pub const CANCELLED_MESSAGE: &str = "Build cancelled by user";
pub const SOURCE_MISSING_MESSAGE: &str = "Original build source no longer available";

const INSERT_ATTEMPTS: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Build not found: {0}")]
    NotFound(BuildId),
    #[error("Build is not completed")]
    NotCompleted,
    #[error("Build already finished")]
    AlreadyFinished,
    #[error("{SOURCE_MISSING_MESSAGE}")]
    SourceMissing,
    #[error("No certificates available for this build")]
    CertsNotFound,
    #[error("Invalid request: {0}")]
    Validation(String),
    #[error("State conflict: {0}")]
    StateConflict(String),
    #[error("submission contention, retry shortly")]
    Contention,
    #[error("corrupt catalog record: {0}")]
    Corrupt(String),
    #[error(transparent)]
    InternalStorageError(#[from] StorageError),
    #[error(transparent)]
    InternalRepoError(#[from] RepoError),
    #[error(transparent)]
    InternalEventError(#[from] EventError),
}

impl SafeDisplay for BuildError {
    fn to_safe_string(&self) -> String {
        match self {
            BuildError::NotFound(_)
            | BuildError::NotCompleted
            | BuildError::AlreadyFinished
            | BuildError::SourceMissing
            | BuildError::CertsNotFound
            | BuildError::Validation(_)
            | BuildError::StateConflict(_)
            | BuildError::Contention => self.to_string(),
            BuildError::Corrupt(_) => "internal error".to_string(),
            BuildError::InternalStorageError(inner) => inner.to_safe_string(),
            BuildError::InternalRepoError(inner) => inner.to_safe_string(),
            BuildError::InternalEventError(inner) => inner.to_safe_string(),
        }
    }
}

/// Outcome of a heartbeat, as discovered by the worker: `Cancelled` covers
/// every way the worker can have lost the build (user cancel, timeout
/// reassignment, completion race), so it can tear its VM down promptly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Ok,
    Cancelled,
    Unknown,
}

/// A telemetry sample after JSON-shape validation; range validation happens
/// on store.
#[derive(Debug, Clone)]
pub struct TelemetrySample {
    pub timestamp: Option<DateTime<Utc>>,
    pub cpu_percent: Option<f64>,
    pub memory_mb: Option<f64>,
}

/// Signing material handed to workers over the header-checked endpoint,
/// assembled by unzipping the stored certs bundle.
#[derive(Debug, Clone)]
pub struct CertsBundle {
    pub p12: String,
    pub p12_password: String,
    pub keychain_password: String,
    pub provisioning_profiles: Vec<String>,
}

/// Build lifecycle operations over the catalog. Every mutation lands here;
/// the dispatch engine and liveness monitor call in like any other caller.
pub struct BuildService {
    build_repo: Arc<dyn BuildRepo>,
    worker_repo: Arc<dyn WorkerRepo>,
    object_store: Arc<dyn ObjectStore>,
    event_service: Arc<EventService>,
    dispatch_service: Arc<DispatchService>,
}

impl BuildService {
    pub fn new(
        build_repo: Arc<dyn BuildRepo>,
        worker_repo: Arc<dyn WorkerRepo>,
        object_store: Arc<dyn ObjectStore>,
        event_service: Arc<EventService>,
        dispatch_service: Arc<DispatchService>,
    ) -> Self {
        Self {
            build_repo,
            worker_repo,
            object_store,
            event_service,
            dispatch_service,
        }
    }

    /// Inserts a new pending build with a fresh owner token, appends the
    /// submission log line and emits `build:submitted`. The id is chosen by
    /// the transport layer before streaming, so stored objects are named
    /// after it.
    pub async fn submit(
        &self,
        id: BuildId,
        platform: Platform,
        source_ref: ObjectRef,
        certs_ref: Option<ObjectRef>,
        now: DateTime<Utc>,
    ) -> Result<Build, BuildError> {
        self.create_build(id, platform, source_ref, certs_ref, now, None)
            .await
    }

    /// Creates a new build sharing the original's stored inputs. Fails when
    /// the source object has vanished from disk.
    pub async fn retry(&self, original: &Build, now: DateTime<Utc>) -> Result<Build, BuildError> {
        match self.object_store.size(&original.source_ref).await {
            Ok(_) => {}
            Err(StorageError::NotFound(_)) | Err(StorageError::Security(_)) => {
                return Err(BuildError::SourceMissing)
            }
            Err(other) => return Err(other.into()),
        }
        if let Some(certs_ref) = &original.certs_ref {
            match self.object_store.size(certs_ref).await {
                Ok(_) => {}
                Err(StorageError::NotFound(_)) | Err(StorageError::Security(_)) => {
                    return Err(BuildError::Validation(
                        "Original build certificates no longer available".to_string(),
                    ))
                }
                Err(other) => return Err(other.into()),
            }
        }

        self.create_build(
            BuildId::new(),
            original.platform,
            original.source_ref.clone(),
            original.certs_ref.clone(),
            now,
            Some(&original.id),
        )
        .await
    }

    async fn create_build(
        &self,
        id: BuildId,
        platform: Platform,
        source_ref: ObjectRef,
        certs_ref: Option<ObjectRef>,
        now: DateTime<Utc>,
        retry_of: Option<&BuildId>,
    ) -> Result<Build, BuildError> {
        let build = Build {
            id,
            platform,
            status: BuildStatus::Pending,
            worker_id: None,
            access_token: TokenSecret::generate(),
            source_ref,
            certs_ref,
            result_ref: None,
            error_message: None,
            sequence: 0,
            submitted_at: now,
            assigned_at: None,
            started_at: None,
            last_heartbeat_at: None,
            completed_at: None,
        };

        // The creation sequence is assigned by the database; a concurrent
        // submission can race it, which surfaces as a unique violation.
        let mut stored = None;
        for _ in 0..INSERT_ATTEMPTS {
            match self.build_repo.insert(&(&build).into()).await {
                Ok(record) => {
                    stored = Some(record);
                    break;
                }
                Err(RepoError::UniqueViolation(_)) => continue,
                Err(other) => return Err(other.into()),
            }
        }
        let stored = stored.ok_or(BuildError::Contention)?;
        let build = Build::try_from(stored).map_err(BuildError::Corrupt)?;

        self.build_repo
            .append_logs(
                &build.id.0,
                &[(now, "info".to_string(), "Build submitted".to_string())],
            )
            .await?;

        let mut payload = json!({"platform": build.platform.as_str()});
        if let Some(original) = retry_of {
            payload["original_build_id"] = json!(original.0);
        }
        self.event_service
            .publish(EventType::Submitted, Some(&build.id), None, payload)
            .await?;
        metrics::record_build_submitted();

        info!(build_id = %build.id, platform = %build.platform, "build submitted");
        Ok(build)
    }

    pub async fn get(&self, id: &BuildId) -> Result<Build, BuildError> {
        let record = self
            .build_repo
            .get(&id.0)
            .await?
            .ok_or_else(|| BuildError::NotFound(id.clone()))?;
        Build::try_from(record).map_err(BuildError::Corrupt)
    }

    pub async fn list_active(&self) -> Result<Vec<Build>, BuildError> {
        self.build_repo
            .list_active()
            .await?
            .into_iter()
            .map(|record| Build::try_from(record).map_err(BuildError::Corrupt))
            .collect()
    }

    pub async fn get_logs(&self, id: &BuildId) -> Result<Vec<BuildLogEntry>, BuildError> {
        self.get(id).await?;
        self.build_repo
            .get_logs(&id.0)
            .await?
            .into_iter()
            .map(|record| BuildLogEntry::try_from(record).map_err(BuildError::Corrupt))
            .collect()
    }

    pub async fn append_logs(
        &self,
        build: &Build,
        entries: &[(LogLevel, String)],
        now: DateTime<Utc>,
    ) -> Result<(), BuildError> {
        if entries.is_empty() {
            return Ok(());
        }
        let rows: Vec<_> = entries
            .iter()
            .map(|(level, message)| (now, level.as_str().to_string(), message.clone()))
            .collect();
        self.build_repo.append_logs(&build.id.0, &rows).await?;
        Ok(())
    }

    /// Records worker liveness on a build, flipping `assigned` to `building`
    /// on the first beat.
    pub async fn heartbeat(
        &self,
        build_id: &BuildId,
        worker_id: Option<&WorkerId>,
        progress: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<HeartbeatOutcome, BuildError> {
        let Some(record) = self.build_repo.get(&build_id.0).await? else {
            return Ok(HeartbeatOutcome::Unknown);
        };
        let build = Build::try_from(record).map_err(BuildError::Corrupt)?;

        // Admin callers act as the bound worker.
        let effective_worker = worker_id.cloned().or_else(|| build.worker_id.clone());
        let Some(effective_worker) = effective_worker.filter(|worker| {
            build.status.is_active() && build.worker_id.as_ref() == Some(worker)
        }) else {
            return Ok(HeartbeatOutcome::Cancelled);
        };

        if build.status == BuildStatus::Assigned {
            self.build_repo.mark_building(&build.id.0, now).await?;
            self.build_repo
                .append_logs(
                    &build.id.0,
                    &[(now, "info".to_string(), "Build started".to_string())],
                )
                .await?;
        }
        self.build_repo
            .record_heartbeat(&build.id.0, &effective_worker.0, now)
            .await?;

        if let Some(progress) = progress {
            self.build_repo
                .append_logs(
                    &build.id.0,
                    &[(
                        now,
                        "info".to_string(),
                        format!("Build progress: {progress}%"),
                    )],
                )
                .await?;
        }

        Ok(HeartbeatOutcome::Ok)
    }

    /// Stores a validated telemetry sample; any telemetry shape counts as a
    /// heartbeat.
    pub async fn record_telemetry(
        &self,
        build: &Build,
        worker_id: &WorkerId,
        sample: &TelemetrySample,
        now: DateTime<Utc>,
    ) -> Result<(), BuildError> {
        if let Some(cpu_percent) = sample.cpu_percent {
            let snapshot = CpuSnapshot {
                timestamp: sample.timestamp.unwrap_or(now),
                cpu_percent,
                memory_mb: sample.memory_mb.unwrap_or(0.0),
            };
            if snapshot.is_valid() {
                self.build_repo
                    .insert_cpu_snapshot(&CpuSnapshotRecord {
                        id: 0,
                        build_id: build.id.0.clone(),
                        timestamp: snapshot.timestamp,
                        cpu_percent: snapshot.cpu_percent,
                        memory_mb: snapshot.memory_mb,
                    })
                    .await?;
            } else {
                debug!(build_id = %build.id, "dropped out-of-range telemetry sample");
            }
        }

        self.build_repo
            .record_heartbeat(&build.id.0, &worker_id.0, now)
            .await?;
        Ok(())
    }

    /// `{assigned, building} -> completed` for the reporting worker.
    pub async fn complete(
        &self,
        build: &Build,
        worker_id: &WorkerId,
        result_ref: &ObjectRef,
        now: DateTime<Utc>,
    ) -> Result<Build, BuildError> {
        let transitioned = self
            .build_repo
            .complete(&build.id.0, &worker_id.0, result_ref.as_str(), now)
            .await?;
        if !transitioned {
            return Err(BuildError::StateConflict(
                "Build is not active for this worker".to_string(),
            ));
        }

        self.worker_repo.increment_completed(&worker_id.0).await?;
        self.worker_repo
            .set_status(&worker_id.0, WorkerStatus::Idle.as_str())
            .await?;
        self.dispatch_service.release(worker_id);

        self.build_repo
            .append_logs(
                &build.id.0,
                &[(
                    now,
                    "info".to_string(),
                    "Build completed successfully".to_string(),
                )],
            )
            .await?;
        self.event_service
            .publish(
                EventType::Completed,
                Some(&build.id),
                Some(worker_id),
                json!({"platform": build.platform.as_str()}),
            )
            .await?;
        metrics::record_build_completed();

        info!(build_id = %build.id, worker_id = %worker_id, "build completed");
        self.get(&build.id).await
    }

    /// `{assigned, building} -> failed` for the reporting worker. The message
    /// is the worker's verbatim report; by policy this never requeues.
    pub async fn fail(
        &self,
        build: &Build,
        worker_id: &WorkerId,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<Build, BuildError> {
        let transitioned = self
            .build_repo
            .fail(&build.id.0, &worker_id.0, message, now)
            .await?;
        if !transitioned {
            return Err(BuildError::StateConflict(
                "Build is not active for this worker".to_string(),
            ));
        }

        self.worker_repo.increment_failed(&worker_id.0).await?;
        self.worker_repo
            .set_status(&worker_id.0, WorkerStatus::Idle.as_str())
            .await?;
        self.dispatch_service.release(worker_id);

        self.build_repo
            .append_logs(
                &build.id.0,
                &[(now, "error".to_string(), format!("Build failed: {message}"))],
            )
            .await?;
        self.event_service
            .publish(
                EventType::Failed,
                Some(&build.id),
                Some(worker_id),
                json!({"error": message}),
            )
            .await?;
        metrics::record_build_failed();

        info!(build_id = %build.id, worker_id = %worker_id, "build failed");
        self.get(&build.id).await
    }

    /// Owner- or admin-initiated cancellation of a non-terminal build. The
    /// assigned worker, if any, discovers this on its next heartbeat.
    pub async fn cancel(&self, build_id: &BuildId, now: DateTime<Utc>) -> Result<Build, BuildError> {
        let before = self
            .build_repo
            .cancel(&build_id.0, CANCELLED_MESSAGE, now)
            .await?;

        let Some(before) = before else {
            // Either unknown or already terminal.
            return match self.build_repo.get(&build_id.0).await? {
                Some(_) => Err(BuildError::AlreadyFinished),
                None => Err(BuildError::NotFound(build_id.clone())),
            };
        };

        let cancelled_worker = before.worker_id.clone().map(WorkerId);
        if let Some(worker_id) = &cancelled_worker {
            self.dispatch_service.release(worker_id);
            self.worker_repo
                .set_status(&worker_id.0, WorkerStatus::Idle.as_str())
                .await?;
        }

        self.build_repo
            .append_logs(
                &build_id.0,
                &[(now, "warn".to_string(), CANCELLED_MESSAGE.to_string())],
            )
            .await?;
        self.event_service
            .publish(
                EventType::Failed,
                Some(build_id),
                cancelled_worker.as_ref(),
                json!({"reason": "cancelled"}),
            )
            .await?;
        metrics::record_build_failed();

        info!(build_id = %build_id, "build cancelled");
        self.get(build_id).await
    }

    pub async fn open_source(
        &self,
        build: &Build,
    ) -> Result<(Box<dyn AsyncRead + Send + Unpin>, u64), BuildError> {
        Ok(self.object_store.open(&build.source_ref).await?)
    }

    pub async fn open_certs(
        &self,
        build: &Build,
    ) -> Result<(Box<dyn AsyncRead + Send + Unpin>, u64), BuildError> {
        let certs_ref = build.certs_ref.as_ref().ok_or(BuildError::CertsNotFound)?;
        match self.object_store.open(certs_ref).await {
            Ok(opened) => Ok(opened),
            Err(StorageError::NotFound(_)) => Err(BuildError::CertsNotFound),
            Err(other) => Err(other.into()),
        }
    }

    /// Result egress is gated on the terminal `completed` state.
    pub async fn open_result(
        &self,
        build: &Build,
    ) -> Result<(Box<dyn AsyncRead + Send + Unpin>, u64), BuildError> {
        if build.status != BuildStatus::Completed {
            return Err(BuildError::NotCompleted);
        }
        let result_ref = build.result_ref.as_ref().ok_or(BuildError::NotCompleted)?;
        Ok(self.object_store.open(result_ref).await?)
    }

    /// Unpacks the certs bundle into the shape the signing step consumes:
    /// one p12 identity, optional passwords from `credentials.json`, and any
    /// number of provisioning profiles.
    pub async fn secure_certs(&self, build: &Build) -> Result<CertsBundle, BuildError> {
        let (mut reader, len) = self.open_certs(build).await?;
        let mut bytes = Vec::with_capacity(len as usize);
        reader.read_to_end(&mut bytes).await.map_err(StorageError::Io)?;

        let mut cursor = std::io::Cursor::new(bytes);
        let mut zip = async_zip::tokio::read::seek::ZipFileReader::with_tokio(&mut cursor)
            .await
            .map_err(|e| BuildError::Validation(format!("Invalid certs bundle: {e}")))?;

        let entries: Vec<(usize, String)> = zip
            .file()
            .entries()
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| {
                entry
                    .filename()
                    .as_str()
                    .ok()
                    .map(|name| (index, name.to_string()))
            })
            .collect();

        let mut p12 = None;
        let mut p12_password = String::new();
        let mut keychain_password = String::new();
        let mut provisioning_profiles = Vec::new();

        for (index, name) in entries {
            if name.ends_with('/') {
                continue;
            }
            let mut entry_reader = zip
                .reader_with_entry(index)
                .await
                .map_err(|e| BuildError::Validation(format!("Invalid certs bundle: {e}")))?;
            let mut contents = Vec::new();
            FuturesAsyncReadExt::read_to_end(&mut entry_reader, &mut contents)
                .await
                .map_err(|e| BuildError::Validation(format!("Invalid certs bundle: {e}")))?;

            if name.ends_with(".p12") && p12.is_none() {
                p12 = Some(BASE64_STANDARD.encode(&contents));
            } else if name.ends_with(".mobileprovision") {
                provisioning_profiles.push(BASE64_STANDARD.encode(&contents));
            } else if name.ends_with("credentials.json") {
                if let Ok(credentials) =
                    serde_json::from_slice::<serde_json::Value>(&contents)
                {
                    if let Some(value) = credentials["p12Password"].as_str() {
                        p12_password = value.to_string();
                    }
                    if let Some(value) = credentials["keychainPassword"].as_str() {
                        keychain_password = value.to_string();
                    }
                }
            }
        }

        let p12 = p12.ok_or_else(|| {
            BuildError::Validation("Certs bundle contains no .p12 identity".to_string())
        })?;

        Ok(CertsBundle {
            p12,
            p12_password,
            keychain_password,
            provisioning_profiles,
        })
    }

    pub async fn build_status_counts(&self) -> Result<HashMap<String, i64>, BuildError> {
        Ok(self.build_repo.count_by_status().await?.into_iter().collect())
    }

    pub async fn worker_status_counts(&self) -> Result<HashMap<String, i64>, BuildError> {
        Ok(self
            .worker_repo
            .count_by_status()
            .await?
            .into_iter()
            .collect())
    }

    pub async fn worker_counter_totals(&self) -> Result<(i64, i64), BuildError> {
        Ok(self.worker_repo.counter_totals().await?)
    }
}
