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

use crate::model::{Build, Worker};
use crate::repo::worker::WorkerRepo;
use crate::repo::RepoError;
use buildmesh_common::model::{BuildId, TokenSecret, WorkerId};
use buildmesh_common::SafeDisplay;
use chrono::{DateTime, Duration, Utc};
use http::HeaderMap;
use poem::{Request, RequestBody};
use poem_openapi::auth::ApiKey;
use poem_openapi::SecurityScheme;
use std::str::FromStr;
use std::sync::Arc;
use tracing::warn;

pub const API_KEY_HEADER: &str = "X-API-Key";
pub const BUILD_TOKEN_HEADER: &str = "X-Build-Token";
pub const WORKER_ID_HEADER: &str = "X-Worker-Id";
pub const ACCESS_TOKEN_HEADER: &str = "X-Access-Token";
pub const BUILD_ID_HEADER: &str = "X-Build-Id";

/// Worker identity as presented on the wire: the id header plus the current
/// rotating token.
#[derive(Debug, Clone)]
pub struct WorkerCredentials {
    pub worker_id: WorkerId,
    pub token: TokenSecret,
}

/// Pre-shared operator key, `X-API-Key`.
#[derive(SecurityScheme)]
#[oai(
    rename = "AdminApiKey",
    ty = "api_key",
    key_in = "header",
    key_name = "X-API-Key",
    checker = "admin_key_checker"
)]
pub struct AdminApiKey(pub TokenSecret);

async fn admin_key_checker(_req: &Request, key: ApiKey) -> Option<TokenSecret> {
    TokenSecret::from_str(&key.key).ok()
}

/// Per-build owner token issued at submission, `X-Build-Token`.
#[derive(SecurityScheme)]
#[oai(
    rename = "BuildAccessToken",
    ty = "api_key",
    key_in = "header",
    key_name = "X-Build-Token",
    checker = "build_token_checker"
)]
pub struct BuildAccessToken(pub TokenSecret);

async fn build_token_checker(_req: &Request, key: ApiKey) -> Option<TokenSecret> {
    TokenSecret::from_str(&key.key).ok()
}

/// Rotating worker token, `X-Access-Token`, paired with `X-Worker-Id`.
#[derive(SecurityScheme)]
#[oai(
    rename = "WorkerAccessToken",
    ty = "api_key",
    key_in = "header",
    key_name = "X-Access-Token",
    checker = "worker_token_checker"
)]
pub struct WorkerAccessToken(pub WorkerCredentials);

async fn worker_token_checker(req: &Request, key: ApiKey) -> Option<WorkerCredentials> {
    let worker_id = req.header(WORKER_ID_HEADER)?;
    if worker_id.is_empty() {
        return None;
    }
    Some(WorkerCredentials {
        worker_id: WorkerId(worker_id.to_string()),
        token: TokenSecret::from_str(&key.key).ok()?,
    })
}

/// The credential the caller actually presented, most privileged first.
/// Whether it suffices for the operation is decided by the auth service.
#[derive(SecurityScheme)]
pub enum CallerSecurityScheme {
    AdminKey(AdminApiKey),
    BuildToken(BuildAccessToken),
    WorkerToken(WorkerAccessToken),
}

/// All credential material carried by a request. Missing headers are simply
/// absent; extraction never fails, authorization does.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub api_key: Option<TokenSecret>,
    pub build_token: Option<TokenSecret>,
    pub worker: Option<WorkerCredentials>,
}

impl Credentials {
    fn presented_any(&self) -> bool {
        self.api_key.is_some() || self.build_token.is_some() || self.worker.is_some()
    }
}

impl From<CallerSecurityScheme> for Credentials {
    fn from(scheme: CallerSecurityScheme) -> Self {
        match scheme {
            CallerSecurityScheme::AdminKey(AdminApiKey(key)) => Credentials {
                api_key: Some(key),
                ..Credentials::default()
            },
            CallerSecurityScheme::BuildToken(BuildAccessToken(token)) => Credentials {
                build_token: Some(token),
                ..Credentials::default()
            },
            CallerSecurityScheme::WorkerToken(WorkerAccessToken(worker)) => Credentials {
                worker: Some(worker),
                ..Credentials::default()
            },
        }
    }
}

pub fn credentials_from_headers(headers: &HeaderMap) -> Credentials {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| TokenSecret::from_str(value).ok())
    };

    let worker = headers
        .get(WORKER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .and_then(|worker_id| {
            header_value(ACCESS_TOKEN_HEADER).map(|token| WorkerCredentials {
                worker_id: WorkerId(worker_id.to_string()),
                token,
            })
        });

    Credentials {
        api_key: header_value(API_KEY_HEADER),
        build_token: header_value(BUILD_TOKEN_HEADER),
        worker,
    }
}

// For the raw streaming handlers that live outside the OpenAPI surface.
impl<'a> poem::FromRequest<'a> for Credentials {
    async fn from_request(req: &'a Request, _body: &mut RequestBody) -> poem::Result<Self> {
        Ok(credentials_from_headers(req.headers()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing credentials")]
    MissingCredentials,
    #[error("invalid API key")]
    InvalidApiKey,
    #[error("invalid build token")]
    InvalidBuildToken,
    #[error("unknown worker")]
    UnknownWorker,
    #[error("invalid worker token")]
    InvalidWorkerToken,
    #[error("worker token expired")]
    WorkerTokenExpired,
    #[error("credential scope does not cover this operation")]
    ScopeMismatch,
    #[error("build is not assigned to this worker")]
    WorkerBuildMismatch,
    #[error("build id header does not match the request path")]
    BuildIdHeaderMismatch,
    #[error("internal auth error: {0}")]
    Internal(String),
    #[error(transparent)]
    InternalRepoError(#[from] RepoError),
}

impl SafeDisplay for AuthError {
    fn to_safe_string(&self) -> String {
        match self {
            AuthError::Internal(_) => "internal error".to_string(),
            AuthError::InternalRepoError(inner) => inner.to_safe_string(),
            other => other.to_string(),
        }
    }
}

/// Successful worker-scope authorization. `rotated_token` carries the fresh
/// token for endpoints that return it in their JSON body.
pub struct WorkerAuth {
    pub worker: Worker,
    pub rotated_token: Option<TokenSecret>,
}

/// A caller admitted to a worker-scoped endpoint: either an operator with
/// the admin key, or the bound worker itself.
pub enum WorkerCaller {
    Admin,
    Worker(WorkerAuth),
}

impl WorkerCaller {
    pub fn rotated_token(&self) -> Option<&TokenSecret> {
        match self {
            WorkerCaller::Admin => None,
            WorkerCaller::Worker(auth) => auth.rotated_token.as_ref(),
        }
    }
}

/// The three credential scopes, checked in order of increasing specificity.
/// All secret comparisons are constant-time.
pub struct AuthService {
    worker_repo: Arc<dyn WorkerRepo>,
    admin_key: TokenSecret,
    token_ttl: Duration,
}

impl AuthService {
    pub fn new(
        worker_repo: Arc<dyn WorkerRepo>,
        admin_key: TokenSecret,
        token_ttl: std::time::Duration,
    ) -> Self {
        Self {
            worker_repo,
            admin_key,
            token_ttl: Duration::from_std(token_ttl).unwrap_or_else(|_| Duration::seconds(90)),
        }
    }

    /// Admin scope only.
    pub fn authorize_admin(&self, credentials: &Credentials) -> Result<(), AuthError> {
        match &credentials.api_key {
            Some(key) if self.admin_key.ct_eq(&key.value) => Ok(()),
            Some(_) => Err(AuthError::InvalidApiKey),
            None if credentials.presented_any() => Err(AuthError::ScopeMismatch),
            None => Err(AuthError::MissingCredentials),
        }
    }

    /// Admin, or the owner of exactly this build.
    pub fn authorize_build_access(
        &self,
        credentials: &Credentials,
        build: &Build,
    ) -> Result<(), AuthError> {
        if let Some(key) = &credentials.api_key {
            return if self.admin_key.ct_eq(&key.value) {
                Ok(())
            } else {
                Err(AuthError::InvalidApiKey)
            };
        }
        if let Some(token) = &credentials.build_token {
            return if build.access_token.ct_eq(&token.value) {
                Ok(())
            } else {
                Err(AuthError::InvalidBuildToken)
            };
        }
        if credentials.worker.is_some() {
            return Err(AuthError::ScopeMismatch);
        }
        Err(AuthError::MissingCredentials)
    }

    /// Admin, or a registered worker with a live token. When `rotate` is set
    /// the presented token is atomically replaced and the fresh one is
    /// returned for the response body; the old token is invalid from this
    /// instant.
    pub async fn authorize_worker_scope(
        &self,
        credentials: &Credentials,
        now: DateTime<Utc>,
        rotate: bool,
    ) -> Result<WorkerCaller, AuthError> {
        if let Some(key) = &credentials.api_key {
            return if self.admin_key.ct_eq(&key.value) {
                Ok(WorkerCaller::Admin)
            } else {
                Err(AuthError::InvalidApiKey)
            };
        }

        let Some(presented) = &credentials.worker else {
            return if credentials.presented_any() {
                Err(AuthError::ScopeMismatch)
            } else {
                Err(AuthError::MissingCredentials)
            };
        };

        let record = self
            .worker_repo
            .get(&presented.worker_id.0)
            .await?
            .ok_or(AuthError::UnknownWorker)?;
        let mut worker = Worker::try_from(record).map_err(AuthError::Internal)?;

        if !worker.access_token.ct_eq(&presented.token.value) {
            return Err(AuthError::InvalidWorkerToken);
        }
        if worker.access_token_expires_at <= now {
            return Err(AuthError::WorkerTokenExpired);
        }

        if rotate {
            // A poll cadence slower than TTL/2 risks expiring mid-gap and
            // causes re-registration storms.
            if now - worker.last_seen_at > self.token_ttl / 2 {
                warn!(
                    worker_id = %worker.id,
                    "worker poll interval exceeds half the token TTL"
                );
            }

            let fresh = TokenSecret::generate();
            let expires_at = now + self.token_ttl;
            let swapped = self
                .worker_repo
                .rotate_token(
                    &worker.id.0,
                    &presented.token.value,
                    &fresh.value,
                    expires_at,
                    now,
                )
                .await?;
            if !swapped {
                // Lost a rotation race; the presented token is already dead.
                return Err(AuthError::InvalidWorkerToken);
            }

            worker.access_token = fresh.clone();
            worker.access_token_expires_at = expires_at;
            worker.last_seen_at = now;

            Ok(WorkerCaller::Worker(WorkerAuth {
                worker,
                rotated_token: Some(fresh),
            }))
        } else {
            self.worker_repo.touch(&worker.id.0, now).await?;
            worker.last_seen_at = now;
            Ok(WorkerCaller::Worker(WorkerAuth {
                worker,
                rotated_token: None,
            }))
        }
    }

    /// Worker-scope plus the binding check: the build must currently be
    /// assigned to the presented worker. Admin bypasses the binding.
    pub async fn authorize_worker_for_build(
        &self,
        credentials: &Credentials,
        build: &Build,
        now: DateTime<Utc>,
        rotate: bool,
    ) -> Result<WorkerCaller, AuthError> {
        let caller = self.authorize_worker_scope(credentials, now, rotate).await?;
        ensure_worker_owns_build(&caller, build)?;
        Ok(caller)
    }
}

pub fn ensure_worker_owns_build(caller: &WorkerCaller, build: &Build) -> Result<(), AuthError> {
    match caller {
        WorkerCaller::Admin => Ok(()),
        WorkerCaller::Worker(auth) => {
            if build.worker_id.as_ref() == Some(&auth.worker.id) {
                Ok(())
            } else {
                Err(AuthError::WorkerBuildMismatch)
            }
        }
    }
}

/// The certs egress rule: the deliberately-supplied header must name the same
/// build as the URL path. Mismatches are security events.
pub fn ensure_build_id_header(
    header: Option<&BuildId>,
    path_id: &BuildId,
) -> Result<(), AuthError> {
    match header {
        Some(header_id) if header_id == path_id => Ok(()),
        Some(header_id) => {
            warn!(
                path_build_id = %path_id,
                header_build_id = %header_id,
                "security: build id header mismatch"
            );
            Err(AuthError::BuildIdHeaderMismatch)
        }
        None => Err(AuthError::BuildIdHeaderMismatch),
    }
}
