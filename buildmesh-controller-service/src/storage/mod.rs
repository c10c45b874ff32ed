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

pub mod fs;

use async_trait::async_trait;
use buildmesh_common::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::{Display, Formatter};
use tokio::io::AsyncRead;

/// Opaque handle to a stored object. The inner value is meaningful only to
/// the store that issued it; other components persist and pass it around.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectRef(pub String);

impl ObjectRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ObjectRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The three logical buckets of the store, addressed by build id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucket {
    Source,
    Certs,
    Result,
}

impl Bucket {
    pub fn dir(&self) -> &'static str {
        match self {
            Bucket::Source => "builds",
            Bucket::Certs => "certs",
            Bucket::Result => "results",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("payload exceeds the limit of {limit} bytes")]
    PayloadTooLarge { limit: u64 },
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("path escapes the storage root: {0}")]
    Security(String),
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SafeDisplay for StorageError {
    fn to_safe_string(&self) -> String {
        match self {
            StorageError::PayloadTooLarge { .. } => self.to_string(),
            StorageError::NotFound(_) => "object not found".to_string(),
            StorageError::Security(_) => "access denied".to_string(),
            StorageError::Io(_) => "storage error".to_string(),
        }
    }
}

/// Content storage with streaming in/out, byte caps on ingress and path
/// confinement on egress. The store never interprets file contents and
/// applies no retention policy.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Streams `reader` to a temporary file, enforcing `max_bytes`, then
    /// renames atomically. A failed or cancelled put leaves nothing behind.
    async fn put(
        &self,
        bucket: Bucket,
        file_name: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        max_bytes: u64,
    ) -> Result<ObjectRef, StorageError>;

    /// Opens a streaming reader together with the object length. Every egress
    /// path goes through this; it is the sole defense against traversal.
    async fn open(
        &self,
        object: &ObjectRef,
    ) -> Result<(Box<dyn AsyncRead + Send + Unpin>, u64), StorageError>;

    /// Stat only.
    async fn size(&self, object: &ObjectRef) -> Result<u64, StorageError>;

    /// Best-effort removal. Missing objects are not an error.
    async fn delete(&self, object: &ObjectRef) -> Result<(), StorageError>;

    /// Whether the backing root is usable, for health reporting.
    async fn available(&self) -> bool;
}
