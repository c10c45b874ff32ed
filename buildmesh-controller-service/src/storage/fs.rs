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

use super::{Bucket, ObjectRef, ObjectStore, StorageError};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

/// Object store rooted in a local directory, laid out
/// `<root>/{builds,certs,results}/<file>`. Writes go through a uniquely
/// named `.part-` temp file and an atomic rename.
pub struct FileSystemObjectStore {
    root: PathBuf,
    canonical_root: PathBuf,
}

impl FileSystemObjectStore {
    pub async fn new(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        for bucket in [Bucket::Source, Bucket::Certs, Bucket::Result] {
            fs::create_dir_all(root.join(bucket.dir())).await?;
        }
        let canonical_root = fs::canonicalize(&root).await?;
        Ok(Self {
            root,
            canonical_root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves an object reference to an absolute path, refusing anything
    /// that leaves the store root. Missing files inside the root are
    /// `NotFound`; everything suspicious is `Security`.
    async fn confined_path(&self, object: &ObjectRef) -> Result<PathBuf, StorageError> {
        let raw = object.as_str();

        if raw.is_empty() || raw.contains('\0') {
            warn!(object = %sanitized(raw), "rejected object reference");
            return Err(StorageError::Security(sanitized(raw)));
        }

        let candidate = if Path::new(raw).is_absolute() {
            PathBuf::from(raw)
        } else {
            self.canonical_root.join(raw)
        };

        let normalized = lexical_normalize(&candidate);
        if !normalized.starts_with(&self.canonical_root) {
            warn!(object = %sanitized(raw), "rejected object reference");
            return Err(StorageError::Security(sanitized(raw)));
        }

        // The lexical check alone would miss symlinks; resolve and re-check.
        match fs::canonicalize(&normalized).await {
            Ok(resolved) if resolved.starts_with(&self.canonical_root) => Ok(resolved),
            Ok(_) => {
                warn!(object = %sanitized(raw), "rejected object reference");
                Err(StorageError::Security(sanitized(raw)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(sanitized(raw)))
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

#[async_trait]
impl ObjectStore for FileSystemObjectStore {
    async fn put(
        &self,
        bucket: Bucket,
        file_name: &str,
        reader: &mut (dyn AsyncRead + Send + Unpin),
        max_bytes: u64,
    ) -> Result<ObjectRef, StorageError> {
        if file_name.is_empty()
            || file_name.contains(['/', '\\', '\0'])
            || file_name.starts_with('.')
        {
            return Err(StorageError::Security(sanitized(file_name)));
        }

        let dir = self.root.join(bucket.dir());
        let final_path = dir.join(file_name);
        let temp_path = dir.join(format!("{file_name}.part-{}", nanoid::nanoid!(8)));

        let guard = PartialWriteGuard::new(temp_path.clone());
        let mut file = fs::File::create(&temp_path).await?;

        let mut written: u64 = 0;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            written += n as u64;
            if written > max_bytes {
                drop(file);
                return Err(StorageError::PayloadTooLarge { limit: max_bytes });
            }
            file.write_all(&buf[..n]).await?;
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &final_path).await?;
        guard.disarm();

        debug!(bucket = bucket.dir(), file_name, written, "stored object");
        Ok(ObjectRef(format!("{}/{}", bucket.dir(), file_name)))
    }

    async fn open(
        &self,
        object: &ObjectRef,
    ) -> Result<(Box<dyn AsyncRead + Send + Unpin>, u64), StorageError> {
        let path = self.confined_path(object).await?;
        let file = fs::File::open(&path).await?;
        let len = file.metadata().await?.len();
        Ok((Box::new(file), len))
    }

    async fn size(&self, object: &ObjectRef) -> Result<u64, StorageError> {
        let path = self.confined_path(object).await?;
        Ok(fs::metadata(&path).await?.len())
    }

    async fn delete(&self, object: &ObjectRef) -> Result<(), StorageError> {
        match self.confined_path(object).await {
            Ok(path) => match fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(StorageError::Io(e)),
            },
            Err(StorageError::NotFound(_)) => Ok(()),
            Err(other) => Err(other),
        }
    }

    async fn available(&self) -> bool {
        fs::metadata(&self.root)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }
}

/// Deletes the temp file unless the write completed. Covers error paths and
/// cancellation alike, since both drop the guard armed.
struct PartialWriteGuard {
    path: Option<PathBuf>,
}

impl PartialWriteGuard {
    fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    fn disarm(mut self) {
        self.path = None;
    }
}

impl Drop for PartialWriteGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Pure lexical `..`/`.` resolution; does not touch the filesystem.
fn lexical_normalize(path: &Path) -> PathBuf {
    let mut result = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => result.push(prefix.as_os_str()),
            Component::RootDir => result.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                result.pop();
            }
            Component::Normal(part) => result.push(part),
        }
    }
    result
}

/// Reference text safe for log lines (control characters stripped).
fn sanitized(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_control() { '?' } else { c })
        .take(256)
        .collect()
}
