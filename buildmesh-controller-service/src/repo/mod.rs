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
pub mod event;
pub mod worker;

use buildmesh_common::SafeDisplay;

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    /// A unique constraint rejected the write. The partial index on active
    /// builds per worker and the event sequence both surface here.
    #[error("unique constraint violation: {0}")]
    UniqueViolation(String),
    #[error("database error: {0}")]
    Internal(sqlx::Error),
}

impl From<sqlx::Error> for RepoError {
    fn from(error: sqlx::Error) -> Self {
        match &error {
            sqlx::Error::Database(db_error)
                if db_error.kind() == sqlx::error::ErrorKind::UniqueViolation =>
            {
                RepoError::UniqueViolation(db_error.message().to_string())
            }
            _ => RepoError::Internal(error),
        }
    }
}

impl SafeDisplay for RepoError {
    fn to_safe_string(&self) -> String {
        "database error".to_string()
    }
}
