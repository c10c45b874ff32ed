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

use crate::storage::ObjectRef;
use buildmesh_common::model::{
    BuildId, BuildStatus, LogLevel, Platform, TokenSecret, WorkerId, WorkerStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// A single submitted unit of work. The catalog owns every mutation of this
/// state; other components hold copies.
#[derive(Debug, Clone)]
pub struct Build {
    pub id: BuildId,
    pub platform: Platform,
    pub status: BuildStatus,
    pub worker_id: Option<WorkerId>,
    pub access_token: TokenSecret,
    pub source_ref: ObjectRef,
    pub certs_ref: Option<ObjectRef>,
    pub result_ref: Option<ObjectRef>,
    pub error_message: Option<String>,
    pub sequence: i64,
    pub submitted_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// An external build executor known to the registry.
#[derive(Debug, Clone)]
pub struct Worker {
    pub id: WorkerId,
    pub name: String,
    pub capabilities: serde_json::Value,
    pub status: WorkerStatus,
    pub access_token: TokenSecret,
    pub access_token_expires_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub builds_completed: i64,
    pub builds_failed: i64,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct BuildLogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// Best-effort worker telemetry sample. Out-of-range samples are dropped on
/// ingress, not rejected.
#[derive(Debug, Clone)]
pub struct CpuSnapshot {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_mb: f64,
}

impl CpuSnapshot {
    /// `cpu_percent` is multi-core (up to 1000 on a 10-core host).
    pub fn is_valid(&self) -> bool {
        (0.0..=1000.0).contains(&self.cpu_percent) && self.memory_mb >= 0.0
    }
}

/// Lifecycle event kinds recorded in the hash-chained audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Submitted,
    Assigned,
    Completed,
    Failed,
    Requeued,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Submitted => "build:submitted",
            EventType::Assigned => "build:assigned",
            EventType::Completed => "build:completed",
            EventType::Failed => "build:failed",
            EventType::Requeued => "build:requeued",
        }
    }
}

impl FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "build:submitted" => Ok(EventType::Submitted),
            "build:assigned" => Ok(EventType::Assigned),
            "build:completed" => Ok(EventType::Completed),
            "build:failed" => Ok(EventType::Failed),
            "build:requeued" => Ok(EventType::Requeued),
            other => Err(format!("Unknown event type: {other}")),
        }
    }
}

impl Display for EventType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One entry of the tamper-evident event log. `event_hash` covers the
/// canonical encoding of all other fields including `previous_hash`.
#[derive(Debug, Clone)]
pub struct LifecycleEvent {
    pub sequence: i64,
    pub event_type: EventType,
    pub build_id: Option<BuildId>,
    pub worker_id: Option<WorkerId>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub previous_hash: String,
    pub event_hash: String,
}
