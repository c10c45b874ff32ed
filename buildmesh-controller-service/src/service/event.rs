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

use crate::model::{EventType, LifecycleEvent};
use crate::repo::event::{EventRecord, EventRepo};
use crate::repo::RepoError;
use buildmesh_common::model::{BuildId, WorkerId};
use buildmesh_common::SafeDisplay;
use chrono::{SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// `previous_hash` of the first event in the chain.
pub const GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

const APPEND_ATTEMPTS: usize = 20;
const BUS_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("event log contention, append retries exhausted")]
    Contention,
    #[error("corrupt event record: {0}")]
    Corrupt(String),
    #[error(transparent)]
    InternalRepoError(#[from] RepoError),
}

impl SafeDisplay for EventError {
    fn to_safe_string(&self) -> String {
        match self {
            EventError::Contention => self.to_string(),
            EventError::Corrupt(_) => "corrupt event log".to_string(),
            EventError::InternalRepoError(inner) => inner.to_safe_string(),
        }
    }
}

/// Tamper-evident lifecycle log: a gapless sequence where every event's hash
/// covers its fields and the previous event's hash. Appends also fan out on
/// an in-process broadcast bus for live observers.
pub struct EventService {
    event_repo: Arc<dyn EventRepo>,
    bus: broadcast::Sender<LifecycleEvent>,
}

impl EventService {
    pub fn new(event_repo: Arc<dyn EventRepo>) -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        Self { event_repo, bus }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.bus.subscribe()
    }

    /// Appends a new event at the chain head. A sequence collision with a
    /// concurrent appender is retried against the fresh head.
    pub async fn publish(
        &self,
        event_type: EventType,
        build_id: Option<&BuildId>,
        worker_id: Option<&WorkerId>,
        payload: serde_json::Value,
    ) -> Result<LifecycleEvent, EventError> {
        let payload_text = payload.to_string();

        for _ in 0..APPEND_ATTEMPTS {
            let head = self.event_repo.last().await?;
            let (sequence, previous_hash) = match &head {
                Some(last) => (last.sequence + 1, last.event_hash.clone()),
                None => (1, GENESIS_HASH.to_string()),
            };

            let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
            let record = EventRecord {
                sequence,
                event_type: event_type.as_str().to_string(),
                build_id: build_id.map(|id| id.0.clone()),
                worker_id: worker_id.map(|id| id.0.clone()),
                payload: payload_text.clone(),
                created_at: created_at.clone(),
                previous_hash: previous_hash.clone(),
                event_hash: String::new(),
            };
            let record = EventRecord {
                event_hash: compute_event_hash(&record),
                ..record
            };

            match self.event_repo.append(&record).await {
                Ok(()) => {
                    debug!(sequence, event_type = %event_type, "appended lifecycle event");
                    let event =
                        LifecycleEvent::try_from(record).map_err(EventError::Corrupt)?;
                    let _ = self.bus.send(event.clone());
                    return Ok(event);
                }
                Err(RepoError::UniqueViolation(_)) => continue,
                Err(other) => return Err(other.into()),
            }
        }

        Err(EventError::Contention)
    }

    pub async fn list_after(
        &self,
        after: i64,
        limit: i64,
    ) -> Result<Vec<LifecycleEvent>, EventError> {
        let records = self.event_repo.list_after(after, limit).await?;
        records
            .into_iter()
            .map(|record| LifecycleEvent::try_from(record).map_err(EventError::Corrupt))
            .collect()
    }

    /// Walks the whole chain and returns the sequence number of the first
    /// event whose linkage or hash does not verify, or `None` for an intact
    /// chain.
    pub async fn verify_chain(&self) -> Result<Option<i64>, EventError> {
        let records = self.event_repo.list_all().await?;

        let mut expected_sequence = 1;
        let mut expected_previous = GENESIS_HASH.to_string();

        for record in records {
            if record.sequence != expected_sequence
                || record.previous_hash != expected_previous
                || record.event_hash != compute_event_hash(&record)
            {
                return Ok(Some(record.sequence));
            }
            expected_sequence = record.sequence + 1;
            expected_previous = record.event_hash;
        }

        Ok(None)
    }
}

/// Canonical encoding hashed into `event_hash`: the pipe-joined fields of
/// the event followed by the previous hash. Absent ids encode as empty
/// strings; the payload is its compact JSON text.
fn canonical_encoding(record: &EventRecord) -> String {
    format!(
        "{}|{}|{}|{}|{}|{}|{}",
        record.sequence,
        record.event_type,
        record.build_id.as_deref().unwrap_or(""),
        record.worker_id.as_deref().unwrap_or(""),
        record.payload,
        record.created_at,
        record.previous_hash,
    )
}

pub fn compute_event_hash(record: &EventRecord) -> String {
    hex::encode(Sha256::digest(canonical_encoding(record).as_bytes()))
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use assert2::check;

    fn record(sequence: i64, previous_hash: &str) -> EventRecord {
        let record = EventRecord {
            sequence,
            event_type: "build:submitted".to_string(),
            build_id: Some("abc123".to_string()),
            worker_id: None,
            payload: r#"{"platform":"ios"}"#.to_string(),
            created_at: "2025-06-01T12:00:00.000000Z".to_string(),
            previous_hash: previous_hash.to_string(),
            event_hash: String::new(),
        };
        EventRecord {
            event_hash: compute_event_hash(&record),
            ..record
        }
    }

    #[test]
    fn hash_is_stable_and_sensitive() {
        let a = record(1, GENESIS_HASH);
        let b = record(1, GENESIS_HASH);
        check!(a.event_hash == b.event_hash);
        check!(a.event_hash.len() == 64);

        let mut tampered = record(1, GENESIS_HASH);
        tampered.payload = r#"{"platform":"android"}"#.to_string();
        check!(compute_event_hash(&tampered) != a.event_hash);
    }

    #[test]
    fn hash_covers_previous_hash() {
        let first = record(1, GENESIS_HASH);
        let chained = record(2, &first.event_hash);
        let rechained = record(2, GENESIS_HASH);
        check!(chained.event_hash != rechained.event_hash);
    }
}
