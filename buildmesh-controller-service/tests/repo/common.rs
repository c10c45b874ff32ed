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

//! Backend-agnostic repo test cases, driven by the per-backend harnesses.

use assert2::{assert, check, let_assert};
use buildmesh_controller_service::repo::build::{BuildRecord, BuildRepo};
use buildmesh_controller_service::repo::event::EventRepo;
use buildmesh_controller_service::repo::worker::{WorkerRecord, WorkerRepo};
use buildmesh_controller_service::repo::RepoError;
use buildmesh_controller_service::service::event::EventService;
use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;

pub struct Deps {
    pub build_repo: Arc<dyn BuildRepo>,
    pub worker_repo: Arc<dyn WorkerRepo>,
    pub event_repo: Arc<dyn EventRepo>,
}

pub fn build_record(submitted_at: DateTime<Utc>) -> BuildRecord {
    BuildRecord {
        id: nanoid::nanoid!(),
        platform: "ios".to_string(),
        status: "pending".to_string(),
        worker_id: None,
        access_token: nanoid::nanoid!(43),
        source_ref: "builds/source.zip".to_string(),
        certs_ref: None,
        result_ref: None,
        error_message: None,
        sequence: 0,
        submitted_at,
        assigned_at: None,
        started_at: None,
        last_heartbeat_at: None,
        completed_at: None,
    }
}

pub fn worker_record(now: DateTime<Utc>) -> WorkerRecord {
    WorkerRecord {
        id: nanoid::nanoid!(12),
        name: "test-worker".to_string(),
        capabilities: r#"{"os":"macos"}"#.to_string(),
        status: "idle".to_string(),
        access_token: nanoid::nanoid!(43),
        access_token_expires_at: now + Duration::seconds(90),
        last_seen_at: now,
        builds_completed: 0,
        builds_failed: 0,
        registered_at: now,
    }
}

// Common test cases -----------------------------------------------------

pub async fn test_insert_and_get_build(deps: &Deps) {
    let now = Utc::now();
    let record = build_record(now);

    let stored = deps.build_repo.insert(&record).await.unwrap();
    check!(stored.id == record.id);
    check!(stored.status == "pending");
    check!(stored.sequence >= 1);

    let second = deps.build_repo.insert(&build_record(now)).await.unwrap();
    check!(second.sequence > stored.sequence);

    let fetched = deps.build_repo.get(&record.id).await.unwrap();
    let_assert!(Some(fetched) = fetched);
    check!(fetched.access_token == record.access_token);
    check!(fetched.worker_id.is_none());

    check!(deps.build_repo.get("missing").await.unwrap().is_none());

    let all = deps.build_repo.list_all().await.unwrap();
    check!(all.len() == 2);
    check!(all[0].sequence < all[1].sequence);
}

pub async fn test_claim_picks_oldest_pending(deps: &Deps) {
    let base = Utc::now() - Duration::minutes(10);
    let oldest = deps
        .build_repo
        .insert(&build_record(base))
        .await
        .unwrap();
    let middle = deps
        .build_repo
        .insert(&build_record(base + Duration::minutes(1)))
        .await
        .unwrap();
    let _newest = deps
        .build_repo
        .insert(&build_record(base + Duration::minutes(2)))
        .await
        .unwrap();

    let w1 = worker_record(Utc::now());
    let w2 = worker_record(Utc::now());
    deps.worker_repo.insert(&w1).await.unwrap();
    deps.worker_repo.insert(&w2).await.unwrap();

    let now = Utc::now();
    let first = deps
        .build_repo
        .claim_next_pending(&w1.id, &w1.name, now)
        .await
        .unwrap();
    let_assert!(Some(first) = first);
    check!(first.id == oldest.id);
    check!(first.status == "assigned");
    check!(first.worker_id.as_deref() == Some(w1.id.as_str()));
    check!(first.assigned_at.is_some());
    check!(first.last_heartbeat_at.is_some());

    // The assignment log line is written in the same transaction.
    let logs = deps.build_repo.get_logs(&oldest.id).await.unwrap();
    assert!(logs
        .iter()
        .any(|log| log.message.contains("Assigned to worker")));

    let second = deps
        .build_repo
        .claim_next_pending(&w2.id, &w2.name, now)
        .await
        .unwrap();
    let_assert!(Some(second) = second);
    check!(second.id == middle.id);
}

pub async fn test_second_claim_by_same_worker_is_rejected(deps: &Deps) {
    let now = Utc::now();
    deps.build_repo.insert(&build_record(now)).await.unwrap();
    deps.build_repo.insert(&build_record(now)).await.unwrap();

    let worker = worker_record(now);
    deps.worker_repo.insert(&worker).await.unwrap();

    let first = deps
        .build_repo
        .claim_next_pending(&worker.id, &worker.name, now)
        .await
        .unwrap();
    assert!(first.is_some());

    // The partial unique index forbids a second active build per worker.
    let second = deps
        .build_repo
        .claim_next_pending(&worker.id, &worker.name, now)
        .await;
    let_assert!(Err(RepoError::UniqueViolation(_)) = second);
}

pub async fn test_concurrent_claims_are_disjoint(deps: &Deps) {
    let base = Utc::now() - Duration::minutes(5);
    let mut build_ids = HashSet::new();
    for i in 0..10 {
        let record = deps
            .build_repo
            .insert(&build_record(base + Duration::seconds(i)))
            .await
            .unwrap();
        build_ids.insert(record.id);
    }

    let now = Utc::now();
    let mut workers = Vec::new();
    for _ in 0..20 {
        let worker = worker_record(now);
        deps.worker_repo.insert(&worker).await.unwrap();
        workers.push(worker);
    }

    let claims = join_all(workers.iter().map(|worker| {
        deps.build_repo
            .claim_next_pending(&worker.id, &worker.name, now)
    }))
    .await;

    let mut claimed = Vec::new();
    let mut empty = 0;
    for claim in claims {
        match claim.unwrap() {
            Some(record) => claimed.push(record),
            None => empty += 1,
        }
    }

    // Exactly one winner per build, no build seen twice.
    check!(claimed.len() == 10);
    check!(empty == 10);
    let claimed_ids: HashSet<_> = claimed.iter().map(|record| record.id.clone()).collect();
    check!(claimed_ids == build_ids);
    let worker_ids: HashSet<_> = claimed
        .iter()
        .map(|record| record.worker_id.clone().unwrap())
        .collect();
    check!(worker_ids.len() == 10);

    let active = deps.build_repo.list_active().await.unwrap();
    check!(active.len() == 10);
    assert!(active.iter().all(|record| record.status == "assigned"));
}

pub async fn test_state_transitions_are_guarded(deps: &Deps) {
    let now = Utc::now();
    let record = deps.build_repo.insert(&build_record(now)).await.unwrap();
    let worker = worker_record(now);
    deps.worker_repo.insert(&worker).await.unwrap();

    // No transition applies to a pending build except claim and cancel.
    check!(!deps.build_repo.mark_building(&record.id, now).await.unwrap());
    check!(!deps
        .build_repo
        .complete(&record.id, &worker.id, "results/x.ipa", now)
        .await
        .unwrap());
    check!(!deps.build_repo.requeue(&record.id).await.unwrap());

    deps.build_repo
        .claim_next_pending(&worker.id, &worker.name, now)
        .await
        .unwrap()
        .unwrap();

    // Heartbeats are bound to the assigned worker.
    check!(deps
        .build_repo
        .record_heartbeat(&record.id, &worker.id, now)
        .await
        .unwrap());
    check!(!deps
        .build_repo
        .record_heartbeat(&record.id, "someone-else", now)
        .await
        .unwrap());

    check!(deps.build_repo.mark_building(&record.id, now).await.unwrap());
    check!(!deps.build_repo.mark_building(&record.id, now).await.unwrap());

    // Completion is bound to the assigned worker too.
    check!(!deps
        .build_repo
        .complete(&record.id, "someone-else", "results/x.ipa", now)
        .await
        .unwrap());
    check!(deps
        .build_repo
        .complete(&record.id, &worker.id, "results/x.ipa", now)
        .await
        .unwrap());

    let completed = deps.build_repo.get(&record.id).await.unwrap().unwrap();
    check!(completed.status == "completed");
    check!(completed.result_ref.as_deref() == Some("results/x.ipa"));
    check!(completed.completed_at.is_some());

    // Terminal states are frozen.
    check!(!deps.build_repo.requeue(&record.id).await.unwrap());
    check!(deps
        .build_repo
        .cancel(&record.id, "Build cancelled by user", now)
        .await
        .unwrap()
        .is_none());
}

pub async fn test_requeue_clears_worker_binding(deps: &Deps) {
    let now = Utc::now();
    let record = deps.build_repo.insert(&build_record(now)).await.unwrap();
    let worker = worker_record(now);
    deps.worker_repo.insert(&worker).await.unwrap();

    deps.build_repo
        .claim_next_pending(&worker.id, &worker.name, now)
        .await
        .unwrap()
        .unwrap();

    check!(deps.build_repo.requeue(&record.id).await.unwrap());
    let requeued = deps.build_repo.get(&record.id).await.unwrap().unwrap();
    check!(requeued.status == "pending");
    check!(requeued.worker_id.is_none());
    check!(requeued.assigned_at.is_none());
    check!(requeued.last_heartbeat_at.is_none());
    // Submission order is preserved for the next claim.
    check!(requeued.submitted_at == record.submitted_at);

    // The worker is free to claim again.
    let again = deps
        .build_repo
        .claim_next_pending(&worker.id, &worker.name, now)
        .await
        .unwrap();
    assert!(again.is_some());
}

pub async fn test_heartbeat_expiry_listing(deps: &Deps) {
    let now = Utc::now();
    let stale = deps
        .build_repo
        .insert(&build_record(now - Duration::minutes(30)))
        .await
        .unwrap();
    let fresh = deps
        .build_repo
        .insert(&build_record(now - Duration::minutes(29)))
        .await
        .unwrap();

    let w1 = worker_record(now);
    let w2 = worker_record(now);
    deps.worker_repo.insert(&w1).await.unwrap();
    deps.worker_repo.insert(&w2).await.unwrap();

    let long_ago = now - Duration::minutes(20);
    deps.build_repo
        .claim_next_pending(&w1.id, &w1.name, long_ago)
        .await
        .unwrap()
        .unwrap();
    deps.build_repo
        .claim_next_pending(&w2.id, &w2.name, long_ago)
        .await
        .unwrap()
        .unwrap();
    deps.build_repo
        .record_heartbeat(&fresh.id, &w2.id, now)
        .await
        .unwrap();

    let cutoff = now - Duration::minutes(2);
    let expired = deps.build_repo.list_heartbeat_expired(cutoff).await.unwrap();
    let expired_ids: Vec<_> = expired.iter().map(|record| record.id.as_str()).collect();
    assert!(expired_ids.contains(&stale.id.as_str()));
    assert!(!expired_ids.contains(&fresh.id.as_str()));
}

pub async fn test_worker_registration_and_rotation(deps: &Deps) {
    let now = Utc::now();
    let worker = worker_record(now);
    deps.worker_repo.insert(&worker).await.unwrap();

    // Rotation requires the current token.
    let rotated = deps
        .worker_repo
        .rotate_token(&worker.id, "wrong-token", "new-token", now, now)
        .await
        .unwrap();
    check!(!rotated);

    let expires = now + Duration::seconds(90);
    let rotated = deps
        .worker_repo
        .rotate_token(&worker.id, &worker.access_token, "new-token", expires, now)
        .await
        .unwrap();
    check!(rotated);

    let fetched = deps.worker_repo.get(&worker.id).await.unwrap().unwrap();
    check!(fetched.access_token == "new-token");

    // The old token is dead from the instant of the swap.
    let replay = deps
        .worker_repo
        .rotate_token(&worker.id, &worker.access_token, "evil", expires, now)
        .await
        .unwrap();
    check!(!replay);

    // Re-registration keeps the row but revives and rotates.
    deps.worker_repo
        .set_status(&worker.id, "offline")
        .await
        .unwrap();
    let existed = deps
        .worker_repo
        .reregister(&worker.id, "renamed", r#"{}"#, "token-3", expires, now)
        .await
        .unwrap();
    check!(existed);
    let fetched = deps.worker_repo.get(&worker.id).await.unwrap().unwrap();
    check!(fetched.name == "renamed");
    check!(fetched.status == "idle");
    check!(fetched.access_token == "token-3");
}

pub async fn test_worker_sweep_listings(deps: &Deps) {
    let now = Utc::now();

    let mut expired = worker_record(now);
    expired.access_token_expires_at = now - Duration::seconds(1);
    deps.worker_repo.insert(&expired).await.unwrap();

    let mut stale = worker_record(now);
    stale.last_seen_at = now - Duration::minutes(10);
    deps.worker_repo.insert(&stale).await.unwrap();

    let healthy = worker_record(now);
    deps.worker_repo.insert(&healthy).await.unwrap();

    let token_expired = deps.worker_repo.list_token_expired(now).await.unwrap();
    let ids: Vec<_> = token_expired.iter().map(|w| w.id.as_str()).collect();
    assert!(ids.contains(&expired.id.as_str()));
    assert!(!ids.contains(&healthy.id.as_str()));

    let stale_list = deps
        .worker_repo
        .list_stale(now - Duration::minutes(2))
        .await
        .unwrap();
    let ids: Vec<_> = stale_list.iter().map(|w| w.id.as_str()).collect();
    assert!(ids.contains(&stale.id.as_str()));
    assert!(!ids.contains(&healthy.id.as_str()));

    // Offline workers drop out of both listings.
    deps.worker_repo
        .set_status(&expired.id, "offline")
        .await
        .unwrap();
    let token_expired = deps.worker_repo.list_token_expired(now).await.unwrap();
    assert!(!token_expired.iter().any(|w| w.id == expired.id));
}

pub async fn test_event_chain_append_and_verify(deps: &Deps) {
    let event_service = EventService::new(deps.event_repo.clone());
    let mut bus = event_service.subscribe();

    let first = event_service
        .publish(
            buildmesh_controller_service::model::EventType::Submitted,
            None,
            None,
            serde_json::json!({"platform": "ios"}),
        )
        .await
        .unwrap();
    let second = event_service
        .publish(
            buildmesh_controller_service::model::EventType::Assigned,
            None,
            None,
            serde_json::json!({"worker_name": "w"}),
        )
        .await
        .unwrap();

    check!(first.sequence == 1);
    check!(second.sequence == 2);
    check!(second.previous_hash == first.event_hash);

    // Observers on the in-process bus see the same appends, in order.
    let observed = bus.recv().await.unwrap();
    check!(observed.sequence == 1);
    check!(observed.event_hash == first.event_hash);
    let observed = bus.recv().await.unwrap();
    check!(observed.sequence == 2);

    check!(event_service.verify_chain().await.unwrap().is_none());

    let page = event_service.list_after(0, 10).await.unwrap();
    check!(page.len() == 2);
    let tail = event_service.list_after(1, 10).await.unwrap();
    check!(tail.len() == 1);
    check!(tail[0].sequence == 2);
}

pub async fn test_build_counters(deps: &Deps) {
    let now = Utc::now();
    deps.build_repo.insert(&build_record(now)).await.unwrap();
    deps.build_repo.insert(&build_record(now)).await.unwrap();

    let counts: std::collections::HashMap<String, i64> =
        deps.build_repo.count_by_status().await.unwrap().into_iter().collect();
    check!(counts.get("pending").copied().unwrap_or(0) == 2);

    let worker = worker_record(now);
    deps.worker_repo.insert(&worker).await.unwrap();
    deps.worker_repo.increment_completed(&worker.id).await.unwrap();
    deps.worker_repo.increment_completed(&worker.id).await.unwrap();
    deps.worker_repo.increment_failed(&worker.id).await.unwrap();

    let (completed, failed) = deps.worker_repo.counter_totals().await.unwrap();
    check!(completed == 2);
    check!(failed == 1);
}
