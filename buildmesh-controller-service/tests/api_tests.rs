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

//! End-to-end scenarios over the full HTTP surface, backed by a fresh
//! sqlite catalog and a temp-dir object store per test.

test_r::enable!();

use assert2::{assert, check};
use async_zip::tokio::write::ZipFileWriter;
use async_zip::{Compression, ZipEntryBuilder};
use buildmesh_common::config::{DbConfig, DbSqliteConfig};
use buildmesh_controller_service::api;
use buildmesh_controller_service::config::ControllerServiceConfig;
use buildmesh_controller_service::db;
use buildmesh_controller_service::service::Services;
use chrono::{Duration, Utc};
use futures::future::join_all;
use http::StatusCode;
use poem::test::TestClient;
use poem::Endpoint;
use std::collections::HashSet;
use test_r::test;

const BOUNDARY: &str = "buildmesh-test-boundary";

fn admin_key() -> String {
    "k".repeat(32)
}

struct TestContext {
    _dir: tempfile::TempDir,
    services: Services,
}

async fn test_context() -> TestContext {
    test_context_with(|_| {}).await
}

async fn test_context_with(customize: impl FnOnce(&mut ControllerServiceConfig)) -> TestContext {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("controller.db");
    let db_config = DbSqliteConfig {
        database: db_path.to_string_lossy().to_string(),
        max_connections: 8,
    };

    let mut config = ControllerServiceConfig {
        api_key: admin_key(),
        storage_root: dir.path().join("storage"),
        db: DbConfig::Sqlite(db_config.clone()),
        ..ControllerServiceConfig::default()
    };
    customize(&mut config);

    db::sqlite_migrate(&db_config).await.unwrap();
    let services = Services::new(&config).await.unwrap();
    TestContext {
        _dir: dir,
        services,
    }
}

fn client(ctx: &TestContext) -> TestClient<impl Endpoint> {
    TestClient::new(api::combined_routes(&ctx.services))
}

fn multipart_body(parts: &[(&str, Option<&str>, Vec<u8>)]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, filename, content) in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        match filename {
            Some(filename) => body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n\
                     Content-Type: application/octet-stream\r\n\r\n"
                )
                .as_bytes(),
            ),
            None => body.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
            ),
        }
        body.extend_from_slice(content);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

fn multipart_content_type() -> String {
    format!("multipart/form-data; boundary={BOUNDARY}")
}

/// Submits a build as admin, returning `(build_id, owner_token)`.
async fn submit_build<E: Endpoint>(
    client: &TestClient<E>,
    platform: &str,
    source: &[u8],
    certs: Option<&[u8]>,
) -> (String, String) {
    let mut parts = vec![
        ("platform", None, platform.as_bytes().to_vec()),
        ("source", Some("source.zip"), source.to_vec()),
    ];
    if let Some(certs) = certs {
        parts.push(("certs", Some("certs.zip"), certs.to_vec()));
    }

    let resp = client
        .post("/api/builds/submit")
        .header("X-API-Key", admin_key())
        .header("content-type", multipart_content_type())
        .body(multipart_body(&parts))
        .send()
        .await;
    resp.assert_status_is_ok();

    let json = resp.json().await;
    let obj = json.value().object();
    check!(obj.get("status").string() == "pending");
    (
        obj.get("id").string().to_string(),
        obj.get("access_token").string().to_string(),
    )
}

/// Registers a worker as admin, returning `(worker_id, access_token)`.
async fn register_worker<E: Endpoint>(client: &TestClient<E>, id: &str) -> (String, String) {
    let resp = client
        .post("/api/workers/register")
        .header("X-API-Key", admin_key())
        .header("content-type", "application/json")
        .body(
            serde_json::to_vec(&serde_json::json!({
                "id": id,
                "name": format!("worker {id}"),
                "capabilities": {"os": "macos"},
            }))
            .unwrap(),
        )
        .send()
        .await;
    resp.assert_status_is_ok();

    let json = resp.json().await;
    let obj = json.value().object();
    (
        obj.get("id").string().to_string(),
        obj.get("access_token").string().to_string(),
    )
}

/// Polls as a worker; returns `(job_build_id, rotated_token)`.
async fn poll<E: Endpoint>(
    client: &TestClient<E>,
    worker_id: &str,
    token: &str,
) -> (Option<String>, String) {
    let resp = client
        .get("/api/workers/poll")
        .query("worker_id", &worker_id)
        .header("X-Worker-Id", worker_id)
        .header("X-Access-Token", token)
        .send()
        .await;
    resp.assert_status_is_ok();

    let json = resp.json().await;
    let obj = json.value().object();
    let job = if obj.get("job") == serde_json::Value::Null {
        None
    } else {
        Some(obj.get("job").object().get("id").string().to_string())
    };
    (job, obj.get("token").string().to_string())
}

/// Posts a heartbeat; returns `(status, rotated_token)`.
async fn heartbeat<E: Endpoint>(
    client: &TestClient<E>,
    build_id: &str,
    worker_id: &str,
    token: &str,
    progress: Option<i64>,
) -> (String, String) {
    let body = match progress {
        Some(progress) => serde_json::json!({ "progress": progress }),
        None => serde_json::json!({}),
    };
    let resp = client
        .post(format!("/api/builds/{build_id}/heartbeat"))
        .query("worker_id", &worker_id)
        .header("X-Worker-Id", worker_id)
        .header("X-Access-Token", token)
        .header("content-type", "application/json")
        .body(serde_json::to_vec(&body).unwrap())
        .send()
        .await;
    resp.assert_status_is_ok();

    let json = resp.json().await;
    let obj = json.value().object();
    (
        obj.get("status").string().to_string(),
        obj.get("token").string().to_string(),
    )
}

/// Uploads a result as a worker; returns the rotated token.
async fn upload_success<E: Endpoint>(
    client: &TestClient<E>,
    build_id: &str,
    worker_id: &str,
    token: &str,
    result: &[u8],
) -> String {
    let parts = vec![
        ("build_id", None, build_id.as_bytes().to_vec()),
        ("worker_id", None, worker_id.as_bytes().to_vec()),
        ("success", None, b"true".to_vec()),
        ("result", Some("result.ipa"), result.to_vec()),
    ];
    let resp = client
        .post("/api/workers/upload")
        .header("X-Worker-Id", worker_id)
        .header("X-Access-Token", token)
        .header("content-type", multipart_content_type())
        .body(multipart_body(&parts))
        .send()
        .await;
    resp.assert_status_is_ok();

    let json = resp.json().await;
    json.value().object().get("token").string().to_string()
}

async fn build_status<E: Endpoint>(
    client: &TestClient<E>,
    build_id: &str,
    owner_token: &str,
) -> (String, Option<String>) {
    let resp = client
        .get(format!("/api/builds/{build_id}/status"))
        .header("X-Build-Token", owner_token)
        .send()
        .await;
    resp.assert_status_is_ok();

    let json = resp.json().await;
    let obj = json.value().object();
    let worker_id = if obj.get("worker_id") == serde_json::Value::Null {
        None
    } else {
        Some(obj.get("worker_id").string().to_string())
    };
    (obj.get("status").string().to_string(), worker_id)
}

async fn certs_zip() -> Vec<u8> {
    let mut buffer = std::io::Cursor::new(Vec::new());
    let mut writer = ZipFileWriter::with_tokio(&mut buffer);
    writer
        .write_entry_whole(
            ZipEntryBuilder::new(String::from("cert.p12").into(), Compression::Stored),
            b"p12-bytes",
        )
        .await
        .unwrap();
    writer
        .write_entry_whole(
            ZipEntryBuilder::new(String::from("credentials.json").into(), Compression::Stored),
            br#"{"p12Password":"pw","keychainPassword":"kc"}"#,
        )
        .await
        .unwrap();
    writer
        .write_entry_whole(
            ZipEntryBuilder::new(
                String::from("profile.mobileprovision").into(),
                Compression::Stored,
            ),
            b"profile-bytes",
        )
        .await
        .unwrap();
    writer.close().await.unwrap();
    buffer.into_inner()
}

// Scenarios -------------------------------------------------------------

#[test]
async fn happy_path_round_trips_the_result_bytes() {
    let ctx = test_context().await;
    let client = client(&ctx);

    let source = vec![7u8; 100 * 1024];
    let (build_id, owner_token) = submit_build(&client, "ios", &source, None).await;

    let (worker_id, token) = register_worker(&client, "w1").await;
    let (job, token) = poll(&client, &worker_id, &token).await;
    check!(job.as_deref() == Some(build_id.as_str()));

    let (status, _) = build_status(&client, &build_id, &owner_token).await;
    check!(status == "assigned");

    let (hb, token) = heartbeat(&client, &build_id, &worker_id, &token, Some(10)).await;
    check!(hb == "ok");
    let (status, _) = build_status(&client, &build_id, &owner_token).await;
    check!(status == "building");
    let (hb, token) = heartbeat(&client, &build_id, &worker_id, &token, Some(50)).await;
    check!(hb == "ok");
    let (hb, token) = heartbeat(&client, &build_id, &worker_id, &token, None).await;
    check!(hb == "ok");

    let result = vec![42u8; 1024 * 1024];
    upload_success(&client, &build_id, &worker_id, &token, &result).await;

    let (status, bound_worker) = build_status(&client, &build_id, &owner_token).await;
    check!(status == "completed");
    check!(bound_worker.as_deref() == Some(worker_id.as_str()));

    // The owner gets back exactly the bytes the worker uploaded.
    let resp = client
        .get(format!("/api/builds/{build_id}/download"))
        .header("X-Build-Token", &owner_token)
        .send()
        .await;
    resp.assert_status_is_ok();
    resp.assert_header("content-length", result.len().to_string());
    resp.assert_bytes(result).await;

    // Stats reflect the completed build.
    let resp = client.get("/api/stats").send().await;
    resp.assert_status_is_ok();
    let json = resp.json().await;
    let obj = json.value().object();
    check!(obj.get("builds_completed_total").i64() == 1);
    check!(obj.get("builds").object().get("completed").i64() == 1);
}

#[test]
async fn contention_assigns_each_build_to_exactly_one_worker() {
    let ctx = test_context().await;
    let client = client(&ctx);

    let mut build_ids = HashSet::new();
    for _ in 0..10 {
        let (id, _) = submit_build(&client, "android", b"source", None).await;
        build_ids.insert(id);
    }

    let mut workers = Vec::new();
    for i in 0..20 {
        workers.push(register_worker(&client, &format!("w{i}")).await);
    }

    let polls = join_all(
        workers
            .iter()
            .map(|(worker_id, token)| poll(&client, worker_id, token)),
    )
    .await;

    let jobs: Vec<_> = polls.iter().filter_map(|(job, _)| job.clone()).collect();
    let empty = polls.iter().filter(|(job, _)| job.is_none()).count();

    check!(jobs.len() == 10);
    check!(empty == 10);
    let distinct: HashSet<_> = jobs.iter().cloned().collect();
    check!(distinct == build_ids);

    // The catalog agrees: ten active builds, each with a distinct worker.
    let resp = client
        .get("/api/builds/active")
        .header("X-API-Key", admin_key())
        .send()
        .await;
    resp.assert_status_is_ok();
    let json = resp.json().await;
    let active = json.value().array();
    check!(active.len() == 10);
    let mut seen_workers = HashSet::new();
    for i in 0..active.len() {
        let worker = active.get(i).object().get("worker_id").string().to_string();
        assert!(seen_workers.insert(worker));
    }
}

#[test]
async fn heartbeat_timeout_requeues_at_queue_head() {
    let ctx = test_context().await;
    let client = client(&ctx);

    let (first_build, owner_token) = submit_build(&client, "ios", b"first", None).await;
    let (worker_id, token) = register_worker(&client, "w1").await;
    let (job, _token) = poll(&client, &worker_id, &token).await;
    check!(job.as_deref() == Some(first_build.as_str()));

    // A later submission must not overtake the requeued build.
    let (second_build, _) = submit_build(&client, "ios", b"second", None).await;

    // Well past the heartbeat timeout, the sweep reclaims the build.
    let sweep_at = Utc::now() + Duration::seconds(121) + Duration::seconds(5);
    let report = ctx
        .services
        .liveness_monitor
        .sweep_once(sweep_at)
        .await
        .unwrap();
    check!(report.requeued_builds == 1);

    let (status, bound) = build_status(&client, &first_build, &owner_token).await;
    check!(status == "pending");
    check!(bound.is_none());

    // The worker that went silent is offline and an error log records why.
    let resp = client
        .get(format!("/api/builds/{first_build}/logs"))
        .header("X-Build-Token", &owner_token)
        .send()
        .await;
    resp.assert_status_is_ok();
    let json = resp.json().await;
    let logs = json.value().object().get("logs").array();
    let mut found = false;
    for i in 0..logs.len() {
        let entry = logs.get(i).object();
        if entry.get("message").string().contains("worker stopped responding") {
            check!(entry.get("level").string() == "error");
            found = true;
        }
    }
    assert!(found);

    // A fresh worker receives the requeued build before the newer one.
    let (w2, w2_token) = register_worker(&client, "w2").await;
    let (job, w2_token) = poll(&client, &w2, &w2_token).await;
    check!(job.as_deref() == Some(first_build.as_str()));
    let (job, _) = poll(&client, &w2, &w2_token).await;
    // Re-poll while holding a build returns the same build, not the next.
    check!(job.as_deref() == Some(first_build.as_str()));
    let _ = second_build;
}

#[test]
async fn source_download_is_streamed_to_admin_and_bound_worker_only() {
    let ctx = test_context().await;
    let client = client(&ctx);

    let source = b"source-archive-bytes".to_vec();
    let (build_id, owner_token) = submit_build(&client, "ios", &source, None).await;
    let (worker_id, token) = register_worker(&client, "w1").await;
    let (_, token) = poll(&client, &worker_id, &token).await;

    // Admin scope covers every endpoint.
    let resp = client
        .get(format!("/api/builds/{build_id}/source"))
        .header("X-API-Key", admin_key())
        .send()
        .await;
    resp.assert_status_is_ok();
    resp.assert_header("content-length", source.len().to_string());
    resp.assert_bytes(source.clone()).await;

    // The bound worker streams the same bytes.
    let resp = client
        .get(format!("/api/builds/{build_id}/source"))
        .header("X-Worker-Id", &worker_id)
        .header("X-Access-Token", &token)
        .send()
        .await;
    resp.assert_status_is_ok();
    resp.assert_bytes(source).await;

    // An unrelated worker is rejected laterally.
    let (intruder, intruder_token) = register_worker(&client, "intruder").await;
    let resp = client
        .get(format!("/api/builds/{build_id}/source"))
        .header("X-Worker-Id", &intruder)
        .header("X-Access-Token", &intruder_token)
        .send()
        .await;
    resp.assert_status(StatusCode::FORBIDDEN);

    // The owner token is status/logs/download scope, not source scope.
    let resp = client
        .get(format!("/api/builds/{build_id}/source"))
        .header("X-Build-Token", &owner_token)
        .send()
        .await;
    resp.assert_status(StatusCode::FORBIDDEN);
}

#[test]
async fn certs_secure_requires_matching_build_id_header() {
    let ctx = test_context().await;
    let client = client(&ctx);

    let bundle = certs_zip().await;
    let (build_id, _) = submit_build(&client, "ios", b"src", Some(&bundle)).await;
    let (other_build, _) = submit_build(&client, "ios", b"src2", None).await;

    let (worker_id, token) = register_worker(&client, "w1").await;
    let (job, token) = poll(&client, &worker_id, &token).await;
    check!(job.as_deref() == Some(build_id.as_str()));

    // Mismatched header: rejected before any cert material is touched.
    let resp = client
        .get(format!("/api/builds/{build_id}/certs-secure"))
        .header("X-Worker-Id", &worker_id)
        .header("X-Access-Token", &token)
        .header("X-Build-Id", &other_build)
        .send()
        .await;
    resp.assert_status(StatusCode::FORBIDDEN);

    // Missing header: same.
    let resp = client
        .get(format!("/api/builds/{build_id}/certs-secure"))
        .header("X-Worker-Id", &worker_id)
        .header("X-Access-Token", &token)
        .send()
        .await;
    resp.assert_status(StatusCode::FORBIDDEN);

    // Matching header: the unzipped bundle.
    let resp = client
        .get(format!("/api/builds/{build_id}/certs-secure"))
        .header("X-Worker-Id", &worker_id)
        .header("X-Access-Token", &token)
        .header("X-Build-Id", &build_id)
        .send()
        .await;
    resp.assert_status_is_ok();
    let json = resp.json().await;
    let obj = json.value().object();
    check!(obj.get("p12").string() == base64_standard(b"p12-bytes"));
    check!(obj.get("p12Password").string() == "pw");
    check!(obj.get("keychainPassword").string() == "kc");
    let profiles = obj.get("provisioningProfiles").array();
    check!(profiles.len() == 1);
    check!(profiles.get(0).string() == base64_standard(b"profile-bytes"));
}

fn base64_standard(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

#[test]
async fn retry_shares_source_and_fails_when_it_vanishes() {
    let ctx = test_context().await;
    let client = client(&ctx);

    let source = b"retry-source".to_vec();
    let (build_id, owner_token) = submit_build(&client, "android", &source, None).await;

    // A successful retry mints a new build over the same stored source.
    let resp = client
        .post(format!("/api/builds/{build_id}/retry"))
        .header("X-Build-Token", &owner_token)
        .send()
        .await;
    resp.assert_status_is_ok();
    let json = resp.json().await;
    let obj = json.value().object();
    let retried_id = obj.get("id").string().to_string();
    check!(retried_id != build_id);
    check!(obj.get("original_build_id").string() == build_id);
    check!(obj.get("status").string() == "pending");

    let resp = client
        .get(format!("/api/builds/{retried_id}/source"))
        .header("X-API-Key", admin_key())
        .send()
        .await;
    resp.assert_status_is_ok();
    resp.assert_bytes(source).await;

    // Remove the stored source out-of-band; retry must now fail loudly.
    std::fs::remove_file(
        ctx.services
            .config
            .storage_root
            .join("builds")
            .join(format!("{build_id}.zip")),
    )
    .unwrap();

    let resp = client
        .post(format!("/api/builds/{build_id}/retry"))
        .header("X-Build-Token", &owner_token)
        .send()
        .await;
    resp.assert_status(StatusCode::BAD_REQUEST);
    let json = resp.json().await;
    check!(
        json.value().object().get("error").string()
            == "Original build source no longer available"
    );
}

#[test]
async fn cancellation_is_discovered_by_the_worker() {
    let ctx = test_context().await;
    let client = client(&ctx);

    let (build_id, owner_token) = submit_build(&client, "ios", b"src", None).await;
    let (worker_id, token) = register_worker(&client, "w1").await;
    let (_, token) = poll(&client, &worker_id, &token).await;

    let resp = client
        .post(format!("/api/builds/{build_id}/cancel"))
        .header("X-Build-Token", &owner_token)
        .send()
        .await;
    resp.assert_status_is_ok();

    let (status, _) = build_status(&client, &build_id, &owner_token).await;
    check!(status == "failed");

    // Second cancel: terminal state conflict.
    let resp = client
        .post(format!("/api/builds/{build_id}/cancel"))
        .header("X-Build-Token", &owner_token)
        .send()
        .await;
    resp.assert_status(StatusCode::BAD_REQUEST);
    let json = resp.json().await;
    check!(json.value().object().get("error").string() == "Build already finished");

    // The worker learns about it on its next heartbeat, and the response
    // distinguishes cancellation from an unknown build.
    let (hb, token) = heartbeat(&client, &build_id, &worker_id, &token, None).await;
    check!(hb == "cancelled");
    let (hb, _) = heartbeat(&client, "no-such-build", &worker_id, &token, None).await;
    check!(hb == "unknown");
}

#[test]
async fn worker_registration_is_idempotent_and_rotates() {
    let ctx = test_context().await;
    let client = client(&ctx);

    let resp = client
        .post("/api/workers/register")
        .header("X-API-Key", admin_key())
        .header("content-type", "application/json")
        .body(
            serde_json::to_vec(
                &serde_json::json!({"id": "mac-1", "name": "Mac One", "capabilities": {}}),
            )
            .unwrap(),
        )
        .send()
        .await;
    resp.assert_status_is_ok();
    let json = resp.json().await;
    let first = json.value().object();
    check!(first.get("status").string() == "registered");
    let first_token = first.get("access_token").string().to_string();

    let resp = client
        .post("/api/workers/register")
        .header("X-API-Key", admin_key())
        .header("content-type", "application/json")
        .body(
            serde_json::to_vec(
                &serde_json::json!({"id": "mac-1", "name": "Mac One", "capabilities": {}}),
            )
            .unwrap(),
        )
        .send()
        .await;
    resp.assert_status_is_ok();
    let json = resp.json().await;
    let second = json.value().object();
    check!(second.get("status").string() == "re-registered");
    check!(second.get("id").string() == "mac-1");
    check!(second.get("access_token").string() != first_token);
}

#[test]
async fn worker_token_rotates_on_every_poll() {
    let ctx = test_context().await;
    let client = client(&ctx);

    let (worker_id, initial_token) = register_worker(&client, "w1").await;
    let (_, rotated) = poll(&client, &worker_id, &initial_token).await;
    check!(rotated != initial_token);

    // The previous token is invalid from the instant of rotation.
    let resp = client
        .get("/api/workers/poll")
        .query("worker_id", &worker_id)
        .header("X-Worker-Id", &worker_id)
        .header("X-Access-Token", &initial_token)
        .send()
        .await;
    resp.assert_status(StatusCode::UNAUTHORIZED);

    // The rotated token works.
    let (_, _) = poll(&client, &worker_id, &rotated).await;
}

#[test]
async fn credential_scopes_are_enforced() {
    let ctx = test_context().await;
    let client = client(&ctx);

    let (build_id, owner_token) = submit_build(&client, "ios", b"src", None).await;
    let (other_build, other_token) = submit_build(&client, "ios", b"src2", None).await;

    // No credentials at all.
    let resp = client
        .get(format!("/api/builds/{build_id}/status"))
        .send()
        .await;
    resp.assert_status(StatusCode::UNAUTHORIZED);

    // Wrong admin key.
    let resp = client
        .post("/api/builds/submit")
        .header("X-API-Key", "wrong".repeat(8))
        .header("content-type", multipart_content_type())
        .body(multipart_body(&[("platform", None, b"ios".to_vec())]))
        .send()
        .await;
    resp.assert_status(StatusCode::UNAUTHORIZED);

    // A token for another build does not transfer.
    let resp = client
        .get(format!("/api/builds/{build_id}/status"))
        .header("X-Build-Token", &other_token)
        .send()
        .await;
    resp.assert_status(StatusCode::UNAUTHORIZED);

    // The right owner token works.
    let resp = client
        .get(format!("/api/builds/{build_id}/status"))
        .header("X-Build-Token", &owner_token)
        .send()
        .await;
    resp.assert_status_is_ok();

    // Admin endpoints reject owner tokens outright.
    let resp = client
        .get("/api/builds/active")
        .header("X-Build-Token", &owner_token)
        .send()
        .await;
    resp.assert_status(StatusCode::FORBIDDEN);
    let _ = other_build;
}

#[test]
async fn payload_cap_aborts_with_413_and_discards_partials() {
    let ctx = test_context_with(|config| {
        config.limits.max_source_bytes = 1024;
    })
    .await;
    let client = client(&ctx);

    let resp = client
        .post("/api/builds/submit")
        .header("X-API-Key", admin_key())
        .header("content-type", multipart_content_type())
        .body(multipart_body(&[
            ("platform", None, b"ios".to_vec()),
            ("source", Some("source.zip"), vec![0u8; 4096]),
        ]))
        .send()
        .await;
    resp.assert_status(StatusCode::PAYLOAD_TOO_LARGE);

    // Nothing may remain in the source bucket.
    let entries: Vec<_> = std::fs::read_dir(ctx.services.config.storage_root.join("builds"))
        .unwrap()
        .collect();
    check!(entries.is_empty());
}

#[test]
async fn invalid_submissions_are_rejected() {
    let ctx = test_context().await;
    let client = client(&ctx);

    // Unknown platform.
    let resp = client
        .post("/api/builds/submit")
        .header("X-API-Key", admin_key())
        .header("content-type", multipart_content_type())
        .body(multipart_body(&[
            ("platform", None, b"windows".to_vec()),
            ("source", Some("source.zip"), b"src".to_vec()),
        ]))
        .send()
        .await;
    resp.assert_status(StatusCode::BAD_REQUEST);

    // Missing source.
    let resp = client
        .post("/api/builds/submit")
        .header("X-API-Key", admin_key())
        .header("content-type", multipart_content_type())
        .body(multipart_body(&[("platform", None, b"ios".to_vec())]))
        .send()
        .await;
    resp.assert_status(StatusCode::BAD_REQUEST);

    // Download before completion is a state conflict.
    let (build_id, owner_token) = submit_build(&client, "ios", b"src", None).await;
    let resp = client
        .get(format!("/api/builds/{build_id}/download"))
        .header("X-Build-Token", &owner_token)
        .send()
        .await;
    resp.assert_status(StatusCode::BAD_REQUEST);
}

#[test]
async fn worker_logs_are_validated_per_mode() {
    let ctx = test_context().await;
    let client = client(&ctx);

    let (build_id, owner_token) = submit_build(&client, "ios", b"src", None).await;
    let (worker_id, token) = register_worker(&client, "w1").await;
    let (_, token) = poll(&client, &worker_id, &token).await;

    // Single entry with an invalid level: rejected.
    let resp = client
        .post(format!("/api/builds/{build_id}/logs"))
        .header("X-Worker-Id", &worker_id)
        .header("X-Access-Token", &token)
        .header("content-type", "application/json")
        .body(serde_json::to_vec(&serde_json::json!({"level": "trace", "message": "x"})).unwrap())
        .send()
        .await;
    resp.assert_status(StatusCode::BAD_REQUEST);

    // The rejected call did not rotate the token away.
    // Batch mode: invalid entries are silently filtered.
    let resp = client
        .post(format!("/api/builds/{build_id}/logs"))
        .header("X-Worker-Id", &worker_id)
        .header("X-Access-Token", &token)
        .header("content-type", "application/json")
        .body(
            serde_json::to_vec(&serde_json::json!({"logs": [
                {"level": "info", "message": "building"},
                {"level": "nonsense", "message": "dropped"},
                {"level": "warn", "message": "low disk"},
            ]}))
            .unwrap(),
        )
        .send()
        .await;
    resp.assert_status_is_ok();

    let resp = client
        .get(format!("/api/builds/{build_id}/logs"))
        .header("X-Build-Token", &owner_token)
        .send()
        .await;
    resp.assert_status_is_ok();
    let json = resp.json().await;
    let logs = json.value().object().get("logs").array();
    let mut messages = Vec::new();
    for i in 0..logs.len() {
        messages.push(logs.get(i).object().get("message").string().to_string());
    }
    assert!(messages.contains(&"building".to_string()));
    assert!(messages.contains(&"low disk".to_string()));
    assert!(!messages.contains(&"dropped".to_string()));
}

#[test]
async fn telemetry_stores_valid_samples_and_counts_as_heartbeat() {
    let ctx = test_context().await;
    let client = client(&ctx);

    let (build_id, owner_token) = submit_build(&client, "ios", b"src", None).await;
    let (worker_id, token) = register_worker(&client, "w1").await;
    let (_, token) = poll(&client, &worker_id, &token).await;

    let resp = client
        .post(format!("/api/builds/{build_id}/telemetry"))
        .header("X-Worker-Id", &worker_id)
        .header("X-Access-Token", &token)
        .header("X-Build-Id", &build_id)
        .header("content-type", "application/json")
        .body(
            serde_json::to_vec(&serde_json::json!({
                "type": "cpu",
                "timestamp": 1735689600000u64,
                "data": {"cpu_percent": 420.5, "memory_mb": 2048.0}
            }))
            .unwrap(),
        )
        .send()
        .await;
    resp.assert_status_is_ok();

    // Telemetry without the matching header is a security failure.
    let json = resp.json().await;
    let token = json.value().object().get("token").string().to_string();
    let resp = client
        .post(format!("/api/builds/{build_id}/telemetry"))
        .header("X-Worker-Id", &worker_id)
        .header("X-Access-Token", &token)
        .header("content-type", "application/json")
        .body(serde_json::to_vec(&serde_json::json!({"type": "cpu"})).unwrap())
        .send()
        .await;
    resp.assert_status(StatusCode::FORBIDDEN);

    // The heartbeat moved even though only telemetry was posted.
    let (status, _) = build_status(&client, &build_id, &owner_token).await;
    check!(status == "assigned" || status == "building");
}

#[test]
async fn events_are_gapless_admin_only_and_chain_verified() {
    let ctx = test_context().await;
    let client = client(&ctx);

    let (build_id, _) = submit_build(&client, "ios", b"src", None).await;
    let (worker_id, token) = register_worker(&client, "w1").await;
    let (_, token) = poll(&client, &worker_id, &token).await;
    upload_success(&client, &build_id, &worker_id, &token, b"result").await;

    let resp = client.get("/api/events").send().await;
    resp.assert_status(StatusCode::UNAUTHORIZED);

    let resp = client
        .get("/api/events")
        .header("X-API-Key", admin_key())
        .send()
        .await;
    resp.assert_status_is_ok();
    let json = resp.json().await;
    let events = json.value().object().get("events").array();
    assert!(events.len() >= 3);

    let mut previous_hash: Option<String> = None;
    for i in 0..events.len() {
        let event = events.get(i).object();
        check!(event.get("sequence").i64() == i as i64 + 1);
        if let Some(previous) = &previous_hash {
            check!(event.get("previous_hash").string() == previous.as_str());
        }
        previous_hash = Some(event.get("event_hash").string().to_string());
    }

    check!(ctx
        .services
        .event_service
        .verify_chain()
        .await
        .unwrap()
        .is_none());
}

#[test]
async fn health_reports_queue_depth_and_storage() {
    let ctx = test_context().await;
    let client = client(&ctx);

    submit_build(&client, "ios", b"src", None).await;

    let resp = client.get("/health").send().await;
    resp.assert_status_is_ok();
    let json = resp.json().await;
    let obj = json.value().object();
    check!(obj.get("status").string() == "ok");
    check!(obj.get("queue").object().get("pending").i64() == 1);
    check!(obj.get("queue").object().get("active").i64() == 0);
    check!(obj.get("storage").object().get("available").bool());
}
