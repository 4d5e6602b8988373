//! HttpRemote against a mock HTTP server
//!
//! Exercises the request shape, server id extraction and error mapping, and
//! the facade's queueing when the server misbehaves.

use std::sync::Arc;
use std::time::Duration;

use offsync::remote::{HttpRemote, HttpRemoteConfig, Remote, RemoteError};
use offsync::store::{DEFAULT_FLAT_CAPACITY, FlatStore, OFFLINE_QUEUE};
use offsync::{SaveOutcome, ServiceOptions, SyncService};
use serde_json::json;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn remote_for(server: &MockServer, timeout: Duration) -> HttpRemote {
    HttpRemote::new(HttpRemoteConfig {
        base_url: server.uri(),
        timeout,
    })
    .unwrap()
}

// ── save ────────────────────────────────────────────────────────

#[tokio::test]
async fn save_posts_payload_and_reads_item_id() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/vault"))
        .and(body_json(json!({"hash": "abc"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"item": {"id": "v-17"}})))
        .expect(1)
        .mount(&server)
        .await;

    let remote = remote_for(&server, Duration::from_secs(5));
    let ack = remote.save("vault", &json!({"hash": "abc"})).await.unwrap();
    assert_eq!(ack.server_id.as_deref(), Some("v-17"));
    assert_eq!(ack.body["item"]["id"], "v-17");
}

#[tokio::test]
async fn save_without_id_is_still_success() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/uploads"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"ok": true})))
        .mount(&server)
        .await;

    let remote = remote_for(&server, Duration::from_secs(5));
    let ack = remote.save("uploads", &json!({})).await.unwrap();
    assert!(ack.server_id.is_none());
}

#[tokio::test]
async fn save_non_success_status_maps_to_status_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let remote = remote_for(&server, Duration::from_secs(5));
    let err = remote.save("uploads", &json!({})).await.unwrap_err();
    assert_eq!(
        err,
        RemoteError::Status {
            status: 503,
            body: "maintenance".to_string()
        }
    );
    assert!(err.is_retryable());
}

#[tokio::test]
async fn save_non_json_body_is_invalid_response() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>proxy login</html>"))
        .mount(&server)
        .await;

    let remote = remote_for(&server, Duration::from_secs(5));
    let err = remote.save("uploads", &json!({})).await.unwrap_err();
    assert!(matches!(err, RemoteError::InvalidResponse(_)));
}

#[tokio::test]
async fn save_slow_server_times_out() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"id": 1}))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let remote = remote_for(&server, Duration::from_millis(200));
    let err = remote.save("uploads", &json!({})).await.unwrap_err();
    assert!(matches!(err, RemoteError::Timeout(_)));
}

#[tokio::test]
async fn unreachable_server_is_network_error() {
    let remote = HttpRemote::new(HttpRemoteConfig {
        base_url: "http://127.0.0.1:1".to_string(),
        timeout: Duration::from_secs(2),
    })
    .unwrap();

    let err = remote.save("uploads", &json!({})).await.unwrap_err();
    assert!(matches!(err, RemoteError::Network(_) | RemoteError::Timeout(_)));
}

// ── fetch ───────────────────────────────────────────────────────

#[tokio::test]
async fn fetch_returns_body() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/documents"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": [{"id": "d1"}]})))
        .mount(&server)
        .await;

    let remote = remote_for(&server, Duration::from_secs(5));
    let body = remote.fetch("documents").await.unwrap();
    assert_eq!(body["items"][0]["id"], "d1");
}

// ── through the service ─────────────────────────────────────────

#[tokio::test]
async fn service_queues_on_server_error_and_drains_later() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/submissions"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/submissions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"item": {"id": 99}})))
        .mount(&server)
        .await;

    let flat = Arc::new(FlatStore::in_memory(DEFAULT_FLAT_CAPACITY));
    let remote = Arc::new(remote_for(&server, Duration::from_secs(5)));
    let service = SyncService::init(ServiceOptions::default(), flat, remote).await.unwrap();

    let outcome = service
        .facade()
        .save("submissions", json!({"form": "w9"}), "submissions")
        .await
        .unwrap();
    let SaveOutcome::QueuedOffline { key, reason, .. } = outcome else {
        panic!("expected queued outcome");
    };
    assert!(reason.contains("500"));
    assert_eq!(service.store().count(OFFLINE_QUEUE).await.unwrap(), 1);

    service.drain_now().await.unwrap();

    assert_eq!(service.store().count(OFFLINE_QUEUE).await.unwrap(), 0);
    let record = service.store().get("submissions", &key).await.unwrap().unwrap();
    assert!(record.synced);
    assert_eq!(record.server_id.as_deref(), Some("99"));

    service.close().await.unwrap();
}
