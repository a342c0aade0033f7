use cadence::config::{QueueConfig, RealtimeConfig};
use cadence::sequence::rules;
use cadence::testing::{TestDatabase, TestServer};
use cadence::{JobQueue, Realtime, SequenceEngine};
use pretty_assertions::assert_eq;
use serde_json::json;

use crate::routes;
use crate::state::AppState;

const HOUR_MS: i64 = 3_600_000;

struct Fixture {
    _db: TestDatabase,
    server: TestServer,
    engine: SequenceEngine,
}

async fn fixture() -> Fixture {
    let db = TestDatabase::fresh().await.expect("test db");
    rules::create(db.conn(), 1, HOUR_MS, "checking in").await.unwrap();
    rules::create(db.conn(), 1, 2 * HOUR_MS, "last nudge").await.unwrap();

    let realtime = Realtime::local();
    let queue = JobQueue::new(QueueConfig::builder().build());
    let engine = SequenceEngine::new(db.connection(), queue, realtime.bus.clone());
    let config = RealtimeConfig {
        redis_url: None,
        sink_capacity: 16,
        keep_alive_secs: 15,
    };
    let state = AppState::new(engine.clone(), realtime, config);
    let server = TestServer::start(routes::router(state)).await;

    Fixture {
        _db: db,
        server,
        engine,
    }
}

async fn start(fx: &Fixture, client_id: i64) -> i64 {
    let response = fx
        .server
        .post_json("/workspaces/1/follow-ups", json!({ "client_id": client_id }))
        .await;
    assert_eq!(response.status, 201);
    response.json()["follow_up"]["id"].as_i64().unwrap()
}

#[tokio::test]
async fn start_creates_an_active_follow_up() {
    let fx = fixture().await;

    let response = fx
        .server
        .post_json("/workspaces/1/follow-ups", json!({ "client_id": 42 }))
        .await;

    assert_eq!(response.status, 201);
    let body = response.json();
    assert_eq!(body["result"], "applied");
    assert_eq!(body["transition"], "follow_up.started");
    assert_eq!(body["follow_up"]["status"], "ACTIVE");
    assert_eq!(body["follow_up"]["client_id"], 42);
    assert!(body["follow_up"].get("active_key").is_none());
}

#[tokio::test]
async fn second_start_for_the_same_client_conflicts() {
    let fx = fixture().await;
    start(&fx, 42).await;

    let response = fx
        .server
        .post_json("/workspaces/1/follow-ups", json!({ "client_id": 42 }))
        .await;

    assert_eq!(response.status, 409);
    assert_eq!(response.json()["error"], "conflict");
}

#[tokio::test]
async fn invalid_bodies_are_rejected() {
    let fx = fixture().await;

    let response = fx
        .server
        .post_json("/workspaces/1/follow-ups", json!({ "client_id": 0 }))
        .await;
    assert_eq!(response.status, 422);
    assert_eq!(
        response.json()["errors"]["client_id"],
        json!(["client_id must be a positive id"])
    );

    let response = fx
        .server
        .post_raw("/workspaces/1/follow-ups", "{\"client_id\":")
        .await;
    assert_eq!(response.status, 422);
    assert_eq!(response.json()["error"], "validation");
}

#[tokio::test]
async fn workspace_without_rules_is_not_found() {
    let fx = fixture().await;

    let response = fx
        .server
        .post_json("/workspaces/2/follow-ups", json!({ "client_id": 42 }))
        .await;

    assert_eq!(response.status, 404);
    assert_eq!(response.json()["error"], "not_found");
}

#[tokio::test]
async fn bad_ids_are_rejected() {
    let fx = fixture().await;

    let response = fx.server.post_json("/workspaces/1/follow-ups/abc/pause", json!({})).await;
    assert_eq!(response.status, 422);

    let response = fx.server.post_json("/workspaces/1/follow-ups/999/pause", json!({})).await;
    assert_eq!(response.status, 404);
}

#[tokio::test]
async fn pause_resume_and_convert() {
    let fx = fixture().await;
    let id = start(&fx, 42).await;

    let paused = fx
        .server
        .post_json(&format!("/workspaces/1/follow-ups/{}/pause", id), json!({}))
        .await;
    assert_eq!(paused.status, 200);
    assert_eq!(paused.json()["follow_up"]["status"], "PAUSED");
    assert_eq!(paused.json()["follow_up"]["next_step_at"], serde_json::Value::Null);

    let cancelled = fx
        .server
        .post_json(&format!("/workspaces/1/follow-ups/{}/cancel", id), json!({}))
        .await;
    assert_eq!(cancelled.status, 409);

    let resumed = fx
        .server
        .post_json(&format!("/workspaces/1/follow-ups/{}/resume", id), json!({}))
        .await;
    assert_eq!(resumed.status, 200);
    assert_eq!(resumed.json()["follow_up"]["status"], "ACTIVE");

    let converted = fx
        .server
        .post_json(&format!("/workspaces/1/follow-ups/{}/convert", id), json!({}))
        .await;
    assert_eq!(converted.json()["follow_up"]["status"], "CONVERTED");

    let again = fx
        .server
        .post_json(&format!("/workspaces/1/follow-ups/{}/convert", id), json!({}))
        .await;
    assert_eq!(again.status, 200);
    assert_eq!(again.json()["result"], "already_terminal");

    let stored = fx.engine.find(id).await.unwrap().unwrap();
    assert_eq!(stored.status, "CONVERTED");
}

#[tokio::test]
async fn follow_up_in_another_workspace_is_not_found() {
    let fx = fixture().await;
    let id = start(&fx, 42).await;

    let response = fx
        .server
        .post_json(&format!("/workspaces/2/follow-ups/{}/cancel", id), json!({}))
        .await;

    assert_eq!(response.status, 404);
}

#[tokio::test]
async fn workspace_stream_announces_then_relays_changes() {
    let fx = fixture().await;
    let mut stream = fx.server.stream("/streams/workspaces/1").await;
    assert_eq!(stream.status, 200);
    assert_eq!(stream.content_type, "text/event-stream");

    let ready = stream.next_event().await;
    assert_eq!(ready.event, "connection_ready");
    assert_eq!(ready.data, json!({ "channel": "workspace:1" }));

    let id = start(&fx, 42).await;

    let started = stream.next_event().await;
    assert_eq!(started.event, "follow_up.started");
    assert_eq!(started.data["type"], "follow_up.started");
    assert_eq!(started.data["follow_up"]["id"], id);
}

#[tokio::test]
async fn conversation_stream_opens_with_its_channel() {
    let fx = fixture().await;
    let mut stream = fx.server.stream("/streams/conversations/42").await;

    let ready = stream.next_event().await;
    assert_eq!(ready.data, json!({ "channel": "conversation:42" }));
}

#[tokio::test]
async fn health_and_unknown_routes() {
    let fx = fixture().await;

    let health = fx.server.get("/health").await;
    assert_eq!(health.status, 200);
    assert_eq!(health.json()["status"], "ok");

    let missing = fx.server.get("/nope").await;
    assert_eq!(missing.status, 404);
    assert_eq!(missing.json()["error"], "not_found");
}
