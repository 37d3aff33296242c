//! End-to-end pipeline tests against an in-process stub control plane.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::{header::AUTHORIZATION, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use lookout_monitor::{
    ControlPlaneClient, Monitor, MonitorConfig, MonitorError, MonitorEvent, PipelineState,
};
use lookout_types::{derive_state, LifecycleState};

#[derive(Clone)]
struct Stub {
    sessions: Arc<Mutex<Vec<Value>>>,
    list_calls: Arc<Mutex<Vec<Option<String>>>>,
    kills: Arc<Mutex<Vec<(String, String)>>>,
    respawns: Arc<Mutex<Vec<(String, Value)>>>,
    log_limits: Arc<Mutex<Vec<String>>>,
    fail_lists: Arc<AtomicBool>,
    fail_kills: Arc<AtomicBool>,
    push: broadcast::Sender<String>,
}

impl Stub {
    fn new(sessions: Vec<Value>) -> Self {
        let (push, _) = broadcast::channel(64);
        Self {
            sessions: Arc::new(Mutex::new(sessions)),
            list_calls: Arc::new(Mutex::new(Vec::new())),
            kills: Arc::new(Mutex::new(Vec::new())),
            respawns: Arc::new(Mutex::new(Vec::new())),
            log_limits: Arc::new(Mutex::new(Vec::new())),
            fail_lists: Arc::new(AtomicBool::new(false)),
            fail_kills: Arc::new(AtomicBool::new(false)),
            push,
        }
    }

    fn set_sessions(&self, sessions: Vec<Value>) {
        *self.sessions.lock().unwrap() = sessions;
    }

    fn list_count(&self) -> usize {
        self.list_calls.lock().unwrap().len()
    }

    fn push_frame(&self, frame: &Value) {
        let _ = self.push.send(frame.to_string());
    }
}

async fn list_sessions(State(stub): State<Stub>, headers: HeaderMap) -> Response {
    let auth = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    stub.list_calls.lock().unwrap().push(auth);
    if stub.fail_lists.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "plane down").into_response();
    }
    Json(Value::Array(stub.sessions.lock().unwrap().clone())).into_response()
}

async fn kill_session(
    State(stub): State<Stub>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    if stub.fail_kills.load(Ordering::SeqCst) {
        return (StatusCode::CONFLICT, "session is immortal").into_response();
    }
    let reason = body["reason"].as_str().unwrap_or_default().to_string();
    stub.kills.lock().unwrap().push((id, reason));
    Json(json!({ "ok": true })).into_response()
}

async fn get_session(State(stub): State<Stub>, Path(id): Path<String>) -> Response {
    let sessions = stub.sessions.lock().unwrap();
    match sessions.iter().find(|s| {
        s["id"].as_str() == Some(id.as_str()) || s["sessionId"].as_str() == Some(id.as_str())
    }) {
        Some(session) => Json(session.clone()).into_response(),
        None => (StatusCode::NOT_FOUND, "no such session").into_response(),
    }
}

async fn respawn_session(
    State(stub): State<Stub>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Json<Value> {
    stub.respawns.lock().unwrap().push((id, body));
    Json(json!({ "ok": true }))
}

async fn session_logs(
    State(stub): State<Stub>,
    Path(_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    stub.log_limits
        .lock()
        .unwrap()
        .push(params.get("limit").cloned().unwrap_or_default());
    Json(json!([
        { "timestamp": "2026-02-12T20:25:00Z", "level": "info", "message": "spawned" },
        { "timestamp": "2026-02-12T20:26:00Z", "level": "warn", "message": "slow provider" }
    ]))
}

async fn session_metrics(Path(id): Path<String>) -> Json<Value> {
    Json(json!({ "id": id, "cpuSeconds": 12.5 }))
}

async fn push_handler(State(stub): State<Stub>, ws: WebSocketUpgrade) -> Response {
    // Subscribe before completing the handshake so frames pushed right after
    // the client observes the connection are never missed.
    let rx = stub.push.subscribe();
    ws.on_upgrade(move |socket| forward_push_frames(socket, rx))
}

async fn forward_push_frames(mut socket: WebSocket, mut rx: broadcast::Receiver<String>) {
    while let Ok(frame) = rx.recv().await {
        if socket.send(WsMessage::Text(frame.into())).await.is_err() {
            break;
        }
    }
}

async fn spawn_stub(stub: Stub) -> String {
    let app = Router::new()
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/ws", get(push_handler))
        .route("/api/sessions/{id}", get(get_session))
        .route("/api/sessions/{id}/kill", post(kill_session))
        .route("/api/sessions/{id}/respawn", post(respawn_session))
        .route("/api/sessions/{id}/logs", get(session_logs))
        .route("/api/sessions/{id}/metrics", get(session_metrics))
        .with_state(stub);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/api")
}

fn config(base_url: String) -> MonitorConfig {
    MonitorConfig {
        base_url,
        use_push: false,
        poll_interval: Duration::from_secs(3600),
        ..Default::default()
    }
}

async fn wait_for<F>(rx: &mut broadcast::Receiver<MonitorEvent>, pred: F) -> MonitorEvent
where
    F: Fn(&MonitorEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = rx.recv().await.expect("event bus closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn is_snapshot(event: &MonitorEvent) -> bool {
    matches!(event, MonitorEvent::SnapshotUpdated { .. })
}

/// Wait until both the first reconciliation and the push connection have
/// happened; the two races freely at startup.
async fn wait_until_streaming(rx: &mut broadcast::Receiver<MonitorEvent>) {
    let mut have_snapshot = false;
    let mut have_push = false;
    while !(have_snapshot && have_push) {
        let event = wait_for(rx, |e| {
            is_snapshot(e) || matches!(e, MonitorEvent::PushConnected)
        })
        .await;
        match event {
            MonitorEvent::SnapshotUpdated { .. } => have_snapshot = true,
            MonitorEvent::PushConnected => have_push = true,
            _ => {}
        }
    }
}

// ── Polling ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn first_poll_is_immediate_and_ordered_by_id() {
    let stub = Stub::new(vec![
        json!({ "id": "beta", "name": "B", "status": "working", "progress": 10 }),
        json!({ "id": "alpha", "name": "A", "status": "working", "progress": 20 }),
    ]);
    let base = spawn_stub(stub.clone()).await;
    let monitor = Monitor::new(config(base));
    let mut rx = monitor.subscribe();

    monitor.start();
    wait_for(&mut rx, is_snapshot).await;

    let ids: Vec<String> = monitor.sessions().into_iter().map(|r| r.id).collect();
    assert_eq!(ids, vec!["alpha", "beta"]);
    assert_eq!(monitor.current().generation(), 1);
    assert_eq!(monitor.state(), PipelineState::Polling);
    monitor.stop();
}

#[tokio::test]
async fn full_poll_omission_prunes_departed_sessions() {
    let stub = Stub::new(vec![
        json!({ "id": "a", "status": "working" }),
        json!({ "id": "b", "status": "working" }),
    ]);
    let base = spawn_stub(stub.clone()).await;
    let monitor = Monitor::new(MonitorConfig {
        poll_interval: Duration::from_millis(100),
        ..config(base)
    });
    let mut rx = monitor.subscribe();

    monitor.start();
    wait_for(&mut rx, is_snapshot).await;
    assert_eq!(monitor.current().len(), 2);

    stub.set_sessions(vec![json!({ "id": "a", "status": "working" })]);
    wait_for(&mut rx, |e| {
        is_snapshot(e) && monitor.current().len() == 1
    })
    .await;
    assert!(monitor.current().get("b").is_none());
    monitor.stop();
}

#[tokio::test]
async fn poll_failure_keeps_last_good_snapshot() {
    let stub = Stub::new(vec![json!({ "id": "a", "status": "working" })]);
    let base = spawn_stub(stub.clone()).await;
    let monitor = Monitor::new(MonitorConfig {
        poll_interval: Duration::from_millis(100),
        ..config(base)
    });
    let mut rx = monitor.subscribe();

    monitor.start();
    wait_for(&mut rx, is_snapshot).await;

    stub.fail_lists.store(true, Ordering::SeqCst);
    let event = wait_for(&mut rx, |e| matches!(e, MonitorEvent::PollFailed { .. })).await;
    assert!(matches!(event, MonitorEvent::PollFailed { .. }));
    assert_eq!(monitor.current().len(), 1, "stale view must stay visible");
    assert!(monitor.last_error().is_some());

    // The scheduled attempts keep coming and the next success clears the error.
    stub.fail_lists.store(false, Ordering::SeqCst);
    wait_for(&mut rx, is_snapshot).await;
    assert!(monitor.last_error().is_none());
    monitor.stop();
}

#[tokio::test]
async fn bearer_token_is_attached_when_configured() {
    let stub = Stub::new(vec![]);
    let base = spawn_stub(stub.clone()).await;
    let monitor = Monitor::new(MonitorConfig {
        bearer_token: Some("secret-token".into()),
        ..config(base)
    });
    let mut rx = monitor.subscribe();

    monitor.start();
    wait_for(&mut rx, is_snapshot).await;
    let auth = stub.list_calls.lock().unwrap()[0].clone();
    assert_eq!(auth.as_deref(), Some("Bearer secret-token"));
    monitor.stop();
}

// ── Actions ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn successful_kill_forces_immediate_reconciliation() {
    let stub = Stub::new(vec![json!({ "id": "x", "status": "working" })]);
    let base = spawn_stub(stub.clone()).await;
    let monitor = Monitor::new(config(base)); // hour-long interval
    let mut rx = monitor.subscribe();

    monitor.start();
    wait_for(&mut rx, is_snapshot).await;
    assert_eq!(stub.list_count(), 1);

    monitor
        .kill("x", Some("operator requested".into()))
        .await
        .unwrap();
    wait_for(&mut rx, is_snapshot).await;

    assert_eq!(stub.list_count(), 2, "kill must bypass the interval timer");
    assert_eq!(
        *stub.kills.lock().unwrap(),
        vec![("x".to_string(), "operator requested".to_string())]
    );
    monitor.stop();
}

#[tokio::test]
async fn respawn_carries_config_and_forces_reconciliation() {
    let stub = Stub::new(vec![json!({ "id": "x", "status": "failed" })]);
    let base = spawn_stub(stub.clone()).await;
    let monitor = Monitor::new(config(base));
    let mut rx = monitor.subscribe();

    monitor.start();
    wait_for(&mut rx, is_snapshot).await;

    monitor
        .respawn("x", json!({ "tokensLimit": 100_000 }))
        .await
        .unwrap();
    wait_for(&mut rx, is_snapshot).await;

    assert_eq!(stub.list_count(), 2);
    let respawns = stub.respawns.lock().unwrap();
    assert_eq!(respawns[0].0, "x");
    assert_eq!(respawns[0].1["tokensLimit"], json!(100_000));
    monitor.stop();
}

#[tokio::test]
async fn failed_kill_surfaces_error_and_skips_refresh() {
    let stub = Stub::new(vec![json!({ "id": "x", "status": "working" })]);
    stub.fail_kills.store(true, Ordering::SeqCst);
    let base = spawn_stub(stub.clone()).await;
    let monitor = Monitor::new(config(base));
    let mut rx = monitor.subscribe();

    monitor.start();
    wait_for(&mut rx, is_snapshot).await;

    let err = monitor.kill("x", None).await.unwrap_err();
    match err {
        MonitorError::Action { status, message } => {
            assert_eq!(status, 409);
            assert!(message.contains("immortal"));
        }
        other => panic!("expected action rejection, got {other}"),
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(stub.list_count(), 1, "no forced refresh on failure");
    monitor.stop();
}

#[tokio::test]
async fn single_session_fetch_normalizes_like_the_listing() {
    let stub = Stub::new(vec![json!({
        "sessionId": "abc", "taskName": "Merge V3", "status": "working", "progress": 65
    })]);
    let base = spawn_stub(stub.clone()).await;
    let client = ControlPlaneClient::new(&config(base));

    let raw = client.get_session("abc").await.unwrap();
    let record = raw.into_record(Utc::now());
    assert_eq!(record.id, "abc");
    assert_eq!(record.name, "Merge V3");
    assert_eq!(record.progress, 65);

    let err = client.get_session("missing").await.unwrap_err();
    assert!(matches!(err, MonitorError::Transport(_)));
}

#[tokio::test]
async fn logs_and_metrics_are_read_only_pass_throughs() {
    let stub = Stub::new(vec![]);
    let base = spawn_stub(stub.clone()).await;
    let monitor = Monitor::new(config(base));

    let logs = monitor.logs("a", 25).await.unwrap();
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[1].level, "warn");
    assert_eq!(*stub.log_limits.lock().unwrap(), vec!["25".to_string()]);

    let metrics = monitor.metrics("a").await.unwrap();
    assert_eq!(metrics["cpuSeconds"], json!(12.5));

    // Neither query touched the store or started anything.
    assert!(monitor.current().is_empty());
    assert_eq!(monitor.state(), PipelineState::Idle);
}

// ── Push channel ───────────────────────────────────────────────────────────

#[tokio::test]
async fn push_delta_merges_into_current_generation() {
    let stub = Stub::new(vec![json!({
        "id": "a", "status": "working", "progress": 100,
        "lastActivity": Utc::now().to_rfc3339()
    })]);
    let base = spawn_stub(stub.clone()).await;
    let monitor = Monitor::new(MonitorConfig {
        use_push: true,
        ..config(base)
    });
    let mut rx = monitor.subscribe();

    monitor.start();
    wait_until_streaming(&mut rx).await;
    assert_eq!(monitor.state(), PipelineState::Streaming);

    stub.push_frame(&json!({
        "id": "a", "status": "working", "progress": 50,
        "lastActivity": Utc::now().to_rfc3339()
    }));
    wait_for(&mut rx, is_snapshot).await;

    let snapshot = monitor.current();
    let entry = snapshot.get("a").unwrap();
    assert_eq!(entry.record.progress, 50);
    assert_eq!(snapshot.generation(), 1, "delta does not advance generations");
    // Merge and derivation are independent layers: the merged record reports
    // 50% and classifies as working.
    assert_eq!(
        derive_state(&entry.record, Utc::now()),
        LifecycleState::Working
    );
    monitor.stop();
}

#[tokio::test]
async fn malformed_push_frame_is_dropped_without_killing_the_stream() {
    let stub = Stub::new(vec![json!({ "id": "a", "status": "working", "progress": 1 })]);
    let base = spawn_stub(stub.clone()).await;
    let monitor = Monitor::new(MonitorConfig {
        use_push: true,
        ..config(base)
    });
    let mut rx = monitor.subscribe();

    monitor.start();
    wait_until_streaming(&mut rx).await;

    let _ = stub.push.send("this is not json".to_string());
    stub.push_frame(&json!({ "id": "a", "status": "working", "progress": 7 }));
    wait_for(&mut rx, is_snapshot).await;

    assert_eq!(monitor.current().get("a").unwrap().record.progress, 7);
    monitor.stop();
}

#[tokio::test]
async fn enveloped_push_frames_are_accepted() {
    let stub = Stub::new(vec![json!({ "id": "a", "status": "working", "progress": 1 })]);
    let base = spawn_stub(stub.clone()).await;
    let monitor = Monitor::new(MonitorConfig {
        use_push: true,
        ..config(base)
    });
    let mut rx = monitor.subscribe();

    monitor.start();
    wait_until_streaming(&mut rx).await;

    stub.push_frame(&json!({
        "type": "session.updated",
        "session": { "sessionId": "a", "status": "working", "progress": 42 }
    }));
    wait_for(&mut rx, is_snapshot).await;
    assert_eq!(monitor.current().get("a").unwrap().record.progress, 42);
    monitor.stop();
}

#[tokio::test]
async fn exhausted_reconnects_degrade_to_poll_only() {
    // A listener that is bound and immediately dropped yields an address
    // that refuses connections: every push connect fails fast.
    let dead = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let monitor = Monitor::new(MonitorConfig {
        base_url: format!("http://{dead_addr}/api"),
        use_push: true,
        poll_interval: Duration::from_secs(3600),
        max_reconnect_attempts: 1,
        ..Default::default()
    });
    let mut rx = monitor.subscribe();

    monitor.start();
    let event = wait_for(&mut rx, |e| matches!(e, MonitorEvent::PushDegraded { .. })).await;
    assert_eq!(event, MonitorEvent::PushDegraded { attempts: 1 });
    assert_eq!(monitor.state(), PipelineState::Degraded);
    assert!(
        monitor
            .last_error()
            .is_some_and(|e| e.contains("push channel abandoned")),
        "exhaustion must be surfaced as the pipeline error"
    );
    monitor.stop();
}
