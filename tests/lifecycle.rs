//! End-to-end lifecycle tests: tunnel over a loopback WebSocket peer, and
//! the runner driving tasks through it.
//!
//! Each test stands up its own in-process peer on an ephemeral port.

use atlas_bridge::agent::AgentKind;
use atlas_bridge::runner::AgentRunner;
use atlas_bridge::supervise::ProcessSupervisor;
use atlas_bridge::task::{Task, TaskPatch, TaskState};
use atlas_bridge::tunnel::{ConnectionState, SyncTunnel, TunnelConfig, TunnelError};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

/// A fake orchestrator: accepts one connection, pushes the given snapshot,
/// then forwards every message it receives into a channel.
async fn spawn_peer(snapshot: Option<String>) -> (Url, mpsc::Receiver<Value>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (msg_tx, msg_rx) = mpsc::channel(64);

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = tokio_tungstenite::accept_async(stream).await.expect("ws");
        if let Some(snapshot) = snapshot {
            ws.send(Message::Text(snapshot)).await.expect("send");
        }
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Text(text) = msg {
                let Ok(value) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                if msg_tx.send(value).await.is_err() {
                    break;
                }
            }
        }
    });

    let url = Url::parse(&format!("ws://{addr}")).expect("url");
    (url, msg_rx)
}

fn snapshot_with(tasks: &[Task]) -> String {
    let map: std::collections::HashMap<&str, &Task> =
        tasks.iter().map(|t| (t.id.as_str(), t)).collect();
    serde_json::json!({"type": "state", "tasks": map}).to_string()
}

fn config_for(url: Url) -> TunnelConfig {
    let mut config = TunnelConfig::new(url, "test-bridge");
    config.handshake_timeout = Duration::from_secs(5);
    config
}

#[tokio::test]
async fn connect_delivers_snapshot_task() {
    let task = Task::new("t1", "goose", "count the files");
    let (url, _peer_rx) = spawn_peer(Some(snapshot_with(&[task]))).await;

    let (tunnel, mut feed) = SyncTunnel::connect(config_for(url)).await.expect("connect");
    assert_eq!(tunnel.state(), ConnectionState::Connected);

    let delivered = timeout(Duration::from_secs(5), feed.recv())
        .await
        .expect("timeout")
        .expect("task");
    assert_eq!(delivered.id, "t1");
    assert_eq!(delivered.state, TaskState::New);
    assert!(tunnel.get_task("t1").is_some());
}

#[tokio::test]
async fn handshake_times_out_without_snapshot() {
    let (url, _peer_rx) = spawn_peer(None).await;

    let mut config = config_for(url);
    config.handshake_timeout = Duration::from_millis(300);

    let result = SyncTunnel::connect(config).await;
    assert!(matches!(result, Err(TunnelError::HandshakeTimeout)));
}

#[tokio::test]
async fn update_task_reports_full_task() {
    let task = Task::new("t1", "goose", "x");
    let (url, mut peer_rx) = spawn_peer(Some(snapshot_with(&[task]))).await;
    let (tunnel, mut feed) = SyncTunnel::connect(config_for(url)).await.expect("connect");
    let _ = feed.recv().await;

    tunnel
        .update_task("t1", TaskPatch::state(TaskState::InProgress))
        .await;

    let call = timeout(Duration::from_secs(5), peer_rx.recv())
        .await
        .expect("timeout")
        .expect("call");
    assert_eq!(call["type"], "call");
    assert_eq!(call["method"], "updateTask");
    // The RPC carries the whole task, not a diff.
    assert_eq!(call["args"][0]["id"], "t1");
    assert_eq!(call["args"][0]["state"], "in-progress");
    assert_eq!(call["args"][0]["description"], "x");
}

#[tokio::test]
async fn broadcast_is_not_a_call() {
    use atlas_bridge::event::{EventPayload, StreamEvent};

    let (url, mut peer_rx) = spawn_peer(Some(snapshot_with(&[]))).await;
    let (tunnel, _feed) = SyncTunnel::connect(config_for(url)).await.expect("connect");

    tunnel
        .broadcast(
            "t1",
            &[StreamEvent::new(EventPayload::Status {
                message: "busy".into(),
            })],
        )
        .await;

    let msg = timeout(Duration::from_secs(5), peer_rx.recv())
        .await
        .expect("timeout")
        .expect("msg");
    assert_eq!(msg["type"], "broadcast");
    assert_eq!(msg["taskId"], "t1");
    assert_eq!(msg["events"][0]["type"], "status");
}

#[tokio::test]
async fn one_shot_run_reports_progress_then_completion() {
    let task = Task::new("t1", "claude", "fix the bug");
    let (url, mut peer_rx) = spawn_peer(Some(snapshot_with(&[task]))).await;
    let (tunnel, mut feed) = SyncTunnel::connect(config_for(url)).await.expect("connect");
    let task = feed.recv().await.expect("task");

    let script = concat!(
        "printf '%s\\n' ",
        "'{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"Patched.\"}]}}' ",
        "'{\"type\":\"result\",\"subtype\":\"success\",\"result\":\"Patched.\"}'",
    );
    let runner = AgentRunner::with_command(
        AgentKind::Claude,
        ProcessSupervisor::new(),
        vec!["sh".into(), "-c".into(), script.into()],
        None,
    );
    runner.run(&task, &tunnel).await.expect("run");

    // First remote call marks the task in-progress, before any output.
    let first = timeout(Duration::from_secs(5), peer_rx.recv())
        .await
        .expect("timeout")
        .expect("first call");
    assert_eq!(first["method"], "updateTask");
    assert_eq!(first["args"][0]["state"], "in-progress");

    // The final updateTask carries completion, the result, and a context
    // holding exactly the stored events.
    let mut last = None;
    while let Ok(Some(msg)) = timeout(Duration::from_millis(500), peer_rx.recv()).await {
        if msg["type"] == "call" {
            last = Some(msg);
        }
    }
    let last = last.expect("final call");
    assert_eq!(last["args"][0]["state"], "completed");
    assert_eq!(last["args"][0]["result"], "Patched.");
    let context = last["args"][0]["context"].as_array().expect("context");
    assert_eq!(context.len(), 2);
    assert_eq!(context[0]["type"], "message");
    assert_eq!(context[1]["type"], "completion");
}

#[tokio::test]
async fn failed_run_reports_failure_reason() {
    let task = Task::new("t1", "claude", "x");
    let (url, mut peer_rx) = spawn_peer(Some(snapshot_with(&[task]))).await;
    let (tunnel, mut feed) = SyncTunnel::connect(config_for(url)).await.expect("connect");
    let task = feed.recv().await.expect("task");

    let runner = AgentRunner::with_command(
        AgentKind::Claude,
        ProcessSupervisor::new(),
        vec!["sh".into(), "-c".into(), "echo boom >&2; exit 2".into()],
        None,
    );
    runner.run(&task, &tunnel).await.expect_err("should fail");

    let mut last = None;
    while let Ok(Some(msg)) = timeout(Duration::from_millis(500), peer_rx.recv()).await {
        if msg["type"] == "call" {
            last = Some(msg);
        }
    }
    let last = last.expect("final call");
    assert_eq!(last["args"][0]["state"], "failed");
    assert!(
        last["args"][0]["result"]
            .as_str()
            .expect("result")
            .contains("boom")
    );
}
