//! State synchronization with the Atlas orchestrator.
//!
//! Maintains a duplex WebSocket to the remote peer. The peer is the system
//! of record: it pushes full-state snapshots that replace the local cache
//! wholesale. The local side applies its own task mutations optimistically,
//! then reports them via fire-and-forget RPC — task progress is never
//! gated on remote connectivity.

use crate::event::StreamEvent;
use crate::task::{Task, TaskPatch, TaskState};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use url::Url;

/// Bound on the reconnect backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Default handshake bound: transport connect plus first snapshot.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors that can occur in the tunnel.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("failed to connect to peer: {0}")]
    Connect(#[source] tokio_tungstenite::tungstenite::Error),

    #[error("handshake timed out")]
    HandshakeTimeout,
}

/// Tunnel connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Connection settings for one bridge identity.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Room URL on the relay (e.g. `wss://host/parties/main/<room>`).
    pub url: Url,
    /// Stable identity string, sent as the `id` query parameter.
    pub identity: String,
    /// Role header distinguishing bridges from UI clients.
    pub role: String,
    /// Keep reconnecting with backoff after a drop.
    pub reconnect: bool,
    /// Bound on connect + first snapshot.
    pub handshake_timeout: Duration,
}

impl TunnelConfig {
    #[must_use]
    pub fn new(url: Url, identity: impl Into<String>) -> Self {
        Self {
            url,
            identity: identity.into(),
            role: "agent-bridge".into(),
            reconnect: false,
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }

    /// The full connection URL with identity/role query parameters.
    #[must_use]
    pub fn connect_url(&self) -> Url {
        let mut url = self.url.clone();
        url.query_pairs_mut()
            .append_pair("id", &self.identity)
            .append_pair("role", &self.role);
        url
    }
}

/// Messages pushed by the remote peer.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum Inbound {
    /// Authoritative full-state snapshot.
    State {
        #[serde(default)]
        tasks: HashMap<String, Task>,
    },
    /// Bare connection acknowledgment (sent before the first snapshot).
    Connected,
    /// Anything else — echoes of our own sends included — is ignored.
    #[serde(other)]
    Other,
}

/// Messages sent to the remote peer.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum Outbound<'a> {
    /// RPC call against the remote actor.
    Call {
        method: &'a str,
        args: Vec<serde_json::Value>,
    },
    /// Ephemeral event fan-out; never persisted on either side.
    Broadcast {
        #[serde(rename = "taskId")]
        task_id: &'a str,
        events: &'a [StreamEvent],
    },
}

struct TunnelShared {
    cache: Mutex<HashMap<String, Task>>,
    /// Last state seen per task, for idempotent new-task delivery.
    seen: Mutex<HashMap<String, TaskState>>,
    state: Mutex<ConnectionState>,
    task_tx: mpsc::Sender<Task>,
}

impl TunnelShared {
    fn set_state(&self, state: ConnectionState) {
        let mut guard = self.state.lock().expect("lock poisoned");
        *guard = state;
    }

    /// Apply one inbound message. Returns true when it completes the
    /// handshake (first snapshot or ack).
    async fn handle_inbound(&self, text: &str) -> bool {
        let inbound = match serde_json::from_str::<Inbound>(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                debug!(%e, "ignoring unparseable peer message");
                return false;
            }
        };

        match inbound {
            Inbound::State { tasks } => {
                // The snapshot is authoritative: replace the cache wholesale
                // and work out which tasks just became runnable.
                let deliveries: Vec<Task> = {
                    let mut seen = self.seen.lock().expect("lock poisoned");
                    let fresh: Vec<Task> = tasks
                        .values()
                        .filter(|task| {
                            task.state.is_runnable() && seen.get(&task.id) != Some(&task.state)
                        })
                        .cloned()
                        .collect();
                    for task in tasks.values() {
                        seen.insert(task.id.clone(), task.state);
                    }
                    fresh
                };
                {
                    let mut cache = self.cache.lock().expect("lock poisoned");
                    *cache = tasks;
                }
                for task in deliveries {
                    info!(id = %task.id, state = ?task.state, agent = %task.agent_id, "task assigned");
                    let _ = self.task_tx.send(task).await;
                }
                true
            }
            Inbound::Connected => true,
            Inbound::Other => false,
        }
    }
}

/// Stream of tasks entering `new`/`continue`, one delivery per transition.
pub type TaskFeed = mpsc::Receiver<Task>;

/// Handle to the synchronization tunnel. Cheap to clone; all clones share
/// one cache and one outbound channel.
#[derive(Clone)]
pub struct SyncTunnel {
    shared: Arc<TunnelShared>,
    out_tx: mpsc::Sender<String>,
}

impl SyncTunnel {
    /// Connect to the remote peer. Resolves once the transport handshake
    /// completes and the first snapshot (or `connected` ack) arrives.
    pub async fn connect(config: TunnelConfig) -> Result<(Self, TaskFeed), TunnelError> {
        let (task_tx, task_rx) = mpsc::channel(64);
        let (out_tx, out_rx) = mpsc::channel(256);
        let shared = Arc::new(TunnelShared {
            cache: Mutex::new(HashMap::new()),
            seen: Mutex::new(HashMap::new()),
            state: Mutex::new(ConnectionState::Connecting),
            task_tx,
        });

        let connect_url = config.connect_url();
        info!(url = %connect_url, "connecting to peer");

        let ws = match timeout(
            config.handshake_timeout,
            connect_async(connect_url.as_str()),
        )
        .await
        {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(e)) => {
                shared.set_state(ConnectionState::Disconnected);
                return Err(TunnelError::Connect(e));
            }
            Err(_elapsed) => {
                shared.set_state(ConnectionState::Disconnected);
                return Err(TunnelError::HandshakeTimeout);
            }
        };

        let (handshake_tx, handshake_rx) = oneshot::channel();
        let io = tokio::spawn(io_task(
            config.clone(),
            Arc::clone(&shared),
            out_rx,
            ws,
            handshake_tx,
        ));

        // Both a timeout and a connection that dies before the first
        // snapshot count as a failed handshake.
        match timeout(config.handshake_timeout, handshake_rx).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) | Err(_) => {
                io.abort();
                shared.set_state(ConnectionState::Disconnected);
                return Err(TunnelError::HandshakeTimeout);
            }
        }

        Ok((Self { shared, out_tx }, task_rx))
    }

    /// A tunnel with no remote peer. All sends are swallowed (and logged),
    /// exactly like sends on a broken connection — used for local one-shot
    /// execution and in tests.
    #[must_use]
    pub fn detached() -> (Self, TaskFeed) {
        let (task_tx, task_rx) = mpsc::channel(64);
        let (out_tx, _dropped) = mpsc::channel(1);
        let shared = Arc::new(TunnelShared {
            cache: Mutex::new(HashMap::new()),
            seen: Mutex::new(HashMap::new()),
            state: Mutex::new(ConnectionState::Disconnected),
            task_tx,
        });
        (Self { shared, out_tx }, task_rx)
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        let guard = self.shared.state.lock().expect("lock poisoned");
        *guard
    }

    /// Put a task into the local cache without remote involvement. Used to
    /// seed locally-originated tasks (`exec`).
    pub fn track_task(&self, task: Task) {
        let mut seen = self.shared.seen.lock().expect("lock poisoned");
        seen.insert(task.id.clone(), task.state);
        drop(seen);
        let mut cache = self.shared.cache.lock().expect("lock poisoned");
        cache.insert(task.id.clone(), task);
    }

    /// Read a task back from the cache.
    #[must_use]
    pub fn get_task(&self, id: &str) -> Option<Task> {
        let cache = self.shared.cache.lock().expect("lock poisoned");
        cache.get(id).cloned()
    }

    /// Apply a partial update optimistically, then report the full task to
    /// the peer. RPC failures are logged and swallowed: task progress must
    /// not be blocked by a transient sync failure.
    pub async fn update_task(&self, id: &str, patch: TaskPatch) {
        let task = {
            let mut cache = self.shared.cache.lock().expect("lock poisoned");
            match cache.get_mut(id) {
                Some(task) => {
                    patch.apply_to(task);
                    task.clone()
                }
                None => {
                    warn!(%id, "update for unknown task dropped");
                    return;
                }
            }
        };

        match serde_json::to_value(&task) {
            Ok(value) => self.call("updateTask", vec![value]).await,
            Err(e) => warn!(%id, %e, "failed to serialize task update"),
        }
    }

    /// Append stored events to a task's context — additive and
    /// order-preserving, never a replacement.
    pub async fn append_context(
        &self,
        id: &str,
        events: Vec<StreamEvent>,
        new_state: Option<TaskState>,
    ) {
        if events.is_empty() && new_state.is_none() {
            return;
        }
        self.update_task(
            id,
            TaskPatch {
                state: new_state,
                append_context: events,
                ..TaskPatch::default()
            },
        )
        .await;
    }

    /// Fan out ephemeral events. Never touches the cache or task context.
    pub async fn broadcast(&self, task_id: &str, events: &[StreamEvent]) {
        if events.is_empty() {
            return;
        }
        self.send_outbound(&Outbound::Broadcast { task_id, events })
            .await;
    }

    /// Free-form "notify human" call.
    pub async fn notify(&self, summary: &str) {
        self.call("notifyHuman", vec![serde_json::Value::String(summary.into())])
            .await;
    }

    /// Fire-and-forget RPC against the remote actor.
    pub async fn call(&self, method: &str, args: Vec<serde_json::Value>) {
        self.send_outbound(&Outbound::Call { method, args }).await;
    }

    async fn send_outbound(&self, outbound: &Outbound<'_>) {
        let json = match serde_json::to_string(outbound) {
            Ok(json) => json,
            Err(e) => {
                warn!(%e, "failed to serialize outbound message");
                return;
            }
        };
        if self.out_tx.send(json).await.is_err() {
            // Store-and-forget: the connection is gone, the work continues.
            warn!("outbound message dropped, tunnel is down");
        }
    }
}

/// Owns the WebSocket for its whole life: pumps outbound messages, applies
/// inbound ones, and reconnects with backoff when configured to.
async fn io_task(
    config: TunnelConfig,
    shared: Arc<TunnelShared>,
    mut out_rx: mpsc::Receiver<String>,
    mut ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    handshake_tx: oneshot::Sender<()>,
) {
    let mut handshake_tx = Some(handshake_tx);
    let mut backoff = Duration::from_secs(1);

    loop {
        loop {
            tokio::select! {
                inbound = ws.next() => match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if shared.handle_inbound(&text).await {
                            shared.set_state(ConnectionState::Connected);
                            if let Some(tx) = handshake_tx.take() {
                                let _ = tx.send(());
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(%e, "tunnel read error");
                        break;
                    }
                },
                outbound = out_rx.recv() => match outbound {
                    Some(json) => {
                        if let Err(e) = ws.send(Message::Text(json)).await {
                            warn!(%e, "tunnel send error");
                            break;
                        }
                    }
                    // Every tunnel handle dropped — shut down cleanly.
                    None => {
                        let _ = ws.close(None).await;
                        return;
                    }
                },
            }
        }

        shared.set_state(ConnectionState::Disconnected);
        if !config.reconnect {
            return;
        }

        shared.set_state(ConnectionState::Reconnecting);
        let connect_url = config.connect_url();
        loop {
            warn!(delay = ?backoff, "tunnel dropped, reconnecting");
            tokio::time::sleep(backoff).await;
            match connect_async(connect_url.as_str()).await {
                Ok((new_ws, _response)) => {
                    info!("tunnel reconnected");
                    ws = new_ws;
                    backoff = Duration::from_secs(1);
                    // The peer re-sends its snapshot on connect; normal
                    // inbound handling takes it from here.
                    break;
                }
                Err(e) => {
                    warn!(%e, "reconnect failed");
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }
}
