//! Agent execution and task lifecycle.
//!
//! One-shot mode spawns a subprocess per task: spawn → stream → exit code →
//! result. Interactive mode (ACP agents) keeps one subprocess alive and
//! multiplexes many tasks over its stdin/stdout pipe.
//!
//! Every stream event is classified stored (appended to the task's durable
//! context) or ephemeral (batched and broadcast, never persisted) — see
//! [`EventPayload::is_stored`].

use crate::agent::AgentKind;
use crate::batch::{EventBatch, EventBatcher};
use crate::event::{EventPayload, StreamEvent};
use crate::parse::Dialect;
use crate::supervise::{
    OutputStream, ProcessHandle, ProcessSupervisor, SpawnOptions, StdioMode, SuperviseError,
};
use crate::task::{Task, TaskPatch, TaskState};
use crate::tunnel::SyncTunnel;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Cap on retained stderr, used for failure reasons.
const STDERR_TAIL: usize = 4096;

/// Cap on retained raw output, used as a fallback result.
const RAW_TAIL: usize = 4096;

/// Errors that can occur while running an agent.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("agent executable not found on PATH: {0}")]
    ExecutableNotFound(String),

    #[error("failed to spawn agent: {0}")]
    Spawn(#[from] SuperviseError),

    #[error("task timed out after {0:?}")]
    Timeout(Duration),

    #[error("agent exited with code {code}: {reason}")]
    ExitNonZero { code: i32, reason: String },

    #[error("agent session is not running")]
    SessionDead,
}

/// Result of a completed one-shot run.
#[derive(Debug, Clone)]
pub struct AgentOutput {
    /// Terminal result text reported to the remote peer.
    pub result: String,
    pub exit_code: i32,
}

/// Runs tasks on one agent kind.
pub struct AgentRunner {
    kind: AgentKind,
    supervisor: ProcessSupervisor,
    /// Replaces executable resolution and argv construction. A harness
    /// hook: points the runner at a stand-in process while keeping the
    /// dialect and lifecycle paths identical.
    command_override: Option<Vec<String>>,
    timeout_override: Option<Duration>,
    /// Observer for every parsed event, stored and ephemeral alike.
    observer: Option<mpsc::UnboundedSender<StreamEvent>>,
}

impl AgentRunner {
    #[must_use]
    pub fn new(kind: AgentKind, supervisor: ProcessSupervisor) -> Self {
        Self {
            kind,
            supervisor,
            command_override: None,
            timeout_override: None,
            observer: None,
        }
    }

    /// Harness constructor: run `command` instead of the real agent CLI.
    #[must_use]
    pub fn with_command(
        kind: AgentKind,
        supervisor: ProcessSupervisor,
        command: Vec<String>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            kind,
            supervisor,
            command_override: Some(command),
            timeout_override: timeout,
            observer: None,
        }
    }

    /// Mirror every parsed event into the given channel.
    #[must_use]
    pub fn with_observer(mut self, observer: mpsc::UnboundedSender<StreamEvent>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Run one task to completion.
    ///
    /// Guarantees, in order: the executable is verified before spawning;
    /// the task is marked `in-progress` before the first byte is read;
    /// stored events reach the task context in arrival order; the task
    /// ends `completed` on exit 0 and `failed` otherwise, with a
    /// timeout-specific error when the deadline killed the process.
    pub async fn run(&self, task: &Task, tunnel: &SyncTunnel) -> Result<AgentOutput, AgentError> {
        let profile = self.kind.profile();
        let timeout = self.timeout_override.unwrap_or(profile.timeout);

        let command = match &self.command_override {
            Some(command) => command.clone(),
            None => {
                let exe = self.kind.resolve_executable().ok_or_else(|| {
                    AgentError::ExecutableNotFound(profile.executable.to_string())
                })?;
                let mut command = vec![exe.to_string_lossy().into_owned()];
                command.extend(self.kind.one_shot_args(&build_prompt(task)));
                command
            }
        };

        info!(task_id = %task.id, agent = %self.kind, "starting one-shot run");
        tunnel
            .update_task(&task.id, TaskPatch::state(TaskState::InProgress))
            .await;

        // Structured dialects need stderr kept separate; plain-text agents
        // expect a terminal and go through the shim when the bridge is
        // headless.
        let mode = if profile.dialect == Dialect::Text {
            StdioMode::Terminal
        } else {
            StdioMode::Piped
        };
        let mut handle = self.supervisor.spawn(
            &command,
            SpawnOptions {
                env: AgentKind::base_env(),
                task_id: Some(task.id.clone()),
                mode,
                timeout: Some(timeout),
            },
        )?;

        // Ephemeral events flow through the debounce batcher into a
        // broadcast forwarder; stored events go straight to the context.
        let (batch_tx, batch_rx) = mpsc::channel::<EventBatch>(32);
        let batcher = EventBatcher::new(task.id.clone(), batch_tx);
        let forwarder = spawn_broadcast_forwarder(tunnel.clone(), batch_rx);

        let mut parser = profile.dialect.parser();
        let mut sink = EventSink::new(task.id.clone(), self.observer.clone());

        while let Some(chunk) = handle.output_rx.recv().await {
            match chunk.stream {
                OutputStream::Stdout => {
                    let events = parser.parse(&chunk.text);
                    sink.consume(events, tunnel, &batcher).await;
                }
                OutputStream::Stderr => sink.push_stderr(&chunk.text),
            }
        }
        let events = parser.flush();
        sink.consume(events, tunnel, &batcher).await;

        let exit = handle.exit_rx.await.unwrap_or_else(|_| {
            warn!(task_id = %task.id, "exit channel dropped");
            crate::supervise::ProcessExit {
                code: 1,
                timed_out: false,
            }
        });

        // Flush ephemerals before the terminal state change so the remote
        // peer never sees a completed task with updates still in flight.
        batcher.flush().await;
        drop(batcher);
        let _ = forwarder.await;

        if exit.timed_out {
            let reason = format!("timed out after {}s", timeout.as_secs());
            tunnel
                .update_task(&task.id, TaskPatch::finished(TaskState::Failed, reason))
                .await;
            return Err(AgentError::Timeout(timeout));
        }

        if exit.code == 0 {
            let result = sink.result_text();
            tunnel
                .update_task(
                    &task.id,
                    TaskPatch::finished(TaskState::Completed, result.clone()),
                )
                .await;
            info!(task_id = %task.id, "task completed");
            Ok(AgentOutput {
                result,
                exit_code: 0,
            })
        } else {
            let reason = sink.failure_reason(exit.code);
            tunnel
                .update_task(
                    &task.id,
                    TaskPatch::finished(TaskState::Failed, reason.clone()),
                )
                .await;
            warn!(task_id = %task.id, code = exit.code, "task failed");
            Err(AgentError::ExitNonZero {
                code: exit.code,
                reason,
            })
        }
    }
}

/// Routes parsed events: stored → context, ephemeral → batcher, permission
/// → pending-user-feedback; tracks result candidates along the way.
struct EventSink {
    task_id: String,
    observer: Option<mpsc::UnboundedSender<StreamEvent>>,
    last_completion: Option<String>,
    last_message: Option<String>,
    raw_tail: String,
    stderr_tail: String,
}

impl EventSink {
    fn new(task_id: String, observer: Option<mpsc::UnboundedSender<StreamEvent>>) -> Self {
        Self {
            task_id,
            observer,
            last_completion: None,
            last_message: None,
            raw_tail: String::new(),
            stderr_tail: String::new(),
        }
    }

    async fn consume(
        &mut self,
        events: Vec<StreamEvent>,
        tunnel: &SyncTunnel,
        batcher: &EventBatcher,
    ) {
        if events.is_empty() {
            return;
        }

        let mut stored = Vec::new();
        for event in events {
            if let Some(observer) = &self.observer {
                let _ = observer.send(event.clone());
            }

            match &event.payload {
                EventPayload::Completion { result, .. } => {
                    if !result.is_empty() {
                        self.last_completion = Some(result.clone());
                    }
                }
                EventPayload::Message {
                    content,
                    delta: false,
                    ..
                } => {
                    self.last_message = Some(content.clone());
                }
                EventPayload::Raw { text } => {
                    self.raw_tail.push_str(text);
                    self.raw_tail.push('\n');
                    truncate_to_tail(&mut self.raw_tail, RAW_TAIL);
                }
                EventPayload::Permission { prompt } => {
                    info!(task_id = %self.task_id, "agent needs input");
                    tunnel
                        .update_task(
                            &self.task_id,
                            TaskPatch::state(TaskState::PendingUserFeedback),
                        )
                        .await;
                    tunnel.notify(prompt).await;
                }
                _ => {}
            }

            if event.is_stored() {
                stored.push(event);
            } else {
                batcher.push(event);
            }
        }

        if !stored.is_empty() {
            tunnel.append_context(&self.task_id, stored, None).await;
        }
    }

    fn push_stderr(&mut self, text: &str) {
        self.stderr_tail.push_str(text);
        truncate_to_tail(&mut self.stderr_tail, STDERR_TAIL);
    }

    /// Terminal result text: explicit completion, else the last full
    /// message, else the tail of raw output.
    fn result_text(&self) -> String {
        self.last_completion
            .clone()
            .or_else(|| self.last_message.clone())
            .unwrap_or_else(|| self.raw_tail.trim().to_string())
    }

    fn failure_reason(&self, code: i32) -> String {
        let stderr = self.stderr_tail.trim();
        if stderr.is_empty() {
            format!("agent exited with code {code}")
        } else {
            stderr.to_string()
        }
    }
}

/// Forward flushed batches to the peer until the batcher side closes.
fn spawn_broadcast_forwarder(
    tunnel: SyncTunnel,
    mut batch_rx: mpsc::Receiver<EventBatch>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(batch) = batch_rx.recv().await {
            tunnel.broadcast(&batch.task_id, &batch.events).await;
        }
    })
}

fn truncate_to_tail(buf: &mut String, cap: usize) {
    if buf.len() > cap {
        let cut = buf.len() - cap;
        let cut = (cut..buf.len())
            .find(|i| buf.is_char_boundary(*i))
            .unwrap_or(buf.len());
        buf.drain(..cut);
    }
}

/// Task description plus prior conversation for reopened tasks.
pub(crate) fn build_prompt(task: &Task) -> String {
    let mut transcript = String::new();
    for event in &task.context {
        if let EventPayload::Message {
            role,
            content,
            delta: false,
        } = &event.payload
        {
            let who = match role {
                crate::event::Role::User => "user",
                crate::event::Role::Assistant => "assistant",
            };
            transcript.push_str(&format!("{who}: {content}\n"));
        }
    }

    if transcript.is_empty() {
        task.description.clone()
    } else {
        format!(
            "Earlier conversation:\n{transcript}\nContinue with: {}",
            task.description
        )
    }
}

/// A persistent agent session serving many tasks over one subprocess.
///
/// ACP agents only: the task text travels as a `session/prompt` request and
/// event correlation follows the current-task pointer set by [`send`].
///
/// [`send`]: InteractiveSession::send
pub struct InteractiveSession {
    kind: AgentKind,
    supervisor: ProcessSupervisor,
    tunnel: SyncTunnel,
    process_id: String,
    stdin_tx: mpsc::Sender<String>,
    current_task: Arc<Mutex<Option<String>>>,
    session_id: Arc<Mutex<Option<String>>>,
    alive: Arc<AtomicBool>,
    next_request_id: AtomicU64,
}

impl InteractiveSession {
    /// Spawn the agent and perform the ACP handshake
    /// (`initialize` → `session/new`).
    pub async fn start(
        kind: AgentKind,
        supervisor: ProcessSupervisor,
        tunnel: SyncTunnel,
    ) -> Result<Self, AgentError> {
        let profile = kind.profile();
        let exe = kind
            .resolve_executable()
            .ok_or_else(|| AgentError::ExecutableNotFound(profile.executable.to_string()))?;

        let mut command = vec![exe.to_string_lossy().into_owned()];
        command.extend(kind.one_shot_args(""));
        Self::start_with_command(kind, supervisor, tunnel, command).await
    }

    /// Harness constructor: drive `command` instead of the real agent CLI.
    pub async fn start_with_command(
        kind: AgentKind,
        supervisor: ProcessSupervisor,
        tunnel: SyncTunnel,
        command: Vec<String>,
    ) -> Result<Self, AgentError> {
        let mut handle = supervisor.spawn(
            &command,
            SpawnOptions {
                env: AgentKind::base_env(),
                task_id: None,
                mode: StdioMode::Interactive,
                timeout: None,
            },
        )?;

        let Some(stdin) = handle.stdin.take() else {
            return Err(AgentError::SessionDead);
        };

        let (stdin_tx, stdin_rx) = mpsc::channel::<String>(32);
        let session = Self {
            kind,
            supervisor,
            tunnel: tunnel.clone(),
            process_id: handle.id.clone(),
            stdin_tx,
            current_task: Arc::new(Mutex::new(None)),
            session_id: Arc::new(Mutex::new(None)),
            alive: Arc::new(AtomicBool::new(true)),
            next_request_id: AtomicU64::new(2),
        };

        spawn_stdin_writer(stdin, stdin_rx);
        spawn_session_reader(SessionReader {
            kind,
            tunnel,
            handle,
            current_task: Arc::clone(&session.current_task),
            session_id: Arc::clone(&session.session_id),
            alive: Arc::clone(&session.alive),
        });

        // ACP handshake. The session id arrives in the session/new response
        // and is captured by the reader.
        session
            .write_frame(serde_json::json!({
                "jsonrpc": "2.0",
                "id": 0,
                "method": "initialize",
                "params": {"protocolVersion": 1, "clientCapabilities": {}},
            }))
            .await?;
        session
            .write_frame(serde_json::json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "session/new",
                "params": {"cwd": std::env::current_dir().map_or_else(|_| "/".into(), |d| d.to_string_lossy().into_owned()), "mcpServers": []},
            }))
            .await?;

        info!(agent = %kind, "interactive session started");
        Ok(session)
    }

    /// Send one task into the session and mark it `in-progress`.
    ///
    /// Events arriving after this call are correlated to the task until its
    /// turn completes or another `send` repoints the session.
    pub async fn send(&self, message: &str, task_id: &str) -> Result<(), AgentError> {
        if !self.is_alive() {
            return Err(AgentError::SessionDead);
        }

        self.tunnel
            .update_task(task_id, TaskPatch::state(TaskState::InProgress))
            .await;
        {
            let mut current = self.current_task.lock().expect("lock poisoned");
            *current = Some(task_id.to_string());
        }

        let session_id = {
            let guard = self.session_id.lock().expect("lock poisoned");
            guard.clone().unwrap_or_default()
        };
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        self.write_frame(serde_json::json!({
            "jsonrpc": "2.0",
            "id": request_id,
            "method": "session/prompt",
            "params": {
                "sessionId": session_id,
                "prompt": [{"type": "text", "text": message}],
            },
        }))
        .await?;

        self.arm_watchdog(task_id);
        Ok(())
    }

    /// Fail the task if it is still current when the per-agent deadline
    /// expires. The session itself is killed: a stuck turn means a stuck
    /// subprocess.
    fn arm_watchdog(&self, task_id: &str) {
        let timeout = self.kind.profile().timeout;
        let task_id = task_id.to_string();
        let current = Arc::clone(&self.current_task);
        let tunnel = self.tunnel.clone();
        let supervisor = self.supervisor.clone();
        let process_id = self.process_id.clone();
        let alive = Arc::clone(&self.alive);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let still_current = {
                let guard = current.lock().expect("lock poisoned");
                guard.as_deref() == Some(task_id.as_str())
            };
            if still_current {
                warn!(%task_id, "interactive turn timed out, killing session");
                alive.store(false, Ordering::SeqCst);
                supervisor.kill(&process_id);
                tunnel
                    .update_task(
                        &task_id,
                        TaskPatch::finished(
                            TaskState::Failed,
                            format!("timed out after {}s", timeout.as_secs()),
                        ),
                    )
                    .await;
            }
        });
    }

    /// Cancel the in-flight turn, if any, then terminate the session.
    pub async fn kill(&self) {
        let session_id = {
            let guard = self.session_id.lock().expect("lock poisoned");
            guard.clone()
        };
        if let Some(session_id) = session_id {
            let _ = self
                .write_frame(serde_json::json!({
                    "jsonrpc": "2.0",
                    "method": "session/cancel",
                    "params": {"sessionId": session_id},
                }))
                .await;
        }
        self.alive.store(false, Ordering::SeqCst);
        self.supervisor.kill(&self.process_id);
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn write_frame(&self, frame: serde_json::Value) -> Result<(), AgentError> {
        let mut json = frame.to_string();
        json.push('\n');
        self.stdin_tx
            .send(json)
            .await
            .map_err(|_| AgentError::SessionDead)
    }
}

fn spawn_stdin_writer(mut stdin: tokio::process::ChildStdin, mut rx: mpsc::Receiver<String>) {
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if stdin.write_all(frame.as_bytes()).await.is_err() {
                break;
            }
            if stdin.flush().await.is_err() {
                break;
            }
        }
    });
}

struct SessionReader {
    kind: AgentKind,
    tunnel: SyncTunnel,
    handle: ProcessHandle,
    current_task: Arc<Mutex<Option<String>>>,
    session_id: Arc<Mutex<Option<String>>>,
    alive: Arc<AtomicBool>,
}

/// Pump the session's output: sniff the `session/new` response for the
/// session id, feed everything through the dialect parser, and route events
/// to whichever task is current.
fn spawn_session_reader(reader: SessionReader) {
    tokio::spawn(async move {
        let SessionReader {
            kind,
            tunnel,
            mut handle,
            current_task,
            session_id,
            alive,
        } = reader;

        let mut parser = kind.profile().dialect.parser();
        let mut lines = crate::parse::LineBuffer::new();
        let (batch_tx, batch_rx) = mpsc::channel::<EventBatch>(32);
        let forwarder = spawn_broadcast_forwarder(tunnel.clone(), batch_rx);
        let mut batchers: HashMap<String, EventBatcher> = HashMap::new();
        let mut sinks: HashMap<String, EventSink> = HashMap::new();

        while let Some(chunk) = handle.output_rx.recv().await {
            if chunk.stream == OutputStream::Stderr {
                debug!(agent = %kind, "session stderr: {}", chunk.text.trim_end());
                continue;
            }

            for line in lines.push(&chunk.text) {
                sniff_session_id(&line, &session_id);

                let task_id = {
                    let guard = current_task.lock().expect("lock poisoned");
                    guard.clone()
                };
                let events = parser.parse(&format!("{line}\n"));
                let Some(task_id) = task_id else {
                    // Output between turns belongs to nobody; the parser
                    // still saw it so its internal state stays coherent.
                    continue;
                };

                let batcher = batchers
                    .entry(task_id.clone())
                    .or_insert_with(|| EventBatcher::new(task_id.clone(), batch_tx.clone()))
                    .clone();
                let sink = sinks
                    .entry(task_id.clone())
                    .or_insert_with(|| EventSink::new(task_id.clone(), None));

                let completed = events
                    .iter()
                    .any(|e| matches!(e.payload, EventPayload::Completion { .. }));
                sink.consume(events, &tunnel, &batcher).await;

                if completed {
                    // Flush ephemerals before the terminal state change.
                    batcher.flush().await;
                    let result = sink.result_text();
                    tunnel
                        .update_task(
                            &task_id,
                            TaskPatch::finished(TaskState::Completed, result),
                        )
                        .await;
                    info!(%task_id, "interactive task completed");
                    sinks.remove(&task_id);
                    batchers.remove(&task_id);
                    let mut guard = current_task.lock().expect("lock poisoned");
                    if guard.as_deref() == Some(task_id.as_str()) {
                        *guard = None;
                    }
                }
            }
        }

        // Subprocess ended. Fail whatever was in flight.
        alive.store(false, Ordering::SeqCst);
        let orphan = {
            let mut guard = current_task.lock().expect("lock poisoned");
            guard.take()
        };
        if let Some(task_id) = orphan {
            warn!(%task_id, "session ended with task in flight");
            tunnel
                .update_task(
                    &task_id,
                    TaskPatch::finished(TaskState::Failed, "agent session ended unexpectedly"),
                )
                .await;
        }
        drop(batchers);
        drop(batch_tx);
        let _ = forwarder.await;
    });
}

/// Capture the session id from the `session/new` response (request id 1).
fn sniff_session_id(line: &str, slot: &Arc<Mutex<Option<String>>>) {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(line) else {
        return;
    };
    if value.get("id").and_then(serde_json::Value::as_u64) != Some(1) {
        return;
    }
    if let Some(sid) = value
        .pointer("/result/sessionId")
        .and_then(serde_json::Value::as_str)
    {
        let mut guard = slot.lock().expect("lock poisoned");
        *guard = Some(sid.to_string());
    }
}
