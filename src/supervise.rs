//! Process supervision.
//!
//! Spawns one subprocess per agent invocation, multiplexes its output into
//! ordered chunk streams, tracks every live process in a registry, and
//! guarantees exactly-once exit delivery. The supervisor is the only
//! component that signals managed processes.
//!
//! Headless operation: when the bridge has no interactive controlling
//! terminal, terminal-mode agents are spawned under the PTY shim
//! ([`crate::pty`]) so they keep streaming. Interactive sessions are never
//! shimmed — TTY emulation would break bidirectional piping.

// PIDs are always positive (i32 -> u32)
#![allow(clippy::cast_sign_loss)]

use crate::pty::{self, PtyError};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::io::IsTerminal;
use std::os::fd::BorrowedFd;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Grace window between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Poll interval for the PTY reader loop.
const PTY_POLL: Duration = Duration::from_millis(10);

/// Errors that can occur in the supervisor.
#[derive(Debug, Error)]
pub enum SuperviseError {
    #[error("command is empty")]
    EmptyCommand,

    #[error("failed to spawn process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to spawn under PTY shim: {0}")]
    Shim(#[from] PtyError),
}

/// Which pipe a chunk arrived on. PTY-shimmed processes deliver everything
/// as stdout — the shim merges the streams by nature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One raw output chunk, UTF-8 converted, otherwise undecoded.
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub text: String,
}

/// How a managed process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// The real exit code, or 128+signal, or 1 when nothing better is known.
    pub code: i32,
    /// Set when the supervisor killed the process on deadline expiry.
    pub timed_out: bool,
}

/// How the child's stdio is wired up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StdioMode {
    /// stdout/stderr piped, stdin closed. For dialect parsing, where the
    /// two streams must stay separate.
    #[default]
    Piped,
    /// All three piped. For interactive multi-task sessions; TTY emulation
    /// is never applied here because it would break bidirectional piping.
    Interactive,
    /// The child expects a terminal. When the bridge itself has no
    /// interactive controlling terminal, the command is wrapped in the TTY
    /// shim and its merged output read from the PTY master.
    Terminal,
}

/// Spawn configuration.
#[derive(Debug, Default)]
pub struct SpawnOptions {
    /// Environment overrides applied on top of the inherited environment.
    pub env: Vec<(String, String)>,
    /// Task correlation for `kill_by_task_id`.
    pub task_id: Option<String>,
    /// Stdio wiring.
    pub mode: StdioMode,
    /// Optional hard deadline; on expiry the process is killed and the exit
    /// is flagged `timed_out`.
    pub timeout: Option<Duration>,
}

/// A live entry in the process registry.
#[derive(Debug, Clone)]
pub struct ManagedProcess {
    pub id: String,
    pub pid: u32,
    pub task_id: Option<String>,
    timed_out: bool,
}

/// Channel ends handed to the caller for one spawned process.
pub struct ProcessHandle {
    /// Registry id (e.g. "rusty-nail").
    pub id: String,
    /// Ordered output chunks, per stream in arrival order.
    pub output_rx: mpsc::Receiver<OutputChunk>,
    /// Resolves exactly once when the process exits.
    pub exit_rx: oneshot::Receiver<ProcessExit>,
    /// Present in `Interactive` mode only.
    pub stdin: Option<ChildStdin>,
}

/// Supervises all agent subprocesses.
///
/// An explicit instance owned by the composition root — cloned handles share
/// one registry, and tests get a fresh registry per instance.
#[derive(Clone, Default)]
pub struct ProcessSupervisor {
    registry: Arc<Mutex<HashMap<String, ManagedProcess>>>,
}

impl ProcessSupervisor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a command.
    ///
    /// Spawn failures are returned to the caller directly; nothing is
    /// registered until the process actually exists.
    pub fn spawn(
        &self,
        cmd: &[String],
        opts: SpawnOptions,
    ) -> Result<ProcessHandle, SuperviseError> {
        if cmd.is_empty() {
            return Err(SuperviseError::EmptyCommand);
        }

        let use_shim =
            opts.mode == StdioMode::Terminal && !std::io::stdin().is_terminal();
        if use_shim {
            self.spawn_shimmed(cmd, opts)
        } else {
            self.spawn_piped(cmd, opts)
        }
    }

    fn spawn_piped(
        &self,
        cmd: &[String],
        opts: SpawnOptions,
    ) -> Result<ProcessHandle, SuperviseError> {
        let mut command = Command::new(&cmd[0]);
        command
            .args(&cmd[1..])
            .envs(opts.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if opts.mode == StdioMode::Interactive {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(SuperviseError::Spawn)?;
        let pid = child.id().unwrap_or(0);
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let id = self.register(pid, opts.task_id.clone());
        info!(%id, %pid, command = %cmd[0], "spawned agent process");

        let (output_tx, output_rx) = mpsc::channel::<OutputChunk>(256);
        let (exit_tx, exit_rx) = oneshot::channel::<ProcessExit>();

        self.arm_timeout(&id, opts.timeout);

        // Per-stream readers; each stream is individually ordered.
        let mut reader_handles = Vec::new();
        if let Some(mut stdout) = stdout {
            let tx = output_tx.clone();
            reader_handles.push(tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                while let Ok(n) = stdout.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    let chunk = OutputChunk {
                        stream: OutputStream::Stdout,
                        text: String::from_utf8_lossy(&buf[..n]).into_owned(),
                    };
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                }
            }));
        }
        if let Some(mut stderr) = stderr {
            let tx = output_tx;
            reader_handles.push(tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                while let Ok(n) = stderr.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    let chunk = OutputChunk {
                        stream: OutputStream::Stderr,
                        text: String::from_utf8_lossy(&buf[..n]).into_owned(),
                    };
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                }
            }));
        }

        // Exit watcher: drain output first so exit never overtakes it.
        let registry = Arc::clone(&self.registry);
        let watcher_id = id.clone();
        tokio::spawn(async move {
            for handle in reader_handles {
                let _ = handle.await;
            }
            let code = match child.wait().await {
                Ok(status) => exit_code_of(status),
                Err(e) => {
                    warn!(id = %watcher_id, %e, "wait failed");
                    1
                }
            };
            let timed_out = deregister(&registry, &watcher_id);
            debug!(id = %watcher_id, %code, %timed_out, "agent process exited");
            let _ = exit_tx.send(ProcessExit { code, timed_out });
        });

        Ok(ProcessHandle {
            id,
            output_rx,
            exit_rx,
            stdin,
        })
    }

    fn spawn_shimmed(
        &self,
        cmd: &[String],
        opts: SpawnOptions,
    ) -> Result<ProcessHandle, SuperviseError> {
        let pty = pty::spawn(cmd, &opts.env)?;
        let pid = pty.pid.as_raw() as u32;

        let id = self.register(pid, opts.task_id.clone());
        info!(%id, %pid, command = %cmd[0], "spawned agent process under TTY shim");

        let (output_tx, output_rx) = mpsc::channel::<OutputChunk>(256);
        let (exit_tx, exit_rx) = oneshot::channel::<ProcessExit>();

        self.arm_timeout(&id, opts.timeout);

        let registry = Arc::clone(&self.registry);
        let watcher_id = id.clone();
        tokio::spawn(async move {
            let mut poll = tokio::time::interval(PTY_POLL);
            let mut buf = [0u8; 4096];
            let code = loop {
                poll.tick().await;

                // Drain whatever is available without blocking.
                #[allow(unsafe_code)] // fd is valid for the life of `pty`
                let fd = unsafe { BorrowedFd::borrow_raw(pty.master_fd()) };
                match nix::unistd::read(fd, &mut buf) {
                    Ok(n) if n > 0 => {
                        let chunk = OutputChunk {
                            stream: OutputStream::Stdout,
                            text: String::from_utf8_lossy(&buf[..n]).into_owned(),
                        };
                        if output_tx.send(chunk).await.is_err() {
                            // Caller abandoned the handle; don't orphan the child.
                            let _ = pty.signal(Signal::SIGKILL);
                            break pty.wait().unwrap_or(1);
                        }
                        continue; // keep draining before the next tick
                    }
                    // No data available right now.
                    Ok(_) | Err(nix::Error::EAGAIN) => {}
                    // PTY closed — child exited.
                    Err(nix::Error::EIO) => {
                        if let Ok(Some(code)) = pty.try_wait() {
                            break code;
                        }
                    }
                    Err(e) => {
                        warn!(id = %watcher_id, %e, "PTY read error");
                    }
                }

                if let Ok(Some(code)) = pty.try_wait() {
                    break code;
                }
            };

            let timed_out = deregister(&registry, &watcher_id);
            debug!(id = %watcher_id, %code, %timed_out, "agent process exited");
            let _ = exit_tx.send(ProcessExit { code, timed_out });
        });

        Ok(ProcessHandle {
            id,
            output_rx,
            exit_rx,
            stdin: None,
        })
    }

    /// Insert a registry entry under a fresh generated id.
    fn register(&self, pid: u32, task_id: Option<String>) -> String {
        let mut registry = self.registry.lock().expect("lock poisoned");
        let mut generator = names::Generator::default();
        let id = loop {
            let candidate = generator.next().unwrap_or_else(|| format!("proc-{pid}"));
            if !registry.contains_key(&candidate) {
                break candidate;
            }
        };
        registry.insert(
            id.clone(),
            ManagedProcess {
                id: id.clone(),
                pid,
                task_id,
                timed_out: false,
            },
        );
        id
    }

    /// Schedule the deadline kill for a spawned process.
    fn arm_timeout(&self, id: &str, timeout: Option<Duration>) {
        let Some(timeout) = timeout else { return };
        let supervisor = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let pid = {
                let mut registry = supervisor.registry.lock().expect("lock poisoned");
                match registry.get_mut(&id) {
                    Some(entry) => {
                        entry.timed_out = true;
                        Some(entry.pid)
                    }
                    None => None, // already exited
                }
            };
            if let Some(pid) = pid {
                warn!(%id, %pid, "process deadline expired, killing");
                supervisor.kill(&id);
            }
        });
    }

    /// Gracefully terminate a process: SIGTERM now, SIGKILL after the grace
    /// window if it is still registered. Returns `false` for unknown ids.
    pub fn kill(&self, id: &str) -> bool {
        let pid = {
            let registry = self.registry.lock().expect("lock poisoned");
            match registry.get(id) {
                Some(entry) => entry.pid,
                None => return false,
            }
        };

        let target = Pid::from_raw(pid as i32);
        if let Err(e) = kill(target, Signal::SIGTERM) {
            // ESRCH means the exit watcher already reaped it.
            debug!(%id, %e, "SIGTERM failed");
        }

        let supervisor = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(KILL_GRACE).await;
            let still_alive = {
                let registry = supervisor.registry.lock().expect("lock poisoned");
                registry.contains_key(&id)
            };
            if still_alive {
                warn!(%id, "grace window expired, sending SIGKILL");
                let _ = kill(target, Signal::SIGKILL);
            }
        });
        true
    }

    /// Kill the process running the given task. Returns `false` — with no
    /// side effects — when no process is correlated with the task.
    pub fn kill_by_task_id(&self, task_id: &str) -> bool {
        let id = {
            let registry = self.registry.lock().expect("lock poisoned");
            registry
                .values()
                .find(|entry| entry.task_id.as_deref() == Some(task_id))
                .map(|entry| entry.id.clone())
        };
        match id {
            Some(id) => self.kill(&id),
            None => false,
        }
    }

    /// Synchronously kill every tracked process. Idempotent, safe with an
    /// empty registry; wired to process-wide shutdown signals so no agent
    /// subprocess outlives the bridge.
    pub fn kill_all(&self) {
        let mut registry = self.registry.lock().expect("lock poisoned");
        for entry in registry.values() {
            info!(id = %entry.id, pid = %entry.pid, "killing on shutdown");
            let _ = kill(Pid::from_raw(entry.pid as i32), Signal::SIGKILL);
        }
        registry.clear();
    }

    /// Snapshot the registry (for diagnostics and tests).
    #[must_use]
    pub fn list(&self) -> Vec<ManagedProcess> {
        let registry = self.registry.lock().expect("lock poisoned");
        registry.values().cloned().collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        let registry = self.registry.lock().expect("lock poisoned");
        registry.is_empty()
    }
}

/// Remove a registry entry, returning whether it had been timeout-flagged.
fn deregister(registry: &Arc<Mutex<HashMap<String, ManagedProcess>>>, id: &str) -> bool {
    let mut registry = registry.lock().expect("lock poisoned");
    registry.remove(id).is_some_and(|entry| entry.timed_out)
}

/// Real exit code, 128+signal for signal deaths, 1 otherwise.
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status
            .code()
            .or_else(|| status.signal().map(|sig| 128 + sig))
            .unwrap_or(1)
    }
    #[cfg(not(unix))]
    {
        status.code().unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    async fn drain(handle: &mut ProcessHandle) -> String {
        let mut text = String::new();
        while let Some(chunk) = handle.output_rx.recv().await {
            text.push_str(&chunk.text);
        }
        text
    }

    #[tokio::test]
    async fn test_exit_zero_empties_registry() {
        let supervisor = ProcessSupervisor::new();
        let mut handle = supervisor
            .spawn(&sh("exit 0"), SpawnOptions::default())
            .expect("spawn");

        drain(&mut handle).await;
        let exit = timeout(Duration::from_secs(5), handle.exit_rx)
            .await
            .expect("timeout")
            .expect("exit");
        assert_eq!(exit.code, 0);
        assert!(!exit.timed_out);
        assert!(supervisor.is_empty());
    }

    #[tokio::test]
    async fn test_nonzero_exit_code_is_reported() {
        let supervisor = ProcessSupervisor::new();
        let mut handle = supervisor
            .spawn(&sh("exit 7"), SpawnOptions::default())
            .expect("spawn");

        drain(&mut handle).await;
        let exit = timeout(Duration::from_secs(5), handle.exit_rx)
            .await
            .expect("timeout")
            .expect("exit");
        assert_eq!(exit.code, 7);
    }

    #[tokio::test]
    async fn test_output_arrives_in_order() {
        let supervisor = ProcessSupervisor::new();
        let mut handle = supervisor
            .spawn(&sh("printf 'one\\ntwo\\nthree\\n'"), SpawnOptions::default())
            .expect("spawn");

        let text = drain(&mut handle).await;
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_spawn_failure_surfaces_to_caller() {
        let supervisor = ProcessSupervisor::new();
        let result = supervisor.spawn(
            &["definitely-not-a-real-binary-name".to_string()],
            SpawnOptions::default(),
        );
        assert!(matches!(result, Err(SuperviseError::Spawn(_))));
        assert!(supervisor.is_empty());
    }

    #[tokio::test]
    async fn test_terminal_mode_matches_shim_decision() {
        // Terminal mode wraps the child in the PTY shim exactly when the
        // bridge itself is headless; the child's view of stdout must agree.
        use std::io::IsTerminal;
        let expected = if std::io::stdin().is_terminal() {
            "not-a-tty" // piped spawn
        } else {
            "is-a-tty" // PTY shim
        };

        let supervisor = ProcessSupervisor::new();
        let mut handle = supervisor
            .spawn(
                &sh("if [ -t 1 ]; then echo is-a-tty; else echo not-a-tty; fi"),
                SpawnOptions {
                    mode: StdioMode::Terminal,
                    ..SpawnOptions::default()
                },
            )
            .expect("spawn");

        let text = drain(&mut handle).await;
        assert!(text.contains(expected));
        let exit = timeout(Duration::from_secs(5), handle.exit_rx)
            .await
            .expect("timeout")
            .expect("exit");
        assert_eq!(exit.code, 0);
        assert!(supervisor.is_empty());
    }

    #[tokio::test]
    async fn test_piped_mode_separates_stderr() {
        let supervisor = ProcessSupervisor::new();
        let mut handle = supervisor
            .spawn(
                &sh("echo out; echo err >&2"),
                SpawnOptions::default(),
            )
            .expect("spawn");

        let mut stdout = String::new();
        let mut stderr = String::new();
        while let Some(chunk) = handle.output_rx.recv().await {
            match chunk.stream {
                OutputStream::Stdout => stdout.push_str(&chunk.text),
                OutputStream::Stderr => stderr.push_str(&chunk.text),
            }
        }
        assert_eq!(stdout.trim(), "out");
        assert_eq!(stderr.trim(), "err");
    }

    #[tokio::test]
    async fn test_empty_command_rejected() {
        let supervisor = ProcessSupervisor::new();
        assert!(matches!(
            supervisor.spawn(&[], SpawnOptions::default()),
            Err(SuperviseError::EmptyCommand)
        ));
    }

    #[tokio::test]
    async fn test_kill_by_task_id_unknown_is_noop() {
        let supervisor = ProcessSupervisor::new();
        assert!(!supervisor.kill_by_task_id("no-such-task"));
        assert!(supervisor.is_empty());
    }

    #[tokio::test]
    async fn test_kill_by_task_id_terminates() {
        let supervisor = ProcessSupervisor::new();
        let handle = supervisor
            .spawn(
                &sh("sleep 30"),
                SpawnOptions {
                    task_id: Some("task-1".into()),
                    ..SpawnOptions::default()
                },
            )
            .expect("spawn");

        assert!(supervisor.kill_by_task_id("task-1"));
        let exit = timeout(Duration::from_secs(5), handle.exit_rx)
            .await
            .expect("timeout")
            .expect("exit");
        assert_ne!(exit.code, 0);
        assert!(supervisor.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_flags_exit() {
        let supervisor = ProcessSupervisor::new();
        let handle = supervisor
            .spawn(
                &sh("sleep 30"),
                SpawnOptions {
                    timeout: Some(Duration::from_millis(100)),
                    ..SpawnOptions::default()
                },
            )
            .expect("spawn");

        let exit = timeout(Duration::from_secs(10), handle.exit_rx)
            .await
            .expect("timeout")
            .expect("exit");
        assert!(exit.timed_out);
        assert_ne!(exit.code, 0);
    }

    #[tokio::test]
    async fn test_kill_all_is_idempotent() {
        let supervisor = ProcessSupervisor::new();
        supervisor.kill_all(); // empty registry is fine

        let _handle = supervisor
            .spawn(&sh("sleep 30"), SpawnOptions::default())
            .expect("spawn");
        supervisor.kill_all();
        supervisor.kill_all();
        assert!(supervisor.is_empty());
    }

    #[tokio::test]
    async fn test_piped_stdin_round_trip() {
        use tokio::io::AsyncWriteExt;

        let supervisor = ProcessSupervisor::new();
        let mut handle = supervisor
            .spawn(
                &["cat".to_string()],
                SpawnOptions {
                    mode: StdioMode::Interactive,
                    ..SpawnOptions::default()
                },
            )
            .expect("spawn");

        let mut stdin = handle.stdin.take().expect("stdin");
        stdin.write_all(b"ping\n").await.expect("write");
        drop(stdin); // EOF lets cat exit

        let text = drain(&mut handle).await;
        assert_eq!(text, "ping\n");
        let exit = timeout(Duration::from_secs(5), handle.exit_rx)
            .await
            .expect("timeout")
            .expect("exit");
        assert_eq!(exit.code, 0);
    }
}
