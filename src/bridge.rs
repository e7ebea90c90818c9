//! The bridge composition root.
//!
//! Owns the process supervisor, the sync tunnel, and any live interactive
//! sessions, and turns assigned tasks into agent runs. One task failing
//! never tears the serve loop down.

use crate::agent::AgentKind;
use crate::runner::{AgentError, AgentRunner, InteractiveSession, build_prompt};
use crate::supervise::ProcessSupervisor;
use crate::task::{Task, TaskPatch, TaskState};
use crate::tunnel::{SyncTunnel, TaskFeed};
use std::collections::HashMap;
use tracing::{error, info, warn};

/// Dispatches assigned tasks to agent runners.
pub struct Bridge {
    supervisor: ProcessSupervisor,
    tunnel: SyncTunnel,
    /// One persistent session per interactive agent kind, started lazily.
    sessions: HashMap<AgentKind, InteractiveSession>,
}

impl Bridge {
    #[must_use]
    pub fn new(supervisor: ProcessSupervisor, tunnel: SyncTunnel) -> Self {
        Self {
            supervisor,
            tunnel,
            sessions: HashMap::new(),
        }
    }

    /// Serve tasks until the feed closes (tunnel shut down).
    pub async fn serve(&mut self, feed: &mut TaskFeed) {
        while let Some(task) = feed.recv().await {
            self.dispatch(task).await;
        }
        info!("task feed closed, bridge stopping");
        self.shutdown().await;
    }

    /// Route one task to its agent.
    pub async fn dispatch(&mut self, task: Task) {
        let Some(kind) = AgentKind::from_name(&task.agent_id) else {
            warn!(task_id = %task.id, agent = %task.agent_id, "unknown agent");
            self.tunnel
                .update_task(
                    &task.id,
                    TaskPatch::finished(
                        TaskState::Failed,
                        format!("unknown agent: {}", task.agent_id),
                    ),
                )
                .await;
            return;
        };

        if kind.profile().interactive {
            self.dispatch_interactive(kind, &task).await;
        } else {
            // One-shot runs execute concurrently; the runner reports
            // completion/failure to the peer itself.
            let runner = AgentRunner::new(kind, self.supervisor.clone());
            let tunnel = self.tunnel.clone();
            tokio::spawn(async move {
                if let Err(e) = runner.run(&task, &tunnel).await {
                    error!(task_id = %task.id, %e, "task run failed");
                }
            });
        }
    }

    /// Send a task into the (lazily started) persistent session for its
    /// agent. A dead session gets one restart before the task fails.
    async fn dispatch_interactive(&mut self, kind: AgentKind, task: &Task) {
        for attempt in 0..2 {
            if !self.sessions.get(&kind).is_some_and(InteractiveSession::is_alive) {
                self.sessions.remove(&kind);
                match InteractiveSession::start(
                    kind,
                    self.supervisor.clone(),
                    self.tunnel.clone(),
                )
                .await
                {
                    Ok(session) => {
                        self.sessions.insert(kind, session);
                    }
                    Err(e) => {
                        error!(agent = %kind, %e, "failed to start session");
                        self.tunnel
                            .update_task(
                                &task.id,
                                TaskPatch::finished(TaskState::Failed, e.to_string()),
                            )
                            .await;
                        return;
                    }
                }
            }

            let Some(session) = self.sessions.get(&kind) else {
                continue;
            };
            match session.send(&build_prompt(task), &task.id).await {
                Ok(()) => return,
                Err(AgentError::SessionDead) if attempt == 0 => {
                    warn!(agent = %kind, "session died, restarting");
                }
                Err(e) => {
                    error!(task_id = %task.id, %e, "interactive send failed");
                    self.tunnel
                        .update_task(
                            &task.id,
                            TaskPatch::finished(TaskState::Failed, e.to_string()),
                        )
                        .await;
                    return;
                }
            }
        }
    }

    /// Tear down sessions and any stray processes.
    pub async fn shutdown(&mut self) {
        for (kind, session) in self.sessions.drain() {
            info!(agent = %kind, "closing session");
            session.kill().await;
        }
        self.supervisor.kill_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::SyncTunnel;

    #[tokio::test]
    async fn test_unknown_agent_fails_task() {
        let (tunnel, _feed) = SyncTunnel::detached();
        let task = Task::new("t1", "cursor", "x");
        tunnel.track_task(task.clone());

        let mut bridge = Bridge::new(ProcessSupervisor::new(), tunnel.clone());
        bridge.dispatch(task).await;

        let cached = tunnel.get_task("t1").expect("cached");
        assert_eq!(cached.state, TaskState::Failed);
        assert!(cached.result.expect("result").contains("unknown agent"));
    }

    #[tokio::test]
    async fn test_missing_executable_fails_interactive_task() {
        let (tunnel, _feed) = SyncTunnel::detached();
        let task = Task::new("t1", "gemini", "x");
        tunnel.track_task(task.clone());

        let mut bridge = Bridge::new(ProcessSupervisor::new(), tunnel.clone());
        bridge.dispatch(task).await;

        let cached = tunnel.get_task("t1").expect("cached");
        assert_eq!(cached.state, TaskState::Failed);
        assert!(cached.result.expect("result").contains("not found"));
    }

    #[tokio::test]
    async fn test_shutdown_with_nothing_running() {
        let (tunnel, _feed) = SyncTunnel::detached();
        let mut bridge = Bridge::new(ProcessSupervisor::new(), tunnel);
        bridge.shutdown().await;
    }
}
