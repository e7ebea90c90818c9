//! Task entity and lifecycle state machine.
//!
//! Tasks are created by the remote peer; the local runner advances them as
//! agent output arrives. The remote peer is the system of record: a state
//! snapshot may overwrite any task wholesale at any time.

use crate::event::{StreamEvent, now_millis};
use serde::{Deserialize, Serialize};

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    /// Freshly created by the remote peer, not yet picked up.
    New,
    /// A terminal task reopened by the remote peer.
    Continue,
    /// A runner has accepted the task and the agent is working.
    InProgress,
    /// The agent asked for human input.
    PendingUserFeedback,
    /// Terminal: the agent finished successfully.
    Completed,
    /// Terminal: the agent failed, timed out, or could not start.
    Failed,
    /// Remote-only: the user paused the task from the UI.
    Paused,
}

impl TaskState {
    /// Whether this state is terminal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether a task in this state should be picked up by a runner.
    #[must_use]
    pub const fn is_runnable(self) -> bool {
        matches!(self, Self::New | Self::Continue)
    }

    /// Whether the local state machine may move from `self` to `to`.
    ///
    /// Terminal states only exit via an explicit `Continue` (issued by the
    /// remote peer); `Paused` is only ever set remotely, so the local side
    /// never transitions *into* it.
    #[must_use]
    pub const fn can_transition(self, to: Self) -> bool {
        if matches!(to, Self::Paused) {
            return false;
        }
        match self {
            Self::Completed | Self::Failed => matches!(to, Self::Continue),
            _ => true,
        }
    }
}

/// A unit of work assigned to one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Stable task id, assigned by the remote peer.
    pub id: String,
    /// Which agent should run this task (e.g. "claude", "goose").
    pub agent_id: String,
    /// What the user asked for.
    pub description: String,
    /// Current lifecycle state.
    pub state: TaskState,
    /// Durable event history. Holds stored events only, in arrival order.
    #[serde(default)]
    pub context: Vec<StreamEvent>,
    /// Terminal result text, set on completion or failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Short human-readable summary, set by the remote peer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Unix timestamp in milliseconds.
    pub created_at: u64,
    /// Unix timestamp in milliseconds, refreshed on every mutation.
    pub updated_at: u64,
}

impl Task {
    /// Create a new task in the `New` state.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        agent_id: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let now = now_millis();
        Self {
            id: id.into(),
            agent_id: agent_id.into(),
            description: description.into(),
            state: TaskState::New,
            context: Vec::new(),
            result: None,
            summary: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Advance the state machine. Returns `false` (and leaves the task
    /// untouched) when the transition is not allowed.
    pub fn advance(&mut self, to: TaskState) -> bool {
        if !self.state.can_transition(to) {
            return false;
        }
        self.state = to;
        self.updated_at = now_millis();
        true
    }

    /// Append stored events to the durable context, in order.
    pub fn append_context(&mut self, events: impl IntoIterator<Item = StreamEvent>) {
        self.context.extend(events);
        self.updated_at = now_millis();
    }
}

/// A partial task update, merged field-by-field into a cached task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<TaskState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Events to concatenate onto `context` — never a replacement.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub append_context: Vec<StreamEvent>,
}

impl TaskPatch {
    /// A patch that only changes state.
    #[must_use]
    pub fn state(state: TaskState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    /// A patch that moves to a terminal state with a result.
    #[must_use]
    pub fn finished(state: TaskState, result: impl Into<String>) -> Self {
        Self {
            state: Some(state),
            result: Some(result.into()),
            ..Self::default()
        }
    }

    /// Merge into a task. Context is appended, never dropped; `updated_at`
    /// is refreshed.
    pub fn apply_to(self, task: &mut Task) {
        if let Some(state) = self.state {
            task.state = state;
        }
        if let Some(result) = self.result {
            task.result = Some(result);
        }
        if let Some(summary) = self.summary {
            task.summary = Some(summary);
        }
        if !self.append_context.is_empty() {
            task.context.extend(self.append_context);
        }
        task.updated_at = now_millis();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventPayload, Role, StreamEvent};

    fn message(text: &str) -> StreamEvent {
        StreamEvent::new(EventPayload::Message {
            role: Role::Assistant,
            content: text.into(),
            delta: false,
        })
    }

    #[test]
    fn test_one_shot_lifecycle() {
        let mut task = Task::new("t1", "goose", "list the files");
        assert!(task.state.is_runnable());

        assert!(task.advance(TaskState::InProgress));
        assert!(task.advance(TaskState::Completed));
        assert!(task.state.is_terminal());
    }

    #[test]
    fn test_terminal_states_only_exit_via_continue() {
        let mut task = Task::new("t1", "goose", "x");
        task.advance(TaskState::InProgress);
        task.advance(TaskState::Failed);

        assert!(!task.advance(TaskState::InProgress));
        assert!(!task.advance(TaskState::New));
        assert_eq!(task.state, TaskState::Failed);

        assert!(task.advance(TaskState::Continue));
        assert!(task.advance(TaskState::InProgress));
    }

    #[test]
    fn test_paused_is_remote_only() {
        let mut task = Task::new("t1", "goose", "x");
        assert!(!task.advance(TaskState::Paused));
        assert_eq!(task.state, TaskState::New);
    }

    #[test]
    fn test_state_wire_names_are_kebab_case() {
        let json = serde_json::to_string(&TaskState::PendingUserFeedback).expect("serialize");
        assert_eq!(json, "\"pending-user-feedback\"");
        let json = serde_json::to_string(&TaskState::InProgress).expect("serialize");
        assert_eq!(json, "\"in-progress\"");
    }

    #[test]
    fn test_patch_appends_context_in_order() {
        let mut task = Task::new("t1", "claude", "x");
        TaskPatch {
            append_context: vec![message("a")],
            ..TaskPatch::default()
        }
        .apply_to(&mut task);
        TaskPatch {
            append_context: vec![message("b")],
            ..TaskPatch::default()
        }
        .apply_to(&mut task);

        let texts: Vec<_> = task
            .context
            .iter()
            .map(|e| match &e.payload {
                EventPayload::Message { content, .. } => content.clone(),
                _ => String::new(),
            })
            .collect();
        assert_eq!(texts, vec!["a", "b"]);
    }

    #[test]
    fn test_patch_merges_fields_without_clearing_others() {
        let mut task = Task::new("t1", "claude", "x");
        task.result = Some("partial".into());

        TaskPatch {
            summary: Some("summary".into()),
            ..TaskPatch::default()
        }
        .apply_to(&mut task);

        assert_eq!(task.result.as_deref(), Some("partial"));
        assert_eq!(task.summary.as_deref(), Some("summary"));
    }
}
