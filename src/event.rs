//! Canonical stream-event model.
//!
//! Every agent dialect is normalized into `StreamEvent`s by the parsers in
//! [`crate::parse`]. Events are immutable once produced and are either
//! *stored* (persisted into a task's durable context) or *ephemeral*
//! (broadcast live, never persisted).

// Timestamp won't overflow u64 until year 584942417355
#![allow(clippy::cast_possible_truncation)]

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Lifecycle status of a tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[derive(Default)]
pub enum ToolStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// One step of an agent-reported plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    /// What the step does.
    pub content: String,
    /// Current status of the step.
    #[serde(default)]
    pub status: ToolStatus,
}

/// Event payload, tagged by event type on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// A conversational message. `delta` marks a partial chunk that must be
    /// accumulated by the consumer, never rendered standalone.
    Message {
        role: Role,
        content: String,
        #[serde(default)]
        delta: bool,
    },

    /// A tool invocation opened by the agent.
    ToolCall {
        /// Correlation key shared with subsequent `ToolUpdate`s.
        id: String,
        /// Tool name or human-readable title.
        name: String,
        #[serde(default)]
        status: ToolStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
    },

    /// A status/output change for an already-opened tool invocation.
    ToolUpdate {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<ToolStatus>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
    },

    /// The agent entered a thinking episode. Emitted once per episode, not
    /// per chunk.
    Thinking,

    /// The agent published or revised its plan.
    Plan { entries: Vec<PlanEntry> },

    /// Free-form progress or diagnostic information.
    Status { message: String },

    /// The agent needs human input before it can continue.
    Permission { prompt: String },

    /// The agent finished a turn or a task.
    Completion {
        result: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stop_reason: Option<String>,
    },

    /// A line the dialect parser could not interpret, carried verbatim.
    Raw { text: String },
}

impl EventPayload {
    /// Whether events of this shape are persisted into `Task::context`.
    ///
    /// This is a fixed classification table: full messages and completions
    /// are stored; everything else (including delta message chunks, which
    /// must never be rendered standalone) is broadcast-only.
    #[must_use]
    pub const fn is_stored(&self) -> bool {
        matches!(
            self,
            Self::Message { delta: false, .. } | Self::Completion { .. }
        )
    }
}

/// A canonical event produced from an agent's output stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Unix timestamp in milliseconds.
    pub timestamp: u64,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl StreamEvent {
    /// Wrap a payload with the current timestamp.
    #[must_use]
    pub fn new(payload: EventPayload) -> Self {
        Self {
            timestamp: now_millis(),
            payload,
        }
    }

    /// Whether this event is persisted into a task's context.
    #[must_use]
    pub const fn is_stored(&self) -> bool {
        self.payload.is_stored()
    }
}

/// Get the current Unix timestamp in milliseconds.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// One folded tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolEntry {
    pub name: String,
    pub status: ToolStatus,
    pub output: Option<String>,
}

/// Consumer-side fold of `ToolCall`/`ToolUpdate` events keyed by id.
///
/// A pure projection: reconstructible from any event slice, never persisted.
#[derive(Debug, Default)]
pub struct ToolState {
    entries: HashMap<String, ToolEntry>,
    order: Vec<String>,
}

impl ToolState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the projection from a slice of events.
    #[must_use]
    pub fn from_events(events: &[StreamEvent]) -> Self {
        let mut state = Self::new();
        for event in events {
            state.apply(event);
        }
        state
    }

    /// Fold one event into the projection. Non-tool events are ignored.
    pub fn apply(&mut self, event: &StreamEvent) {
        match &event.payload {
            EventPayload::ToolCall {
                id,
                name,
                status,
                output,
            } => {
                if !self.entries.contains_key(id) {
                    self.order.push(id.clone());
                }
                self.entries.insert(
                    id.clone(),
                    ToolEntry {
                        name: name.clone(),
                        status: *status,
                        output: output.clone(),
                    },
                );
            }
            EventPayload::ToolUpdate { id, status, output } => {
                // An update without a preceding call still opens an entry so
                // late joiners replaying partial context stay consistent.
                let entry = self.entries.entry(id.clone()).or_insert_with(|| {
                    self.order.push(id.clone());
                    ToolEntry {
                        name: id.clone(),
                        status: ToolStatus::Pending,
                        output: None,
                    }
                });
                if let Some(status) = status {
                    entry.status = *status;
                }
                if let Some(output) = output {
                    entry.output = Some(output.clone());
                }
            }
            _ => {}
        }
    }

    /// Look up a folded entry by correlation id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ToolEntry> {
        self.entries.get(id)
    }

    /// Iterate entries in first-seen order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &ToolEntry)> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id).map(|e| (id.as_str(), e)))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
