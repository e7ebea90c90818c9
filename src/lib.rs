//! atlas-bridge — Agent Process Bridge & Task Synchronization
//!
//! Runs third-party coding-agent CLIs locally while the Atlas orchestrator
//! assigns tasks and observes progress: subprocess supervision, per-dialect
//! stream parsing into canonical events, a per-task state machine, and
//! optimistic state sync with the remote peer.

// Error documentation is deferred - the errors are self-explanatory from types
#![allow(clippy::missing_errors_doc)]

pub mod agent;
pub mod batch;
pub mod bridge;
pub mod cli;
pub mod event;
pub mod parse;
pub mod pty;
pub mod runner;
pub mod supervise;
pub mod task;
pub mod tunnel;

pub use agent::{AgentKind, AgentProfile};
pub use batch::{EventBatch, EventBatcher};
pub use bridge::Bridge;
pub use cli::{Cli, Command};
pub use event::{EventPayload, Role, StreamEvent, ToolState, ToolStatus};
pub use parse::{Dialect, DialectParser};
pub use runner::{AgentError, AgentOutput, AgentRunner, InteractiveSession};
pub use supervise::{ProcessSupervisor, SpawnOptions, StdioMode, SuperviseError};
pub use task::{Task, TaskPatch, TaskState};
pub use tunnel::{ConnectionState, SyncTunnel, TunnelConfig, TunnelError};
