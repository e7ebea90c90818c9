//! The supported-agent registry.
//!
//! A closed enum of the coding-agent CLIs the bridge knows how to drive.
//! Each kind carries a fixed profile: executable name, output dialect,
//! argument template, and timeout. New agents are added here and nowhere
//! else.

use crate::parse::Dialect;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// A coding-agent CLI the bridge can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Opencode,
    Claude,
    Goose,
    Gemini,
    Droid,
    Toad,
}

impl AgentKind {
    /// All supported kinds, in display order.
    pub const ALL: [Self; 6] = [
        Self::Opencode,
        Self::Claude,
        Self::Goose,
        Self::Gemini,
        Self::Droid,
        Self::Toad,
    ];

    /// The registry name, as used in task `agent_id` fields.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Opencode => "opencode",
            Self::Claude => "claude",
            Self::Goose => "goose",
            Self::Gemini => "gemini",
            Self::Droid => "droid",
            Self::Toad => "toad",
        }
    }

    /// Resolve a kind from a task's `agent_id` string.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == name.trim().to_lowercase())
    }

    /// The fixed execution profile for this agent.
    #[must_use]
    pub const fn profile(self) -> AgentProfile {
        match self {
            Self::Opencode => AgentProfile {
                executable: "opencode",
                dialect: Dialect::Text,
                timeout: Duration::from_secs(5 * 60),
                interactive: false,
            },
            Self::Claude => AgentProfile {
                executable: "claude",
                dialect: Dialect::Ndjson,
                timeout: Duration::from_secs(5 * 60),
                interactive: false,
            },
            Self::Goose => AgentProfile {
                executable: "goose",
                dialect: Dialect::Text,
                timeout: Duration::from_secs(5 * 60),
                interactive: false,
            },
            Self::Gemini => AgentProfile {
                executable: "gemini",
                dialect: Dialect::Acp,
                timeout: Duration::from_secs(30 * 60),
                interactive: true,
            },
            Self::Droid => AgentProfile {
                executable: "droid",
                dialect: Dialect::StreamJsonRpc,
                timeout: Duration::from_secs(5 * 60),
                interactive: false,
            },
            Self::Toad => AgentProfile {
                executable: "toad",
                dialect: Dialect::Acp,
                timeout: Duration::from_secs(30 * 60),
                interactive: true,
            },
        }
    }

    /// Build the one-shot argument vector for a task description.
    ///
    /// Interactive (ACP) agents take no task on the command line — the task
    /// text travels over stdin as a `session/prompt` request instead.
    #[must_use]
    pub fn one_shot_args(self, task_text: &str) -> Vec<String> {
        match self {
            Self::Opencode => vec!["run".into(), task_text.into()],
            Self::Claude => vec![
                "-p".into(),
                "--output-format".into(),
                "stream-json".into(),
                "--verbose".into(),
                task_text.into(),
            ],
            Self::Goose => vec![
                "run".into(),
                "-t".into(),
                task_text.into(),
                "--no-session".into(),
            ],
            Self::Droid => vec![
                "exec".into(),
                "-o".into(),
                "stream-jsonrpc".into(),
                task_text.into(),
            ],
            Self::Gemini => vec!["--experimental-acp".into()],
            Self::Toad => vec!["acp".into()],
        }
    }

    /// Environment overrides applied to every spawn: color output is
    /// disabled so parsers see clean text.
    #[must_use]
    pub fn base_env() -> Vec<(String, String)> {
        vec![
            ("FORCE_COLOR".into(), "0".into()),
            ("NO_COLOR".into(), "1".into()),
        ]
    }

    /// Look up the executable on `PATH`. Returns the resolved path, or
    /// `None` when the agent is not installed.
    #[must_use]
    pub fn resolve_executable(self) -> Option<PathBuf> {
        resolve_on_path(self.profile().executable)
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Fixed execution profile for one agent kind.
#[derive(Debug, Clone, Copy)]
pub struct AgentProfile {
    /// Executable name looked up on `PATH`.
    pub executable: &'static str,
    /// Which dialect parser consumes its stdout.
    pub dialect: Dialect,
    /// Hard per-task timeout.
    pub timeout: Duration,
    /// Whether the agent supports a persistent multi-task session.
    pub interactive: bool,
}

/// Walk `PATH` looking for an executable file with the given name.
fn resolve_on_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(name);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}

#[cfg(unix)]
fn is_executable(path: &std::path::Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &std::path::Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_name_round_trips() {
        for kind in AgentKind::ALL {
            assert_eq!(AgentKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(AgentKind::from_name("CLAUDE"), Some(AgentKind::Claude));
        assert_eq!(AgentKind::from_name("  goose "), Some(AgentKind::Goose));
        assert_eq!(AgentKind::from_name("cursor"), None);
    }

    #[test]
    fn test_one_shot_args_carry_task_text() {
        let args = AgentKind::Goose.one_shot_args("fix the tests");
        assert_eq!(args, vec!["run", "-t", "fix the tests", "--no-session"]);

        // Interactive agents get the task over stdin, not argv.
        let args = AgentKind::Gemini.one_shot_args("fix the tests");
        assert!(!args.iter().any(|a| a.contains("fix the tests")));
    }

    #[test]
    fn test_interactive_agents_have_long_timeouts() {
        for kind in AgentKind::ALL {
            let profile = kind.profile();
            if profile.interactive {
                assert!(profile.timeout >= Duration::from_secs(30 * 60));
            }
        }
    }

    #[test]
    fn test_resolve_missing_executable() {
        // None of the agent CLIs ship in CI; `sh` always resolves.
        assert!(resolve_on_path("sh").is_some());
        assert!(resolve_on_path("definitely-not-a-real-binary-name").is_none());
    }
}
