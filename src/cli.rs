//! Command-line interface for atlas-bridge.

use clap::{Parser, Subcommand};
use url::Url;

/// Default relay host, overridable per deployment.
pub const DEFAULT_HOST: &str = "atlas-agents-rooms.example.partykit.dev";

/// Build the room URL the way the relay expects it:
/// `wss://<host>/parties/main/<room>` (`ws://` for local development).
pub fn room_url(host: &str, room: &str) -> Result<Url, url::ParseError> {
    let scheme = if host.contains("localhost") || host.starts_with("127.") {
        "ws"
    } else {
        "wss"
    };
    Url::parse(&format!("{scheme}://{host}/parties/main/{room}"))
}

/// Bridge between local coding-agent CLIs and the Atlas orchestrator.
#[derive(Debug, Parser)]
#[command(name = "atlas-bridge", version, about)]
pub struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Connect to the orchestrator and serve assigned tasks.
    Run {
        /// Relay host.
        #[arg(long, env = "ATLAS_HOST", default_value = DEFAULT_HOST)]
        host: String,

        /// Room to join (one room per user/workspace).
        #[arg(long, env = "ATLAS_ROOM")]
        room: String,

        /// Stable identity announced to the peer.
        #[arg(long, env = "ATLAS_IDENTITY", default_value = "agent-bridge")]
        identity: String,

        /// Keep reconnecting with backoff after a drop.
        #[arg(long)]
        reconnect: bool,
    },

    /// Run one task locally and print its events as JSON lines.
    Exec {
        /// Which agent to run (opencode, claude, goose, gemini, droid, toad).
        #[arg(long, short)]
        agent: String,

        /// Task description.
        task: String,
    },

    /// List supported agents and whether their executables resolve.
    Agents,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_url_schemes() {
        let url = room_url("relay.example.dev", "room-1").expect("url");
        assert_eq!(url.as_str(), "wss://relay.example.dev/parties/main/room-1");

        let url = room_url("localhost:1999", "room-1").expect("url");
        assert_eq!(url.as_str(), "ws://localhost:1999/parties/main/room-1");
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "atlas-bridge",
            "run",
            "--room",
            "room-1",
            "--identity",
            "bridge-7",
            "--reconnect",
        ])
        .expect("parse");
        match cli.command {
            Command::Run {
                room,
                identity,
                reconnect,
                ..
            } => {
                assert_eq!(room, "room-1");
                assert_eq!(identity, "bridge-7");
                assert!(reconnect);
            }
            other => panic!("expected Run, got {other:?}"),
        }
    }

    #[test]
    fn test_cli_parses_exec() {
        let cli = Cli::try_parse_from([
            "atlas-bridge",
            "exec",
            "--agent",
            "goose",
            "list the tests",
        ])
        .expect("parse");
        match cli.command {
            Command::Exec { agent, task } => {
                assert_eq!(agent, "goose");
                assert_eq!(task, "list the tests");
            }
            other => panic!("expected Exec, got {other:?}"),
        }
    }
}
