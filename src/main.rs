//! atlas-bridge — Agent Process Bridge & Task Synchronization

use atlas_bridge::supervise::ProcessSupervisor;
use atlas_bridge::tunnel::{SyncTunnel, TunnelConfig};
use atlas_bridge::{AgentKind, AgentRunner, Bridge, Cli, Command, Task};
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("atlas_bridge=debug")
    } else {
        EnvFilter::new("atlas_bridge=warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Command::Run {
            host,
            room,
            identity,
            reconnect,
        } => run_bridge(&host, &room, identity, reconnect).await,
        Command::Exec { agent, task } => run_exec(&agent, task).await,
        Command::Agents => run_agents(),
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

/// Connect to the orchestrator and serve tasks until shutdown.
async fn run_bridge(
    host: &str,
    room: &str,
    identity: String,
    reconnect: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let url = atlas_bridge::cli::room_url(host, room)?;
    let mut config = TunnelConfig::new(url, identity);
    config.reconnect = reconnect;

    let supervisor = ProcessSupervisor::new();
    install_shutdown_handlers(&supervisor);

    // A failed handshake is fatal; everything after degrades gracefully.
    let (tunnel, mut feed) = SyncTunnel::connect(config).await?;

    let mut bridge = Bridge::new(supervisor, tunnel);
    bridge.serve(&mut feed).await;
    Ok(())
}

/// Run one task locally, printing every event as a JSON line.
async fn run_exec(agent: &str, description: String) -> Result<(), Box<dyn std::error::Error>> {
    let kind = AgentKind::from_name(agent)
        .ok_or_else(|| atlas_bridge::AgentError::UnknownAgent(agent.to_string()))?;

    let task = Task::new(
        format!("local-{}", std::process::id()),
        kind.name(),
        description,
    );
    let (tunnel, _feed) = SyncTunnel::detached();
    tunnel.track_task(task.clone());

    let supervisor = ProcessSupervisor::new();
    install_shutdown_handlers(&supervisor);

    let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if let Ok(json) = serde_json::to_string(&event) {
                println!("{json}");
            }
        }
    });

    let runner = AgentRunner::new(kind, supervisor).with_observer(event_tx);
    let output = runner.run(&task, &tunnel).await?;
    // The runner holds the observer sender; drop it so the printer drains
    // and exits.
    drop(runner);
    let _ = printer.await;

    if !output.result.is_empty() {
        eprintln!("{}", output.result);
    }
    Ok(())
}

/// List the agent registry with executable-resolution status.
fn run_agents() -> Result<(), Box<dyn std::error::Error>> {
    for kind in AgentKind::ALL {
        let profile = kind.profile();
        let status = kind.resolve_executable().map_or_else(
            || "[MISSING]".to_string(),
            |path| format!("[OK] {}", path.display()),
        );
        println!(
            "{:<10} {:<16} timeout {:>4}s  {}",
            kind.name(),
            format!("({:?})", profile.dialect).to_lowercase(),
            profile.timeout.as_secs(),
            status,
        );
    }
    Ok(())
}

/// Kill every tracked subprocess on interrupt/terminate, then exit. Also
/// runs on normal exit paths via the bridge shutdown.
fn install_shutdown_handlers(supervisor: &ProcessSupervisor) {
    let on_interrupt = supervisor.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        on_interrupt.kill_all();
        std::process::exit(130);
    });

    #[cfg(unix)]
    {
        let on_terminate = supervisor.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{SignalKind, signal};
            if let Ok(mut term) = signal(SignalKind::terminate()) {
                term.recv().await;
                on_terminate.kill_all();
                std::process::exit(143);
            }
        });
    }
}
