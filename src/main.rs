//! voxwire CLI: run one streaming voice-agent session from a TOML config.
//!
//! Loads the config, wires logging listeners onto all six lifecycle event
//! kinds, starts the session, and stops it cleanly on Ctrl-C. Audio goes
//! through the in-memory loopback backend; real deployments embed the
//! library and supply their own [`AudioBackend`] implementation.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use voxwire::audio::{AudioBackend, AudioRouter, DeviceId, LoopbackBackend, OutputRole};
use voxwire::config::Config;
use voxwire::events::{EventDispatcher, EventKind, LifecycleEvent};
use voxwire::session::{SessionController, StartOptions};
use voxwire::transport::{Transport, TransportClient};

#[derive(Debug, Parser)]
#[command(name = "voxwire", version, about = "Streaming voice-agent session runner")]
struct Cli {
    /// Path to the TOML config file (defaults to the platform config dir).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured agent id.
    #[arg(long)]
    agent_id: Option<String>,

    /// Message the agent speaks first.
    #[arg(long)]
    message: Option<String>,

    /// Activity timeout in seconds (0 disables).
    #[arg(long)]
    timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("voxwire=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    let agent_id = cli
        .agent_id
        .clone()
        .unwrap_or_else(|| config.agent.agent_id.clone());
    if agent_id.is_empty() {
        anyhow::bail!("no agent id configured; set [agent].agent_id or pass --agent-id");
    }

    // Device bindings from config, claimed up front.
    let backend = Arc::new(LoopbackBackend::new());
    let router = Arc::new(AudioRouter::new(
        Arc::clone(&backend) as Arc<dyn AudioBackend>
    ));
    router.bind_input(&DeviceId::new(config.audio.input.clone()))?;
    router.bind_output(
        OutputRole::Agent,
        &DeviceId::new(config.audio.agent_output.clone()),
    )?;
    if let Some(activation) = &config.audio.activation_output {
        router.bind_output(OutputRole::Activation, &DeviceId::new(activation.clone()))?;
    }

    // Log every lifecycle transition the way a host automation would see it.
    let dispatcher = Arc::new(EventDispatcher::new());
    for kind in EventKind::all() {
        dispatcher.subscribe(*kind, |event| match event {
            LifecycleEvent::Error(message) => {
                tracing::error!(message = %message, "Session error");
            }
            other => tracing::info!(event = ?other, "Lifecycle event"),
        });
    }

    let transport = Arc::new(TransportClient::new(config.transport.to_transport_config()));
    let controller =
        SessionController::new(dispatcher, router, transport as Arc<dyn Transport>);

    let mut opts = StartOptions::new(agent_id);
    if let Some(key) = config.agent.api_key.clone() {
        opts = opts.with_credential(key);
    }
    if let Some(message) = cli.message.clone().or(config.agent.initial_message.clone()) {
        opts = opts.with_initial_message(message);
    }
    let timeout = match cli.timeout {
        Some(0) => None,
        Some(secs) => Some(Duration::from_secs(secs)),
        None => config.timeout(),
    };
    if let Some(timeout) = timeout {
        opts = opts.with_timeout(timeout);
    }

    controller.start(opts).await?;
    tracing::info!("Session running; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    controller.stop().await;
    tracing::info!("Session stopped");

    Ok(())
}
