//! Easel headless client
//!
//! Joins a project, keeps the local mirror reconciled, and logs what the
//! room is doing. Reconnects with a short backoff when the connection drops;
//! the join/full-sync handshake restores state. Useful for soak-testing a
//! server and as a protocol reference.

use anyhow::Result;
use clap::Parser;
use easel_client::{ClientConfig, ClientEngine, WsSession};
use easel_protocol::{ClientMessage, ServerMessage};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Easel - collaborative canvas client
#[derive(Parser, Debug)]
#[command(name = "easel")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long)]
    config: Option<String>,

    /// Server endpoint (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Project to join (overrides config)
    #[arg(short, long)]
    project: Option<i64>,

    /// Username (overrides config)
    #[arg(short, long)]
    username: Option<String>,

    /// Run in verbose mode
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = match &args.config {
        Some(path) => ClientConfig::load(path).await?,
        None => ClientConfig::default(),
    };
    if let Some(endpoint) = args.endpoint {
        config.endpoint = endpoint;
    }
    if let Some(project) = args.project {
        config.project_id = project;
    }
    if let Some(username) = args.username {
        config.username = username;
    }

    let tab_id = uuid::Uuid::new_v4().to_string();
    let mut engine = ClientEngine::new(config.project_id);

    loop {
        match run_session(&config, &tab_id, &mut engine).await {
            Ok(()) => break,
            Err(e) => {
                warn!(error = %e, "session ended, reconnecting");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }

    info!(
        nodes = engine.canvas().node_count(),
        seq = engine.last_seq(),
        "final state"
    );
    Ok(())
}

/// One connection's lifetime. `Ok(())` means the user asked to quit;
/// any error means the caller should reconnect.
async fn run_session(
    config: &ClientConfig,
    tab_id: &str,
    engine: &mut ClientEngine,
) -> Result<()> {
    let session = WsSession::connect(&config.endpoint).await?;
    let (sender, mut receiver) = session.split();

    let display_name = config
        .display_name
        .clone()
        .unwrap_or_else(|| config.username.clone());
    sender
        .send(&ClientMessage::JoinProject {
            project_id: config.project_id,
            username: config.username.clone(),
            display_name,
            tab_id: tab_id.to_string(),
        })
        .await?;

    let mut heartbeat = tokio::time::interval(Duration::from_secs(config.heartbeat_secs));

    loop {
        tokio::select! {
            message = receiver.recv() => {
                let Some(message) = message? else {
                    anyhow::bail!("server closed the connection");
                };
                log_message(&message);
                match engine.handle(&message) {
                    Ok(Some(reply)) => sender.send(&reply).await?,
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "reconciliation error"),
                }
            }
            _ = heartbeat.tick() => {
                let timestamp = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0);
                sender.send(&engine.heartbeat(timestamp)).await?;
                for operation_id in engine.check_timeouts(Instant::now()) {
                    warn!(operation_id, "operation timed out");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("leaving project");
                let _ = sender
                    .send(&ClientMessage::LeaveProject { project_id: config.project_id })
                    .await;
                return Ok(());
            }
        }
    }
}

fn log_message(message: &ServerMessage) {
    match message {
        ServerMessage::ProjectJoined { sequence_number, .. } => {
            info!(seq = sequence_number, "joined project");
        }
        ServerMessage::ActiveUsers { users } => {
            info!(users = users.len(), "presence update");
        }
        ServerMessage::UserJoined { user } => info!(user = %user.username, "user joined"),
        ServerMessage::UserLeft { username, .. } => info!(user = %username, "user left"),
        ServerMessage::TabClosed { tab_id, .. } => info!(%tab_id, "tab closed"),
        ServerMessage::StateUpdate { state_version, .. } => {
            info!(seq = state_version, "state update");
        }
        ServerMessage::MediaReady { hash, .. } => info!(%hash, "media ready"),
        _ => {}
    }
}
