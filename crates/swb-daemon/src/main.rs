// SPDX-License-Identifier: MIT OR Apache-2.0
//! Daemon entry point.

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use swb_config::{SwitchboardConfig, load_config, validate_config};
use swb_daemon::{WsTransport, build_adapters};
use swb_manager::{FileLauncherStateStorage, FileSessionStorage, SessionManager, Transport};
use swb_telemetry::EventBus;

#[derive(Debug, Parser)]
#[command(name = "swb-daemon", version, about = "Agent Switchboard daemon")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen port override.
    #[arg(long)]
    port: Option<u16>,

    /// Directory for persisted session and launcher state.
    #[arg(long, default_value = ".switchboard")]
    state_dir: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(config: &SwitchboardConfig, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(config.log_level.as_deref().unwrap_or("info"))
    });
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref()).context("loading configuration")?;
    if let Some(port) = args.port {
        config.port = port;
    }
    init_tracing(&config, args.log_json);
    for warning in validate_config(&config).context("validating configuration")? {
        tracing::warn!(target: "swb.daemon", "{warning}");
    }

    let bus = EventBus::new();
    let (adapters, supervisors) = build_adapters(&config, &bus).await;
    let manager = SessionManager::with_bus(
        config.clone(),
        adapters,
        Arc::new(FileSessionStorage::new(args.state_dir.join("sessions"))),
        Arc::new(FileLauncherStateStorage::new(
            args.state_dir.join("launcher.json"),
        )),
        bus,
    )
    .with_supervisors(supervisors);

    manager.start().await.context("starting session manager")?;

    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    let transport = WsTransport::new(manager.clone(), addr);
    transport
        .start(manager.bridge().clone())
        .await
        .context("starting transport")?;

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!(target: "swb.daemon", "shutting down");
    transport.stop().await;
    manager.stop().await;
    Ok(())
}
