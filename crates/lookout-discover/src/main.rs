//! CLI entry point for the lookout-discover daemon.

use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use lookout_core::events::LookoutEvent;
use lookout_core::Device;
use lookout_store::{Inventory, MemoryInventory, SecretStore, StaticSecretStore};

use lookout_discover::config;
use lookout_discover::discovery::{DiscoveryPass, DiscoverySummary};
use lookout_discover::onvif::{HttpOnvifClient, OnvifClient};
use lookout_discover::prober::{ConnectionProber, HealthSummary};
use lookout_discover::scheduler::{run_discovery_pass, run_health_check_pass, Scheduler};

#[derive(Parser)]
#[command(name = "lookout-discover")]
#[command(about = "ONVIF camera discovery and health checks for the Lookout gateway")]
struct Cli {
    /// Run one discovery pass and one health check, print a JSON report, and exit.
    #[arg(long)]
    once: bool,

    /// Run as daemon with scheduled discovery and health checks.
    #[arg(long)]
    daemon: bool,

    /// Config file prefix (default: lookout).
    #[arg(short, long, default_value = "lookout")]
    config: String,
}

#[derive(Serialize)]
struct OnceReport {
    discovery: DiscoverySummary,
    health: HealthSummary,
    devices: Vec<Device>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).json().init();

    let cli = Cli::parse();
    if !cli.once && !cli.daemon {
        anyhow::bail!("Specify --once (single pass) or --daemon (scheduled passes)");
    }

    let discover_config = config::load(&cli.config)?;

    let inventory = MemoryInventory::with_devices(discover_config.static_devices()?);
    tracing::info!(devices = inventory.len().await, "Inventory loaded");
    let inventory: Arc<dyn Inventory> = Arc::new(inventory);
    let secrets: Arc<dyn SecretStore> =
        Arc::new(StaticSecretStore::new(discover_config.credentials.clone()));
    let client: Arc<dyn OnvifClient> =
        Arc::new(HttpOnvifClient::new(discover_config.request_timeout())?);

    let (events, _) = broadcast::channel(256);
    tokio::spawn(log_events(events.subscribe()));

    let prober = ConnectionProber::standard(
        client.clone(),
        secrets.clone(),
        inventory.clone(),
        discover_config.request_timeout(),
    )?
    .with_events(events.clone());
    let discovery =
        DiscoveryPass::new(&discover_config, inventory.clone(), client, secrets).with_events(events);

    let cancel = CancellationToken::new();
    spawn_signal_handlers(cancel.clone());

    if cli.once {
        let discovered = run_discovery_pass(
            &discovery,
            discover_config.max_discover_duration(),
            &cancel,
        )
        .await;
        let health = run_health_check_pass(inventory.as_ref(), &prober, &cancel).await?;
        let report = OnceReport {
            discovery: discovered,
            health,
            devices: inventory.list_devices().await?,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let scheduler = Scheduler::new(
            &discover_config,
            inventory,
            Arc::new(prober),
            Arc::new(discovery),
        );
        scheduler.run(cancel).await;
    }

    Ok(())
}

async fn log_events(mut rx: broadcast::Receiver<LookoutEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => tracing::info!(event = %json, "Lookout event"),
                Err(e) => tracing::warn!(error = %e, "Could not serialize event"),
            },
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "Event logger lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Turn Ctrl-C and SIGTERM into cancellation of `cancel`.
fn spawn_signal_handlers(cancel: CancellationToken) {
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl+C, shutting down");
            on_ctrl_c.cancel();
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, shutting down");
                    cancel.cancel();
                }
                Err(e) => tracing::warn!(error = %e, "Failed to register SIGTERM handler"),
            }
        });
    }

    #[cfg(not(unix))]
    {
        let _ = cancel;
    }
}
