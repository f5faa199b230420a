//! Connects to a router, runs one discovery scan and prints what it finds.
//!
//! Configuration comes from `helvar.toml` if present and `HELVAR__*`
//! environment variables, e.g. `HELVAR__ROUTER__HOST=10.254.1.1`.
use std::sync::Arc;
use std::time::Duration;

use helvar_core::config::ConfigBuilder;
use helvar_net::{DiscoveryEvent, HelvarBridge, SessionStatus};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ConfigBuilder::new()
        .with_config_file("helvar.toml")
        .with_environment_prefix("helvar")
        .build()?;
    helvar_core::logging::init_with_config(&config.logging)?;

    let (status_tx, mut status_rx) = mpsc::unbounded_channel::<SessionStatus>();
    let (discovery_tx, mut discovery_rx) = mpsc::unbounded_channel::<DiscoveryEvent>();
    let bridge = HelvarBridge::new(&config, Arc::new(status_tx), Arc::new(discovery_tx));

    tokio::spawn(async move {
        while let Some(status) = status_rx.recv().await {
            match status {
                SessionStatus::Online => info!("Router online"),
                other => warn!("Router status: {}", other),
            }
        }
    });

    tokio::spawn(async move {
        while let Some(event) = discovery_rx.recv().await {
            let json = match &event {
                DiscoveryEvent::Device(device) => device.properties(),
                DiscoveryEvent::Group(group) => group.properties(),
            };
            println!("{}", serde_json::to_string_pretty(&json).unwrap_or_default());
        }
    });

    bridge.connect().await?;
    bridge.start_discovery();

    info!("Scanning for 30 seconds...");
    sleep(Duration::from_secs(30)).await;

    bridge.disconnect().await;
    Ok(())
}
