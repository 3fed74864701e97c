//! mysql-relay
//!
//! Protocol-aware TCP reverse proxy for the MySQL wire protocol.
//!
//! This binary:
//! - Loads `[routing]` sections from an INI-style configuration file
//! - Binds one routing service per section
//! - Accepts client connections, applies admission control, and splices
//!   each one to a backend picked by the section's routing mode
//! - Re-validates live connections against the access-control service on
//!   SIGUSR2

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mysql_relay::config::{parse_config, RoutingConfig};
use mysql_relay::proxy::Router;

#[derive(Parser)]
#[command(name = "mysql-relay", version, about = "MySQL wire-protocol TCP reverse proxy")]
struct Cli {
    /// Configuration file containing [routing] sections.
    #[arg(short, long)]
    config: PathBuf,

    /// Log level when RUST_LOG is not set (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| cli.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let text = std::fs::read_to_string(&cli.config)
        .with_context(|| format!("Failed to read configuration file {}", cli.config.display()))?;
    let sections = parse_config(&text)?;

    let mut routers = Vec::new();
    for section in sections.iter().filter(|s| s.name == "routing") {
        let config = RoutingConfig::from_section(section)?;
        let router = Arc::new(Router::bind(config).await?);
        info!(
            route = %section.label(),
            "configured; listening on {}", router.local_addr()?
        );
        routers.push(router);
    }
    if routers.is_empty() {
        bail!(
            "no [routing] section found in {}",
            cli.config.display()
        );
    }

    // Revalidation is driven by a channel; the signal handler only
    // enqueues, the drain task walks the routers.
    let (revalidate_tx, mut revalidate_rx) = mpsc::channel::<()>(1);
    {
        let routers = routers.clone();
        tokio::spawn(async move {
            while revalidate_rx.recv().await.is_some() {
                info!("revalidating connections");
                for router in &routers {
                    let revoked = router.revalidate().await;
                    if revoked > 0 {
                        info!("revoked {revoked} connections");
                    }
                }
            }
        });
    }

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let tx = revalidate_tx.clone();
        tokio::spawn(async move {
            let mut usr2 = match signal(SignalKind::user_defined2()) {
                Ok(stream) => stream,
                Err(e) => {
                    error!("failed to install SIGUSR2 handler: {e}");
                    return;
                }
            };
            while usr2.recv().await.is_some() {
                // A sweep is already queued when this fails; dropping the
                // extra event is fine.
                let _ = tx.try_send(());
            }
        });
    }

    let mut services = Vec::new();
    for router in &routers {
        let router = Arc::clone(router);
        services.push(tokio::spawn(router.run()));
    }
    for service in services {
        service.await.context("routing service panicked")??;
    }

    Ok(())
}
