//! Mail-to-ticket bridge service.
//!
//! Configuration comes from the environment (and `.env`). Set `RUST_LOG` to control
//! log levels, e.g. `RUST_LOG=mail_ticket_bridge=debug`. HTTP requests are logged under
//! the `tower_http` target.

use mail_ticket_bridge::{api, spawn_listener, BridgeConfig, ListenerSupervisor};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> mail_ticket_bridge::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("mail_ticket_bridge=info,tower_http=info")),
        )
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    let config = BridgeConfig::from_env()?;
    tracing::info!(
        imap_host = %config.mailbox.host,
        folder = %config.mailbox.folder,
        ticketing = %config.ticketing.base_url(),
        "Configuration loaded"
    );

    let listener_config = config.clone();
    let supervisor = Arc::new(ListenerSupervisor::new(move || {
        spawn_listener(&listener_config)
    }));

    // Start listening right away; the HTTP trigger restarts it if it ever gives up
    supervisor.ensure_running().await?;

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
        tracing::info!("Shutdown requested");
    };

    let served = api::serve(addr, Arc::clone(&supervisor), shutdown).await;

    if tokio::time::timeout(Duration::from_secs(30), supervisor.shutdown())
        .await
        .is_err()
    {
        tracing::warn!("Listener did not stop in time");
    }
    tracing::info!("Stopped");
    served
}
