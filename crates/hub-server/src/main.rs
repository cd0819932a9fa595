//! TCP connection hub.

use std::sync::Arc;

use hub_server::config::ServerConfig;
use hub_server::{logging, server, Hub, LogHandler};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing();

    let config = ServerConfig::from_env()?;

    info!(
        addr = %config.socket_addr_string(),
        max_clients = config.max_clients,
        queue_capacity = config.hub.outbound_queue_capacity,
        "starting hub-server"
    );

    let hub = Hub::start(config.hub.clone(), Arc::new(LogHandler));

    if let Some(every) = config.stats_interval {
        tokio::spawn(server::report_stats(hub.clone(), every));
    }

    let mut gateway = tokio::spawn(server::run(config, hub.clone()));

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("shutdown requested");
        }
        result = &mut gateway => {
            // The gateway only returns on its own if binding failed.
            hub.shutdown().await;
            return result?;
        }
    }

    hub.shutdown().await;
    match gateway.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "gateway failed"),
        Err(e) => error!(error = %e, "gateway task panicked"),
    }

    let stats = hub.stats().await;
    info!(remaining = stats.total_connections, "hub-server stopped");
    Ok(())
}
