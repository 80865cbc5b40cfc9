use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use wormhole_server::admin::{self, AdminState};
use wormhole_server::config::{Cli, ServerConfig};
use wormhole_server::store::{RedisStore, SessionStore};
use wormhole_server::telemetry::Telemetry;
use wormhole_server::{Credentials, Server};

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        proto = %config.proto,
        listen_addr = %config.listen_addr,
        node_id = %config.node.node_id,
        cluster = %config.node.cluster,
        shared_port = config.shared_port.is_some(),
        "starting wormhole server"
    );

    let store: Arc<dyn SessionStore> = Arc::new(
        RedisStore::connect(&config.redis_url)
            .await
            .context("failed to connect to redis")?,
    );
    let credentials = Credentials::load(&config)?;

    let shutdown = CancellationToken::new();
    let server = Server::bind(&config, credentials, Arc::clone(&store), shutdown.clone()).await?;

    let admin_listener = TcpListener::bind(config.metrics_addr)
        .await
        .with_context(|| format!("failed to bind admin listener {}", config.metrics_addr))?;
    info!(addr = %config.metrics_addr, "admin api listening");
    let router = admin::router(Arc::new(AdminState {
        store,
        metrics: telemetry.metrics_handle(),
    }));
    let admin_shutdown = shutdown.clone();
    let admin_task = tokio::spawn(async move {
        axum::serve(admin_listener, router)
            .with_graceful_shutdown(async move { admin_shutdown.cancelled().await })
            .await
    });

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_shutdown.cancel();
    });

    server.run().await;
    shutdown.cancel();
    match admin_task.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(error = %err, "admin api stopped with error"),
        Err(err) => warn!(error = %err, "admin api task failed"),
    }
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
