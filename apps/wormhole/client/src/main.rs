use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use wormhole_client::config::Cli;
use wormhole_client::supervisor::{self, Supervisor};
use wormhole_client::{Agent, AgentConfig};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()
        .context("failed to initialise tracing subscriber")?;

    let config = AgentConfig::try_from(Cli::parse())?;
    let agent = Agent::new(config.clone()).context("failed to set up TLS")?;
    let shutdown = CancellationToken::new();

    if config.command.is_empty() {
        let signal_shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            signal_shutdown.cancel();
        });
        agent.run(shutdown).await?;
        return Ok(ExitCode::SUCCESS);
    }

    let child = Supervisor::spawn(&config.command, config.port)?;
    let mut exited = tokio::spawn(child.wait());
    tokio::select! {
        ready = supervisor::wait_for_port(&config.local_endpoint, config.startup_timeout) => {
            if let Err(err) = ready {
                // Dropping the child kills it.
                exited.abort();
                return Err(err.into());
            }
        }
        status = &mut exited => {
            let status = status.context("program supervisor failed")??;
            error!(%status, "program exited before accepting connections");
            return Ok(exit_code(status));
        }
    }
    info!(local = %config.local_endpoint, "program is accepting connections");

    let agent_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { agent.run(shutdown).await }
    });
    let status = exited.await.context("program supervisor failed")??;
    shutdown.cancel();
    match agent_task.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(error = %err, "agent stopped with error"),
        Err(err) => warn!(error = %err, "agent task failed"),
    }
    Ok(exit_code(status))
}

fn exit_code(status: std::process::ExitStatus) -> ExitCode {
    let code = supervisor::exit_code(status);
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

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

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
