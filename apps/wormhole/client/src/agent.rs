use std::sync::Arc;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use wormhole_core::ClientTls;

use crate::config::{AgentConfig, Proto};
use crate::control::{self, ControlOptions, Disconnect, SessionEnd};
use crate::local_proxy::LocalProxy;
use crate::tunnel::Dialer;
use crate::{ssh, AgentError};

/// Keeps one session with the server alive, reconnecting with exponential
/// backoff until shut down.
pub struct Agent {
    config: AgentConfig,
    tls: Option<ClientTls>,
    local: Arc<LocalProxy>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        let tls = if config.insecure {
            None
        } else {
            Some(ClientTls::with_ca_file(config.ca_file.as_deref(), &config.server_name)?)
        };
        Self::with_tls(config, tls)
    }

    /// An agent trusting exactly `tls` towards the server.
    pub fn with_tls(config: AgentConfig, tls: Option<ClientTls>) -> Result<Self, AgentError> {
        let local_tls = if config.local_endpoint_use_tls {
            Some(ClientTls::with_ca_file(
                config.local_ca_file.as_deref(),
                config.local_host(),
            )?)
        } else {
            None
        };
        let local = Arc::new(LocalProxy::new(config.local_endpoint.clone(), local_tls));
        Ok(Self { config, tls, local })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.backoff_initial)
            .with_max_interval(self.config.backoff_max)
            .with_max_elapsed_time(None)
            .build()
    }

    /// Runs until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), AgentError> {
        let dialer = match self.config.proto {
            Proto::Ssh => None,
            proto => Some(Dialer::new(
                proto,
                self.config.remote_endpoint.clone(),
                self.config.token.clone(),
                self.tls.clone(),
                Arc::clone(&self.local),
            )?),
        };
        let options = ControlOptions {
            ping_interval: self.config.ping_interval,
            pong_timeout: self.config.pong_timeout,
            release: self.config.release.clone(),
        };
        let mut backoff = self.backoff();

        info!(
            proto = ?self.config.proto,
            remote = %self.config.remote_endpoint,
            local = %self.local.endpoint(),
            "agent starting"
        );
        loop {
            let attempt = match &dialer {
                Some(dialer) => control::run_control(dialer, &options, &shutdown).await,
                None => ssh::run(&self.config, &self.local, &shutdown).await,
            };
            match attempt {
                Ok(SessionEnd {
                    cause: Disconnect::Cancelled,
                    ..
                }) => return Ok(()),
                Ok(end) => {
                    if end.established {
                        backoff.reset();
                    }
                    info!(cause = %end.cause, "session ended");
                }
                Err(AgentError::AuthenticationFailed) => {
                    warn!("server rejected the token");
                }
                Err(err) => warn!(error = %err, "session failed"),
            }
            if shutdown.is_cancelled() {
                return Ok(());
            }

            let delay = backoff.next_backoff().unwrap_or(self.config.backoff_max);
            info!(delay = ?delay, "reconnecting");
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
