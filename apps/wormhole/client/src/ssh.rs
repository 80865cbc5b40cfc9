//! Legacy SSH transport: a remote port forward whose `forwarded-tcpip`
//! channels are spliced to the local service.

use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Config, Handle, Handler, Msg, Session};
use russh::{Channel, Disconnect as SshDisconnect};
use tokio::io::copy_bidirectional;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wormhole_core::{Release, SSH_RELEASE_COMMAND};

use crate::config::AgentConfig;
use crate::control::{Disconnect, SessionEnd};
use crate::local_proxy::LocalProxy;
use crate::AgentError;

const SSH_USER: &str = "wormhole";
const KEEPALIVE_MAX: usize = 3;
const CLOSED_POLL: Duration = Duration::from_secs(1);

struct Forwarder {
    local: Arc<LocalProxy>,
}

impl Handler for Forwarder {
    type Error = AgentError;

    // TODO: pin the server host key through a known_hosts file option.
    async fn check_server_key(&mut self, _key: &russh::keys::PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(
            connected = %format!("{connected_address}:{connected_port}"),
            originator = %format!("{originator_address}:{originator_port}"),
            "forwarded connection"
        );
        let local = Arc::clone(&self.local);
        tokio::spawn(async move {
            let mut remote = channel.into_stream();
            let mut backend = match local.connect().await {
                Ok(backend) => backend,
                Err(err) => {
                    warn!(endpoint = %local.endpoint(), error = %err, "local service unreachable");
                    return;
                }
            };
            if let Err(err) = copy_bidirectional(&mut remote, &mut backend).await {
                debug!(error = %err, "forwarded connection ended with error");
            }
        });
        Ok(())
    }
}

fn release_command(release: &Release) -> Result<String, serde_json::Error> {
    Ok(format!("{SSH_RELEASE_COMMAND} {}", serde_json::to_string(release)?))
}

async fn announce_release(handle: &Handle<Forwarder>, release: &Release) -> Result<(), AgentError> {
    let command = match release_command(release) {
        Ok(command) => command,
        Err(err) => {
            warn!(error = %err, "release does not encode");
            return Ok(());
        }
    };
    let channel = handle.channel_open_session().await?;
    channel.exec(true, command).await?;
    Ok(())
}

async fn closed(handle: &Handle<Forwarder>) {
    let mut poll = interval(CLOSED_POLL);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    while !handle.is_closed() {
        poll.tick().await;
    }
}

/// Runs one SSH session until the server drops it or `shutdown` fires.
pub async fn run(
    config: &AgentConfig,
    local: &Arc<LocalProxy>,
    shutdown: &CancellationToken,
) -> Result<SessionEnd, AgentError> {
    let ssh_config = Config {
        inactivity_timeout: Some(config.pong_timeout),
        keepalive_interval: Some(config.ping_interval),
        keepalive_max: KEEPALIVE_MAX,
        ..Default::default()
    };
    let handler = Forwarder {
        local: Arc::clone(local),
    };
    let mut handle = client::connect(Arc::new(ssh_config), config.remote_endpoint.as_str(), handler).await?;

    let auth = handle
        .authenticate_password(SSH_USER, config.token.as_str())
        .await?;
    if !auth.success() {
        return Err(AgentError::AuthenticationFailed);
    }
    let forwarded = handle.tcpip_forward("0.0.0.0", 0).await?;
    info!(forward = ?forwarded, "ssh session established");
    if let Some(release) = &config.release {
        announce_release(&handle, release).await?;
    }

    let cause = tokio::select! {
        _ = shutdown.cancelled() => {
            let _ = handle
                .disconnect(SshDisconnect::ByApplication, "agent shutting down", "en")
                .await;
            Disconnect::Cancelled
        }
        _ = closed(&handle) => Disconnect::Closed,
    };
    Ok(SessionEnd {
        established: true,
        cause,
    })
}
