//! Legacy SSH transport. The agent authenticates with its token as the
//! password and asks for a `tcpip-forward`; every public connection becomes a
//! `forwarded-tcpip` channel.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use russh::keys::PrivateKey;
use russh::server::{Auth, Config, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, Disconnect};
use tokio::io::{copy_bidirectional, AsyncRead, AsyncWrite};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wormhole_core::{Release, DEFAULT_PING_INTERVAL, SSH_RELEASE_COMMAND};

use super::{AgentInfo, CloseReason, SessionContext, SessionCore, SessionError};
use crate::listener::{next_connection, Accepted};
use crate::registry::{Registered, Registry};
use crate::store::StoreError;
use crate::telemetry::{AUTH_FAILURES_TOTAL, PROXY_REQUESTS_TOTAL, TUNNELS_INSERTED_TOTAL};

const KEEPALIVE_MAX: usize = 3;
/// Recorded as the client version of ssh sessions.
const SSH_CLIENT_VERSION: &str = "ssh";

type SessionSlot = Arc<Mutex<Option<Arc<SshSession>>>>;

/// Accepts SSH agent connections for one server.
pub struct SshServer {
    ctx: Arc<SessionContext>,
    registry: Arc<Registry<SshSession>>,
    config: Arc<Config>,
}

impl SshServer {
    pub fn new(ctx: Arc<SessionContext>, registry: Arc<Registry<SshSession>>, key: PrivateKey) -> Self {
        let config = Config {
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::ZERO),
            inactivity_timeout: Some(ctx.config.ping_timeout),
            keepalive_interval: Some(DEFAULT_PING_INTERVAL),
            keepalive_max: KEEPALIVE_MAX,
            keys: vec![key],
            ..Default::default()
        };
        Self {
            ctx,
            registry,
            config: Arc::new(config),
        }
    }

    pub fn load_key(path: &Path) -> Result<PrivateKey, russh::keys::Error> {
        russh::keys::load_secret_key(path, None)
    }

    /// Runs one agent connection until it ends, then tears its session down.
    pub async fn serve<IO>(&self, stream: IO, peer: SocketAddr, shutdown: CancellationToken) -> CloseReason
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let slot = SessionSlot::default();
        let handler = SshConnection {
            ctx: Arc::clone(&self.ctx),
            registry: Arc::clone(&self.registry),
            peer,
            backend_id: None,
            slot: Arc::clone(&slot),
            pending_release: None,
        };
        let mut running = match russh::server::run_stream(Arc::clone(&self.config), stream, handler).await {
            Ok(running) => running,
            Err(err) => {
                debug!(peer = %peer, error = %err, "ssh handshake failed");
                return CloseReason::ProtocolError("ssh handshake failed");
            }
        };

        let reason = tokio::select! {
            ended = &mut running => {
                if let Err(err) = ended {
                    debug!(peer = %peer, error = %err, "ssh connection ended with error");
                }
                CloseReason::ControlClosed
            }
            _ = shutdown.cancelled() => {
                let _ = running
                    .handle()
                    .disconnect(Disconnect::ByApplication, "server shutting down".into(), "en".into())
                    .await;
                CloseReason::ServerShutdown
            }
        };

        let session = slot.lock().take();
        if let Some(session) = session {
            session.close(reason.clone()).await;
        }
        reason
    }
}

/// Parses the exec command that carries a release.
fn parse_release_command(command: &str) -> Option<Release> {
    let json = command
        .strip_prefix(SSH_RELEASE_COMMAND)?
        .strip_prefix(' ')?;
    serde_json::from_str(json).ok()
}

struct SshConnection {
    ctx: Arc<SessionContext>,
    registry: Arc<Registry<SshSession>>,
    peer: SocketAddr,
    backend_id: Option<String>,
    slot: SessionSlot,
    /// A release received before the forward was set up.
    pending_release: Option<Release>,
}

impl Handler for SshConnection {
    type Error = SessionError;

    async fn auth_password(&mut self, _user: &str, password: &str) -> Result<Auth, Self::Error> {
        match self.ctx.store.backend_id_from_token(password).await {
            Ok(backend_id) => {
                debug!(peer = %self.peer, backend_id = %backend_id, "ssh agent authenticated");
                self.backend_id = Some(backend_id);
                Ok(Auth::Accept)
            }
            Err(StoreError::UnknownToken) => {
                counter!(AUTH_FAILURES_TOTAL, 1, "proto" => "ssh");
                info!(peer = %self.peer, "ssh agent presented an unknown token");
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                    partial_success: false,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.backend_id.is_some())
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(backend_id) = self.backend_id.clone() else {
            return Ok(false);
        };
        if self.slot.lock().is_some() {
            warn!(peer = %self.peer, "second tcpip-forward on one connection refused");
            return Ok(false);
        }

        let agent = AgentInfo {
            backend_id,
            addr: self.peer,
            version: SSH_CLIENT_VERSION.to_string(),
        };
        let core = SessionCore::establish(Arc::clone(&self.ctx), agent).await?;
        if *port == 0 {
            if let Some(bound) = core.listener().endpoints().iter().find_map(|endpoint| {
                endpoint
                    .addr
                    .rsplit_once(':')
                    .and_then(|(_, port)| port.parse::<u32>().ok())
            }) {
                *port = bound;
            }
        }

        let ssh_session = Arc::new(SshSession {
            core,
            handle: session.handle(),
            forward_address: address.to_string(),
            forward_port: *port,
            registry: Arc::clone(&self.registry),
        });
        self.registry.insert(&ssh_session);
        if let Some(release) = self.pending_release.take() {
            if let Err(err) = ssh_session.core.register_release(release).await {
                warn!(session_id = %ssh_session.core.id(), error = %err, "failed to record release");
            }
        }
        ssh_session.spawn_ingress();
        ssh_session.spawn_refresh();
        *self.slot.lock() = Some(ssh_session);
        Ok(true)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data);
        match parse_release_command(&command) {
            Some(release) => {
                let current = self.slot.lock().clone();
                match current {
                    Some(ssh_session) => {
                        if let Err(err) = ssh_session.core.register_release(release).await {
                            warn!(session_id = %ssh_session.core.id(), error = %err, "failed to record release");
                        }
                    }
                    None => self.pending_release = Some(release),
                }
                let _ = session.channel_success(channel);
                let _ = session.exit_status_request(channel, 0);
            }
            None => {
                debug!(peer = %self.peer, "unsupported exec request");
                let _ = session.channel_failure(channel);
                let _ = session.exit_status_request(channel, 1);
            }
        }
        let _ = session.eof(channel);
        let _ = session.close(channel);
        Ok(())
    }
}

pub struct SshSession {
    core: SessionCore,
    handle: Handle,
    forward_address: String,
    forward_port: u32,
    registry: Arc<Registry<SshSession>>,
}

impl SshSession {
    pub fn core(&self) -> &SessionCore {
        &self.core
    }

    pub async fn close(&self, reason: CloseReason) {
        if self.core.teardown(&reason).await {
            self.registry.remove(self.core.id());
        }
    }

    fn spawn_ingress(self: &Arc<Self>) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(accepted) = next_connection(session.core.listener()).await {
                tokio::spawn(Arc::clone(&session).forward(accepted));
            }
            debug!(session_id = %session.core.id(), "ingress loop finished");
        });
    }

    /// Keeps the published endpoints fresh while the connection is alive.
    fn spawn_refresh(self: &Arc<Self>) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let cancelled = session.core.cancelled();
            let mut tick = interval(DEFAULT_PING_INTERVAL);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = tick.tick() => session.core.touch_endpoints().await,
                }
            }
        });
    }

    async fn forward(self: Arc<Self>, accepted: Accepted) {
        let channel = match self
            .handle
            .channel_open_forwarded_tcpip(
                self.forward_address.clone(),
                self.forward_port,
                accepted.peer.ip().to_string(),
                u32::from(accepted.peer.port()),
            )
            .await
        {
            Ok(channel) => channel,
            Err(err) => {
                counter!(PROXY_REQUESTS_TOTAL, 1, "outcome" => "no_tunnel");
                debug!(session_id = %self.core.id(), error = %err, "agent refused forwarded channel");
                return;
            }
        };
        counter!(TUNNELS_INSERTED_TOTAL, 1);

        let mut tunnel = channel.into_stream();
        let mut public = accepted.stream;
        let cancelled = self.core.cancelled();
        tokio::select! {
            spliced = copy_bidirectional(&mut public, &mut tunnel) => match spliced {
                Ok((sent, received)) => {
                    counter!(PROXY_REQUESTS_TOTAL, 1, "outcome" => "ok");
                    debug!(session_id = %self.core.id(), peer = %accepted.peer, sent, received, "connection finished");
                }
                Err(err) => {
                    counter!(PROXY_REQUESTS_TOTAL, 1, "outcome" => "upstream_error");
                    debug!(session_id = %self.core.id(), error = %err, "splice failed");
                }
            },
            _ = cancelled.cancelled() => {}
        }
    }
}

impl Registered for SshSession {
    fn id(&self) -> &str {
        self.core.id()
    }

    fn backend_id(&self) -> &str {
        self.core.backend_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_command_carries_json() {
        let release = parse_release_command(
            r#"wormhole-release {"id":"v7","branch":"main","vcs_type":"git"}"#,
        )
        .unwrap();
        assert_eq!(release.id, "v7");
        assert_eq!(release.branch, "main");
        assert!(release.author_email.is_empty());
    }

    #[test]
    fn other_commands_are_not_releases() {
        assert!(parse_release_command("uptime").is_none());
        assert!(parse_release_command("wormhole-release").is_none());
        assert!(parse_release_command("wormhole-release not-json").is_none());
        assert!(parse_release_command("wormhole-releasex {}").is_none());
    }
}
