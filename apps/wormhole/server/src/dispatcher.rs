//! Accept loop for agent connections: rate limiting, the first TLS phase,
//! and routing on the first control frame.

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use metrics::counter;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::codec::{Framed, FramedParts};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use wormhole_core::{tls, AuthTunnel, BoxedStream, CodecError, ControlCodec, Message, ServerTls, Stream, TlsError};

use crate::registry::{Registered, Registry};
use crate::session::{AgentInfo, Http2Session, SessionContext, SessionError, SshServer, TcpSession};
use crate::store::StoreError;
use crate::telemetry::{AUTH_FAILURES_TOTAL, RATE_LIMITED_TOTAL};

/// Limiter entries kept before idle ones are pruned.
const LIMITER_RETAIN_THRESHOLD: usize = 10_000;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("handshake deadline elapsed")]
    Timeout,
    #[error("connection closed before the first frame")]
    Closed,
    #[error("unexpected first frame {0}")]
    Unexpected(&'static str),
    #[error("tunnel for unknown session {0}")]
    UnknownSession(String),
    #[error("tunnel token does not belong to the session's backend")]
    TokenMismatch,
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// The wire form agents speak on this server's port.
pub enum Transport {
    Http2 {
        tls: ServerTls,
        registry: Arc<Registry<Http2Session>>,
    },
    Tcp {
        /// `None` when running insecure.
        tls: Option<ServerTls>,
        registry: Arc<Registry<TcpSession>>,
    },
    Ssh(Arc<SshServer>),
}

pub struct Dispatcher {
    ctx: Arc<SessionContext>,
    transport: Transport,
    limiter: Option<DefaultKeyedRateLimiter<IpAddr>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Dispatcher {
    pub fn new(
        ctx: Arc<SessionContext>,
        transport: Transport,
        rate_limit_per_minute: Option<NonZeroU32>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            transport,
            limiter: rate_limit_per_minute.map(|per_minute| RateLimiter::keyed(Quota::per_minute(per_minute))),
            shutdown,
            tracker: TaskTracker::new(),
        }
    }

    /// Accepts until shutdown, then waits for every connection task (and so
    /// every session teardown) to finish.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (tcp, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(error = %err, "agent accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                },
            };
            if !self.admit(peer.ip()) {
                counter!(RATE_LIMITED_TOTAL, 1);
                debug!(peer = %peer, "rate limited");
                continue;
            }
            let _ = tcp.set_nodelay(true);
            let dispatcher = Arc::clone(&self);
            self.tracker.spawn(async move {
                match dispatcher.dispatch(tcp, peer).await {
                    Ok(()) => {}
                    Err(
                        err @ (DispatchError::Timeout
                        | DispatchError::Closed
                        | DispatchError::Tls(_)
                        | DispatchError::Io(_)),
                    ) => debug!(peer = %peer, error = %err, "agent connection dropped"),
                    Err(err @ DispatchError::AuthenticationFailed) => {
                        info!(peer = %peer, error = %err, "agent connection rejected")
                    }
                    Err(err) => warn!(peer = %peer, error = %err, "agent connection failed"),
                }
            });
        }
        drop(listener);
        self.tracker.close();
        self.tracker.wait().await;
        info!("dispatcher stopped");
    }

    fn admit(&self, ip: IpAddr) -> bool {
        let Some(limiter) = &self.limiter else {
            return true;
        };
        if limiter.len() > LIMITER_RETAIN_THRESHOLD {
            limiter.retain_recent();
        }
        limiter.check_key(&ip).is_ok()
    }

    async fn dispatch(&self, tcp: TcpStream, peer: SocketAddr) -> Result<(), DispatchError> {
        match &self.transport {
            Transport::Ssh(server) => {
                let reason = server.serve(tcp, peer, self.shutdown.clone()).await;
                debug!(peer = %peer, reason = %reason, "ssh connection finished");
                Ok(())
            }
            Transport::Http2 { tls: server_tls, registry } => {
                let (framed, first) = self
                    .within_deadline(async move { read_first(server_tls.accept_generic(tcp).await?).await })
                    .await?;
                match first {
                    Message::AuthControl(auth) => {
                        let mut control = boxed(framed);
                        let agent = self.authenticate(&mut control, &auth.token, peer).await?;
                        let (session, outbound) =
                            match Http2Session::establish(Arc::clone(&self.ctx), Arc::clone(registry), agent).await {
                                Ok(established) => established,
                                Err(err) => return Err(reject(&mut control, err).await),
                            };
                        let reason = session.serve(control, outbound, self.shutdown.clone()).await;
                        debug!(peer = %peer, reason = %reason, "control connection finished");
                        Ok(())
                    }
                    Message::AuthTunnel(auth) => {
                        let session = self.tunnel_owner(registry, &auth).await?;
                        let parts = framed.into_parts();
                        if !parts.read_buf.is_empty() {
                            warn!(peer = %peer, bytes = parts.read_buf.len(), "discarding data sent after AuthTunnel");
                        }
                        let tunnel = self
                            .within_deadline(async move {
                                let raw = tls::finish_server_phase(parts.io).await?;
                                Ok::<_, DispatchError>(server_tls.accept_h2(raw).await?)
                            })
                            .await?;
                        session.add_tunnel(tunnel).await?;
                        Ok(())
                    }
                    other => Err(DispatchError::Unexpected(other.name())),
                }
            }
            Transport::Tcp { tls: server_tls, registry } => {
                let (framed, first) = self
                    .within_deadline(async move {
                        let io: BoxedStream = match server_tls {
                            Some(tls) => Box::new(tls.accept_generic(tcp).await?),
                            None => Box::new(tcp),
                        };
                        read_first(io).await
                    })
                    .await?;
                match first {
                    Message::AuthControl(auth) => {
                        let mut control = framed;
                        let agent = self.authenticate(&mut control, &auth.token, peer).await?;
                        let (session, outbound) =
                            match TcpSession::establish(Arc::clone(&self.ctx), Arc::clone(registry), agent).await {
                                Ok(established) => established,
                                Err(err) => return Err(reject(&mut control, err).await),
                            };
                        let reason = session.serve(control, outbound, self.shutdown.clone()).await;
                        debug!(peer = %peer, reason = %reason, "control connection finished");
                        Ok(())
                    }
                    Message::AuthTunnel(auth) => {
                        let session = self.tunnel_owner(registry, &auth).await?;
                        let parts = framed.into_parts();
                        session.add_tunnel(parts.io, parts.read_buf)?;
                        Ok(())
                    }
                    other => Err(DispatchError::Unexpected(other.name())),
                }
            }
        }
    }

    async fn within_deadline<T>(
        &self,
        fut: impl Future<Output = Result<T, DispatchError>>,
    ) -> Result<T, DispatchError> {
        timeout(self.ctx.config.handshake_timeout, fut)
            .await
            .map_err(|_| DispatchError::Timeout)?
    }

    /// Resolves the control token. On failure the agent is told why and the
    /// connection is closed without anything being persisted.
    async fn authenticate(
        &self,
        control: &mut Framed<BoxedStream, ControlCodec>,
        token: &str,
        peer: SocketAddr,
    ) -> Result<AgentInfo, DispatchError> {
        match self.ctx.store.backend_id_from_token(token).await {
            Ok(backend_id) => Ok(AgentInfo {
                backend_id,
                addr: peer,
                version: String::new(),
            }),
            Err(StoreError::UnknownToken) => {
                counter!(AUTH_FAILURES_TOTAL, 1, "proto" => self.ctx.proto.to_string());
                let _ = control.send(Message::shutdown("authentication failed")).await;
                let _ = control.close().await;
                Err(DispatchError::AuthenticationFailed)
            }
            Err(err) => {
                let _ = control.send(Message::shutdown("session store unavailable")).await;
                let _ = control.close().await;
                Err(err.into())
            }
        }
    }

    /// The live session an `AuthTunnel` refers to, provided its token
    /// belongs to the same backend.
    async fn tunnel_owner<S: Registered>(
        &self,
        registry: &Registry<S>,
        auth: &AuthTunnel,
    ) -> Result<Arc<S>, DispatchError> {
        let session = registry
            .get(&auth.client_id)
            .ok_or_else(|| DispatchError::UnknownSession(auth.client_id.clone()))?;
        let backend_id = match self.ctx.store.backend_id_from_token(&auth.token).await {
            Ok(backend_id) => backend_id,
            Err(StoreError::UnknownToken) => return Err(DispatchError::TokenMismatch),
            Err(err) => return Err(err.into()),
        };
        if backend_id != session.backend_id() {
            return Err(DispatchError::TokenMismatch);
        }
        Ok(session)
    }
}

async fn read_first<S: Stream>(io: S) -> Result<(Framed<S, ControlCodec>, Message), DispatchError> {
    let mut framed = Framed::new(io, ControlCodec);
    match framed.next().await {
        Some(Ok(message)) => Ok((framed, message)),
        Some(Err(err)) => Err(err.into()),
        None => Err(DispatchError::Closed),
    }
}

/// Erases the stream type, keeping bytes already buffered by the codec.
fn boxed<S: Stream>(framed: Framed<S, ControlCodec>) -> Framed<BoxedStream, ControlCodec> {
    let parts = framed.into_parts();
    let mut erased = FramedParts::new::<Message>(Box::new(parts.io) as BoxedStream, parts.codec);
    erased.read_buf = parts.read_buf;
    erased.write_buf = parts.write_buf;
    Framed::from_parts(erased)
}

async fn reject(control: &mut Framed<BoxedStream, ControlCodec>, err: SessionError) -> DispatchError {
    let _ = control.send(Message::shutdown("failed to register session")).await;
    let _ = control.close().await;
    err.into()
}
