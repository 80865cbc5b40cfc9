//! HTTP/2 transport: public requests are reverse proxied over a pool of
//! HTTP/2 tunnels dialed by the agent on request.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tunnel_pool::{Pool, PoolConfig, PoolError, Poolable};
use wormhole_core::{BoxedStream, ControlCodec, Message, Stream};

use super::control::{self, CloseReason, ControlSession, CONTROL_QUEUE};
use super::{AgentInfo, SessionContext, SessionCore, SessionError};
use crate::listener::{next_connection, Accepted};
use crate::proxy::{self, Forwarding};
use crate::registry::{Registered, Registry};
use crate::telemetry::TUNNELS_INSERTED_TOTAL;
use crate::tunnel::Tunnel;

const INGRESS_DRAIN: Duration = Duration::from_secs(5);

pub struct Http2Session {
    core: SessionCore,
    pool: Pool<Tunnel>,
    control: mpsc::Sender<Message>,
    /// When each unanswered `OpenTunnel` was sent.
    requested: Mutex<VecDeque<Instant>>,
    next_tunnel_id: AtomicU64,
    default_authority: String,
    registry: Arc<Registry<Http2Session>>,
}

impl Http2Session {
    /// Registers a new session and makes it visible in `registry`.
    pub async fn establish(
        ctx: Arc<SessionContext>,
        registry: Arc<Registry<Http2Session>>,
        agent: AgentInfo,
    ) -> Result<(Arc<Self>, mpsc::Receiver<Message>), SessionError> {
        let max_tunnels = ctx.config.max_tunnels;
        let core = SessionCore::establish(ctx, agent).await?;
        let default_authority = core
            .listener()
            .endpoints()
            .first()
            .map(|endpoint| endpoint.addr.clone())
            .unwrap_or_default();
        let (control, outbound) = mpsc::channel(CONTROL_QUEUE);
        let session = Arc::new(Self {
            core,
            pool: Pool::new(PoolConfig::new(max_tunnels)),
            control,
            requested: Mutex::new(VecDeque::new()),
            next_tunnel_id: AtomicU64::new(1),
            default_authority,
            registry: Arc::clone(&registry),
        });
        registry.insert(&session);
        Ok((session, outbound))
    }

    pub fn core(&self) -> &SessionCore {
        &self.core
    }

    pub fn tunnels(&self) -> usize {
        self.pool.len()
    }

    /// Serves ingress and the control connection until the session ends.
    pub async fn serve(
        self: Arc<Self>,
        control: Framed<BoxedStream, ControlCodec>,
        outbound: mpsc::Receiver<Message>,
        shutdown: CancellationToken,
    ) -> CloseReason {
        self.spawn_ingress();
        control::serve_control(self, control, outbound, shutdown).await
    }

    /// Wraps a re-keyed tunnel connection in an HTTP/2 client and pools it.
    pub async fn add_tunnel<IO: Stream>(&self, io: IO) -> Result<(), SessionError> {
        if self.core.is_closed() {
            return Err(SessionError::Closed);
        }
        self.requested.lock().pop_front();
        let tunnel_id = self.next_tunnel_id.fetch_add(1, Ordering::SeqCst);
        let tunnel = Tunnel::handshake(
            tunnel_id,
            io,
            self.core.config().stream_soft_cap,
            self.pool.waker(),
        )
        .await?;

        match self.pool.insert(Arc::clone(&tunnel)) {
            Ok(true) => {
                counter!(TUNNELS_INSERTED_TOTAL, 1);
                info!(
                    session_id = %self.core.id(),
                    tunnel_id,
                    tunnels = self.pool.len(),
                    "tunnel added"
                );
                Ok(())
            }
            Ok(false) => {
                warn!(session_id = %self.core.id(), tunnel_id, "tunnel pool full, closing tunnel");
                tunnel.close();
                Ok(())
            }
            Err(PoolError::Closed) => {
                tunnel.close();
                Err(SessionError::Closed)
            }
        }
    }

    fn spawn_ingress(self: &Arc<Self>) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(accepted) = next_connection(session.core.listener()).await {
                let session = Arc::clone(&session);
                tokio::spawn(session.serve_ingress(accepted));
            }
            debug!(session_id = %session.core.id(), "ingress loop finished");
        });
    }

    async fn serve_ingress(self: Arc<Self>, accepted: Accepted) {
        let config = self.core.config();
        let forwarding = Forwarding {
            scheme: config.forward_scheme,
            default_authority: self.default_authority.clone(),
            peer: accepted.peer,
            tls: accepted.tls,
            tunnel_wait: config.tunnel_wait,
        };
        let session = Arc::clone(&self);
        let service = service_fn(move |req| {
            let session = Arc::clone(&session);
            let forwarding = forwarding.clone();
            async move { Ok::<_, Infallible>(proxy::forward(&session.pool, req, &forwarding).await) }
        });

        let builder = auto::Builder::new(TokioExecutor::new());
        let conn = builder.serve_connection(TokioIo::new(accepted.stream), service);
        tokio::pin!(conn);
        let cancelled = self.core.cancelled();
        tokio::select! {
            served = conn.as_mut() => {
                if let Err(err) = served {
                    debug!(session_id = %self.core.id(), peer = %accepted.peer, error = %err, "ingress connection ended");
                }
            }
            _ = cancelled.cancelled() => {
                conn.as_mut().graceful_shutdown();
                if timeout(INGRESS_DRAIN, conn).await.is_err() {
                    debug!(session_id = %self.core.id(), "ingress connection did not drain");
                }
            }
        }
    }
}

impl Registered for Http2Session {
    fn id(&self) -> &str {
        self.core.id()
    }

    fn backend_id(&self) -> &str {
        self.core.backend_id()
    }
}

#[async_trait]
impl ControlSession for Http2Session {
    fn core(&self) -> &SessionCore {
        &self.core
    }

    fn control(&self) -> &mpsc::Sender<Message> {
        &self.control
    }

    /// Asks the agent for the tunnels the pool is missing, counting requests
    /// still in flight.
    fn on_tick(&self) {
        let config = self.core.config();
        let now = Instant::now();
        let mut requested = self.requested.lock();
        while requested
            .front()
            .is_some_and(|sent| now.duration_since(*sent) > config.handshake_timeout)
        {
            requested.pop_front();
        }
        let have = self.pool.len() + requested.len();
        for _ in have..config.tunnels_per_session {
            if self
                .control
                .try_send(Message::open_tunnel(self.core.id()))
                .is_err()
            {
                break;
            }
            requested.push_back(now);
        }
    }

    async fn close(&self, reason: CloseReason) {
        if self.core.teardown(&reason).await {
            self.registry.remove(self.core.id());
            self.pool.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::session::tests::{agent, context};
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn tick_requests_missing_tunnels_once() {
        let store = Arc::new(MemoryStore::new());
        let config = SessionConfig {
            tunnels_per_session: 3,
            ..SessionConfig::default()
        };
        let registry = Arc::new(Registry::new());
        let (session, mut outbound) = Http2Session::establish(context(store, config), registry.clone(), agent())
            .await
            .unwrap();
        assert!(registry.contains(session.core().id()));

        session.on_tick();
        session.on_tick();
        let mut requests = 0;
        while let Ok(message) = outbound.try_recv() {
            assert_eq!(message, Message::open_tunnel(session.core().id()));
            requests += 1;
        }
        assert_eq!(requests, 3);

        session.close(CloseReason::ControlClosed).await;
        assert!(!registry.contains(session.core().id()));
        assert!(session.pool.is_closed());
    }

    #[tokio::test]
    async fn closed_session_refuses_tunnels() {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(Registry::new());
        let (session, _outbound) =
            Http2Session::establish(context(store, SessionConfig::default()), registry, agent())
                .await
                .unwrap();
        session.close(CloseReason::Cancelled).await;
        let (io, _peer) = tokio::io::duplex(64);
        assert!(matches!(session.add_tunnel(io).await, Err(SessionError::Closed)));
    }
}
