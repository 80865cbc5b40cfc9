//! Raw TCP transport: every public connection gets its own tunnel, spliced
//! byte for byte.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::BytesMut;
use metrics::counter;
use parking_lot::Mutex;
use tokio::io::{copy_bidirectional, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use wormhole_core::{BoxedStream, ControlCodec, Message};

use super::control::{self, CloseReason, ControlSession, CONTROL_QUEUE};
use super::{AgentInfo, SessionContext, SessionCore, SessionError};
use crate::listener::{next_connection, Accepted};
use crate::registry::{Registered, Registry};
use crate::telemetry::{PROXY_REQUESTS_TOTAL, TUNNELS_INSERTED_TOTAL};

struct Parked {
    accepted: Accepted,
    since: Instant,
}

pub struct TcpSession {
    core: SessionCore,
    control: mpsc::Sender<Message>,
    /// Public connections waiting for a tunnel, oldest first.
    parked: Mutex<VecDeque<Parked>>,
    registry: Arc<Registry<TcpSession>>,
}

impl TcpSession {
    pub async fn establish(
        ctx: Arc<SessionContext>,
        registry: Arc<Registry<TcpSession>>,
        agent: AgentInfo,
    ) -> Result<(Arc<Self>, mpsc::Receiver<Message>), SessionError> {
        let core = SessionCore::establish(ctx, agent).await?;
        let (control, outbound) = mpsc::channel(CONTROL_QUEUE);
        let session = Arc::new(Self {
            core,
            control,
            parked: Mutex::new(VecDeque::new()),
            registry: Arc::clone(&registry),
        });
        registry.insert(&session);
        Ok((session, outbound))
    }

    pub fn core(&self) -> &SessionCore {
        &self.core
    }

    pub fn parked(&self) -> usize {
        self.parked.lock().len()
    }

    pub async fn serve(
        self: Arc<Self>,
        control: Framed<BoxedStream, ControlCodec>,
        outbound: mpsc::Receiver<Message>,
        shutdown: CancellationToken,
    ) -> CloseReason {
        self.spawn_ingress();
        control::serve_control(self, control, outbound, shutdown).await
    }

    /// Pairs a tunnel with the oldest parked public connection. `early` holds
    /// bytes the agent sent behind its `AuthTunnel` frame.
    pub fn add_tunnel(&self, tunnel: BoxedStream, early: BytesMut) -> Result<(), SessionError> {
        if self.core.is_closed() {
            return Err(SessionError::Closed);
        }
        let Some(parked) = self.parked.lock().pop_front() else {
            debug!(session_id = %self.core.id(), "tunnel arrived with no waiting connection");
            return Ok(());
        };
        counter!(TUNNELS_INSERTED_TOTAL, 1);

        let session_id = self.core.id().to_string();
        let cancelled = self.core.cancelled();
        tokio::spawn(async move {
            let peer = parked.accepted.peer;
            let mut public = parked.accepted.stream;
            let mut tunnel = tunnel;
            let splice = async {
                if !early.is_empty() {
                    public.write_all(&early).await?;
                }
                copy_bidirectional(&mut public, &mut tunnel).await
            };
            tokio::select! {
                spliced = splice => match spliced {
                    Ok((sent, received)) => {
                        counter!(PROXY_REQUESTS_TOTAL, 1, "outcome" => "ok");
                        debug!(session_id = %session_id, peer = %peer, sent, received, "connection finished");
                    }
                    Err(err) => {
                        counter!(PROXY_REQUESTS_TOTAL, 1, "outcome" => "upstream_error");
                        debug!(session_id = %session_id, peer = %peer, error = %err, "splice failed");
                    }
                },
                _ = cancelled.cancelled() => {}
            }
        });
        Ok(())
    }

    fn spawn_ingress(self: &Arc<Self>) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(accepted) = next_connection(session.core.listener()).await {
                session.park(accepted);
            }
            debug!(session_id = %session.core.id(), "ingress loop finished");
        });
    }

    fn park(&self, accepted: Accepted) {
        let max = self.core.config().max_pending_connections;
        let mut parked = self.parked.lock();
        if parked.len() >= max {
            if let Some(dropped) = parked.pop_front() {
                warn!(session_id = %self.core.id(), peer = %dropped.accepted.peer, "too many waiting connections, dropping oldest");
                counter!(PROXY_REQUESTS_TOTAL, 1, "outcome" => "no_tunnel");
            }
        }
        parked.push_back(Parked {
            accepted,
            since: Instant::now(),
        });
        if self
            .control
            .try_send(Message::open_tunnel(self.core.id()))
            .is_err()
        {
            warn!(session_id = %self.core.id(), "control queue full, tunnel request dropped");
        }
    }
}

impl Registered for TcpSession {
    fn id(&self) -> &str {
        self.core.id()
    }

    fn backend_id(&self) -> &str {
        self.core.backend_id()
    }
}

#[async_trait]
impl ControlSession for TcpSession {
    fn core(&self) -> &SessionCore {
        &self.core
    }

    fn control(&self) -> &mpsc::Sender<Message> {
        &self.control
    }

    /// Drops public connections that waited longer than `tunnel_wait`.
    fn on_tick(&self) {
        let wait = self.core.config().tunnel_wait;
        let mut parked = self.parked.lock();
        while parked
            .front()
            .is_some_and(|oldest| oldest.since.elapsed() > wait)
        {
            if let Some(expired) = parked.pop_front() {
                debug!(session_id = %self.core.id(), peer = %expired.accepted.peer, "no tunnel in time, closing connection");
                counter!(PROXY_REQUESTS_TOTAL, 1, "outcome" => "no_tunnel");
            }
        }
    }

    async fn close(&self, reason: CloseReason) {
        if self.core.teardown(&reason).await {
            self.registry.remove(self.core.id());
            self.parked.lock().clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::session::tests::{agent, context};
    use crate::store::MemoryStore;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    #[tokio::test]
    async fn public_connection_is_spliced_with_next_tunnel() {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(Registry::new());
        let (session, mut outbound) =
            TcpSession::establish(context(store, SessionConfig::default()), registry, agent())
                .await
                .unwrap();
        session.spawn_ingress();

        let endpoint = session.core().listener().endpoints()[0].addr.clone();
        let mut public = TcpStream::connect(&endpoint).await.unwrap();
        let request = timeout(Duration::from_secs(2), outbound.recv()).await.unwrap();
        assert_eq!(request, Some(Message::open_tunnel(session.core().id())));

        let (tunnel, mut agent_side) = tokio::io::duplex(1024);
        timeout(Duration::from_secs(2), async {
            while session.parked() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        session
            .add_tunnel(Box::new(tunnel), BytesMut::from(&b"hello "[..]))
            .unwrap();

        agent_side.write_all(b"world").await.unwrap();
        let mut buf = [0u8; 11];
        timeout(Duration::from_secs(2), public.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"hello world");

        public.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        timeout(Duration::from_secs(2), agent_side.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"ping");

        session.close(CloseReason::ControlClosed).await;
    }

    #[tokio::test]
    async fn stale_connections_are_dropped_on_tick() {
        let store = Arc::new(MemoryStore::new());
        let config = SessionConfig {
            tunnel_wait: Duration::from_millis(10),
            ..SessionConfig::default()
        };
        let registry = Arc::new(Registry::new());
        let (session, _outbound) = TcpSession::establish(context(store, config), registry, agent())
            .await
            .unwrap();
        session.spawn_ingress();
        let endpoint = session.core().listener().endpoints()[0].addr.clone();
        let _public = TcpStream::connect(&endpoint).await.unwrap();
        timeout(Duration::from_secs(2), async {
            while session.parked() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        session.on_tick();
        assert_eq!(session.parked(), 0);
        session.close(CloseReason::ControlClosed).await;
    }
}
