//! Dialing the server: control connections and the tunnels it asks for.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use tokio::io::{copy_bidirectional, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use wormhole_core::{tls, BoxedStream, ClientTls, Message};

use crate::config::Proto;
use crate::local_proxy::LocalProxy;
use crate::AgentError;

/// In-flight requests get this long to finish once the agent shuts down.
const TUNNEL_DRAIN: Duration = Duration::from_secs(5);

/// Everything needed to open connections to the server.
#[derive(Clone)]
pub struct Dialer {
    proto: Proto,
    remote: String,
    token: String,
    /// `None` only for the insecure tcp transport.
    tls: Option<ClientTls>,
    local: Arc<LocalProxy>,
}

impl Dialer {
    pub fn new(
        proto: Proto,
        remote: impl Into<String>,
        token: impl Into<String>,
        tls: Option<ClientTls>,
        local: Arc<LocalProxy>,
    ) -> Result<Self, AgentError> {
        if tls.is_none() && proto == Proto::Http2 {
            return Err(AgentError::TlsRequired(proto));
        }
        Ok(Self {
            proto,
            remote: remote.into(),
            token: token.into(),
            tls,
            local,
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    async fn connect(&self) -> Result<TcpStream, AgentError> {
        let tcp = TcpStream::connect(&self.remote).await?;
        let _ = tcp.set_nodelay(true);
        Ok(tcp)
    }

    /// Opens a control connection (TLS unless insecure).
    pub async fn dial_control(&self) -> Result<BoxedStream, AgentError> {
        let tcp = self.connect().await?;
        Ok(match &self.tls {
            Some(tls) => Box::new(tls.connect_generic(tcp).await?),
            None => Box::new(tcp),
        })
    }

    /// Answers one `OpenTunnel` for `session_id`, serving the tunnel until it
    /// closes or `cancel` fires.
    pub async fn open_tunnel(&self, session_id: &str, cancel: CancellationToken) -> Result<(), AgentError> {
        match self.proto {
            Proto::Http2 => self.serve_http2(session_id, cancel).await,
            Proto::Tcp => self.splice_tcp(session_id, cancel).await,
            Proto::Ssh => Err(AgentError::Protocol("ssh sessions do not open tunnels")),
        }
    }

    /// Two-phase tunnel: authenticate under a generic TLS session, close it,
    /// then serve HTTP/2 on a fresh h2 session over the same socket.
    async fn serve_http2(&self, session_id: &str, cancel: CancellationToken) -> Result<(), AgentError> {
        let tls = self.tls.as_ref().ok_or(AgentError::TlsRequired(self.proto))?;
        let tcp = self.connect().await?;
        let mut first = tls.connect_generic(tcp).await?;
        first
            .write_all(&Message::auth_tunnel(session_id, &self.token).pack()?)
            .await?;
        let raw = tls::finish_client_phase(first).await?;
        let tunnel = tls.connect_h2(raw).await?;
        debug!(session_id, "http2 tunnel established");

        let local = Arc::clone(&self.local);
        let service = service_fn(move |req| {
            let local = Arc::clone(&local);
            async move { Ok::<_, Infallible>(local.forward(req).await) }
        });
        let conn = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
            .timer(TokioTimer::new())
            .serve_connection(TokioIo::new(tunnel), service);
        tokio::pin!(conn);
        tokio::select! {
            served = conn.as_mut() => {
                served?;
                debug!(session_id, "http2 tunnel closed");
            }
            _ = cancel.cancelled() => {
                conn.as_mut().graceful_shutdown();
                if timeout(TUNNEL_DRAIN, conn).await.is_err() {
                    debug!(session_id, "tunnel did not drain in time");
                }
            }
        }
        Ok(())
    }

    /// Raw tunnel: authenticate, then splice the same stream with a fresh
    /// connection to the local service.
    async fn splice_tcp(&self, session_id: &str, cancel: CancellationToken) -> Result<(), AgentError> {
        let mut local = self.local.connect().await?;
        let tcp = self.connect().await?;
        let mut tunnel: BoxedStream = match &self.tls {
            Some(tls) => Box::new(tls.connect_generic(tcp).await?),
            None => Box::new(tcp),
        };
        tunnel
            .write_all(&Message::auth_tunnel(session_id, &self.token).pack()?)
            .await?;
        tunnel.flush().await?;
        debug!(session_id, "tcp tunnel established");

        tokio::select! {
            spliced = copy_bidirectional(&mut tunnel, &mut local) => {
                let (sent, received) = spliced?;
                debug!(session_id, sent, received, "tcp tunnel closed");
            }
            _ = cancel.cancelled() => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio_util::codec::Framed;
    use wormhole_core::ControlCodec;

    #[tokio::test]
    async fn tcp_tunnel_authenticates_then_splices() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = backend.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            socket.write_all(b"pong").await.unwrap();
        });

        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let local = Arc::new(LocalProxy::new(backend_addr.to_string(), None));
        let dialer = Dialer::new(Proto::Tcp, server_addr.to_string(), "fly_token", None, local).unwrap();
        let cancel = CancellationToken::new();
        let tunnel = tokio::spawn({
            let cancel = cancel.clone();
            async move { dialer.open_tunnel("abc123", cancel).await }
        });

        let (socket, _) = timeout(Duration::from_secs(2), server.accept()).await.unwrap().unwrap();
        let mut framed = Framed::new(socket, ControlCodec);
        let first = framed.next().await.unwrap().unwrap();
        assert_eq!(first, Message::auth_tunnel("abc123", "fly_token"));
        let mut socket = framed.into_inner();
        socket.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        timeout(Duration::from_secs(2), socket.read_exact(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&reply, b"pong");

        cancel.cancel();
        timeout(Duration::from_secs(2), tunnel).await.unwrap().unwrap().unwrap();
    }

    #[test]
    fn http2_tunnels_need_tls() {
        let local = Arc::new(LocalProxy::new("127.0.0.1:9", None));
        let err = Dialer::new(Proto::Http2, "127.0.0.1:1", "fly_token", None, local)
            .err()
            .unwrap();
        assert!(matches!(err, AgentError::TlsRequired(Proto::Http2)));
    }
}
