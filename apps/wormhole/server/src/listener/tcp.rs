use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Accepted, Binding, Listener, ListenerError, ListenerFactory};
use crate::store::Endpoint;

/// Binds a fresh ephemeral port per session.
pub struct TcpListenerFactory {
    bind: IpAddr,
    advertise_host: String,
    accept_deadline: Duration,
}

impl TcpListenerFactory {
    pub fn new(bind: IpAddr, advertise_host: impl Into<String>, accept_deadline: Duration) -> Self {
        Self {
            bind,
            advertise_host: advertise_host.into(),
            accept_deadline,
        }
    }
}

#[async_trait]
impl ListenerFactory for TcpListenerFactory {
    async fn listen(&self, binding: &Binding) -> Result<Box<dyn Listener>, ListenerError> {
        let listener = TcpListener::bind(SocketAddr::new(self.bind, 0)).await?;
        let port = listener.local_addr()?.port();
        debug!(session_id = %binding.session_id, port, "bound session port");
        Ok(Box::new(TcpIngress {
            listener,
            endpoint: Endpoint::tcp(format!("{}:{}", self.advertise_host, port)),
            closed: CancellationToken::new(),
            accept_deadline: self.accept_deadline,
        }))
    }
}

struct TcpIngress {
    listener: TcpListener,
    endpoint: Endpoint,
    closed: CancellationToken,
    accept_deadline: Duration,
}

#[async_trait]
impl Listener for TcpIngress {
    async fn accept(&self) -> Result<Accepted, ListenerError> {
        if self.closed.is_cancelled() {
            return Err(ListenerError::Closed);
        }
        tokio::select! {
            _ = self.closed.cancelled() => Err(ListenerError::Closed),
            accepted = timeout(self.accept_deadline, self.listener.accept()) => {
                let (stream, peer) = accepted.map_err(|_| ListenerError::Timeout)??;
                let _ = stream.set_nodelay(true);
                Ok(Accepted {
                    stream: Box::new(stream),
                    peer,
                    tls: false,
                })
            }
        }
    }

    fn endpoints(&self) -> Vec<Endpoint> {
        vec![self.endpoint.clone()]
    }

    fn close(&self) {
        self.closed.cancel();
    }
}
