//! Ingress listener factories.
//!
//! Every session asks its [`ListenerFactory`] for a [`Listener`] once it is
//! registered. Public connections accepted there are proxied down the
//! session's tunnels. `accept` is bounded by a deadline so accept loops can
//! notice a closed listener promptly.

mod fanin;
mod sni;
mod tcp;

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;
use wormhole_core::{BoxedStream, TlsError};

use crate::store::{Endpoint, StoreError};

pub use self::fanin::FanInFactory;
pub use self::sni::SniListenerFactory;
pub use self::tcp::TcpListenerFactory;

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("listener closed")]
    Closed,
    #[error("accept deadline elapsed")]
    Timeout,
    #[error("no live session for {0:?}")]
    UnknownSession(String),
    #[error("client certificate rejected")]
    CertificateRejected,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A public connection delivered to a session.
pub struct Accepted {
    pub stream: BoxedStream,
    pub peer: SocketAddr,
    /// TLS was terminated by the listener.
    pub tls: bool,
}

/// The session a listener is bound for.
#[derive(Debug, Clone)]
pub struct Binding {
    pub session_id: String,
    pub backend_id: String,
}

#[async_trait]
pub trait Listener: Send + Sync {
    /// Waits at most one accept deadline for the next connection.
    async fn accept(&self) -> Result<Accepted, ListenerError>;

    /// Public addresses this listener is reachable at.
    fn endpoints(&self) -> Vec<Endpoint>;

    /// Stops accepting. Idempotent.
    fn close(&self);

    /// Whether closing a fan-in parent should also close this listener.
    fn should_cleanup(&self) -> bool {
        true
    }
}

#[async_trait]
pub trait ListenerFactory: Send + Sync {
    async fn listen(&self, binding: &Binding) -> Result<Box<dyn Listener>, ListenerError>;
}

/// Accepts until a connection arrives or the listener is closed.
pub async fn next_connection(listener: &dyn Listener) -> Option<Accepted> {
    loop {
        match listener.accept().await {
            Ok(accepted) => return Some(accepted),
            Err(ListenerError::Timeout) => continue,
            Err(ListenerError::Closed) => return None,
            Err(err) => {
                warn!(error = %err, "ingress accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}
