//! Shared-port ingress: one TLS listener for every session, routed by the
//! leftmost label of the SNI server name.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::LazyConfigAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wormhole_core::tls;

use super::{Accepted, Binding, Listener, ListenerError, ListenerFactory};
use crate::registry::BackendLookup;
use crate::store::{Endpoint, SessionStore};

const ROUTE_BUFFER: usize = 16;
const INGRESS_ALPN: [&[u8]; 2] = [b"h2", b"http/1.1"];

/// Leftmost DNS label of an SNI server name.
pub fn session_label(server_name: &str) -> &str {
    server_name.split('.').next().unwrap_or(server_name)
}

struct Shared {
    routes: DashMap<String, mpsc::Sender<Accepted>>,
    domain: String,
    port: u16,
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    open_config: Arc<ServerConfig>,
    store: Arc<dyn SessionStore>,
    lookup: Arc<dyn BackendLookup>,
    handshake_timeout: Duration,
    accept_deadline: Duration,
}

impl Shared {
    fn endpoint_for(&self, session_id: &str) -> Endpoint {
        if self.port == 443 {
            Endpoint::tls(format!("{session_id}.{}", self.domain))
        } else {
            Endpoint::tls(format!("{session_id}.{}:{}", self.domain, self.port))
        }
    }

    /// TLS config for connections to `backend_id`'s sessions.
    async fn config_for(&self, backend_id: &str) -> Result<(Arc<ServerConfig>, bool), ListenerError> {
        if !self.store.requires_client_auth(backend_id).await? {
            return Ok((Arc::clone(&self.open_config), false));
        }
        let pem = self
            .store
            .client_cas(backend_id)
            .await?
            .ok_or(ListenerError::CertificateRejected)?;
        let mut config = tls::server_config_with_client_auth(
            self.certs.clone(),
            self.key.clone_key(),
            tls::parse_certs(&pem)?,
        )?;
        config.alpn_protocols = INGRESS_ALPN.iter().map(|proto| proto.to_vec()).collect();
        Ok((Arc::new(config), true))
    }

    async fn route(&self, tcp: TcpStream, peer: SocketAddr) -> Result<(), ListenerError> {
        let start = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), tcp).await?;
        let server_name = start
            .client_hello()
            .server_name()
            .map(str::to_owned)
            .ok_or_else(|| ListenerError::UnknownSession(String::new()))?;
        let session_id = session_label(&server_name).to_string();

        let route = self
            .routes
            .get(&session_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ListenerError::UnknownSession(server_name.clone()))?;
        let backend_id = self
            .lookup
            .backend_for(&session_id)
            .ok_or_else(|| ListenerError::UnknownSession(server_name.clone()))?;

        let (config, client_auth) = self.config_for(&backend_id).await?;
        let stream = start.into_stream(config).await?;

        if client_auth {
            let presented: Vec<String> = stream
                .get_ref()
                .1
                .peer_certificates()
                .unwrap_or_default()
                .iter()
                .map(|cert| tls::fingerprint(cert))
                .collect();
            let mut accepted = false;
            for fp in &presented {
                if self.store.valid_certificate(&backend_id, fp).await? {
                    accepted = true;
                    break;
                }
            }
            if !accepted {
                return Err(ListenerError::CertificateRejected);
            }
        }

        debug!(session_id = %session_id, peer = %peer, "routed shared-port connection");
        route
            .send(Accepted {
                stream: Box::new(stream),
                peer,
                tls: true,
            })
            .await
            .map_err(|_| ListenerError::Closed)
    }
}

/// Owns the shared TLS port and hands out per-session sub-listeners.
pub struct SniListenerFactory {
    shared: Arc<Shared>,
    listener: parking_lot::Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
}

impl SniListenerFactory {
    #[allow(clippy::too_many_arguments)]
    pub async fn bind(
        addr: SocketAddr,
        domain: impl Into<String>,
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        store: Arc<dyn SessionStore>,
        lookup: Arc<dyn BackendLookup>,
        handshake_timeout: Duration,
        accept_deadline: Duration,
    ) -> Result<Self, ListenerError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let open_config = Arc::new(tls::server_config(
            certs.clone(),
            key.clone_key(),
            &INGRESS_ALPN,
        )?);
        info!(addr = %local_addr, "shared TLS port listening");
        Ok(Self {
            shared: Arc::new(Shared {
                routes: DashMap::new(),
                domain: domain.into(),
                port: local_addr.port(),
                certs,
                key,
                open_config,
                store,
                lookup,
                handshake_timeout,
                accept_deadline,
            }),
            listener: parking_lot::Mutex::new(Some(listener)),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts the shared accept loop. Only the first call has an effect.
    pub fn serve(&self, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        let listener = self.listener.lock().take()?;
        let shared = Arc::clone(&self.shared);
        Some(tokio::spawn(async move {
            loop {
                let (tcp, peer) = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!(error = %err, "shared port accept failed");
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            continue;
                        }
                    },
                };
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    match timeout(shared.handshake_timeout, shared.route(tcp, peer)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(ListenerError::UnknownSession(name))) => {
                            info!(peer = %peer, server_name = %name, "dropping connection for unknown session");
                        }
                        Ok(Err(err)) => warn!(peer = %peer, error = %err, "shared port connection rejected"),
                        Err(_) => warn!(peer = %peer, "shared port handshake timed out"),
                    }
                });
            }
            debug!("shared TLS port stopped");
        }))
    }
}

#[async_trait]
impl ListenerFactory for SniListenerFactory {
    async fn listen(&self, binding: &Binding) -> Result<Box<dyn Listener>, ListenerError> {
        let (tx, rx) = mpsc::channel(ROUTE_BUFFER);
        self.shared.routes.insert(binding.session_id.clone(), tx);
        Ok(Box::new(SniSessionListener {
            session_id: binding.session_id.clone(),
            endpoint: self.shared.endpoint_for(&binding.session_id),
            rx: Mutex::new(rx),
            shared: Arc::clone(&self.shared),
            closed: CancellationToken::new(),
        }))
    }
}

struct SniSessionListener {
    session_id: String,
    endpoint: Endpoint,
    rx: Mutex<mpsc::Receiver<Accepted>>,
    shared: Arc<Shared>,
    closed: CancellationToken,
}

#[async_trait]
impl Listener for SniSessionListener {
    async fn accept(&self) -> Result<Accepted, ListenerError> {
        if self.closed.is_cancelled() {
            return Err(ListenerError::Closed);
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(ListenerError::Closed),
            next = timeout(self.shared.accept_deadline, rx.recv()) => match next {
                Err(_) => Err(ListenerError::Timeout),
                Ok(Some(accepted)) => Ok(accepted),
                Ok(None) => Err(ListenerError::Closed),
            },
        }
    }

    fn endpoints(&self) -> Vec<Endpoint> {
        vec![self.endpoint.clone()]
    }

    fn close(&self) {
        if !self.closed.is_cancelled() {
            self.closed.cancel();
            self.shared.routes.remove(&self.session_id);
        }
    }
}

impl Drop for SniSessionListener {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_is_leftmost_label() {
        assert_eq!(session_label("abc123.wormhole.example"), "abc123");
        assert_eq!(session_label("abc123"), "abc123");
        assert_eq!(session_label(""), "");
    }
}
