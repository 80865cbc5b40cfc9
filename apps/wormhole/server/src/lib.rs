pub mod admin;
pub mod config;
pub mod dispatcher;
pub mod listener;
pub mod proxy;
pub mod registry;
pub mod session;
pub mod store;
pub mod telemetry;
pub mod tunnel;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use wormhole_core::{tls, ServerTls};

use crate::config::{Proto, ServerConfig};
use crate::dispatcher::{Dispatcher, Transport};
use crate::listener::{FanInFactory, ListenerFactory, SniListenerFactory, TcpListenerFactory};
use crate::registry::{BackendLookup, Registry};
use crate::session::{Http2Session, SessionContext, SshServer, SshSession, TcpSession};
use crate::store::SessionStore;

/// A certificate chain and its private key.
pub struct CertifiedKey {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl CertifiedKey {
    fn load(cert: &std::path::Path, key: &std::path::Path) -> Result<Self> {
        Ok(Self {
            certs: tls::load_certs(cert)
                .with_context(|| format!("failed to load certificate {}", cert.display()))?,
            key: tls::load_private_key(key)
                .with_context(|| format!("failed to load private key {}", key.display()))?,
        })
    }
}

/// Key material the server presents, loaded up front so a bad file fails
/// startup instead of the first connection.
#[derive(Default)]
pub struct Credentials {
    pub tls: Option<CertifiedKey>,
    pub shared_tls: Option<CertifiedKey>,
    pub ssh_key: Option<russh::keys::PrivateKey>,
}

impl Credentials {
    pub fn load(config: &ServerConfig) -> Result<Self> {
        let tls = match &config.tls {
            Some(files) if !config.insecure => Some(CertifiedKey::load(&files.cert, &files.key)?),
            _ => None,
        };
        let shared_tls = config
            .shared_port
            .as_ref()
            .map(|shared| CertifiedKey::load(&shared.tls.cert, &shared.tls.key))
            .transpose()?;
        let ssh_key = match (&config.proto, &config.ssh_private_key) {
            (Proto::Ssh, Some(path)) => Some(
                SshServer::load_key(path)
                    .with_context(|| format!("failed to load ssh host key {}", path.display()))?,
            ),
            _ => None,
        };
        Ok(Self {
            tls,
            shared_tls,
            ssh_key,
        })
    }
}

/// The agent-facing side of a wormhole server: the dispatcher on its port
/// plus, in shared-port mode, the SNI listener.
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    sni: Option<Arc<SniListenerFactory>>,
    shutdown: CancellationToken,
}

impl Server {
    pub async fn bind(
        config: &ServerConfig,
        credentials: Credentials,
        store: Arc<dyn SessionStore>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let Credentials {
            tls: agent_tls,
            shared_tls,
            ssh_key,
        } = credentials;

        let (transport, ctx, sni) = match config.proto {
            Proto::Http2 => {
                let registry = Arc::new(Registry::<Http2Session>::new());
                let (ctx, sni) =
                    session_context(config, &store, shared_tls, registry.clone()).await?;
                let certified = agent_tls.context("the http2 transport requires a TLS certificate")?;
                let tls = ServerTls::new(certified.certs, certified.key)?;
                (Transport::Http2 { tls, registry }, ctx, sni)
            }
            Proto::Tcp => {
                let registry = Arc::new(Registry::<TcpSession>::new());
                let (ctx, sni) =
                    session_context(config, &store, shared_tls, registry.clone()).await?;
                let tls = match agent_tls {
                    Some(certified) => Some(ServerTls::new(certified.certs, certified.key)?),
                    None if config.insecure => None,
                    None => anyhow::bail!("the tcp transport requires a TLS certificate unless insecure"),
                };
                (Transport::Tcp { tls, registry }, ctx, sni)
            }
            Proto::Ssh => {
                let registry = Arc::new(Registry::<SshSession>::new());
                let (ctx, sni) =
                    session_context(config, &store, shared_tls, registry.clone()).await?;
                let key = ssh_key.context("the ssh transport requires a host key")?;
                let server = SshServer::new(Arc::clone(&ctx), registry, key);
                (Transport::Ssh(Arc::new(server)), ctx, sni)
            }
        };

        let listener = TcpListener::bind(config.listen_addr)
            .await
            .with_context(|| format!("failed to bind {}", config.listen_addr))?;
        let local_addr = listener.local_addr()?;
        info!(
            addr = %local_addr,
            proto = %config.proto,
            node_id = %config.node.node_id,
            "wormhole server listening"
        );

        let dispatcher = Dispatcher::new(
            ctx,
            transport,
            config.rate_limit_per_minute,
            shutdown.clone(),
        );
        Ok(Self {
            listener,
            local_addr,
            dispatcher: Arc::new(dispatcher),
            sni,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address of the shared TLS port, when shared-port forwarding is on.
    pub fn shared_port_addr(&self) -> Option<SocketAddr> {
        self.sni.as_ref().map(|sni| sni.local_addr())
    }

    /// Serves until the shutdown token fires and every session has been
    /// torn down.
    pub async fn run(self) {
        let sni_task = self
            .sni
            .as_ref()
            .and_then(|sni| sni.serve(self.shutdown.clone()));
        self.dispatcher.serve(self.listener).await;
        if let Some(task) = sni_task {
            let _ = task.await;
        }
        info!("wormhole server stopped");
    }
}

async fn session_context(
    config: &ServerConfig,
    store: &Arc<dyn SessionStore>,
    shared_tls: Option<CertifiedKey>,
    lookup: Arc<dyn BackendLookup>,
) -> Result<(Arc<SessionContext>, Option<Arc<SniListenerFactory>>)> {
    let per_session: Arc<dyn ListenerFactory> = Arc::new(TcpListenerFactory::new(
        config.ingress_bind,
        config.advertise_host.clone(),
        config.accept_deadline,
    ));

    let (listeners, sni) = match (&config.shared_port, shared_tls) {
        (Some(shared), Some(certified)) => {
            let sni = Arc::new(
                SniListenerFactory::bind(
                    shared.addr,
                    shared.domain.clone(),
                    certified.certs,
                    certified.key,
                    Arc::clone(store),
                    lookup,
                    config.session.handshake_timeout,
                    config.accept_deadline,
                )
                .await
                .with_context(|| format!("failed to bind shared port {}", shared.addr))?,
            );
            let fan_in: Arc<dyn ListenerFactory> = Arc::new(FanInFactory::new(
                vec![per_session, sni.clone() as Arc<dyn ListenerFactory>],
                config.accept_deadline,
            ));
            (fan_in, Some(sni))
        }
        (Some(_), None) => anyhow::bail!("shared port forwarding requires a TLS certificate"),
        (None, _) => (per_session, None),
    };

    let ctx = Arc::new(SessionContext {
        store: Arc::clone(store),
        listeners,
        config: config.session.clone(),
        node: config.node.clone(),
        proto: config.proto,
    });
    Ok((ctx, sni))
}
