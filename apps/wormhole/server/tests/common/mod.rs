#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use bytes::Bytes;
use http::{header, Request, StatusCode};
use http_body_util::{BodyExt, Empty};
use hyper_util::rt::TokioIo;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::RootCertStore;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use wormhole_core::ClientTls;
use wormhole_server::config::ServerConfig;
use wormhole_server::session::SshServer;
use wormhole_server::store::MemoryStore;
use wormhole_server::{CertifiedKey, Credentials, Server};

pub const TOKEN: &str = "fly_token";
pub const BACKEND_ID: &str = "1";

pub fn self_signed(names: &[&str]) -> CertifiedKey {
    let names = names.iter().map(|name| name.to_string()).collect::<Vec<_>>();
    let certified = rcgen::generate_simple_self_signed(names).unwrap();
    CertifiedKey {
        certs: vec![certified.cert.der().clone()],
        key: PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()).into(),
    }
}

/// A client CA and one client certificate it issued.
pub struct ClientIdentity {
    pub ca_pem: String,
    pub cert: CertificateDer<'static>,
    pub key: PrivateKeyDer<'static>,
}

pub fn client_identity() -> ClientIdentity {
    let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "wormhole test client ca");
    let ca_key = KeyPair::generate().unwrap();
    let ca = ca_params.self_signed(&ca_key).unwrap();

    let mut params = CertificateParams::new(vec!["client.wormhole.example".to_string()]).unwrap();
    params
        .distinguished_name
        .push(DnType::CommonName, "wormhole test client");
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
    let key = KeyPair::generate().unwrap();
    let cert = params.signed_by(&key, &ca, &ca_key).unwrap();
    ClientIdentity {
        ca_pem: ca.pem(),
        cert: cert.der().clone(),
        key: PrivatePkcs8KeyDer::from(key.serialize_der()).into(),
    }
}

pub fn roots(certs: &[CertificateDer<'static>]) -> RootCertStore {
    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots.add(cert.clone()).unwrap();
    }
    roots
}

pub fn client_tls(certified: &CertifiedKey) -> ClientTls {
    ClientTls::new(roots(&certified.certs), "localhost").unwrap()
}

pub fn ssh_host_key() -> russh::keys::PrivateKey {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/ssh_host_ed25519_key");
    SshServer::load_key(&path).unwrap()
}

pub struct Running {
    pub addr: SocketAddr,
    pub shared_addr: Option<SocketAddr>,
    pub store: Arc<MemoryStore>,
    pub shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl Running {
    pub async fn stop(self) {
        self.shutdown.cancel();
        timeout(Duration::from_secs(10), self.task)
            .await
            .expect("server stops")
            .unwrap();
    }
}

pub async fn start(config: ServerConfig, credentials: Credentials) -> Running {
    let store = Arc::new(MemoryStore::new());
    store.add_token(TOKEN, BACKEND_ID);
    let shutdown = CancellationToken::new();
    let server = Server::bind(&config, credentials, store.clone(), shutdown.clone())
        .await
        .unwrap();
    let addr = server.local_addr();
    let shared_addr = server.shared_port_addr();
    let task = tokio::spawn(server.run());
    Running {
        addr,
        shared_addr,
        store,
        shutdown,
        task,
    }
}

/// A local backend answering every request with `test`.
pub async fn backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = Router::new().route("/", axum::routing::get(|| async { "test" }));
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    addr
}

/// Polls the store until `backend:1:<what>` has a member matching `pick`.
pub async fn wait_for_member(store: &MemoryStore, key: &str, pick: impl Fn(&str) -> bool) -> String {
    timeout(Duration::from_secs(5), async {
        loop {
            if let Some(member) = store.members(key).into_iter().find(|m| pick(m)) {
                return member;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("{key} never filled"))
}

pub async fn session_id(store: &MemoryStore) -> String {
    wait_for_member(store, "backend:1:sessions", |_| true).await
}

pub async fn ingress_addr(store: &MemoryStore) -> String {
    wait_for_member(store, "backend:1:endpoints", |entry| !entry.starts_with("tls:")).await
}

/// One HTTP/1.1 GET over `io`.
pub async fn try_get_over<IO>(io: IO, host: &str) -> Result<(StatusCode, String), hyper::Error>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io)).await?;
    tokio::spawn(conn);
    let req = Request::builder()
        .uri("/")
        .header(header::HOST, host)
        .body(Empty::<Bytes>::new())
        .unwrap();
    let response = timeout(Duration::from_secs(10), sender.send_request(req))
        .await
        .expect("response in time")?;
    let status = response.status();
    let body = response.into_body().collect().await?.to_bytes();
    Ok((status, String::from_utf8_lossy(&body).into_owned()))
}

pub async fn get_over<IO>(io: IO, host: &str) -> (StatusCode, String)
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    try_get_over(io, host).await.unwrap()
}

pub async fn get(addr: &str) -> (StatusCode, String) {
    let tcp = tokio::net::TcpStream::connect(addr).await.unwrap();
    get_over(tcp, addr).await
}
