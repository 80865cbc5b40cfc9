//! TLS layering for control and tunnel connections.
//!
//! A tunnel connection carries two TLS sessions in sequence over the same
//! TCP socket: a generic one for the `AuthTunnel` exchange and a second one
//! that must negotiate ALPN `h2`. The first session is bracketed with
//! close_notify in both directions before the socket is handed back, see
//! [`finish_server_phase`] and [`finish_client_phase`].

use std::fs;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};
use tracing::{debug, warn};

pub const ALPN_H2: &[u8] = b"h2";

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no certificates found in {0}")]
    NoCertificates(String),
    #[error("no private key found in {0}")]
    NoPrivateKey(String),
    #[error("invalid server name {0:?}")]
    InvalidServerName(String),
    #[error("peer did not negotiate ALPN h2")]
    AlpnMismatch,
    #[error(transparent)]
    Rustls(#[from] rustls::Error),
    #[error("client certificate verifier: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn read_file(path: &Path) -> Result<Vec<u8>, TlsError> {
    fs::read(path).map_err(|source| TlsError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Parses every certificate in a PEM bundle.
pub fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(pem)).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates("PEM bundle".into()));
    }
    Ok(certs)
}

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    parse_certs(&read_file(path)?).map_err(|err| match err {
        TlsError::NoCertificates(_) => TlsError::NoCertificates(path.display().to_string()),
        other => other,
    })
}

pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let pem = read_file(path)?;
    rustls_pemfile::private_key(&mut BufReader::new(pem.as_slice()))?
        .ok_or_else(|| TlsError::NoPrivateKey(path.display().to_string()))
}

/// Builds a server config for TLS 1.2+ advertising `alpn`.
pub fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    alpn: &[&[u8]],
) -> Result<ServerConfig, TlsError> {
    let mut config = ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = alpn.iter().map(|proto| proto.to_vec()).collect();
    Ok(config)
}

/// Like [`server_config`], but requires a client certificate chaining to
/// one of `client_cas`.
pub fn server_config_with_client_auth(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    client_cas: Vec<CertificateDer<'static>>,
) -> Result<ServerConfig, TlsError> {
    let mut roots = RootCertStore::empty();
    for ca in client_cas {
        roots.add(ca)?;
    }
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider()).build()?;
    Ok(ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])?
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)?)
}

/// Trust anchors from `ca_file`, or the bundled web PKI roots.
pub fn root_store(ca_file: Option<&Path>) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    match ca_file {
        Some(path) => {
            for cert in load_certs(path)? {
                roots.add(cert)?;
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }
    Ok(roots)
}

fn client_config(roots: RootCertStore, alpn: &[&[u8]]) -> Result<ClientConfig, TlsError> {
    let mut config = ClientConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])?
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|proto| proto.to_vec()).collect();
    Ok(config)
}

fn ensure_h2(alpn: Option<&[u8]>) -> Result<(), TlsError> {
    match alpn {
        Some(ALPN_H2) => Ok(()),
        _ => Err(TlsError::AlpnMismatch),
    }
}

/// Server side acceptors for both wrap modes.
#[derive(Clone)]
pub struct ServerTls {
    generic: TlsAcceptor,
    h2: TlsAcceptor,
}

impl ServerTls {
    pub fn new(
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self, TlsError> {
        let generic = server_config(certs.clone(), key.clone_key(), &[])?;
        let h2 = server_config(certs, key, &[ALPN_H2])?;
        Ok(Self {
            generic: TlsAcceptor::from(Arc::new(generic)),
            h2: TlsAcceptor::from(Arc::new(h2)),
        })
    }

    pub fn from_pem_files(cert: &Path, key: &Path) -> Result<Self, TlsError> {
        Self::new(load_certs(cert)?, load_private_key(key)?)
    }

    pub async fn accept_generic<IO>(&self, io: IO) -> Result<server::TlsStream<IO>, TlsError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        Ok(self.generic.accept(io).await?)
    }

    pub async fn accept_h2<IO>(&self, io: IO) -> Result<server::TlsStream<IO>, TlsError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let tls = self.h2.accept(io).await?;
        ensure_h2(tls.get_ref().1.alpn_protocol())?;
        Ok(tls)
    }
}

/// Agent side connectors for both wrap modes.
#[derive(Clone)]
pub struct ClientTls {
    generic: TlsConnector,
    h2: TlsConnector,
    server_name: ServerName<'static>,
}

impl ClientTls {
    pub fn new(roots: RootCertStore, server_name: &str) -> Result<Self, TlsError> {
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|_| TlsError::InvalidServerName(server_name.to_string()))?;
        let generic = client_config(roots.clone(), &[])?;
        let h2 = client_config(roots, &[ALPN_H2])?;
        Ok(Self {
            generic: TlsConnector::from(Arc::new(generic)),
            h2: TlsConnector::from(Arc::new(h2)),
            server_name,
        })
    }

    pub fn with_ca_file(ca_file: Option<&Path>, server_name: &str) -> Result<Self, TlsError> {
        Self::new(root_store(ca_file)?, server_name)
    }

    pub async fn connect_generic<IO>(&self, io: IO) -> Result<client::TlsStream<IO>, TlsError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        Ok(self.generic.connect(self.server_name.clone(), io).await?)
    }

    pub async fn connect_h2<IO>(&self, io: IO) -> Result<client::TlsStream<IO>, TlsError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let tls = self.h2.connect(self.server_name.clone(), io).await?;
        ensure_h2(tls.get_ref().1.alpn_protocol())?;
        Ok(tls)
    }
}

/// Reads and discards until the peer ends the stream.
pub async fn drain_to_eof<S>(stream: &mut S) -> io::Result<()>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; 512];
    let mut discarded = 0usize;
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        discarded += n;
    }
    if discarded > 0 {
        warn!(bytes = discarded, "discarded data before end of TLS phase");
    }
    Ok(())
}

/// Ends the first TLS phase on the accepting side: waits for the agent's
/// close_notify, answers with our own and returns the bare socket.
pub async fn finish_server_phase<IO>(mut tls: server::TlsStream<IO>) -> io::Result<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    drain_to_eof(&mut tls).await?;
    tls.get_mut().1.send_close_notify();
    tls.flush().await?;
    debug!("server TLS phase closed");
    Ok(tls.into_inner().0)
}

/// Ends the first TLS phase on the dialing side: sends close_notify, waits
/// for the server to mirror it and returns the bare socket.
pub async fn finish_client_phase<IO>(mut tls: client::TlsStream<IO>) -> io::Result<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    tls.get_mut().1.send_close_notify();
    tls.flush().await?;
    drain_to_eof(&mut tls).await?;
    debug!("client TLS phase closed");
    Ok(tls.into_inner().0)
}

/// Lowercase hex SHA-256 of a DER certificate.
pub fn fingerprint(cert: &[u8]) -> String {
    hex::encode(Sha256::digest(cert))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_lowercase_sha256_hex() {
        let fp = fingerprint(b"abc");
        assert_eq!(
            fp,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn alpn_must_be_h2() {
        assert!(ensure_h2(Some(b"h2")).is_ok());
        assert!(matches!(ensure_h2(Some(b"http/1.1")), Err(TlsError::AlpnMismatch)));
        assert!(matches!(ensure_h2(None), Err(TlsError::AlpnMismatch)));
    }

    #[test]
    fn empty_pem_has_no_certificates() {
        assert!(matches!(parse_certs(b""), Err(TlsError::NoCertificates(_))));
    }

    #[test]
    fn missing_ca_file_is_reported() {
        let err = root_store(Some(Path::new("/nonexistent/ca.pem"))).unwrap_err();
        assert!(matches!(err, TlsError::Read { .. }));
    }
}
