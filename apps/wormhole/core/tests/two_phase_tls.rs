use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::RootCertStore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use wormhole_core::tls::{self, ClientTls, ServerTls, TlsError};
use wormhole_core::{ControlCodec, Message};

fn self_signed() -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let key = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()).into();
    (vec![certified.cert.der().clone()], key)
}

fn client_for(certs: &[CertificateDer<'static>]) -> ClientTls {
    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots.add(cert.clone()).unwrap();
    }
    ClientTls::new(roots, "localhost").unwrap()
}

#[tokio::test]
async fn auth_tunnel_then_rewrap_as_h2() {
    let (certs, key) = self_signed();
    let server_tls = ServerTls::new(certs.clone(), key).unwrap();
    let client_tls = client_for(&certs);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let tls = server_tls.accept_generic(tcp).await.unwrap();
        let mut framed = Framed::new(tls, ControlCodec);
        let first = framed.next().await.unwrap().unwrap();
        let parts = framed.into_parts();
        assert!(parts.read_buf.is_empty());

        let raw = tls::finish_server_phase(parts.io).await.unwrap();
        let mut h2 = server_tls.accept_h2(raw).await.unwrap();
        let mut buf = [0u8; 5];
        h2.read_exact(&mut buf).await.unwrap();
        h2.write_all(b"world").await.unwrap();
        h2.flush().await.unwrap();
        (first, buf)
    });

    let client = async {
        let tcp = TcpStream::connect(addr).await.unwrap();
        let tls = client_tls.connect_generic(tcp).await.unwrap();
        let mut framed = Framed::new(tls, ControlCodec);
        framed
            .send(Message::auth_tunnel("abc123", "fly_token"))
            .await
            .unwrap();
        let raw = tls::finish_client_phase(framed.into_inner()).await.unwrap();

        let mut h2 = client_tls.connect_h2(raw).await.unwrap();
        assert_eq!(h2.get_ref().1.alpn_protocol(), Some(&b"h2"[..]));
        h2.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        h2.read_exact(&mut buf).await.unwrap();
        buf
    };

    let reply = timeout(Duration::from_secs(5), client).await.unwrap();
    let (first, received) = timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(first, Message::auth_tunnel("abc123", "fly_token"));
    assert_eq!(&received, b"hello");
    assert_eq!(&reply, b"world");
}

#[tokio::test]
async fn h2_wrap_fails_without_alpn() {
    let (certs, key) = self_signed();
    let server_tls = ServerTls::new(certs.clone(), key).unwrap();
    let client_tls = client_for(&certs);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        // Generic acceptor: no ALPN is ever selected.
        let _ = server_tls.accept_generic(tcp).await;
    });

    let tcp = TcpStream::connect(addr).await.unwrap();
    let result = timeout(Duration::from_secs(5), client_tls.connect_h2(tcp))
        .await
        .unwrap();
    assert!(matches!(result, Err(TlsError::AlpnMismatch)));
    server.abort();
}
