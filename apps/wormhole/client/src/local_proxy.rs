//! Forwards tunneled requests to the local backend.

use std::error::Error as StdError;

use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::uri::{PathAndQuery, Uri};
use http::{Request, Response, StatusCode, Version};
use http_body::Body;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::{debug, warn};
use wormhole_core::{BoxedStream, ClientTls};

use crate::AgentError;

pub type LocalBody = BoxBody<Bytes, hyper::Error>;

const KEEP_ALIVE: &str = "keep-alive";
const PROXY_CONNECTION: &str = "proxy-connection";

/// The local service the agent exposes.
pub struct LocalProxy {
    endpoint: String,
    tls: Option<ClientTls>,
}

impl LocalProxy {
    pub fn new(endpoint: impl Into<String>, tls: Option<ClientTls>) -> Self {
        Self {
            endpoint: endpoint.into(),
            tls,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Opens a fresh connection to the backend.
    pub async fn connect(&self) -> Result<BoxedStream, AgentError> {
        let tcp = TcpStream::connect(&self.endpoint).await?;
        let _ = tcp.set_nodelay(true);
        Ok(match &self.tls {
            Some(tls) => Box::new(tls.connect_generic(tcp).await?),
            None => Box::new(tcp),
        })
    }

    /// Sends one tunneled request to the backend over HTTP/1.1. Any failure
    /// becomes a 502 for the public client.
    pub async fn forward<B>(&self, req: Request<B>) -> Response<LocalBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        match self.round_trip(req).await {
            Ok(response) => {
                debug!(%method, %path, status = %response.status(), "local request finished");
                response
            }
            Err(err) => {
                warn!(%method, %path, endpoint = %self.endpoint, error = %err, "local backend request failed");
                bad_gateway()
            }
        }
    }

    async fn round_trip<B>(&self, req: Request<B>) -> Result<Response<LocalBody>, AgentError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let req = to_origin_form(req)?;
        let stream = self.connect().await?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                debug!(error = %err, "local connection ended with error");
            }
        });
        let response = sender.send_request(req).await?;
        let (mut parts, body) = response.into_parts();
        strip_connection_headers(&mut parts.headers);
        parts.version = Version::HTTP_2;
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// Turns the absolute-form request the server sent into an origin-form
/// HTTP/1.1 request, keeping the public host in `Host`.
fn to_origin_form<B>(req: Request<B>) -> Result<Request<B>, http::Error> {
    let (mut parts, body) = req.into_parts();
    let authority = parts.uri.authority().map(|authority| authority.as_str().to_owned());
    let path = parts
        .uri
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    parts.uri = Uri::from(path);
    parts.version = Version::HTTP_11;
    if let Some(authority) = authority {
        parts.headers.insert(header::HOST, HeaderValue::from_str(&authority)?);
    }
    strip_connection_headers(&mut parts.headers);
    Ok(Request::from_parts(parts, body))
}

/// Removes headers that are meaningless (or illegal) across an HTTP/2 hop.
fn strip_connection_headers(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    headers.remove(header::CONNECTION);
    headers.remove(header::TRANSFER_ENCODING);
    headers.remove(header::UPGRADE);
    headers.remove(KEEP_ALIVE);
    headers.remove(PROXY_CONNECTION);
}

fn bad_gateway() -> Response<LocalBody> {
    let mut response = Response::new(
        Full::new(Bytes::from_static(b"local backend unavailable"))
            .map_err(|never| match never {})
            .boxed(),
    );
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Empty;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    #[test]
    fn absolute_request_becomes_origin_form_with_public_host() {
        let req = Request::builder()
            .uri("http://app.example:8080/items?page=2")
            .version(Version::HTTP_2)
            .header("te", "trailers")
            .header("connection", "x-trace")
            .header("x-trace", "1")
            .body(())
            .unwrap();
        let req = to_origin_form(req).unwrap();
        assert_eq!(req.uri(), "/items?page=2");
        assert_eq!(req.version(), Version::HTTP_11);
        assert_eq!(req.headers()[header::HOST], "app.example:8080");
        assert!(req.headers().get("x-trace").is_none());
        assert_eq!(req.headers()["te"], "trailers");
    }

    #[tokio::test]
    async fn request_reaches_backend_and_response_is_h2_clean() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = backend.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = backend.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let mut read = 0;
            while !buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                read += socket.read(&mut buf[read..]).await.unwrap();
            }
            let head = String::from_utf8_lossy(&buf[..read]).to_string();
            assert!(head.starts_with("GET /hello HTTP/1.1\r\n"));
            assert!(head.to_ascii_lowercase().contains("host: app.example\r\n"));
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nConnection: keep-alive\r\nKeep-Alive: timeout=5\r\nContent-Length: 4\r\n\r\ntest")
                .await
                .unwrap();
        });

        let proxy = LocalProxy::new(addr.to_string(), None);
        let req = Request::builder()
            .uri("http://app.example/hello")
            .body(Empty::<Bytes>::new())
            .unwrap();
        let response = timeout(Duration::from_secs(2), proxy.forward(req)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(header::CONNECTION).is_none());
        assert!(response.headers().get(KEEP_ALIVE).is_none());
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"test");
    }

    #[tokio::test]
    async fn unreachable_backend_is_bad_gateway() {
        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = unused.local_addr().unwrap();
        drop(unused);
        let proxy = LocalProxy::new(addr.to_string(), None);
        let req = Request::builder()
            .uri("http://app.example/")
            .body(Empty::<Bytes>::new())
            .unwrap();
        let response = proxy.forward(req).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
