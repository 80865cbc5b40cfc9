//! Reverse proxying of public HTTP requests over a session's tunnels.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::uri::{PathAndQuery, Uri};
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use metrics::counter;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};
use tunnel_pool::{Pool, PoolHandle, Poolable};

use crate::telemetry::PROXY_REQUESTS_TOTAL;
use crate::tunnel::{ProxyBody, Tunnel};

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const KEEP_ALIVE: &str = "keep-alive";
const PROXY_CONNECTION: &str = "proxy-connection";
/// Checkouts attempted per request before giving up on a pool that keeps
/// handing out dying tunnels.
const MAX_CHECKOUTS: usize = 4;

/// Per-connection facts needed to rewrite a request.
#[derive(Debug, Clone)]
pub struct Forwarding {
    pub scheme: &'static str,
    /// Authority used when the request carries no Host.
    pub default_authority: String,
    pub peer: SocketAddr,
    /// The public connection was TLS.
    pub tls: bool,
    pub tunnel_wait: Duration,
}

/// Forwards one public request to the agent. Failures become 502s; the
/// request itself is never retried.
pub async fn forward(
    pool: &Pool<Tunnel>,
    req: Request<Incoming>,
    forwarding: &Forwarding,
) -> Response<ProxyBody> {
    let req = match rewrite_request(req, forwarding) {
        Ok(req) => req.map(|body| body.boxed()),
        Err(err) => {
            debug!(error = %err, "rejecting unroutable request");
            counter!(PROXY_REQUESTS_TOTAL, 1, "outcome" => "bad_request");
            return text_response(StatusCode::BAD_REQUEST, "bad request");
        }
    };

    let Some(handle) = checkout(pool, forwarding.tunnel_wait).await else {
        counter!(PROXY_REQUESTS_TOTAL, 1, "outcome" => "no_tunnel");
        return text_response(StatusCode::BAD_GATEWAY, "no tunnel available");
    };
    let tunnel = Arc::clone(handle.object());
    handle.done();

    match tunnel.round_trip(req).await {
        Ok(response) => {
            counter!(PROXY_REQUESTS_TOTAL, 1, "outcome" => "ok");
            rewrite_response(response)
        }
        Err(err) => {
            warn!(tunnel_id = tunnel.id(), error = %err, "tunnel round trip failed");
            counter!(PROXY_REQUESTS_TOTAL, 1, "outcome" => "upstream_error");
            text_response(StatusCode::BAD_GATEWAY, "tunnel error")
        }
    }
}

async fn checkout(pool: &Pool<Tunnel>, wait: Duration) -> Option<PoolHandle<Tunnel>> {
    let deadline = Instant::now() + wait;
    for _ in 0..MAX_CHECKOUTS {
        match timeout_at(deadline, pool.get()).await {
            Ok(Ok(handle)) if handle.should_delete() => {
                debug!(tunnel_id = handle.id(), "skipping dying tunnel");
            }
            Ok(Ok(handle)) => return Some(handle),
            Ok(Err(_)) | Err(_) => return None,
        }
    }
    None
}

pub fn text_response(status: StatusCode, body: &'static str) -> Response<ProxyBody> {
    let mut response = Response::new(
        Full::new(Bytes::from_static(body.as_bytes()))
            .map_err(|never| match never {})
            .boxed(),
    );
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Points the request at the agent: absolute URI built from the forwarding
/// scheme and the public Host, hop-by-hop headers removed, forwarding headers
/// appended.
pub fn rewrite_request<B>(
    req: Request<B>,
    forwarding: &Forwarding,
) -> Result<Request<B>, http::Error> {
    let (mut parts, body) = req.into_parts();

    let authority = parts
        .headers
        .get(header::HOST)
        .and_then(|host| host.to_str().ok())
        .map(str::to_owned)
        .or_else(|| parts.uri.authority().map(|a| a.to_string()))
        .unwrap_or_else(|| forwarding.default_authority.clone());
    let path = parts
        .uri
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    parts.uri = Uri::builder()
        .scheme(forwarding.scheme)
        .authority(authority.as_str())
        .path_and_query(path)
        .build()?;
    parts.version = http::Version::HTTP_2;

    strip_hop_by_hop(&mut parts.headers, true);
    parts.headers.remove(header::HOST);

    let client_ip = forwarding.peer.ip().to_string();
    let forwarded_for = match parts.headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) if !prior.is_empty() => format!("{prior}, {client_ip}"),
        _ => client_ip,
    };
    parts.headers.insert(
        HeaderName::from_static(X_FORWARDED_FOR),
        HeaderValue::from_str(&forwarded_for)?,
    );
    parts.headers.insert(
        HeaderName::from_static(X_FORWARDED_PROTO),
        HeaderValue::from_static(if forwarding.tls { "https" } else { "http" }),
    );

    Ok(Request::from_parts(parts, body))
}

/// Prepares an agent response for the public connection.
pub fn rewrite_response<B>(response: Response<B>) -> Response<B> {
    let (mut parts, body) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers, false);
    parts.headers.remove(header::CONTENT_LENGTH);
    Response::from_parts(parts, body)
}

fn strip_hop_by_hop(headers: &mut HeaderMap, request: bool) {
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
    headers.remove(header::UPGRADE);
    headers.remove(header::TRANSFER_ENCODING);
    headers.remove(header::PROXY_AUTHENTICATE);
    headers.remove(KEEP_ALIVE);
    headers.remove(PROXY_CONNECTION);

    let keep_te = request
        && headers
            .get(header::TE)
            .and_then(|te| te.to_str().ok())
            .is_some_and(|te| te.trim().eq_ignore_ascii_case("trailers"));
    if !keep_te {
        headers.remove(header::TE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forwarding(tls: bool) -> Forwarding {
        Forwarding {
            scheme: "http",
            default_authority: "127.0.0.1:4242".into(),
            peer: "203.0.113.9:5555".parse().unwrap(),
            tls,
            tunnel_wait: Duration::from_millis(100),
        }
    }

    #[test]
    fn request_targets_public_host_over_forwarding_scheme() {
        let req = Request::get("/api/items?page=2")
            .header(header::HOST, "abc123.wormhole.example")
            .body(())
            .unwrap();
        let req = rewrite_request(req, &forwarding(true)).unwrap();
        assert_eq!(
            req.uri().to_string(),
            "http://abc123.wormhole.example/api/items?page=2"
        );
        assert!(req.headers().get(header::HOST).is_none());
        assert_eq!(req.headers()[X_FORWARDED_PROTO], "https");
        assert_eq!(req.headers()[X_FORWARDED_FOR], "203.0.113.9");
    }

    #[test]
    fn request_without_host_uses_default_authority() {
        let req = Request::get("/").body(()).unwrap();
        let req = rewrite_request(req, &forwarding(false)).unwrap();
        assert_eq!(req.uri().to_string(), "http://127.0.0.1:4242/");
        assert_eq!(req.headers()[X_FORWARDED_PROTO], "http");
    }

    #[test]
    fn hop_by_hop_headers_are_dropped() {
        let req = Request::post("/upload")
            .header(header::HOST, "svc")
            .header(header::CONNECTION, "keep-alive, x-session-hint")
            .header("x-session-hint", "drop me")
            .header(KEEP_ALIVE, "timeout=5")
            .header(header::TRANSFER_ENCODING, "chunked")
            .header(header::UPGRADE, "websocket")
            .header(header::TE, "gzip")
            .header("x-kept", "yes")
            .body(())
            .unwrap();
        let req = rewrite_request(req, &forwarding(false)).unwrap();
        let headers = req.headers();
        for gone in ["connection", "x-session-hint", "keep-alive", "transfer-encoding", "upgrade", "te"] {
            assert!(headers.get(gone).is_none(), "{gone} should be stripped");
        }
        assert_eq!(headers["x-kept"], "yes");
    }

    #[test]
    fn te_trailers_survives() {
        let req = Request::get("/")
            .header(header::TE, "trailers")
            .body(())
            .unwrap();
        let req = rewrite_request(req, &forwarding(false)).unwrap();
        assert_eq!(req.headers()[header::TE], "trailers");
    }

    #[test]
    fn forwarded_for_is_appended() {
        let req = Request::get("/")
            .header(X_FORWARDED_FOR, "198.51.100.1")
            .body(())
            .unwrap();
        let req = rewrite_request(req, &forwarding(false)).unwrap();
        assert_eq!(req.headers()[X_FORWARDED_FOR], "198.51.100.1, 203.0.113.9");
    }

    #[test]
    fn response_loses_length_and_hop_headers() {
        let response = Response::builder()
            .header(header::CONTENT_LENGTH, "5")
            .header(header::CONNECTION, "close")
            .header(header::CONTENT_TYPE, "text/plain")
            .body(())
            .unwrap();
        let response = rewrite_response(response);
        assert!(response.headers().get(header::CONTENT_LENGTH).is_none());
        assert!(response.headers().get(header::CONNECTION).is_none());
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
    }

    #[tokio::test]
    async fn empty_pool_times_out_to_none() {
        let pool: Pool<Tunnel> = Pool::new(tunnel_pool::PoolConfig::new(2));
        assert!(checkout(&pool, Duration::from_millis(30)).await.is_none());
    }
}
