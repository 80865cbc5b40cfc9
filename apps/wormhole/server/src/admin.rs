//! Admin HTTP API served on the metrics port.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tracing::warn;

use crate::store::{SessionStore, StoreError};

pub struct AdminState {
    pub store: Arc<dyn SessionStore>,
    pub metrics: PrometheusHandle,
}

pub fn router(state: Arc<AdminState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/v1/endpoints", get(endpoints_handler))
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics_handler(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

/// Lists the shared-port endpoints of the caller's backend.
async fn endpoints_handler(State(state): State<Arc<AdminState>>, headers: HeaderMap) -> Response {
    let Some(token) = token_from(&headers) else {
        return unauthorized();
    };
    let backend_id = match state.store.backend_id_from_token(token).await {
        Ok(backend_id) => backend_id,
        Err(StoreError::UnknownToken) => return unauthorized(),
        Err(err) => return internal(err),
    };
    match state.store.backend_endpoints(&backend_id).await {
        Ok(endpoints) => Json(endpoints).into_response(),
        Err(err) => internal(err),
    }
}

/// Accepts `Authorization: Token <t>`.
fn token_from(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("token") && !token.is_empty()).then_some(token)
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "unauthorized" })),
    )
        .into_response()
}

fn internal(err: StoreError) -> Response {
    warn!(error = %err, "admin request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal" })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Endpoint, MemoryStore, SessionRecord};
    use axum::{
        body::{self, Body},
        http::Request,
    };
    use metrics_exporter_prometheus::PrometheusBuilder;
    use time::OffsetDateTime;
    use tower::util::ServiceExt;

    fn app(store: Arc<MemoryStore>) -> Router {
        router(Arc::new(AdminState {
            store,
            metrics: PrometheusBuilder::new().build_recorder().handle(),
        }))
    }

    fn get_endpoints(authorization: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method("GET").uri("/api/v1/endpoints");
        if let Some(value) = authorization {
            builder = builder.header("authorization", value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn endpoints_are_listed_for_token_backend() {
        let store = Arc::new(MemoryStore::new());
        store.add_token("fly_token", "1");
        let record = SessionRecord {
            id: "abc123".into(),
            node_id: "node-1".into(),
            backend_id: "1".into(),
            client_addr: "192.0.2.10:5000".into(),
            client_version: String::new(),
            cluster: "wormhole.example".into(),
            region: String::new(),
            endpoints: vec![
                Endpoint::tcp("127.0.0.1:40001"),
                Endpoint::tls("abc123.wormhole.example"),
            ],
            release: None,
            connected_at: OffsetDateTime::now_utc(),
        };
        store.register_endpoints(&record).await.unwrap();

        let response = app(store)
            .oneshot(get_endpoints(Some("Token fly_token")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let listed: Vec<serde_json::Value> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0]["address"], "abc123.wormhole.example");
        assert_eq!(listed[0]["cluster"], "wormhole.example");
        assert!(listed[0]["last_seen_at"].is_string());
    }

    #[tokio::test]
    async fn missing_or_unknown_token_is_unauthorized() {
        let store = Arc::new(MemoryStore::new());
        store.add_token("fly_token", "1");
        for authorization in [None, Some("Bearer fly_token"), Some("Token nope"), Some("Token ")] {
            let response = app(store.clone())
                .oneshot(get_endpoints(authorization))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{authorization:?}");
        }
    }

    #[tokio::test]
    async fn store_failure_is_internal_error() {
        let store = Arc::new(MemoryStore::new());
        store.add_token("fly_token", "1");
        store.set_unavailable(true);
        let response = app(store)
            .oneshot(get_endpoints(Some("Token fly_token")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn health_and_metrics_respond() {
        let app = app(Arc::new(MemoryStore::new()));
        let response = app
            .clone()
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; version=0.0.4"
        );
    }
}
