//! Session persistence in the shared key/value store.
//!
//! Key layout (scores are unix milliseconds):
//!
//! | key | type |
//! |---|---|
//! | `backend_tokens` | hash `token -> backend id` |
//! | `session:<id>` | hash of session fields |
//! | `sessions:connected`, `sessions:disconnected` | sorted sets of session ids |
//! | `node:<node>:sessions`, `backend:<b>:sessions` | sets of session ids |
//! | `backend:<b>:endpoints` | set of endpoint entries (`tls:` prefix for SNI endpoints) |
//! | `backend:<b>:endpoint:<entry>` | hash `cluster`, `connected_at`, `last_seen_at`, `region` |
//! | `backend:<b>:releases` | sorted set of release ids |
//! | `backend:<b>:release:<rid>` | hash of release fields |
//! | `backend:<b>:valid_certificates` | set of certificate fingerprints |
//! | `backend:<b>` | hash with `client_auth_disabled`, `client_auth_chain` |

mod memory;
mod redis_store;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use wormhole_core::Release;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session store unavailable: {0}")]
    Unavailable(#[from] redis::RedisError),
    #[error("unknown token")]
    UnknownToken,
    #[error("failed to encode store value: {0}")]
    Serialization(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    /// Per-session TCP port.
    Tcp,
    /// Shared TLS port, routed by SNI.
    Tls,
}

impl EndpointKind {
    pub fn tag(self) -> &'static str {
        match self {
            EndpointKind::Tcp => "",
            EndpointKind::Tls => "tls:",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub kind: EndpointKind,
    pub addr: String,
}

impl Endpoint {
    pub fn tcp(addr: impl Into<String>) -> Self {
        Self {
            kind: EndpointKind::Tcp,
            addr: addr.into(),
        }
    }

    pub fn tls(addr: impl Into<String>) -> Self {
        Self {
            kind: EndpointKind::Tls,
            addr: addr.into(),
        }
    }

    /// Member of `backend:<b>:endpoints`.
    pub fn entry(&self) -> String {
        format!("{}{}", self.kind.tag(), self.addr)
    }
}

/// Snapshot of a session as persisted.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: String,
    pub node_id: String,
    pub backend_id: String,
    pub client_addr: String,
    pub client_version: String,
    pub cluster: String,
    pub region: String,
    pub endpoints: Vec<Endpoint>,
    pub release: Option<Release>,
    pub connected_at: OffsetDateTime,
}

impl SessionRecord {
    pub(crate) fn endpoint_list(&self) -> String {
        self.endpoints
            .iter()
            .map(Endpoint::entry)
            .collect::<Vec<_>>()
            .join(",")
    }

    pub(crate) fn fields(&self) -> Result<Vec<(&'static str, String)>, StoreError> {
        Ok(vec![
            ("id", self.id.clone()),
            ("node_id", self.node_id.clone()),
            ("backend_id", self.backend_id.clone()),
            ("client_addr", self.client_addr.clone()),
            ("client_version", self.client_version.clone()),
            ("cluster", self.cluster.clone()),
            ("endpoints", self.endpoint_list()),
            ("connected_at", rfc3339(self.connected_at)?),
            (
                "release_id",
                self.release
                    .as_ref()
                    .map(|release| release.id.clone())
                    .unwrap_or_default(),
            ),
        ])
    }
}

/// A TLS endpoint as listed by the admin API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointInfo {
    pub address: String,
    pub cluster: String,
    pub connected_at: String,
    pub last_seen_at: String,
}

pub(crate) fn rfc3339(at: OffsetDateTime) -> Result<String, StoreError> {
    at.format(&Rfc3339)
        .map_err(|err| StoreError::Serialization(err.to_string()))
}

/// Sorted-set score: milliseconds since the epoch.
pub(crate) fn score(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

pub(crate) mod keys {
    pub const BACKEND_TOKENS: &str = "backend_tokens";
    pub const SESSIONS_CONNECTED: &str = "sessions:connected";
    pub const SESSIONS_DISCONNECTED: &str = "sessions:disconnected";

    pub fn session(id: &str) -> String {
        format!("session:{id}")
    }

    pub fn node_sessions(node_id: &str) -> String {
        format!("node:{node_id}:sessions")
    }

    pub fn backend(backend_id: &str) -> String {
        format!("backend:{backend_id}")
    }

    pub fn backend_sessions(backend_id: &str) -> String {
        format!("backend:{backend_id}:sessions")
    }

    pub fn backend_endpoints(backend_id: &str) -> String {
        format!("backend:{backend_id}:endpoints")
    }

    pub fn backend_endpoint(backend_id: &str, entry: &str) -> String {
        format!("backend:{backend_id}:endpoint:{entry}")
    }

    pub fn backend_releases(backend_id: &str) -> String {
        format!("backend:{backend_id}:releases")
    }

    pub fn backend_release(backend_id: &str, release_id: &str) -> String {
        format!("backend:{backend_id}:release:{release_id}")
    }

    pub fn valid_certificates(backend_id: &str) -> String {
        format!("backend:{backend_id}:valid_certificates")
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    /// Resolves the backend owning `token`.
    async fn backend_id_from_token(&self, token: &str) -> Result<String, StoreError>;

    async fn register_connection(&self, session: &SessionRecord) -> Result<(), StoreError>;

    async fn register_disconnection(&self, session: &SessionRecord) -> Result<(), StoreError>;

    /// Publishes every endpoint of `session`.
    async fn register_endpoints(&self, session: &SessionRecord) -> Result<(), StoreError>;

    async fn unregister_endpoints(&self, session: &SessionRecord) -> Result<(), StoreError>;

    /// Refreshes `last_seen_at` of the session's endpoints.
    async fn touch_endpoints(&self, session: &SessionRecord) -> Result<(), StoreError>;

    /// Persists `session.release`, once per backend and release id.
    async fn register_release(&self, session: &SessionRecord) -> Result<(), StoreError>;

    /// Client certificates are required unless the backend opted out.
    async fn requires_client_auth(&self, backend_id: &str) -> Result<bool, StoreError>;

    /// PEM chain of CAs allowed to sign client certificates.
    async fn client_cas(&self, backend_id: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn valid_certificate(&self, backend_id: &str, fingerprint: &str)
        -> Result<bool, StoreError>;

    /// TLS endpoints currently published for the backend.
    async fn backend_endpoints(&self, backend_id: &str) -> Result<Vec<EndpointInfo>, StoreError>;
}

/// Interprets the `client_auth_disabled` flag; anything but a truthy value
/// keeps client authentication on.
pub(crate) fn client_auth_disabled(value: Option<&str>) -> bool {
    matches!(
        value.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("1" | "true" | "yes" | "on")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_entries_carry_transport_tag() {
        assert_eq!(Endpoint::tcp("node:4242").entry(), "node:4242");
        assert_eq!(Endpoint::tls("abc.example:443").entry(), "tls:abc.example:443");
    }

    #[test]
    fn score_is_unix_millis() {
        let at = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        assert_eq!(score(at), 1_700_000_000_000);
    }

    #[test]
    fn client_auth_flag_defaults_to_required() {
        assert!(!client_auth_disabled(None));
        assert!(!client_auth_disabled(Some("false")));
        assert!(!client_auth_disabled(Some("0")));
        assert!(client_auth_disabled(Some("true")));
        assert!(client_auth_disabled(Some(" 1 ")));
    }
}
