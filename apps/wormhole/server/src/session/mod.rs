//! Per-agent sessions.
//!
//! Every transport shares [`SessionCore`]: it owns the store record, the
//! ingress listener and the heartbeat clock, and runs the registration and
//! teardown sequences in the order the store contract requires.

mod control;
mod http2;
mod ssh;
mod tcp;

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, decrement_gauge, increment_gauge};
use parking_lot::Mutex;
use thiserror::Error;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wormhole_core::{CodecError, Release, TlsError};

use crate::config::{NodeInfo, Proto, SessionConfig};
use crate::listener::{Binding, Listener, ListenerError, ListenerFactory};
use crate::store::{SessionRecord, SessionStore, StoreError};
use crate::telemetry::{SESSIONS_ACTIVE, SESSIONS_TOTAL};

pub use self::control::CloseReason;
pub use self::http2::Http2Session;
pub use self::ssh::{SshServer, SshSession};
pub use self::tcp::TcpSession;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Http(#[from] hyper::Error),
    #[error(transparent)]
    Ssh(#[from] russh::Error),
    #[error("session is closed")]
    Closed,
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
}

/// Collaborators every session needs, shared by all sessions of a server.
pub struct SessionContext {
    pub store: Arc<dyn SessionStore>,
    pub listeners: Arc<dyn ListenerFactory>,
    pub config: SessionConfig,
    pub node: NodeInfo,
    pub proto: Proto,
}

/// What an authenticated agent told us about itself.
#[derive(Debug, Clone)]
pub struct AgentInfo {
    pub backend_id: String,
    pub addr: SocketAddr,
    pub version: String,
}

pub struct SessionCore {
    id: String,
    backend_id: String,
    ctx: Arc<SessionContext>,
    record: Mutex<SessionRecord>,
    listener: Box<dyn Listener>,
    last_ping: Mutex<Instant>,
    release_registered: AtomicBool,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl SessionCore {
    /// Persists the connection, binds ingress and publishes its endpoints.
    /// On failure nothing stays published.
    pub async fn establish(ctx: Arc<SessionContext>, agent: AgentInfo) -> Result<Self, SessionError> {
        let id = Uuid::new_v4().simple().to_string();
        let mut record = SessionRecord {
            id: id.clone(),
            node_id: ctx.node.node_id.clone(),
            backend_id: agent.backend_id.clone(),
            client_addr: agent.addr.to_string(),
            client_version: agent.version,
            cluster: ctx.node.cluster.clone(),
            region: ctx.node.region.clone(),
            endpoints: Vec::new(),
            release: None,
            connected_at: OffsetDateTime::now_utc(),
        };
        ctx.store.register_connection(&record).await?;

        let binding = Binding {
            session_id: id.clone(),
            backend_id: agent.backend_id.clone(),
        };
        let listener = match ctx.listeners.listen(&binding).await {
            Ok(listener) => listener,
            Err(err) => {
                if let Err(store_err) = ctx.store.register_disconnection(&record).await {
                    warn!(session_id = %id, error = %store_err, "failed to record aborted session");
                }
                return Err(err.into());
            }
        };
        record.endpoints = listener.endpoints();
        if let Err(err) = ctx.store.register_endpoints(&record).await {
            listener.close();
            if let Err(store_err) = ctx.store.register_disconnection(&record).await {
                warn!(session_id = %id, error = %store_err, "failed to record aborted session");
            }
            return Err(err.into());
        }

        increment_gauge!(SESSIONS_ACTIVE, 1.0);
        counter!(SESSIONS_TOTAL, 1, "proto" => ctx.proto.to_string());
        info!(
            session_id = %id,
            backend_id = %agent.backend_id,
            client_addr = %agent.addr,
            endpoints = %record.endpoint_list(),
            "session registered"
        );

        Ok(Self {
            id,
            backend_id: agent.backend_id,
            ctx,
            record: Mutex::new(record),
            listener,
            last_ping: Mutex::new(Instant::now()),
            release_registered: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.ctx.config
    }

    pub fn listener(&self) -> &dyn Listener {
        self.listener.as_ref()
    }

    pub fn record(&self) -> SessionRecord {
        self.record.lock().clone()
    }

    /// Fires once teardown has started.
    pub fn cancelled(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn record_ping(&self) {
        *self.last_ping.lock() = Instant::now();
    }

    pub fn heartbeat_expired(&self) -> bool {
        self.last_ping.lock().elapsed() > self.ctx.config.ping_timeout
    }

    pub async fn touch_endpoints(&self) {
        let record = self.record();
        if let Err(err) = self.ctx.store.touch_endpoints(&record).await {
            warn!(session_id = %self.id, error = %err, "failed to refresh endpoints");
        }
    }

    /// Persists the agent's release. Only the first release of a session is
    /// recorded.
    pub async fn register_release(&self, release: Release) -> Result<(), SessionError> {
        if release.id.is_empty() {
            debug!(session_id = %self.id, "ignoring release without id");
            return Ok(());
        }
        if self.release_registered.swap(true, Ordering::SeqCst) {
            debug!(session_id = %self.id, "release already recorded");
            return Ok(());
        }
        let record = {
            let mut record = self.record.lock();
            record.release = Some(release);
            record.clone()
        };
        self.ctx.store.register_release(&record).await?;
        info!(session_id = %self.id, release_id = ?record.release.as_ref().map(|r| &r.id), "release registered");
        Ok(())
    }

    /// Unpublishes and closes the session. Returns `false` when teardown had
    /// already run. Store failures are logged and the sequence continues.
    pub async fn teardown(&self, reason: &CloseReason) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.cancel.cancel();
        let record = self.record();

        if let Err(err) = self.ctx.store.unregister_endpoints(&record).await {
            warn!(session_id = %self.id, error = %err, "failed to unregister endpoints");
        }
        self.listener.close();
        if let Err(err) = self.ctx.store.register_disconnection(&record).await {
            warn!(session_id = %self.id, error = %err, "failed to record disconnection");
        }

        decrement_gauge!(SESSIONS_ACTIVE, 1.0);
        info!(session_id = %self.id, backend_id = %self.backend_id, reason = %reason, "session closed");
        true
    }
}
