pub mod agent;
pub mod config;
pub mod control;
pub mod local_proxy;
pub mod release;
pub mod ssh;
pub mod supervisor;
pub mod tunnel;

use std::io;

use thiserror::Error;
use wormhole_core::{CodecError, TlsError};

pub use agent::Agent;
pub use config::{AgentConfig, Proto};
pub use local_proxy::LocalProxy;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Tls(#[from] TlsError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Http(#[from] hyper::Error),
    #[error(transparent)]
    InvalidRequest(#[from] http::Error),
    #[error(transparent)]
    Ssh(#[from] russh::Error),
    #[error("the {0:?} transport needs TLS towards the server")]
    TlsRequired(Proto),
    #[error("server rejected the token")]
    AuthenticationFailed,
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
    #[error("local service did not accept connections within {0:?}")]
    StartupTimeout(std::time::Duration),
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}
