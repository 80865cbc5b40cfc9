use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Proto {
    Ssh,
    Tcp,
    Http2,
}

impl std::fmt::Display for Proto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Proto::Ssh => "ssh",
            Proto::Tcp => "tcp",
            Proto::Http2 => "http2",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "wormhole-server",
    author,
    version,
    about = "Reverse tunnel server exposing agents' local services"
)]
pub struct Cli {
    /// Transport spoken with agents.
    #[arg(long, env = "WORMHOLE_PROTO", value_enum, default_value_t = Proto::Http2)]
    pub proto: Proto,

    /// Port agents connect to.
    #[arg(long, env = "WORMHOLE_PORT", default_value_t = 10000)]
    pub port: u16,

    /// Address the agent and ingress listeners bind to.
    #[arg(long, env = "WORMHOLE_BIND_HOST", default_value = "0.0.0.0")]
    pub bind_host: IpAddr,

    /// Hostname or IP published as the prefix of per-session endpoints.
    #[arg(long, env = "WORMHOLE_LOCALHOST", default_value = "127.0.0.1")]
    pub localhost: String,

    #[arg(long, env = "WORMHOLE_CLUSTER_URL", default_value = "localhost")]
    pub cluster_url: String,

    /// Identifier of this server instance; random when unset.
    #[arg(long, env = "WORMHOLE_NODE_ID")]
    pub node_id: Option<String>,

    #[arg(long, env = "WORMHOLE_REGION", default_value = "")]
    pub region: String,

    #[arg(long, env = "WORMHOLE_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    #[arg(long, env = "WORMHOLE_TLS_CERT_FILE")]
    pub tls_cert_file: Option<PathBuf>,

    #[arg(long, env = "WORMHOLE_TLS_PRIVATE_KEY_FILE")]
    pub tls_private_key_file: Option<PathBuf>,

    #[arg(long, env = "WORMHOLE_SSH_PRIVATE_KEY_FILE")]
    pub ssh_private_key_file: Option<PathBuf>,

    /// Serve ingress for every session on one TLS port, routed by SNI.
    #[arg(long, env = "WORMHOLE_USE_SHARED_PORT_FORWARDING", default_value_t = false)]
    pub use_shared_port_forwarding: bool,

    #[arg(long, env = "WORMHOLE_SHARED_TLS_FORWARDING_PORT", default_value_t = 443)]
    pub shared_tls_forwarding_port: u16,

    /// Domain appended to session ids to form SNI endpoints. Defaults to the cluster URL host.
    #[arg(long, env = "WORMHOLE_SHARED_TLS_DOMAIN")]
    pub shared_tls_domain: Option<String>,

    #[arg(long, env = "WORMHOLE_SHARED_TLS_CERT_FILE")]
    pub shared_tls_cert_file: Option<PathBuf>,

    #[arg(long, env = "WORMHOLE_SHARED_TLS_PRIVATE_KEY_FILE")]
    pub shared_tls_private_key_file: Option<PathBuf>,

    /// Run the agent port without TLS (not allowed with http2).
    #[arg(long, env = "WORMHOLE_INSECURE", default_value_t = false)]
    pub insecure: bool,

    #[arg(long, env = "WORMHOLE_METRICS_API_PORT", default_value_t = 9191)]
    pub metrics_api_port: u16,

    /// Tunnels kept open per session.
    #[arg(long, env = "WORMHOLE_TUNNELS_PER_SESSION", default_value_t = 2)]
    pub tunnels_per_session: usize,

    /// Hard cap on pooled tunnels per session.
    #[arg(long, env = "WORMHOLE_MAX_TUNNELS_PER_SESSION", default_value_t = 16)]
    pub max_tunnels_per_session: usize,

    /// Concurrent streams after which a tunnel is retired once drained.
    #[arg(long, env = "WORMHOLE_TUNNEL_STREAM_SOFT_CAP", default_value_t = 100)]
    pub tunnel_stream_soft_cap: usize,

    /// Forward requests to the agent with the https scheme.
    #[arg(long, env = "WORMHOLE_FORWARD_HTTPS", default_value_t = false)]
    pub forward_https: bool,

    #[arg(long, env = "WORMHOLE_PING_TIMEOUT_SECS", default_value_t = 30)]
    pub ping_timeout_secs: u64,

    #[arg(long, env = "WORMHOLE_CONN_CHECK_INTERVAL_MS", default_value_t = 1000)]
    pub conn_check_interval_ms: u64,

    /// Time allowed between accept and the first control message.
    #[arg(long, env = "WORMHOLE_HANDSHAKE_TIMEOUT_SECS", default_value_t = 10)]
    pub handshake_timeout_secs: u64,

    /// How long an ingress request waits for a usable tunnel.
    #[arg(long, env = "WORMHOLE_TUNNEL_WAIT_SECS", default_value_t = 5)]
    pub tunnel_wait_secs: u64,

    /// New agent connections per minute per source IP; 0 disables the limit.
    #[arg(long, env = "WORMHOLE_RATE_LIMIT_PER_MINUTE", default_value_t = 30)]
    pub rate_limit_per_minute: u32,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("--insecure cannot be used with the http2 transport")]
    InsecureHttp2,
    #[error("the {0} transport requires --tls-cert-file and --tls-private-key-file")]
    MissingTls(Proto),
    #[error("the ssh transport requires --ssh-private-key-file")]
    MissingSshKey,
    #[error("shared port forwarding requires --shared-tls-cert-file and --shared-tls-private-key-file")]
    MissingSharedTls,
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SharedPortConfig {
    pub addr: SocketAddr,
    pub domain: String,
    pub tls: TlsFiles,
}

/// Identity of this server instance as written to the session store.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub node_id: String,
    pub cluster: String,
    pub region: String,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub tunnels_per_session: usize,
    pub max_tunnels: usize,
    pub stream_soft_cap: usize,
    pub ping_timeout: Duration,
    pub conn_check_interval: Duration,
    pub tunnel_wait: Duration,
    pub handshake_timeout: Duration,
    pub forward_scheme: &'static str,
    /// Ingress connections parked while the tcp transport waits for a tunnel.
    pub max_pending_connections: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tunnels_per_session: 2,
            max_tunnels: 16,
            stream_soft_cap: 100,
            ping_timeout: wormhole_core::DEFAULT_PING_TIMEOUT,
            conn_check_interval: wormhole_core::DEFAULT_CONN_CHECK_INTERVAL,
            tunnel_wait: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            forward_scheme: "http",
            max_pending_connections: 64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub proto: Proto,
    pub listen_addr: SocketAddr,
    /// Bind address for per-session ingress listeners (port chosen by the OS).
    pub ingress_bind: IpAddr,
    pub advertise_host: String,
    pub node: NodeInfo,
    pub redis_url: String,
    pub tls: Option<TlsFiles>,
    pub ssh_private_key: Option<PathBuf>,
    pub shared_port: Option<SharedPortConfig>,
    pub insecure: bool,
    pub metrics_addr: SocketAddr,
    pub session: SessionConfig,
    pub rate_limit_per_minute: Option<NonZeroU32>,
    pub accept_deadline: Duration,
}

impl ServerConfig {
    /// A configuration for an in-process server on loopback, used by tests
    /// and embedders that fill in the rest themselves.
    pub fn local(proto: Proto) -> Self {
        Self {
            proto,
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            ingress_bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            advertise_host: "127.0.0.1".into(),
            node: NodeInfo {
                node_id: "node-local".into(),
                cluster: "localhost".into(),
                region: String::new(),
            },
            redis_url: String::new(),
            tls: None,
            ssh_private_key: None,
            shared_port: None,
            insecure: false,
            metrics_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            session: SessionConfig::default(),
            rate_limit_per_minute: None,
            accept_deadline: Duration::from_secs(1),
        }
    }
}

fn tls_pair(cert: Option<PathBuf>, key: Option<PathBuf>) -> Option<TlsFiles> {
    match (cert, key) {
        (Some(cert), Some(key)) => Some(TlsFiles { cert, key }),
        _ => None,
    }
}

fn cluster_host(cluster_url: &str) -> String {
    let without_scheme = cluster_url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(cluster_url);
    without_scheme
        .split(['/', ':'])
        .next()
        .unwrap_or(without_scheme)
        .to_string()
}

impl TryFrom<Cli> for ServerConfig {
    type Error = ConfigError;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        if cli.proto == Proto::Http2 && cli.insecure {
            return Err(ConfigError::InsecureHttp2);
        }
        let tls = tls_pair(cli.tls_cert_file, cli.tls_private_key_file);
        let needs_tls = match cli.proto {
            Proto::Http2 => true,
            Proto::Tcp => !cli.insecure,
            Proto::Ssh => false,
        };
        if needs_tls && tls.is_none() {
            return Err(ConfigError::MissingTls(cli.proto));
        }
        if cli.proto == Proto::Ssh && cli.ssh_private_key_file.is_none() {
            return Err(ConfigError::MissingSshKey);
        }
        if cli.tunnels_per_session == 0 {
            return Err(ConfigError::Zero("--tunnels-per-session"));
        }
        if cli.max_tunnels_per_session == 0 {
            return Err(ConfigError::Zero("--max-tunnels-per-session"));
        }
        if cli.tunnel_stream_soft_cap == 0 {
            return Err(ConfigError::Zero("--tunnel-stream-soft-cap"));
        }

        let shared_port = if cli.use_shared_port_forwarding {
            let tls = tls_pair(cli.shared_tls_cert_file, cli.shared_tls_private_key_file)
                .ok_or(ConfigError::MissingSharedTls)?;
            Some(SharedPortConfig {
                addr: SocketAddr::new(cli.bind_host, cli.shared_tls_forwarding_port),
                domain: cli
                    .shared_tls_domain
                    .unwrap_or_else(|| cluster_host(&cli.cluster_url)),
                tls,
            })
        } else {
            None
        };

        let node_id = cli
            .node_id
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

        Ok(ServerConfig {
            proto: cli.proto,
            listen_addr: SocketAddr::new(cli.bind_host, cli.port),
            ingress_bind: cli.bind_host,
            advertise_host: cli.localhost,
            node: NodeInfo {
                node_id,
                cluster: cli.cluster_url,
                region: cli.region,
            },
            redis_url: cli.redis_url,
            tls,
            ssh_private_key: cli.ssh_private_key_file,
            shared_port,
            insecure: cli.insecure,
            metrics_addr: SocketAddr::new(cli.bind_host, cli.metrics_api_port),
            session: SessionConfig {
                tunnels_per_session: cli.tunnels_per_session,
                max_tunnels: cli.max_tunnels_per_session.max(cli.tunnels_per_session),
                stream_soft_cap: cli.tunnel_stream_soft_cap,
                ping_timeout: Duration::from_secs(cli.ping_timeout_secs),
                conn_check_interval: Duration::from_millis(cli.conn_check_interval_ms.max(10)),
                tunnel_wait: Duration::from_secs(cli.tunnel_wait_secs),
                handshake_timeout: Duration::from_secs(cli.handshake_timeout_secs),
                forward_scheme: if cli.forward_https { "https" } else { "http" },
                ..SessionConfig::default()
            },
            rate_limit_per_minute: NonZeroU32::new(cli.rate_limit_per_minute),
            accept_deadline: Duration::from_secs(1),
        })
    }
}
