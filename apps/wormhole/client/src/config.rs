use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use thiserror::Error;
use wormhole_core::{Release, DEFAULT_PING_INTERVAL, DEFAULT_PONG_TIMEOUT};

use crate::release::{self, ReleaseVars};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Proto {
    Ssh,
    Tcp,
    Http2,
}

#[derive(Debug, Parser)]
#[command(
    name = "wormhole-agent",
    author,
    version,
    about = "Exposes a local service through a wormhole server"
)]
pub struct Cli {
    /// Backend token issued by the wormhole operator.
    #[arg(long, env = "WORMHOLE_TOKEN", hide_env_values = true)]
    pub token: String,

    /// Transport spoken with the server; must match the server's.
    #[arg(long, env = "WORMHOLE_PROTO", value_enum, default_value_t = Proto::Http2)]
    pub proto: Proto,

    /// Server address as host:port.
    #[arg(long, env = "WORMHOLE_REMOTE_ENDPOINT", default_value = "localhost:10000")]
    pub remote_endpoint: String,

    /// Name checked against the server certificate. Defaults to the remote host.
    #[arg(long, env = "WORMHOLE_SERVER_NAME")]
    pub server_name: Option<String>,

    /// PEM bundle trusted for the server certificate instead of the web PKI roots.
    #[arg(long, env = "WORMHOLE_CA_FILE")]
    pub ca_file: Option<PathBuf>,

    /// Talk to the server without TLS (tcp transport only).
    #[arg(long, env = "WORMHOLE_INSECURE", default_value_t = false)]
    pub insecure: bool,

    /// Port of the local service, also passed to a supervised program as PORT.
    #[arg(long, env = "PORT", default_value_t = 5000)]
    pub port: u16,

    /// Local service address; defaults to 127.0.0.1:<port>.
    #[arg(long, env = "WORMHOLE_LOCAL_ENDPOINT")]
    pub local_endpoint: Option<String>,

    /// Connect to the local service over TLS.
    #[arg(long, env = "WORMHOLE_LOCAL_ENDPOINT_USE_TLS", default_value_t = false)]
    pub local_endpoint_use_tls: bool,

    /// PEM bundle trusted for the local service certificate.
    #[arg(long, env = "WORMHOLE_LOCAL_CA_FILE")]
    pub local_ca_file: Option<PathBuf>,

    /// Environment variable holding the release id.
    #[arg(long, env = "WORMHOLE_RELEASE_ID_VAR", default_value = "WORMHOLE_RELEASE_ID")]
    pub release_id_var: String,

    #[arg(long, env = "WORMHOLE_RELEASE_DESC_VAR", default_value = "WORMHOLE_RELEASE_DESC")]
    pub release_desc_var: String,

    #[arg(long, env = "WORMHOLE_RELEASE_BRANCH_VAR", default_value = "WORMHOLE_RELEASE_BRANCH")]
    pub release_branch_var: String,

    #[arg(long, env = "WORMHOLE_PING_INTERVAL_SECS", default_value_t = DEFAULT_PING_INTERVAL.as_secs())]
    pub ping_interval_secs: u64,

    /// Control connection is dropped after this long without a Pong.
    #[arg(long, env = "WORMHOLE_PONG_TIMEOUT_SECS", default_value_t = DEFAULT_PONG_TIMEOUT.as_secs())]
    pub pong_timeout_secs: u64,

    /// How long a supervised program gets to start listening on PORT.
    #[arg(long, env = "WORMHOLE_STARTUP_TIMEOUT_SECS", default_value_t = 60)]
    pub startup_timeout_secs: u64,

    /// Program to run and expose, given after `--`.
    #[arg(last = true)]
    pub command: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("--insecure cannot be used with the {0:?} transport")]
    Insecure(Proto),
    #[error("remote endpoint {0:?} is not host:port")]
    RemoteEndpoint(String),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub proto: Proto,
    pub token: String,
    pub remote_endpoint: String,
    pub server_name: String,
    pub ca_file: Option<PathBuf>,
    pub insecure: bool,
    pub port: u16,
    pub local_endpoint: String,
    pub local_endpoint_use_tls: bool,
    pub local_ca_file: Option<PathBuf>,
    pub release: Option<Release>,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub startup_timeout: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub command: Vec<String>,
}

impl AgentConfig {
    /// A configuration for an agent of `proto` reaching `remote_endpoint`
    /// with defaults for everything else.
    pub fn new(
        proto: Proto,
        token: impl Into<String>,
        remote_endpoint: impl Into<String>,
        local_endpoint: impl Into<String>,
    ) -> Self {
        let remote_endpoint = remote_endpoint.into();
        Self {
            proto,
            token: token.into(),
            server_name: remote_host(&remote_endpoint).unwrap_or("localhost").to_string(),
            remote_endpoint,
            ca_file: None,
            insecure: false,
            port: 0,
            local_endpoint: local_endpoint.into(),
            local_endpoint_use_tls: false,
            local_ca_file: None,
            release: None,
            ping_interval: DEFAULT_PING_INTERVAL,
            pong_timeout: DEFAULT_PONG_TIMEOUT,
            startup_timeout: Duration::from_secs(60),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(120),
            command: Vec::new(),
        }
    }

    /// Host part of the local endpoint, used as the TLS server name.
    pub fn local_host(&self) -> &str {
        remote_host(&self.local_endpoint).unwrap_or("localhost")
    }
}

/// Host of a `host:port` pair, without IPv6 brackets.
fn remote_host(endpoint: &str) -> Option<&str> {
    let (host, port) = endpoint.rsplit_once(':')?;
    port.parse::<u16>().ok()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    (!host.is_empty()).then_some(host)
}

impl TryFrom<Cli> for AgentConfig {
    type Error = ConfigError;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        if cli.insecure && cli.proto != Proto::Tcp {
            return Err(ConfigError::Insecure(cli.proto));
        }
        let host = remote_host(&cli.remote_endpoint)
            .ok_or_else(|| ConfigError::RemoteEndpoint(cli.remote_endpoint.clone()))?
            .to_string();
        if cli.ping_interval_secs == 0 {
            return Err(ConfigError::Zero("--ping-interval-secs"));
        }
        if cli.pong_timeout_secs == 0 {
            return Err(ConfigError::Zero("--pong-timeout-secs"));
        }

        let vars = ReleaseVars {
            id: cli.release_id_var,
            description: cli.release_desc_var,
            branch: cli.release_branch_var,
        };
        let release = release::from_env(&vars);

        Ok(AgentConfig {
            proto: cli.proto,
            token: cli.token,
            remote_endpoint: cli.remote_endpoint,
            server_name: cli.server_name.unwrap_or(host),
            ca_file: cli.ca_file,
            insecure: cli.insecure,
            port: cli.port,
            local_endpoint: cli
                .local_endpoint
                .unwrap_or_else(|| format!("127.0.0.1:{}", cli.port)),
            local_endpoint_use_tls: cli.local_endpoint_use_tls,
            local_ca_file: cli.local_ca_file,
            release,
            ping_interval: Duration::from_secs(cli.ping_interval_secs),
            pong_timeout: Duration::from_secs(cli.pong_timeout_secs),
            startup_timeout: Duration::from_secs(cli.startup_timeout_secs),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(120),
            command: cli.command,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<AgentConfig, ConfigError> {
        let mut argv = vec!["wormhole-agent", "--token", "fly_token"];
        argv.extend_from_slice(args);
        AgentConfig::try_from(Cli::parse_from(argv))
    }

    #[test]
    fn defaults_point_at_local_port() {
        let config = parse(&["--remote-endpoint", "wormhole.example:10000", "--port", "8080"]).unwrap();
        assert_eq!(config.proto, Proto::Http2);
        assert_eq!(config.server_name, "wormhole.example");
        assert_eq!(config.local_endpoint, "127.0.0.1:8080");
        assert_eq!(config.ping_interval, Duration::from_secs(5));
        assert_eq!(config.pong_timeout, Duration::from_secs(15));
        assert!(config.command.is_empty());
    }

    #[test]
    fn program_follows_double_dash() {
        let config = parse(&["--", "python3", "-m", "http.server"]).unwrap();
        assert_eq!(config.command, vec!["python3", "-m", "http.server"]);
    }

    #[test]
    fn insecure_is_only_for_tcp() {
        assert!(matches!(
            parse(&["--insecure"]),
            Err(ConfigError::Insecure(Proto::Http2))
        ));
        assert!(parse(&["--insecure", "--proto", "tcp"]).is_ok());
    }

    #[test]
    fn remote_endpoint_needs_a_port() {
        assert!(matches!(
            parse(&["--remote-endpoint", "wormhole.example"]),
            Err(ConfigError::RemoteEndpoint(_))
        ));
        let config = parse(&["--remote-endpoint", "[::1]:10000"]).unwrap();
        assert_eq!(config.server_name, "::1");
    }
}
