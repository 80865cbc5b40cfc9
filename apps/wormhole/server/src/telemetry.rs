use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const SESSIONS_ACTIVE: &str = "wormhole_sessions_active";
pub const SESSIONS_TOTAL: &str = "wormhole_sessions_total";
pub const TUNNELS_INSERTED_TOTAL: &str = "wormhole_tunnels_inserted_total";
pub const AUTH_FAILURES_TOTAL: &str = "wormhole_auth_failures_total";
pub const PROXY_REQUESTS_TOTAL: &str = "wormhole_proxy_requests_total";
pub const HEARTBEAT_TIMEOUTS_TOTAL: &str = "wormhole_heartbeat_timeouts_total";
pub const RATE_LIMITED_TOTAL: &str = "wormhole_rate_limited_total";

pub struct Telemetry {
    metrics_handle: PrometheusHandle,
}

impl Telemetry {
    pub fn init() -> Result<Self> {
        let metrics_handle = PrometheusBuilder::new()
            .install_recorder()
            .context("failed to install Prometheus metrics recorder")?;

        tracing_subscriber::registry()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init()
            .context("failed to initialise tracing subscriber")?;

        Ok(Self { metrics_handle })
    }

    pub fn metrics_handle(&self) -> PrometheusHandle {
        self.metrics_handle.clone()
    }
}
