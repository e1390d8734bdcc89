use clap::Parser;
use tracing::level_filters::LevelFilter;

#[derive(Debug, Clone, Parser)]
pub struct ControllerConfig {
    /// Namespace the controller runs in; the write lease lives here.
    #[arg(short = 'n', long, env = "EEC_CONTROLLER_NAMESPACE", default_value = "linkerd")]
    pub controller_namespace: String,

    /// DNS zone of the cluster; destination hosts outside it are rejected.
    #[arg(long, env = "EEC_CLUSTER_DOMAIN", default_value = "cluster.local")]
    pub cluster_domain: String,

    #[arg(long, env = "EEC_GRPC_ADDR", default_value = "0.0.0.0:8086")]
    pub grpc_addr: std::net::SocketAddr,

    /// Serves /metrics, /healthz, /readyz and /gateways.
    #[arg(long, env = "EEC_ADMIN_ADDR", default_value = "0.0.0.0:9990")]
    pub admin_addr: std::net::SocketAddr,

    /// Number of concurrent workers draining the service queue.
    #[arg(long, env = "EEC_WORKERS", default_value = "1")]
    pub workers: usize,

    #[arg(long, env = "EEC_LOG_LEVEL", default_value = "INFO")]
    pub log_level: LevelFilter,
}

impl ControllerConfig {
    /// Lease holder identity. The pod hostname is unique per replica, which
    /// is what makes the lease hand-off observable.
    #[must_use]
    pub fn identity() -> String {
        std::env::var("HOSTNAME").unwrap_or_else(|_| "external-endpoints-controller".to_string())
    }
}
