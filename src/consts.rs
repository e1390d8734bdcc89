/// Identity written into the managed-by label of every slice we own.
pub const MANAGED_BY: &str = "linkerd-external-workloads-controller";

pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
// Kept in sync with MANAGED_BY_LABEL for readers that only understand the
// upstream endpointslice controller's marker.
pub const COMPAT_MANAGED_BY_LABEL: &str = "endpointslice.kubernetes.io/managed-by";

pub const LEASE_NAME: &str = "linkerd-destination-endpoint-write";

pub const MAX_ENDPOINTS_PER_SLICE: usize = 100;

/// Keys are retried through the rate limiter this many times before the
/// controller gives up on them.
pub const MAX_RETRY_BUDGET: u32 = 15;

// Mirror-service markers consumed by the gateway bookkeeping.
pub const MIRROR_SERVICE_LABEL: &str = "mirror.linkerd.io/mirrored-service";
pub const MIRROR_CLUSTER_LABEL: &str = "mirror.linkerd.io/cluster-name";
pub const GATEWAY_PROBE_PATH_ANN: &str = "mirror.linkerd.io/gateway-probe-path";
pub const GATEWAY_PROBE_PORT_ANN: &str = "mirror.linkerd.io/gateway-probe-port";
pub const GATEWAY_PROBE_PERIOD_ANN: &str = "mirror.linkerd.io/gateway-probe-period";
