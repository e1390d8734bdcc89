use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// ExternalWorkload describes a single deployable unit running outside of
/// the cluster (typically a virtual machine) that is enrolled in the mesh
/// and exposed through in-cluster Services.
#[derive(Clone, Debug, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "workload.linkerd.io",
    version = "v1beta1",
    kind = "ExternalWorkload",
    status = "ExternalWorkloadStatus",
    namespaced
)]
pub struct ExternalWorkloadSpec {
    /// MeshTls describes TLS settings associated with an external workload.
    #[serde(rename = "meshTLS")]
    pub mesh_tls: Option<MeshTls>,
    /// Ports describes a set of ports exposed by the workload.
    pub ports: Option<Vec<PortSpec>>,
    /// List of IP addresses that can be used to send traffic to the
    /// workload.
    #[serde(rename = "workloadIPs")]
    pub workload_ips: Option<Vec<WorkloadIP>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct MeshTls {
    /// Identity associated with the workload, verified by peers during the
    /// mTLS handshake.
    pub identity: String,
    /// DNS name used to terminate TLS with the SNI extension.
    #[serde(rename = "serverName")]
    pub server_name: String,
}

/// A network port exposed on each of the workload's IP addresses.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct PortSpec {
    /// If set, must be an IANA_SVC_NAME unique within the workload's port
    /// set. Services may refer to the port by this name.
    pub name: Option<String>,
    /// Must be a valid port number, 0 < x < 65536.
    pub port: std::num::NonZeroU16,
    /// One of UDP, TCP, or SCTP. Defaults to TCP when unset.
    pub protocol: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct WorkloadIP {
    pub ip: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct ExternalWorkloadStatus {
    pub conditions: Vec<WorkloadCondition>,
}

/// WorkloadCondition represents the service state of an ExternalWorkload.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadCondition {
    #[serde(rename = "type")]
    pub typ: String,
    /// Can be True, False, Unknown.
    pub status: ConditionStatus,
    pub last_transition_time: Option<Time>,
    pub last_probe_time: Option<Time>,
    /// Unique one-word CamelCase reason for the last transition.
    pub reason: Option<String>,
    pub message: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl ExternalWorkload {
    /// A workload is ready iff it carries a `Ready` condition with status
    /// `True`. No condition means not ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.status
            .as_ref()
            .map(|status| {
                status
                    .conditions
                    .iter()
                    .any(|c| c.typ == "Ready" && c.status == ConditionStatus::True)
            })
            .unwrap_or(false)
    }

    #[must_use]
    pub fn workload_ips(&self) -> &[WorkloadIP] {
        self.spec.workload_ips.as_deref().unwrap_or_default()
    }

    #[must_use]
    pub fn ports(&self) -> &[PortSpec] {
        self.spec.ports.as_deref().unwrap_or_default()
    }

    /// Workloads with no addresses or no ports never produce endpoints, even
    /// when ready.
    #[must_use]
    pub fn is_selectable(&self) -> bool {
        !self.workload_ips().is_empty() && !self.ports().is_empty()
    }
}

/// ServiceProfile provides per-service routing configuration consumed by the
/// profile half of the discovery API.
#[derive(Clone, Debug, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema, Default)]
#[kube(
    group = "linkerd.io",
    version = "v1alpha2",
    kind = "ServiceProfile",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceProfileSpec {
    pub routes: Option<Vec<RouteSpec>>,
    pub retry_budget: Option<RetryBudget>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpec {
    pub name: String,
    pub condition: Option<RequestMatch>,
    pub is_retryable: Option<bool>,
    /// Per-request timeout, e.g. "10s".
    pub timeout: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RequestMatch {
    pub method: Option<String>,
    pub path_regex: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RetryBudget {
    pub retry_ratio: f32,
    pub min_retries_per_second: u32,
    /// Window over which retries are budgeted, e.g. "10s".
    pub ttl: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ObjectMeta;

    fn workload(conditions: Option<Vec<WorkloadCondition>>) -> ExternalWorkload {
        ExternalWorkload {
            metadata: ObjectMeta {
                name: Some("w1".to_string()),
                namespace: Some("shop".to_string()),
                ..Default::default()
            },
            spec: ExternalWorkloadSpec {
                mesh_tls: None,
                ports: Some(vec![PortSpec {
                    name: Some("http".to_string()),
                    port: 8080.try_into().unwrap(),
                    protocol: None,
                }]),
                workload_ips: Some(vec![WorkloadIP {
                    ip: "10.0.0.1".to_string(),
                }]),
            },
            status: conditions.map(|conditions| ExternalWorkloadStatus { conditions }),
        }
    }

    fn ready_condition(status: ConditionStatus) -> WorkloadCondition {
        WorkloadCondition {
            typ: "Ready".to_string(),
            status,
            last_transition_time: None,
            last_probe_time: None,
            reason: None,
            message: None,
        }
    }

    #[test]
    fn ready_requires_true_condition() {
        assert!(workload(Some(vec![ready_condition(ConditionStatus::True)])).is_ready());
        assert!(!workload(Some(vec![ready_condition(ConditionStatus::False)])).is_ready());
        assert!(!workload(Some(vec![ready_condition(ConditionStatus::Unknown)])).is_ready());
    }

    #[test]
    fn missing_status_means_not_ready() {
        assert!(!workload(None).is_ready());
        assert!(!workload(Some(vec![])).is_ready());
    }

    #[test]
    fn unrelated_conditions_are_ignored() {
        let mut cond = ready_condition(ConditionStatus::True);
        cond.typ = "Registered".to_string();
        assert!(!workload(Some(vec![cond])).is_ready());
    }

    #[test]
    fn selectable_requires_ips_and_ports() {
        let mut w = workload(None);
        assert!(w.is_selectable());
        w.spec.workload_ips = Some(vec![]);
        assert!(!w.is_selectable());
        w = workload(None);
        w.spec.ports = None;
        assert!(!w.is_selectable());
    }
}
