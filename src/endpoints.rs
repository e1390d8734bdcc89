use std::collections::BTreeMap;
use std::net::IpAddr;

use k8s_openapi::api::core::v1::{Service, ServicePort};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::crd::ExternalWorkload;

pub const DEFAULT_PROTOCOL: &str = "TCP";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AddressType {
    Ipv4,
    Ipv6,
}

impl AddressType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ipv4 => "IPv4",
            Self::Ipv6 => "IPv6",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "IPv4" => Some(Self::Ipv4),
            "IPv6" => Some(Self::Ipv6),
            _ => None,
        }
    }

    #[must_use]
    pub const fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::Ipv4,
            IpAddr::V6(_) => Self::Ipv6,
        }
    }
}

/// One port a slice serves: the Service port's name, the target port it
/// resolved to on the workloads, and the protocol.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortEntry {
    pub name: Option<String>,
    pub port: i32,
    pub protocol: String,
}

/// Canonically ordered, deduplicated port set.
#[must_use]
pub fn canonical_ports(mut ports: Vec<PortEntry>) -> Vec<PortEntry> {
    ports.sort();
    ports.dedup();
    ports
}

/// Equivalence class of endpoints sharing an address family and a resolved
/// port set; each bucket maps onto one or more slices.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProfileKey {
    pub address_type: AddressType,
    pub ports: Vec<PortEntry>,
}

/// Identity of an endpoint within a Service: no endpoint key may appear in
/// more than one slice.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointKey {
    pub address_type: AddressType,
    pub address: String,
    pub uid: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DesiredEndpoint {
    pub address: String,
    pub address_type: AddressType,
    pub ready: bool,
    pub target_name: String,
    pub target_uid: String,
}

pub type DesiredBuckets = BTreeMap<ProfileKey, BTreeMap<EndpointKey, DesiredEndpoint>>;

fn service_protocol(port: &ServicePort) -> String {
    port.protocol
        .clone()
        .unwrap_or_else(|| DEFAULT_PROTOCOL.to_string())
}

/// Resolves a Service port's target against a workload. A named target
/// matches the workload port carrying that name; a numeric target matches a
/// workload port number literally. No match means the port contributes no
/// endpoints for this workload.
#[must_use]
pub fn resolve_target_port(port: &ServicePort, workload: &ExternalWorkload) -> Option<PortEntry> {
    let target = port
        .target_port
        .clone()
        .unwrap_or(IntOrString::Int(port.port));
    let resolved = match &target {
        IntOrString::String(name) => workload
            .ports()
            .iter()
            .find(|p| p.name.as_deref() == Some(name.as_str()))
            .map(|p| i32::from(p.port.get())),
        IntOrString::Int(number) => workload
            .ports()
            .iter()
            .find(|p| i32::from(p.port.get()) == *number)
            .map(|p| i32::from(p.port.get())),
    }?;
    Some(PortEntry {
        name: port.name.clone(),
        port: resolved,
        protocol: service_protocol(port),
    })
}

/// Computes the desired endpoint set for one Service, grouped into profile
/// buckets. Workloads with no addresses or no ports are dropped; addresses
/// of both families on one workload land in separate buckets.
#[must_use]
pub fn desired_endpoints(svc: &Service, workloads: &[ExternalWorkload]) -> DesiredBuckets {
    let mut buckets = DesiredBuckets::new();
    let svc_ports = svc
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .cloned()
        .unwrap_or_default();

    for workload in workloads {
        if !workload.is_selectable() {
            continue;
        }
        let ports = canonical_ports(
            svc_ports
                .iter()
                .filter_map(|port| resolve_target_port(port, workload))
                .collect(),
        );
        if ports.is_empty() {
            continue;
        }
        let ready = workload.is_ready();
        let uid = workload.metadata.uid.clone().unwrap_or_default();
        let name = workload.name_any();

        for workload_ip in workload.workload_ips() {
            let Ok(addr) = workload_ip.ip.parse::<IpAddr>() else {
                tracing::warn!(
                    workload = %name,
                    ip = %workload_ip.ip,
                    "Skipping workload address that does not parse",
                );
                continue;
            };
            let address_type = AddressType::of(&addr);
            let key = EndpointKey {
                address_type,
                address: addr.to_string(),
                uid: uid.clone(),
            };
            buckets
                .entry(ProfileKey {
                    address_type,
                    ports: ports.clone(),
                })
                .or_default()
                .insert(
                    key,
                    DesiredEndpoint {
                        address: addr.to_string(),
                        address_type,
                        ready,
                        target_name: name.clone(),
                        target_uid: uid.clone(),
                    },
                );
        }
    }
    buckets
}
