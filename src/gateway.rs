use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use serde::Serialize;

use crate::cache::{EventHandler, HandlerRegistry};
use crate::consts;

/// Probe settings a gateway advertises on its mirror Services.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProbeSpec {
    pub path: String,
    pub port: u16,
    pub period_seconds: u32,
}

impl ProbeSpec {
    const DEFAULT_PATH: &'static str = "/ready";
    const DEFAULT_PORT: u16 = 4191;
    const DEFAULT_PERIOD: u32 = 3;

    fn from_annotations(annotations: &BTreeMap<String, String>) -> Self {
        let path = annotations
            .get(consts::GATEWAY_PROBE_PATH_ANN)
            .cloned()
            .unwrap_or_else(|| Self::DEFAULT_PATH.to_string());
        let port = annotations
            .get(consts::GATEWAY_PROBE_PORT_ANN)
            .and_then(|p| p.parse().ok())
            .unwrap_or(Self::DEFAULT_PORT);
        let period_seconds = annotations
            .get(consts::GATEWAY_PROBE_PERIOD_ANN)
            .and_then(|p| p.parse().ok())
            .unwrap_or(Self::DEFAULT_PERIOD);
        Self {
            path,
            port,
            period_seconds,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct GatewayAccount {
    pub cluster: String,
    pub probe: Option<ProbeSpec>,
    /// Mirrored Services exposed through this gateway, as namespace/name.
    pub services: HashSet<String>,
}

/// Per-cluster accounting of mirror Services created by a multicluster link.
/// A Service labelled as a mirror names its source cluster; the probe
/// annotations describe how the remote gateway is health-checked. The
/// registry only keeps books; probing itself happens elsewhere.
#[derive(Default)]
pub struct GatewayRegistry {
    by_cluster: Mutex<HashMap<String, GatewayAccount>>,
}

fn mirror_cluster(svc: &Service) -> Option<String> {
    let labels = svc.metadata.labels.as_ref()?;
    if !labels.contains_key(consts::MIRROR_SERVICE_LABEL) {
        return None;
    }
    labels.get(consts::MIRROR_CLUSTER_LABEL).cloned()
}

impl GatewayRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a Service add or update. Non-mirror Services fall through to
    /// `remove` so a label strip drops the accounting entry.
    pub fn apply(&self, svc: &Service) {
        let Some(cluster) = mirror_cluster(svc) else {
            self.remove(svc);
            return;
        };
        let key = format!(
            "{}/{}",
            svc.namespace().unwrap_or_default(),
            svc.name_any()
        );
        let probe = svc
            .metadata
            .annotations
            .as_ref()
            .map(|annotations| ProbeSpec::from_annotations(annotations));

        let mut by_cluster = self.by_cluster.lock().unwrap();
        // The same Service may have been re-linked to another cluster.
        for account in by_cluster.values_mut() {
            account.services.remove(&key);
        }
        let account = by_cluster.entry(cluster.clone()).or_insert_with(|| {
            GatewayAccount {
                cluster,
                ..Default::default()
            }
        });
        if let Some(probe) = probe {
            account.probe = Some(probe);
        }
        account.services.insert(key);
        by_cluster.retain(|_, account| !account.services.is_empty());
    }

    pub fn remove(&self, svc: &Service) {
        let key = format!(
            "{}/{}",
            svc.namespace().unwrap_or_default(),
            svc.name_any()
        );
        let mut by_cluster = self.by_cluster.lock().unwrap();
        for account in by_cluster.values_mut() {
            account.services.remove(&key);
        }
        by_cluster.retain(|_, account| !account.services.is_empty());
    }

    /// Snapshot of all accounts, ordered by cluster name.
    #[must_use]
    pub fn accounts(&self) -> Vec<GatewayAccount> {
        let by_cluster = self.by_cluster.lock().unwrap();
        let mut accounts: Vec<_> = by_cluster.values().cloned().collect();
        accounts.sort_by(|a, b| a.cluster.cmp(&b.cluster));
        accounts
    }

    /// Probe targets, one per linked cluster.
    #[must_use]
    pub fn probe_targets(&self) -> Vec<(String, ProbeSpec)> {
        self.accounts()
            .into_iter()
            .filter_map(|account| account.probe.map(|probe| (account.cluster, probe)))
            .collect()
    }

    /// Keeps the books current from Service events. Attached once at
    /// startup; bookkeeping is not leadership-gated.
    pub fn attach(self: &Arc<Self>, handlers: &HandlerRegistry<Service>) {
        handlers.attach(Arc::new(GatewayEvents(self.clone())));
    }
}

struct GatewayEvents(Arc<GatewayRegistry>);

impl EventHandler<Service> for GatewayEvents {
    fn on_add(&self, svc: &Service) {
        self.0.apply(svc);
    }
    fn on_update(&self, _old: &Service, new: &Service) {
        self.0.apply(new);
    }
    fn on_delete(&self, svc: &Service) {
        self.0.remove(svc);
    }
}
