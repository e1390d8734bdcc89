use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use k8s_openapi::api::core::v1::{ObjectReference, Service};
use k8s_openapi::api::discovery::v1::{
    Endpoint, EndpointConditions, EndpointPort, EndpointSlice,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, PostParams};
use kube::core::ObjectMeta;
use kube::ResourceExt;

use crate::consts;
use crate::endpoints::{
    canonical_ports, desired_endpoints, AddressType, DesiredBuckets, DesiredEndpoint,
    EndpointKey, PortEntry, ProfileKey,
};
use crate::error::Result;
use crate::tracker::EndpointSliceTracker;

/// Writes required to bring a Service's slices in line with the desired
/// endpoint set. Applied delete → update → create so a per-Service cap can
/// never be transiently exceeded.
#[derive(Debug, Default)]
pub struct SlicePlan {
    pub to_create: Vec<EndpointSlice>,
    pub to_update: Vec<EndpointSlice>,
    pub to_delete: Vec<EndpointSlice>,
}

impl SlicePlan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }
}

#[must_use]
pub fn owned_labels(service: &str) -> BTreeMap<String, String> {
    [
        (consts::SERVICE_NAME_LABEL.to_string(), service.to_string()),
        (consts::MANAGED_BY_LABEL.to_string(), consts::MANAGED_BY.to_string()),
        (
            consts::COMPAT_MANAGED_BY_LABEL.to_string(),
            consts::MANAGED_BY.to_string(),
        ),
    ]
    .into()
}

fn slice_profile(slice: &EndpointSlice) -> Option<ProfileKey> {
    let address_type = AddressType::parse(&slice.address_type)?;
    let ports = canonical_ports(
        slice
            .ports
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|port| PortEntry {
                name: port.name.clone(),
                port: port.port.unwrap_or_default(),
                protocol: port
                    .protocol
                    .clone()
                    .unwrap_or_else(|| crate::endpoints::DEFAULT_PROTOCOL.to_string()),
            })
            .collect(),
    );
    Some(ProfileKey {
        address_type,
        ports,
    })
}

fn endpoint_key(address_type: AddressType, endpoint: &Endpoint) -> Option<EndpointKey> {
    let address = endpoint.addresses.first()?.clone();
    let uid = endpoint
        .target_ref
        .as_ref()
        .and_then(|r| r.uid.clone())
        .unwrap_or_default();
    Some(EndpointKey {
        address_type,
        address,
        uid,
    })
}

// Comparable shape of one endpoint; two slices with equal normal forms need
// no write.
type NormalEndpoint = (EndpointKey, bool, String);

fn normalize(address_type: AddressType, endpoints: &[Endpoint]) -> Option<Vec<NormalEndpoint>> {
    let mut normal = endpoints
        .iter()
        .map(|ep| {
            let key = endpoint_key(address_type, ep)?;
            let ready = ep
                .conditions
                .as_ref()
                .and_then(|c| c.ready)
                .unwrap_or(false);
            let name = ep
                .target_ref
                .as_ref()
                .and_then(|r| r.name.clone())
                .unwrap_or_default();
            Some((key, ready, name))
        })
        .collect::<Option<Vec<_>>>()?;
    normal.sort();
    Some(normal)
}

fn make_endpoint(namespace: &str, desired: &DesiredEndpoint) -> Endpoint {
    Endpoint {
        addresses: vec![desired.address.clone()],
        conditions: Some(EndpointConditions {
            ready: Some(desired.ready),
            // External workloads carry no deletion grace state, so serving
            // mirrors ready and nothing ever terminates.
            serving: Some(desired.ready),
            terminating: Some(false),
        }),
        target_ref: Some(ObjectReference {
            kind: Some("ExternalWorkload".to_string()),
            name: Some(desired.target_name.clone()),
            namespace: Some(namespace.to_string()),
            uid: Some(desired.target_uid.clone()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn new_slice(
    svc: &Service,
    profile: &ProfileKey,
    endpoints: Vec<Endpoint>,
) -> EndpointSlice {
    let name = svc.name_any();
    let owner_references = svc.metadata.uid.clone().map(|uid| {
        vec![OwnerReference {
            api_version: "v1".to_string(),
            kind: "Service".to_string(),
            name: name.clone(),
            uid,
            controller: Some(true),
            block_owner_deletion: Some(true),
        }]
    });
    EndpointSlice {
        metadata: ObjectMeta {
            generate_name: Some(format!("{name}-")),
            namespace: svc.metadata.namespace.clone(),
            labels: Some(owned_labels(&name)),
            owner_references,
            ..Default::default()
        },
        address_type: profile.address_type.as_str().to_string(),
        ports: Some(
            profile
                .ports
                .iter()
                .map(|port| EndpointPort {
                    name: port.name.clone(),
                    port: Some(port.port),
                    protocol: Some(port.protocol.clone()),
                    app_protocol: None,
                })
                .collect(),
        ),
        endpoints,
    }
}

/// Diffs the desired buckets against the slices the controller currently
/// owns for one Service. Ordering is stable throughout, so planning twice
/// over an unchanged state yields an empty plan the second time.
#[must_use]
pub fn plan(svc: &Service, desired: &DesiredBuckets, existing: Vec<EndpointSlice>) -> SlicePlan {
    let namespace = svc.namespace().unwrap_or_default();
    let mut out = SlicePlan::default();

    // Pair slices with desired buckets by profile; everything that matches
    // no bucket is an orphan.
    let mut by_profile: BTreeMap<ProfileKey, Vec<EndpointSlice>> = BTreeMap::new();
    for slice in existing {
        match slice_profile(&slice) {
            Some(profile) if desired.contains_key(&profile) => {
                by_profile.entry(profile).or_default().push(slice);
            }
            _ => out.to_delete.push(slice),
        }
    }

    for (profile, endpoints) in desired {
        let mut slices = by_profile.remove(profile).unwrap_or_default();
        slices.sort_by_key(|slice| slice.name_any());

        // First pass: keep endpoints where they already live. A key claimed
        // by one slice is never repeated in a later one.
        let mut assigned: BTreeSet<EndpointKey> = BTreeSet::new();
        let mut retained: Vec<(EndpointSlice, Vec<EndpointKey>)> = Vec::new();
        for slice in slices {
            let mut keys = Vec::new();
            for endpoint in &slice.endpoints {
                if keys.len() == consts::MAX_ENDPOINTS_PER_SLICE {
                    // Over-quota slices shed the excess to other slices.
                    break;
                }
                if let Some(key) = endpoint_key(profile.address_type, endpoint) {
                    if endpoints.contains_key(&key) && assigned.insert(key.clone()) {
                        keys.push(key);
                    }
                }
            }
            retained.push((slice, keys));
        }

        let mut remaining: VecDeque<EndpointKey> = endpoints
            .keys()
            .filter(|key| !assigned.contains(*key))
            .cloned()
            .collect();

        // Second pass: top up partially-filled slices, smallest name first.
        for (_, keys) in &mut retained {
            while keys.len() < consts::MAX_ENDPOINTS_PER_SLICE {
                let Some(key) = remaining.pop_front() else {
                    break;
                };
                keys.push(key);
            }
        }

        for (slice, mut keys) in retained {
            if keys.is_empty() {
                out.to_delete.push(slice);
                continue;
            }
            keys.sort();
            let next: Vec<Endpoint> = keys
                .iter()
                .map(|key| make_endpoint(&namespace, &endpoints[key]))
                .collect();
            let unchanged = normalize(profile.address_type, &slice.endpoints)
                .is_some_and(|old| Some(old) == normalize(profile.address_type, &next));
            if unchanged {
                continue;
            }
            let mut updated = slice;
            updated.endpoints = next;
            out.to_update.push(updated);
        }

        // Whatever did not fit goes into fresh slices, quota-sized.
        while !remaining.is_empty() {
            let take = remaining.len().min(consts::MAX_ENDPOINTS_PER_SLICE);
            let chunk: Vec<Endpoint> = remaining
                .drain(..take)
                .map(|key| make_endpoint(&namespace, &endpoints[&key]))
                .collect();
            out.to_create.push(new_slice(svc, profile, chunk));
        }
    }

    out
}

/// Applies a plan and keeps the tracker consistent with every write that
/// succeeded; the first failure is returned and the key retried.
pub struct Reconciler {
    client: kube::Client,
    tracker: Arc<EndpointSliceTracker>,
}

impl Reconciler {
    #[must_use]
    pub fn new(client: kube::Client, tracker: Arc<EndpointSliceTracker>) -> Self {
        Self { client, tracker }
    }

    #[tracing::instrument(skip_all, fields(service = %svc.name_any()))]
    pub async fn reconcile(
        &self,
        svc: &Service,
        workloads: &[crate::crd::ExternalWorkload],
        existing: Vec<EndpointSlice>,
    ) -> Result<()> {
        let desired = desired_endpoints(svc, workloads);
        let plan = plan(svc, &desired, existing);
        if plan.is_empty() {
            tracing::debug!("Slices already match the desired endpoint set");
            return Ok(());
        }
        tracing::info!(
            creates = plan.to_create.len(),
            updates = plan.to_update.len(),
            deletes = plan.to_delete.len(),
            "Writing slice changes",
        );
        self.apply(&svc.namespace().unwrap_or_default(), plan).await
    }

    async fn apply(&self, namespace: &str, plan: SlicePlan) -> Result<()> {
        let api: Api<EndpointSlice> = Api::namespaced(self.client.clone(), namespace);
        for slice in plan.to_delete {
            self.tracker.expect_deletion(&slice);
            api.delete(&slice.name_any(), &DeleteParams::default()).await?;
        }
        for slice in plan.to_update {
            let written = api
                .replace(&slice.name_any(), &PostParams::default(), &slice)
                .await?;
            self.tracker.expect(&written);
        }
        for slice in plan.to_create {
            let written = api.create(&PostParams::default(), &slice).await?;
            self.tracker.expect(&written);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoints::fixtures::{service, service_port, workload};
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

    fn http_service() -> Service {
        service("api", vec![service_port("http", 80, IntOrString::Int(8080))])
    }

    // Gives planned creations a server-assigned name and RV so they can be
    // fed back in as the observed state.
    fn materialize(plan: SlicePlan, start: usize) -> Vec<EndpointSlice> {
        plan.to_create
            .into_iter()
            .enumerate()
            .map(|(i, mut slice)| {
                let base = slice.metadata.generate_name.clone().unwrap();
                slice.metadata.name = Some(format!("{base}{:05}", start + i));
                slice.metadata.resource_version = Some("1".to_string());
                slice
            })
            .chain(plan.to_update)
            .collect()
    }

    #[test]
    fn single_workload_yields_one_slice() {
        let svc = http_service();
        let workloads = vec![workload("w1", &["10.0.0.1"], &[(Some("http"), 8080)], true)];
        let desired = desired_endpoints(&svc, &workloads);
        let plan = plan(&svc, &desired, vec![]);

        assert_eq!(plan.to_create.len(), 1);
        assert!(plan.to_update.is_empty() && plan.to_delete.is_empty());

        let slice = &plan.to_create[0];
        assert_eq!(slice.address_type, "IPv4");
        assert_eq!(slice.metadata.generate_name.as_deref(), Some("api-"));
        let labels = slice.metadata.labels.as_ref().unwrap();
        assert_eq!(labels[consts::SERVICE_NAME_LABEL], "api");
        assert_eq!(labels[consts::MANAGED_BY_LABEL], consts::MANAGED_BY);

        let ports = slice.ports.as_ref().unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].port, Some(8080));
        assert_eq!(ports[0].name.as_deref(), Some("http"));

        assert_eq!(slice.endpoints.len(), 1);
        let ep = &slice.endpoints[0];
        assert_eq!(ep.addresses, vec!["10.0.0.1".to_string()]);
        let conditions = ep.conditions.as_ref().unwrap();
        assert_eq!(conditions.ready, Some(true));
        assert_eq!(conditions.serving, Some(true));
        assert_eq!(conditions.terminating, Some(false));
        let target = ep.target_ref.as_ref().unwrap();
        assert_eq!(target.kind.as_deref(), Some("ExternalWorkload"));
        assert_eq!(target.name.as_deref(), Some("w1"));
    }

    #[test]
    fn second_reconcile_plans_nothing() {
        let svc = http_service();
        let workloads = vec![
            workload("w1", &["10.0.0.1"], &[(Some("http"), 8080)], true),
            workload("w2", &["10.0.0.2"], &[(Some("http"), 8080)], false),
        ];
        let desired = desired_endpoints(&svc, &workloads);
        let first = plan(&svc, &desired, vec![]);
        assert!(!first.is_empty());

        let observed = materialize(first, 0);
        let second = plan(&svc, &desired, observed);
        assert!(second.is_empty(), "repeat reconcile must write nothing");
    }

    #[test]
    fn quota_overflow_splits_deterministically() {
        let svc = http_service();
        let workloads: Vec<_> = (0..101)
            .map(|i| {
                let ip = format!("10.0.{}.{}", i / 256, i % 256);
                workload(
                    &format!("w{i:03}"),
                    &[ip.as_str()],
                    &[(Some("http"), 8080)],
                    true,
                )
            })
            .collect();
        let desired = desired_endpoints(&svc, &workloads);
        let plan_a = plan(&svc, &desired, vec![]);

        assert_eq!(plan_a.to_create.len(), 2);
        let mut sizes: Vec<_> = plan_a.to_create.iter().map(|s| s.endpoints.len()).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![1, consts::MAX_ENDPOINTS_PER_SLICE]);

        // Same inputs partition the same way.
        let plan_b = plan(&svc, &desired, vec![]);
        let first_a: Vec<_> = plan_a.to_create[0]
            .endpoints
            .iter()
            .map(|e| e.addresses[0].clone())
            .collect();
        let first_b: Vec<_> = plan_b.to_create[0]
            .endpoints
            .iter()
            .map(|e| e.addresses[0].clone())
            .collect();
        assert_eq!(first_a, first_b);
    }

    #[test]
    fn address_families_split_slices() {
        let svc = http_service();
        let workloads = vec![
            workload("w1", &["10.0.0.1"], &[(Some("http"), 8080)], true),
            workload("w2", &["10.0.0.2", "2001:db8::2"], &[(Some("http"), 8080)], true),
        ];
        let desired = desired_endpoints(&svc, &workloads);
        let plan = plan(&svc, &desired, vec![]);

        assert_eq!(plan.to_create.len(), 2);
        let v4 = plan
            .to_create
            .iter()
            .find(|s| s.address_type == "IPv4")
            .unwrap();
        let v6 = plan
            .to_create
            .iter()
            .find(|s| s.address_type == "IPv6")
            .unwrap();
        assert_eq!(v4.endpoints.len(), 2);
        assert_eq!(v6.endpoints.len(), 1);
    }

    #[test]
    fn ready_flip_updates_in_place() {
        let svc = http_service();
        let up = vec![workload("w1", &["10.0.0.1"], &[(Some("http"), 8080)], true)];
        let desired_up = desired_endpoints(&svc, &up);
        let observed = materialize(plan(&svc, &desired_up, vec![]), 0);
        let slice_name = observed[0].name_any();

        // Ready goes false: same slice, same membership, flipped condition.
        let down = vec![workload("w1", &["10.0.0.1"], &[(Some("http"), 8080)], false)];
        let desired_down = desired_endpoints(&svc, &down);
        let flip = plan(&svc, &desired_down, observed);
        assert!(flip.to_create.is_empty() && flip.to_delete.is_empty());
        assert_eq!(flip.to_update.len(), 1);
        assert_eq!(flip.to_update[0].name_any(), slice_name);
        let ep = &flip.to_update[0].endpoints[0];
        assert_eq!(ep.conditions.as_ref().unwrap().ready, Some(false));
        assert_eq!(ep.addresses, vec!["10.0.0.1".to_string()]);

        // Flip back: membership identical to the initial state again.
        let observed = materialize(
            SlicePlan {
                to_update: flip.to_update,
                ..Default::default()
            },
            0,
        );
        let restore = plan(&svc, &desired_up, observed);
        assert_eq!(restore.to_update.len(), 1);
        assert!(restore.to_create.is_empty() && restore.to_delete.is_empty());
        assert_eq!(
            restore.to_update[0].endpoints[0]
                .conditions
                .as_ref()
                .unwrap()
                .ready,
            Some(true)
        );
    }

    #[test]
    fn orphan_profiles_are_deleted() {
        // Named target: the resolved port follows the workload's declaration.
        let svc = service(
            "api",
            vec![service_port("http", 80, IntOrString::String("http".to_string()))],
        );
        let old = vec![workload("w1", &["10.0.0.1"], &[(Some("http"), 9090)], true)];
        let observed = materialize(plan(&svc, &desired_endpoints(&svc, &old), vec![]), 0);
        assert_eq!(observed.len(), 1);

        // The workload's resolved port moved; the old profile has no bucket.
        let new = vec![workload("w1", &["10.0.0.1"], &[(Some("http"), 8080)], true)];
        let shift = plan(&svc, &desired_endpoints(&svc, &new), observed);
        assert_eq!(shift.to_delete.len(), 1);
        assert_eq!(shift.to_create.len(), 1);
    }

    #[test]
    fn no_matching_workloads_deletes_every_slice() {
        let svc = http_service();
        let workloads = vec![workload("w1", &["10.0.0.1"], &[(Some("http"), 8080)], true)];
        let observed = materialize(plan(&svc, &desired_endpoints(&svc, &workloads), vec![]), 0);

        let wiped = plan(&svc, &desired_endpoints(&svc, &[]), observed);
        assert_eq!(wiped.to_delete.len(), 1);
        assert!(wiped.to_create.is_empty() && wiped.to_update.is_empty());
    }

    #[test]
    fn duplicated_endpoint_is_claimed_by_smallest_slice_name() {
        let svc = http_service();
        let workloads = vec![
            workload("w1", &["10.0.0.1"], &[(Some("http"), 8080)], true),
            workload("w2", &["10.0.0.2"], &[(Some("http"), 8080)], true),
        ];
        let desired = desired_endpoints(&svc, &workloads);
        let template = materialize(plan(&svc, &desired, vec![]), 0);

        // Duplicate the whole slice under a larger name: every endpoint now
        // appears twice across the Service.
        let mut dup = template[0].clone();
        dup.metadata.name = Some("api-zzzzz".to_string());
        let observed = vec![template[0].clone(), dup];

        let fixed = plan(&svc, &desired, observed);
        // The duplicate empties out and is removed; the original is fine.
        assert_eq!(fixed.to_delete.len(), 1);
        assert_eq!(fixed.to_delete[0].name_any(), "api-zzzzz");
        assert!(fixed.to_update.is_empty() && fixed.to_create.is_empty());
    }

    #[test]
    fn new_endpoints_fill_smallest_named_slice_first() {
        let svc = http_service();
        let two = vec![
            workload("w1", &["10.0.0.1"], &[(Some("http"), 8080)], true),
            workload("w2", &["10.0.0.2"], &[(Some("http"), 8080)], true),
        ];
        let desired_two = desired_endpoints(&svc, &two);
        let mut observed = materialize(plan(&svc, &desired_endpoints(&svc, &two[..1]), vec![]), 0);
        observed[0].metadata.name = Some("api-aaaaa".to_string());
        let mut other = observed[0].clone();
        other.metadata.name = Some("api-bbbbb".to_string());
        other.endpoints = vec![];
        observed.push(other);

        let filled = plan(&svc, &desired_two, observed);
        // w2 lands in api-aaaaa (smallest name with room); the empty
        // api-bbbbb is deleted.
        assert_eq!(filled.to_update.len(), 1);
        assert_eq!(filled.to_update[0].name_any(), "api-aaaaa");
        assert_eq!(filled.to_update[0].endpoints.len(), 2);
        assert_eq!(filled.to_delete.len(), 1);
        assert_eq!(filled.to_delete[0].name_any(), "api-bbbbb");
    }

    #[test]
    fn removed_workload_shrinks_its_slice() {
        let svc = http_service();
        let two = vec![
            workload("w1", &["10.0.0.1"], &[(Some("http"), 8080)], true),
            workload("w2", &["10.0.0.2"], &[(Some("http"), 8080)], true),
        ];
        let observed = materialize(plan(&svc, &desired_endpoints(&svc, &two), vec![]), 0);

        let one = vec![two[0].clone()];
        let shrunk = plan(&svc, &desired_endpoints(&svc, &one), observed);
        assert_eq!(shrunk.to_update.len(), 1);
        assert_eq!(shrunk.to_update[0].endpoints.len(), 1);
        assert_eq!(
            shrunk.to_update[0].endpoints[0].addresses,
            vec!["10.0.0.1".to_string()]
        );
    }

    #[test]
    fn overflow_tops_up_existing_before_creating() {
        let svc = http_service();
        let first: Vec<_> = (0..99)
            .map(|i| {
                let ip = format!("10.0.{}.{}", i / 256, i % 256);
                workload(&format!("w{i:03}"), &[ip.as_str()], &[(Some("http"), 8080)], true)
            })
            .collect();
        let observed = materialize(plan(&svc, &desired_endpoints(&svc, &first), vec![]), 0);

        let mut grown = first;
        for i in 99..102 {
            let ip = format!("10.0.{}.{}", i / 256, i % 256);
            grown.push(workload(
                &format!("w{i:03}"),
                &[ip.as_str()],
                &[(Some("http"), 8080)],
                true,
            ));
        }
        let expanded = plan(&svc, &desired_endpoints(&svc, &grown), observed);
        assert_eq!(expanded.to_update.len(), 1);
        assert_eq!(
            expanded.to_update[0].endpoints.len(),
            consts::MAX_ENDPOINTS_PER_SLICE
        );
        assert_eq!(expanded.to_create.len(), 1);
        assert_eq!(expanded.to_create[0].endpoints.len(), 2);
    }
}
