use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::Stream;
use k8s_openapi::api::core::v1::{ObjectReference, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::ResourceExt;
use tokio::sync::mpsc;
use tonic::Status;

use super::proto;
use crate::cache::{ClusterCache, EventHandler};
use crate::consts;

/// Updates buffered per listener; a proxy that cannot drain this many is
/// cut loose rather than allowed to stall the informer path.
pub(crate) const LISTENER_BUFFER: usize = 64;

const DEFAULT_WEIGHT: u32 = 10_000;

/// Maps an endpoint's target reference to a `(label, value)` metric-label
/// pair. The default treats every target like a pod, which is what proxies
/// expect to aggregate on.
pub type OwnerLookup = Arc<dyn Fn(&ObjectReference) -> Option<(String, String)> + Send + Sync>;

#[must_use]
pub fn default_owner_lookup() -> OwnerLookup {
    Arc::new(|target| {
        target
            .name
            .clone()
            .map(|name| ("pod".to_string(), name))
    })
}

/// Response stream backing one `Get` or `GetProfile` call. Ends cleanly when
/// the sender is dropped, or with the recorded terminal status (slow
/// consumer, server shutdown). Dropping the stream (tonic does so when the
/// client cancels) releases the drop guard, which is what the watcher's
/// detach task waits on.
#[derive(Debug)]
pub struct ListenerStream<T> {
    rx: mpsc::Receiver<T>,
    terminal: Arc<Mutex<Option<Status>>>,
    finished: bool,
    _detach: Option<tokio::sync::oneshot::Sender<()>>,
}

impl<T> Stream for ListenerStream<T> {
    type Item = Result<T, Status>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(item)) => Poll::Ready(Some(Ok(item))),
            Poll::Ready(None) => {
                this.finished = true;
                match this.terminal.lock().unwrap().take() {
                    Some(status) => Poll::Ready(Some(Err(status))),
                    None => Poll::Ready(None),
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

pub(crate) struct Listener<T> {
    id: usize,
    tx: mpsc::Sender<T>,
    terminal: Arc<Mutex<Option<Status>>>,
}

impl<T> Listener<T> {
    /// Returns the publish side, the response stream, and a receiver that
    /// resolves once the stream has been dropped by the client.
    pub(crate) fn channel(
        id: usize,
        capacity: usize,
    ) -> (Self, ListenerStream<T>, tokio::sync::oneshot::Receiver<()>) {
        let (tx, rx) = mpsc::channel(capacity);
        let (detach_tx, detach_rx) = tokio::sync::oneshot::channel();
        let terminal = Arc::new(Mutex::new(None));
        (
            Self {
                id,
                tx,
                terminal: terminal.clone(),
            },
            ListenerStream {
                rx,
                terminal,
                finished: false,
                _detach: Some(detach_tx),
            },
            detach_rx,
        )
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    /// False means the listener is dead and must be dropped: either the
    /// client went away, or it fell too far behind and its stream is closed
    /// with `ResourceExhausted`.
    pub(crate) fn push(&self, item: T) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                *self.terminal.lock().unwrap() = Some(Status::resource_exhausted(
                    "consumer too slow for endpoint updates",
                ));
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub(crate) fn close(&self, status: Status) {
        *self.terminal.lock().unwrap() = Some(status);
    }
}

fn update_add(addrs: Vec<proto::WeightedAddr>) -> proto::Update {
    proto::Update {
        update: Some(proto::update::Update::Add(proto::WeightedAddrSet { addrs })),
    }
}

fn update_remove(addrs: Vec<String>) -> proto::Update {
    proto::Update {
        update: Some(proto::update::Update::Remove(proto::AddrSet { addrs })),
    }
}

fn update_no_endpoints(exists: bool) -> proto::Update {
    proto::Update {
        update: Some(proto::update::Update::NoEndpoints(proto::NoEndpoints {
            exists,
        })),
    }
}

/// Flattens the slices backing a Service into the address set served for one
/// Service port. The requested port is the *service* port; each slice names
/// the target port it maps to.
#[must_use]
pub fn endpoint_addrs(
    svc: Option<&Service>,
    slices: &[EndpointSlice],
    port: u16,
    owner_lookup: &OwnerLookup,
) -> BTreeMap<String, proto::WeightedAddr> {
    let mut out = BTreeMap::new();
    let Some(svc) = svc else {
        return out;
    };
    let namespace = svc.namespace().unwrap_or_default();
    let Some(svc_port) = svc
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .and_then(|ports| ports.iter().find(|p| p.port == i32::from(port)))
    else {
        return out;
    };

    for slice in slices {
        let Some(target_port) = slice
            .ports
            .as_deref()
            .unwrap_or_default()
            .iter()
            .find(|p| p.name == svc_port.name)
            .and_then(|p| p.port)
            .and_then(|p| u16::try_from(p).ok())
        else {
            continue;
        };
        for endpoint in &slice.endpoints {
            let ready = endpoint
                .conditions
                .as_ref()
                .and_then(|c| c.ready)
                .unwrap_or(true);
            if !ready {
                continue;
            }
            let mut metric_labels: HashMap<String, String> =
                [("namespace".to_string(), namespace.clone())].into();
            if let Some((label, value)) = endpoint
                .target_ref
                .as_ref()
                .and_then(|target| owner_lookup.as_ref()(target))
            {
                metric_labels.insert(label, value);
            }
            for address in &endpoint.addresses {
                let Ok(ip) = address.parse::<IpAddr>() else {
                    continue;
                };
                let addr = SocketAddr::new(ip, target_port).to_string();
                out.insert(
                    addr.clone(),
                    proto::WeightedAddr {
                        addr,
                        weight: DEFAULT_WEIGHT,
                        metric_labels: metric_labels.clone(),
                    },
                );
            }
        }
    }
    out
}

type PortKey = (String, String, u16);

struct PortState {
    current: BTreeMap<String, proto::WeightedAddr>,
    listeners: Vec<Listener<proto::Update>>,
}

#[derive(Default)]
struct WatchState {
    ports: HashMap<PortKey, PortState>,
    next_id: usize,
    shut_down: bool,
}

/// Tracks active `Get` streams per (service, port) and republishes endpoint
/// deltas whenever the backing slices change.
pub struct EndpointsWatcher {
    cache: ClusterCache,
    owner_lookup: OwnerLookup,
    state: Mutex<WatchState>,
}

impl EndpointsWatcher {
    #[must_use]
    pub fn new(cache: ClusterCache, owner_lookup: OwnerLookup) -> Arc<Self> {
        Arc::new(Self {
            cache,
            owner_lookup,
            state: Mutex::new(WatchState::default()),
        })
    }

    /// Wires the watcher into the informer dispatch so slice and Service
    /// events flow into active streams. Attached once at startup.
    pub fn attach(self: &Arc<Self>) {
        self.cache
            .slice_handlers
            .attach(Arc::new(SliceEvents(self.clone())));
        self.cache
            .service_handlers
            .attach(Arc::new(ServiceEvents(self.clone())));
    }

    fn snapshot(&self, namespace: &str, name: &str, port: u16) -> BTreeMap<String, proto::WeightedAddr> {
        let svc = self.cache.get_service(namespace, name);
        let slices = self.cache.slices_for_service(namespace, name);
        endpoint_addrs(svc.as_deref(), &slices, port, &self.owner_lookup)
    }

    /// Registers a listener; the stream's first message always describes the
    /// current endpoint set.
    pub fn subscribe(
        self: &Arc<Self>,
        namespace: &str,
        name: &str,
        port: u16,
    ) -> Result<ListenerStream<proto::Update>, Status> {
        let key: PortKey = (namespace.to_string(), name.to_string(), port);

        let mut state = self.state.lock().unwrap();
        if state.shut_down {
            return Err(Status::unavailable("resolver is shutting down"));
        }
        // Snapshot under the lock: an event arriving while we register must
        // not slip between the initial state and the first delta.
        let snapshot = self.snapshot(namespace, name, port);
        let exists = self.cache.get_service(namespace, name).is_some();
        state.next_id += 1;
        let (listener, stream, dropped) = Listener::channel(state.next_id, LISTENER_BUFFER);
        let entry = state.ports.entry(key.clone()).or_insert_with(|| PortState {
            current: snapshot,
            listeners: Vec::new(),
        });
        let initial = if entry.current.is_empty() {
            update_no_endpoints(exists)
        } else {
            update_add(entry.current.values().cloned().collect())
        };
        // The buffer is fresh; the initial update cannot overflow it.
        listener.push(initial);
        let id = listener.id;
        entry.listeners.push(listener);
        drop(state);

        // Detach promptly when the client goes away, rather than waiting
        // for the next publish to notice the dead listener.
        let watcher = self.clone();
        tokio::spawn(async move {
            let _ = dropped.await;
            watcher.detach(&key, id);
        });

        Ok(stream)
    }

    fn detach(&self, key: &PortKey, id: usize) {
        let mut state = self.state.lock().unwrap();
        let emptied = state.ports.get_mut(key).is_some_and(|port| {
            port.listeners.retain(|listener| listener.id != id);
            port.listeners.is_empty()
        });
        if emptied {
            state.ports.remove(key);
        }
    }

    /// Recomputes every subscribed port of a Service and publishes deltas.
    pub fn refresh_service(&self, namespace: &str, name: &str) {
        let keys: Vec<PortKey> = {
            let state = self.state.lock().unwrap();
            state
                .ports
                .keys()
                .filter(|(ns, svc, _)| ns == namespace && svc == name)
                .cloned()
                .collect()
        };
        for key in keys {
            let snapshot = self.snapshot(&key.0, &key.1, key.2);
            let exists = self.cache.get_service(&key.0, &key.1).is_some();
            self.publish(&key, snapshot, exists);
        }
    }

    fn publish(&self, key: &PortKey, next: BTreeMap<String, proto::WeightedAddr>, exists: bool) {
        let mut state = self.state.lock().unwrap();
        let Some(port) = state.ports.get_mut(key) else {
            return;
        };
        let added: Vec<proto::WeightedAddr> = next
            .iter()
            .filter(|(addr, weighted)| port.current.get(*addr) != Some(weighted))
            .map(|(_, weighted)| weighted.clone())
            .collect();
        let removed: Vec<String> = port
            .current
            .keys()
            .filter(|addr| !next.contains_key(*addr))
            .cloned()
            .collect();
        if added.is_empty() && removed.is_empty() {
            return;
        }

        let mut updates = Vec::new();
        if !added.is_empty() {
            updates.push(update_add(added));
        }
        if !removed.is_empty() {
            updates.push(update_remove(removed));
        }
        if next.is_empty() {
            updates.push(update_no_endpoints(exists));
        }
        port.current = next;
        port.listeners
            .retain(|listener| updates.iter().all(|update| listener.push(update.clone())));
    }

    /// Closes every stream with `Unavailable` and refuses new subscribers.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.shut_down = true;
        for (_, port) in state.ports.drain() {
            for listener in port.listeners {
                listener.close(Status::unavailable("resolver is shutting down"));
            }
        }
    }
}

struct SliceEvents(Arc<EndpointsWatcher>);

impl SliceEvents {
    fn refresh(&self, slice: &EndpointSlice) {
        let Some(namespace) = slice.namespace() else {
            return;
        };
        if let Some(owner) = slice
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(consts::SERVICE_NAME_LABEL))
        {
            self.0.refresh_service(&namespace, owner);
        }
    }
}

impl EventHandler<EndpointSlice> for SliceEvents {
    fn on_add(&self, slice: &EndpointSlice) {
        self.refresh(slice);
    }
    fn on_update(&self, old: &EndpointSlice, new: &EndpointSlice) {
        self.refresh(old);
        self.refresh(new);
    }
    fn on_delete(&self, slice: &EndpointSlice) {
        self.refresh(slice);
    }
}

struct ServiceEvents(Arc<EndpointsWatcher>);

impl EventHandler<Service> for ServiceEvents {
    fn on_add(&self, svc: &Service) {
        if let Some(namespace) = svc.namespace() {
            self.0.refresh_service(&namespace, &svc.name_any());
        }
    }
    fn on_update(&self, _old: &Service, new: &Service) {
        if let Some(namespace) = new.namespace() {
            self.0.refresh_service(&namespace, &new.name_any());
        }
    }
    fn on_delete(&self, svc: &Service) {
        if let Some(namespace) = svc.namespace() {
            self.0.refresh_service(&namespace, &svc.name_any());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use k8s_openapi::api::core::v1::ServicePort;
    use k8s_openapi::api::discovery::v1::{Endpoint, EndpointConditions, EndpointPort};
    use kube::core::ObjectMeta;

    fn svc(name: &str, port: i32, port_name: Option<&str>) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("shop".to_string()),
                ..Default::default()
            },
            spec: Some(k8s_openapi::api::core::v1::ServiceSpec {
                selector: Some([("app".to_string(), name.to_string())].into()),
                ports: Some(vec![ServicePort {
                    name: port_name.map(String::from),
                    port,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn slice(svc_name: &str, port_name: Option<&str>, target: i32, addrs: &[(&str, bool)]) -> EndpointSlice {
        EndpointSlice {
            metadata: ObjectMeta {
                name: Some(format!("{svc_name}-aaaaa")),
                namespace: Some("shop".to_string()),
                labels: Some(
                    [(
                        consts::SERVICE_NAME_LABEL.to_string(),
                        svc_name.to_string(),
                    )]
                    .into(),
                ),
                ..Default::default()
            },
            address_type: "IPv4".to_string(),
            ports: Some(vec![EndpointPort {
                name: port_name.map(String::from),
                port: Some(target),
                ..Default::default()
            }]),
            endpoints: addrs
                .iter()
                .map(|(addr, ready)| Endpoint {
                    addresses: vec![(*addr).to_string()],
                    conditions: Some(EndpointConditions {
                        ready: Some(*ready),
                        ..Default::default()
                    }),
                    target_ref: Some(ObjectReference {
                        kind: Some("ExternalWorkload".to_string()),
                        name: Some("w1".to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                })
                .collect(),
        }
    }

    #[test]
    fn addrs_resolve_service_port_to_target_port() {
        let service = svc("api", 80, Some("http"));
        let slices = vec![slice("api", Some("http"), 8080, &[("10.0.0.1", true)])];
        let addrs = endpoint_addrs(Some(&service), &slices, 80, &default_owner_lookup());
        assert_eq!(addrs.len(), 1);
        let weighted = addrs.get("10.0.0.1:8080").unwrap();
        assert_eq!(weighted.weight, DEFAULT_WEIGHT);
        assert_eq!(weighted.metric_labels["pod"], "w1");
        assert_eq!(weighted.metric_labels["namespace"], "shop");
    }

    #[test]
    fn unready_endpoints_are_excluded() {
        let service = svc("api", 80, Some("http"));
        let slices = vec![slice(
            "api",
            Some("http"),
            8080,
            &[("10.0.0.1", true), ("10.0.0.2", false)],
        )];
        let addrs = endpoint_addrs(Some(&service), &slices, 80, &default_owner_lookup());
        assert_eq!(addrs.len(), 1);
        assert!(addrs.contains_key("10.0.0.1:8080"));
    }

    #[test]
    fn unknown_service_port_resolves_nothing() {
        let service = svc("api", 80, Some("http"));
        let slices = vec![slice("api", Some("http"), 8080, &[("10.0.0.1", true)])];
        assert!(endpoint_addrs(Some(&service), &slices, 443, &default_owner_lookup()).is_empty());
        assert!(endpoint_addrs(None, &slices, 80, &default_owner_lookup()).is_empty());
    }

    #[test]
    fn unnamed_ports_pair_up() {
        let service = svc("api", 80, None);
        let slices = vec![slice("api", None, 9000, &[("10.0.0.1", true)])];
        let addrs = endpoint_addrs(Some(&service), &slices, 80, &default_owner_lookup());
        assert!(addrs.contains_key("10.0.0.1:9000"));
    }

    #[test]
    fn ipv6_addresses_are_bracketed() {
        let service = svc("api", 80, Some("http"));
        let slices = vec![slice("api", Some("http"), 8080, &[("2001:db8::1", true)])];
        let addrs = endpoint_addrs(Some(&service), &slices, 80, &default_owner_lookup());
        assert!(addrs.contains_key("[2001:db8::1]:8080"));
    }

    #[tokio::test]
    async fn slow_listeners_end_with_resource_exhausted() {
        let (listener, mut stream, _dropped) = Listener::channel(1, 2);
        assert!(listener.push(update_no_endpoints(false)));
        assert!(listener.push(update_no_endpoints(false)));
        // Buffer full: the listener reports itself dead.
        assert!(!listener.push(update_no_endpoints(false)));
        drop(listener);

        assert!(stream.next().await.unwrap().is_ok());
        assert!(stream.next().await.unwrap().is_ok());
        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.code(), tonic::Code::ResourceExhausted);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn closed_listeners_end_cleanly() {
        let (listener, mut stream, _dropped) = Listener::channel(1, 2);
        assert!(listener.push(update_no_endpoints(true)));
        drop(listener);
        assert!(stream.next().await.unwrap().is_ok());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn explicit_close_surfaces_the_status() {
        let (listener, mut stream, _dropped) = Listener::<proto::Update>::channel(1, 2);
        listener.close(Status::unavailable("resolver is shutting down"));
        drop(listener);
        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unavailable);
    }
}
