use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::api::Api;
use kube::runtime::reflector::{self, Store};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Resource, ResourceExt};

use crate::consts;
use crate::crd::{ExternalWorkload, ServiceProfile};

/// Exact-match label selection: every selector pair must be present.
#[must_use]
pub fn selector_matches(
    selector: &BTreeMap<String, String>,
    labels: Option<&BTreeMap<String, String>>,
) -> bool {
    selector.iter().all(|(key, value)| {
        labels.is_some_and(|labels| labels.get(key) == Some(value))
    })
}

/// True for slices this controller wrote for the given Service. Slices
/// without our managed-by mark are never touched.
#[must_use]
pub fn slice_is_owned(slice: &EndpointSlice, service: &str) -> bool {
    let Some(labels) = slice.metadata.labels.as_ref() else {
        return false;
    };
    labels.get(consts::MANAGED_BY_LABEL).map(String::as_str) == Some(consts::MANAGED_BY)
        && labels.get(consts::SERVICE_NAME_LABEL).map(String::as_str) == Some(service)
}

#[must_use]
pub fn slice_is_managed(slice: &EndpointSlice) -> bool {
    slice
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(consts::MANAGED_BY_LABEL))
        .map(String::as_str)
        == Some(consts::MANAGED_BY)
}

/// Event callbacks dispatched from a watch stream. Implementations are
/// attached and detached explicitly; there is no implicit fan-out.
pub trait EventHandler<K>: Send + Sync {
    fn on_add(&self, obj: &K);
    fn on_update(&self, old: &K, new: &K);
    fn on_delete(&self, obj: &K);
}

pub type HandlerId = usize;

/// Attachable set of event handlers for one resource kind. Attach and detach
/// are mutex-guarded so leadership acquisition and release cannot
/// interleave with dispatch.
pub struct HandlerRegistry<K> {
    handlers: Mutex<Vec<(HandlerId, Arc<dyn EventHandler<K>>)>>,
    next_id: AtomicUsize,
}

impl<K> Default for HandlerRegistry<K> {
    fn default() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl<K> HandlerRegistry<K> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, handler: Arc<dyn EventHandler<K>>) -> HandlerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.lock().unwrap().push((id, handler));
        id
    }

    pub fn detach(&self, id: HandlerId) {
        self.handlers
            .lock()
            .unwrap()
            .retain(|(handler_id, _)| *handler_id != id);
    }

    fn snapshot(&self) -> Vec<Arc<dyn EventHandler<K>>> {
        self.handlers
            .lock()
            .unwrap()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect()
    }

    pub fn on_add(&self, obj: &K) {
        for handler in self.snapshot() {
            handler.on_add(obj);
        }
    }

    pub fn on_update(&self, old: &K, new: &K) {
        for handler in self.snapshot() {
            handler.on_update(old, new);
        }
    }

    pub fn on_delete(&self, obj: &K) {
        for handler in self.snapshot() {
            handler.on_delete(obj);
        }
    }
}

fn object_key<K: Resource>(obj: &K) -> (String, String) {
    (obj.namespace().unwrap_or_default(), obj.name_any())
}

/// Translates a watch stream into add/update/delete handler calls.
///
/// A local map of last-known objects turns bare apply events into old/new
/// pairs and keeps deletions tombstone-tolerant: the object handed to
/// `on_delete` is the last complete revision observed, and objects that
/// silently vanished across a relist are dispatched as deletions when the
/// relist finishes.
pub async fn dispatch<K, S>(stream: S, registry: Arc<HandlerRegistry<K>>)
where
    K: Resource + Clone,
    K::DynamicType: Default,
    S: Stream<Item = Result<Event<K>, watcher::Error>>,
{
    let mut known: HashMap<(String, String), K> = HashMap::new();
    let mut relisted: Option<HashSet<(String, String)>> = None;
    futures::pin_mut!(stream);

    while let Some(event) = stream.next().await {
        match event {
            Ok(Event::Init) => {
                relisted = Some(HashSet::new());
            }
            Ok(Event::InitApply(obj) | Event::Apply(obj)) => {
                let key = object_key(&obj);
                if let Some(seen) = relisted.as_mut() {
                    seen.insert(key.clone());
                }
                match known.insert(key, obj.clone()) {
                    Some(old) => registry.on_update(&old, &obj),
                    None => registry.on_add(&obj),
                }
            }
            Ok(Event::InitDone) => {
                if let Some(seen) = relisted.take() {
                    let gone: Vec<_> = known
                        .keys()
                        .filter(|key| !seen.contains(*key))
                        .cloned()
                        .collect();
                    for key in gone {
                        if let Some(old) = known.remove(&key) {
                            registry.on_delete(&old);
                        }
                    }
                }
            }
            Ok(Event::Delete(obj)) => {
                let key = object_key(&obj);
                let last = known.remove(&key).unwrap_or(obj);
                registry.on_delete(&last);
            }
            Err(error) => {
                tracing::warn!(%error, "Watch stream error; the watcher backs off and resumes");
            }
        }
    }
}

/// Read facade over the informer caches, shared by the endpoints controller
/// and the discovery resolver.
#[derive(Clone)]
pub struct ClusterCache {
    pub services: Store<Service>,
    pub workloads: Store<ExternalWorkload>,
    pub slices: Store<EndpointSlice>,
    pub profiles: Store<ServiceProfile>,
    pub service_handlers: Arc<HandlerRegistry<Service>>,
    pub workload_handlers: Arc<HandlerRegistry<ExternalWorkload>>,
    pub slice_handlers: Arc<HandlerRegistry<EndpointSlice>>,
    pub profile_handlers: Arc<HandlerRegistry<ServiceProfile>>,
}

impl ClusterCache {
    /// Starts one watch per resource kind and keeps reflector stores and
    /// handler registries fed from them.
    #[must_use]
    pub fn spawn(client: &kube::Client) -> Self {
        fn watch<K>(api: Api<K>) -> (Store<K>, Arc<HandlerRegistry<K>>)
        where
            K: Resource<DynamicType = ()>
                + Clone
                + std::fmt::Debug
                + Send
                + Sync
                + serde::de::DeserializeOwned
                + 'static,
        {
            let (reader, writer) = reflector::store();
            let registry = Arc::new(HandlerRegistry::new());
            let stream = watcher::watcher(api, watcher::Config::default())
                .default_backoff()
                .reflect(writer);
            tokio::spawn(dispatch(stream, registry.clone()));
            (reader, registry)
        }

        let (services, service_handlers) = watch(Api::<Service>::all(client.clone()));
        let (workloads, workload_handlers) = watch(Api::<ExternalWorkload>::all(client.clone()));
        let (slices, slice_handlers) = watch(Api::<EndpointSlice>::all(client.clone()));
        let (profiles, profile_handlers) = watch(Api::<ServiceProfile>::all(client.clone()));

        Self {
            services,
            workloads,
            slices,
            profiles,
            service_handlers,
            workload_handlers,
            slice_handlers,
            profile_handlers,
        }
    }

    pub async fn wait_ready(&self) {
        self.services.wait_until_ready().await.ok();
        self.workloads.wait_until_ready().await.ok();
        self.slices.wait_until_ready().await.ok();
        self.profiles.wait_until_ready().await.ok();
    }

    #[must_use]
    pub fn get_service(&self, namespace: &str, name: &str) -> Option<Arc<Service>> {
        let key = reflector::ObjectRef::new(name).within(namespace);
        self.services.get(&key)
    }

    #[must_use]
    pub fn services_in(&self, namespace: &str) -> Vec<Arc<Service>> {
        self.services
            .state()
            .into_iter()
            .filter(|svc| svc.namespace().as_deref() == Some(namespace))
            .collect()
    }

    /// ExternalWorkloads in a namespace matching a Service selector.
    #[must_use]
    pub fn workloads_matching(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Vec<ExternalWorkload> {
        self.workloads
            .state()
            .into_iter()
            .filter(|w| {
                w.namespace().as_deref() == Some(namespace)
                    && selector_matches(selector, w.metadata.labels.as_ref())
            })
            .map(|w| (*w).clone())
            .collect()
    }

    /// Slices this controller owns for a Service, with slices already being
    /// deleted dropped.
    #[must_use]
    pub fn owned_slices(&self, namespace: &str, service: &str) -> Vec<EndpointSlice> {
        self.slices
            .state()
            .into_iter()
            .filter(|slice| {
                slice.namespace().as_deref() == Some(namespace)
                    && slice_is_owned(slice, service)
                    && slice.metadata.deletion_timestamp.is_none()
            })
            .map(|slice| (*slice).clone())
            .collect()
    }

    /// All slices backing a Service regardless of who manages them; the
    /// resolver reads the full endpoint picture.
    #[must_use]
    pub fn slices_for_service(&self, namespace: &str, service: &str) -> Vec<EndpointSlice> {
        self.slices
            .state()
            .into_iter()
            .filter(|slice| {
                slice.namespace().as_deref() == Some(namespace)
                    && slice
                        .metadata
                        .labels
                        .as_ref()
                        .and_then(|labels| labels.get(consts::SERVICE_NAME_LABEL))
                        .map(String::as_str)
                        == Some(service)
            })
            .map(|slice| (*slice).clone())
            .collect()
    }

    #[must_use]
    pub fn get_profile(&self, namespace: &str, name: &str) -> Option<Arc<ServiceProfile>> {
        let key = reflector::ObjectRef::new(name).within(namespace);
        self.profiles.get(&key)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use kube::runtime::reflector::store::Writer;

    /// A cache wired to in-memory stores; tests feed it watcher events
    /// through the writers.
    pub(crate) struct TestCache {
        pub cache: ClusterCache,
        pub services: Writer<Service>,
        pub workloads: Writer<ExternalWorkload>,
        pub slices: Writer<EndpointSlice>,
        pub profiles: Writer<ServiceProfile>,
    }

    pub(crate) fn cluster_cache() -> TestCache {
        let (services, services_writer) = reflector::store();
        let (workloads, workloads_writer) = reflector::store();
        let (slices, slices_writer) = reflector::store();
        let (profiles, profiles_writer) = reflector::store();
        TestCache {
            cache: ClusterCache {
                services,
                workloads,
                slices,
                profiles,
                service_handlers: Arc::new(HandlerRegistry::new()),
                workload_handlers: Arc::new(HandlerRegistry::new()),
                slice_handlers: Arc::new(HandlerRegistry::new()),
                profile_handlers: Arc::new(HandlerRegistry::new()),
            },
            services: services_writer,
            workloads: workloads_writer,
            slices: slices_writer,
            profiles: profiles_writer,
        }
    }
}
