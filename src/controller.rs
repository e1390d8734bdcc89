use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::ResourceExt;
use tokio::sync::watch;

use crate::cache::{selector_matches, ClusterCache, EventHandler};
use crate::consts;
use crate::crd::ExternalWorkload;
use crate::error::{Error, Result};
use crate::metrics;
use crate::queue::WorkQueue;
use crate::reconciler::Reconciler;
use crate::tracker::EndpointSliceTracker;

/// `namespace/name` queue key for a Service. Events for `kube-system` are
/// dropped here.
#[must_use]
pub fn service_key(svc: &Service) -> Option<String> {
    let namespace = svc.namespace()?;
    if namespace == "kube-system" {
        return None;
    }
    Some(format!("{namespace}/{}", svc.name_any()))
}

pub fn split_key(key: &str) -> Result<(&str, &str)> {
    key.split_once('/')
        .filter(|(ns, name)| !ns.is_empty() && !name.is_empty())
        .ok_or_else(|| Error::InvalidKey(key.to_string()))
}

/// The selector to reconcile with, or None when the Service is skipped
/// (ExternalName, or no selector at all).
#[must_use]
pub fn reconcilable_selector(svc: &Service) -> Option<&BTreeMap<String, String>> {
    let spec = svc.spec.as_ref()?;
    if spec.type_.as_deref() == Some("ExternalName") {
        return None;
    }
    spec.selector.as_ref().filter(|selector| !selector.is_empty())
}

/// Services in the workload's namespace that select the given label set.
#[must_use]
pub fn owners_of(
    labels: Option<&BTreeMap<String, String>>,
    services: &[Arc<Service>],
) -> BTreeSet<String> {
    services
        .iter()
        .filter(|svc| {
            reconcilable_selector(svc)
                .is_some_and(|selector| selector_matches(selector, labels))
        })
        .filter_map(|svc| service_key(svc))
        .collect()
}

fn workload_spec_changed(old: &ExternalWorkload, new: &ExternalWorkload) -> bool {
    old.spec.ports != new.spec.ports || old.spec.workload_ips != new.spec.workload_ips
}

/// Service keys to enqueue for a workload update. Pure resource-version
/// bumps produce nothing. When anything relevant changed, the union of old
/// and new memberships is enqueued, including Services selecting both label
/// sets, so a reconcile against a lagging cache still gets retried via the
/// tracker rather than silently skipped.
#[must_use]
pub fn workload_update_keys(
    old: &ExternalWorkload,
    new: &ExternalWorkload,
    services: &[Arc<Service>],
) -> BTreeSet<String> {
    let spec_changed = workload_spec_changed(old, new);
    let ready_changed = old.is_ready() != new.is_ready();
    let labels_changed = old.metadata.labels != new.metadata.labels;
    if !spec_changed && !ready_changed && !labels_changed {
        return BTreeSet::new();
    }
    let mut keys = owners_of(new.metadata.labels.as_ref(), services);
    if labels_changed {
        keys.extend(owners_of(old.metadata.labels.as_ref(), services));
    }
    keys
}

struct ServiceHandler {
    queue: WorkQueue,
}

impl EventHandler<Service> for ServiceHandler {
    fn on_add(&self, svc: &Service) {
        if let Some(key) = service_key(svc) {
            self.queue.add(key);
        }
    }
    fn on_update(&self, _old: &Service, new: &Service) {
        if let Some(key) = service_key(new) {
            self.queue.add(key);
        }
    }
    fn on_delete(&self, svc: &Service) {
        if let Some(key) = service_key(svc) {
            self.queue.add(key);
        }
    }
}

struct WorkloadHandler {
    queue: WorkQueue,
    cache: ClusterCache,
}

impl WorkloadHandler {
    fn enqueue_owners(&self, workload: &ExternalWorkload) {
        let Some(namespace) = workload.namespace() else {
            return;
        };
        let services = self.cache.services_in(&namespace);
        for key in owners_of(workload.metadata.labels.as_ref(), &services) {
            self.queue.add(key);
        }
    }
}

impl EventHandler<ExternalWorkload> for WorkloadHandler {
    fn on_add(&self, workload: &ExternalWorkload) {
        self.enqueue_owners(workload);
    }
    fn on_update(&self, old: &ExternalWorkload, new: &ExternalWorkload) {
        let Some(namespace) = new.namespace() else {
            return;
        };
        let services = self.cache.services_in(&namespace);
        for key in workload_update_keys(old, new, &services) {
            self.queue.add(key);
        }
    }
    fn on_delete(&self, workload: &ExternalWorkload) {
        self.enqueue_owners(workload);
    }
}

struct SliceHandler {
    queue: WorkQueue,
    tracker: Arc<EndpointSliceTracker>,
}

fn slice_owner_key(slice: &EndpointSlice) -> Option<String> {
    let namespace = slice.namespace()?;
    let owner = slice
        .metadata
        .labels
        .as_ref()?
        .get(consts::SERVICE_NAME_LABEL)?;
    Some(format!("{namespace}/{owner}"))
}

impl EventHandler<EndpointSlice> for SliceHandler {
    fn on_add(&self, slice: &EndpointSlice) {
        if !crate::cache::slice_is_managed(slice) {
            return;
        }
        if self.tracker.should_sync(slice) {
            if let Some(key) = slice_owner_key(slice) {
                self.queue.add(key);
            }
        }
    }

    fn on_update(&self, old: &EndpointSlice, new: &EndpointSlice) {
        if !crate::cache::slice_is_managed(old) && !crate::cache::slice_is_managed(new) {
            return;
        }
        let old_owner = slice_owner_key(old);
        let new_owner = slice_owner_key(new);
        if old_owner != new_owner {
            // The service-name label moved: both the previous and the new
            // owner need to settle their slice sets.
            for key in [old_owner, new_owner].into_iter().flatten() {
                self.queue.add(key);
            }
            return;
        }
        if self.tracker.should_sync(new) {
            if let Some(key) = new_owner {
                self.queue.add(key);
            }
        }
    }

    fn on_delete(&self, slice: &EndpointSlice) {
        if !crate::cache::slice_is_managed(slice) {
            return;
        }
        if !self.tracker.handle_deletion(slice) {
            if let Some(key) = slice_owner_key(slice) {
                self.queue.add(key);
            }
        }
    }
}

struct SyncContext {
    cache: ClusterCache,
    tracker: Arc<EndpointSliceTracker>,
    reconciler: Reconciler,
}

async fn sync_service(ctx: &SyncContext, key: &str) -> Result<()> {
    let (namespace, name) = split_key(key)?;
    let Some(svc) = ctx.cache.get_service(namespace, name) else {
        // Deleted between enqueue and sync; slices follow via the Service
        // owner reference, only the tracker state is ours to clean.
        ctx.tracker.delete_service(namespace, name);
        return Ok(());
    };
    let Some(selector) = reconcilable_selector(&svc) else {
        return Ok(());
    };
    let workloads = ctx.cache.workloads_matching(namespace, selector);
    let slices = ctx.cache.owned_slices(namespace, name);
    if ctx.tracker.stale_slices(namespace, name, &slices) {
        return Err(Error::StaleCache(key.to_string()));
    }
    ctx.reconciler.reconcile(&svc, &workloads, slices).await
}

fn handle_error(queue: &WorkQueue, key: &str, result: Result<()>) {
    match result {
        Ok(()) => queue.forget(key),
        Err(error) if !error.is_retryable() => {
            tracing::error!(%error, key, "Sync failed on invalid input; not retrying");
            queue.forget(key);
        }
        Err(error) => {
            if queue.num_requeues(key) < consts::MAX_RETRY_BUDGET {
                tracing::debug!(%error, key, "Sync failed; requeuing with backoff");
                queue.add_rate_limited(key);
            } else {
                tracing::error!(%error, key, "Retry budget exhausted; dropping key");
                queue.forget(key);
                metrics::QUEUE_DROPPED.inc();
            }
        }
    }
}

async fn worker(queue: WorkQueue, ctx: Arc<SyncContext>) {
    while let Some(key) = queue.get().await {
        let result = sync_service(&ctx, &key).await;
        handle_error(&queue, &key, result);
        queue.done(&key);
    }
}

/// Leader-elected endpoints controller. In STANDBY no handlers are attached
/// and the queue is idle; LEADING resets the tracker, attaches handlers,
/// seeds every known Service and runs the workers. Losing the lease detaches
/// the handlers and drains the queue.
pub struct EndpointsController {
    ctx: Arc<SyncContext>,
    workers: usize,
}

impl EndpointsController {
    #[must_use]
    pub fn new(client: kube::Client, cache: ClusterCache, workers: usize) -> Self {
        let tracker = Arc::new(EndpointSliceTracker::new());
        let reconciler = Reconciler::new(client, tracker.clone());
        Self {
            ctx: Arc::new(SyncContext {
                cache,
                tracker,
                reconciler,
            }),
            workers: workers.max(1),
        }
    }

    pub async fn run(self, mut leadership: watch::Receiver<bool>, shutdown: drain::Watch) {
        loop {
            // A fresh shutdown future per turn: leading consumes the
            // previous one when it steps down.
            tokio::select! {
                _ = shutdown.clone().signaled() => return,
                changed = leadership.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    if *leadership.borrow_and_update() {
                        self.lead(&mut leadership, shutdown.clone()).await;
                    }
                }
            }
        }
    }

    async fn lead(&self, leadership: &mut watch::Receiver<bool>, shutdown: drain::Watch) {
        tracing::info!("Taking over slice writes");
        self.ctx.tracker.reset();
        let queue = WorkQueue::new();

        let service_id = self.ctx.cache.service_handlers.attach(Arc::new(ServiceHandler {
            queue: queue.clone(),
        }));
        let workload_id = self
            .ctx
            .cache
            .workload_handlers
            .attach(Arc::new(WorkloadHandler {
                queue: queue.clone(),
                cache: self.ctx.cache.clone(),
            }));
        let slice_id = self.ctx.cache.slice_handlers.attach(Arc::new(SliceHandler {
            queue: queue.clone(),
            tracker: self.ctx.tracker.clone(),
        }));

        // A fresh leader owes the whole world one pass.
        for svc in self.ctx.cache.services.state() {
            if let Some(key) = service_key(&svc) {
                queue.add(key);
            }
        }

        let workers: Vec<_> = (0..self.workers)
            .map(|_| tokio::spawn(worker(queue.clone(), self.ctx.clone())))
            .collect();

        let signaled = shutdown.signaled();
        tokio::pin!(signaled);
        loop {
            tokio::select! {
                _ = &mut signaled => break,
                changed = leadership.changed() => {
                    if changed.is_err() || !*leadership.borrow_and_update() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Stepping down from slice writes");
        self.ctx.cache.service_handlers.detach(service_id);
        self.ctx.cache.workload_handlers.detach(workload_id);
        self.ctx.cache.slice_handlers.detach(slice_id);
        queue.shut_down_with_drain().await;
        for handle in workers {
            handle.await.ok();
        }
    }
}
