use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use kube::ResourceExt;
use tonic::Status;

use super::watch::{Listener, ListenerStream, LISTENER_BUFFER};
use super::proto;
use crate::cache::{ClusterCache, EventHandler};
use crate::crd::{ServiceProfile, ServiceProfileSpec};

/// "10s" / "500ms" style durations used in profile routes.
#[must_use]
pub fn parse_duration_ms(value: &str) -> Option<u64> {
    if let Some(ms) = value.strip_suffix("ms") {
        return ms.parse().ok();
    }
    if let Some(secs) = value.strip_suffix('s') {
        return secs.parse::<u64>().ok().map(|s| s * 1000);
    }
    None
}

/// Renders a profile CRD (or its absence) into the wire shape. The default
/// profile is just the fully-qualified name with no routes.
#[must_use]
pub fn profile_message(fqdn: &str, spec: Option<&ServiceProfileSpec>) -> proto::DestinationProfile {
    let mut message = proto::DestinationProfile {
        fully_qualified_name: fqdn.to_string(),
        routes: Vec::new(),
        retry_budget: None,
    };
    let Some(spec) = spec else {
        return message;
    };
    for route in spec.routes.as_deref().unwrap_or_default() {
        message.routes.push(proto::Route {
            name: route.name.clone(),
            condition: route.condition.as_ref().map(|cond| proto::RequestMatch {
                method: cond.method.clone().unwrap_or_default(),
                path_regex: cond.path_regex.clone().unwrap_or_default(),
            }),
            is_retryable: route.is_retryable.unwrap_or(false),
            timeout_ms: route
                .timeout
                .as_deref()
                .and_then(parse_duration_ms)
                .unwrap_or(0),
        });
    }
    message.retry_budget = spec.retry_budget.as_ref().map(|budget| proto::RetryBudget {
        retry_ratio: budget.retry_ratio,
        min_retries_per_second: budget.min_retries_per_second,
        ttl_ms: parse_duration_ms(&budget.ttl).unwrap_or(0),
    });
    message
}

// Profiles are named by the destination FQDN within the Service's own
// namespace, so the listener key is (namespace, fqdn).
type ProfileKey = (String, String);

#[derive(Default)]
struct ProfileState {
    listeners: HashMap<ProfileKey, Vec<Listener<proto::DestinationProfile>>>,
    next_id: usize,
    shut_down: bool,
}

/// Tracks active `GetProfile` streams and republishes on profile changes.
pub struct ProfileWatcher {
    cache: ClusterCache,
    state: Mutex<ProfileState>,
}

impl ProfileWatcher {
    #[must_use]
    pub fn new(cache: ClusterCache) -> Arc<Self> {
        Arc::new(Self {
            cache,
            state: Mutex::new(ProfileState::default()),
        })
    }

    pub fn attach(self: &Arc<Self>) {
        self.cache
            .profile_handlers
            .attach(Arc::new(ProfileEvents(self.clone())));
    }

    fn current(&self, namespace: &str, fqdn: &str) -> proto::DestinationProfile {
        let profile = self.cache.get_profile(namespace, fqdn);
        profile_message(fqdn, profile.as_deref().map(|p| &p.spec))
    }

    /// Registers a listener; the initial message is always sent, even when
    /// no profile resource exists.
    pub fn subscribe(
        self: &Arc<Self>,
        namespace: &str,
        fqdn: &str,
    ) -> Result<ListenerStream<proto::DestinationProfile>, Status> {
        let initial = self.current(namespace, fqdn);
        let key: ProfileKey = (namespace.to_string(), fqdn.to_string());

        let mut state = self.state.lock().unwrap();
        if state.shut_down {
            return Err(Status::unavailable("resolver is shutting down"));
        }
        state.next_id += 1;
        let (listener, stream, dropped) = Listener::channel(state.next_id, LISTENER_BUFFER);
        listener.push(initial);
        let id = listener.id();
        state.listeners.entry(key.clone()).or_default().push(listener);
        drop(state);

        let watcher = self.clone();
        tokio::spawn(async move {
            let _ = dropped.await;
            watcher.detach(&key, id);
        });

        Ok(stream)
    }

    fn detach(&self, key: &ProfileKey, id: usize) {
        let mut state = self.state.lock().unwrap();
        let emptied = state.listeners.get_mut(key).is_some_and(|listeners| {
            listeners.retain(|listener| listener.id() != id);
            listeners.is_empty()
        });
        if emptied {
            state.listeners.remove(key);
        }
    }

    fn refresh(&self, namespace: &str, fqdn: &str) {
        let key: ProfileKey = (namespace.to_string(), fqdn.to_string());
        let message = self.current(namespace, fqdn);
        let mut state = self.state.lock().unwrap();
        if let Some(listeners) = state.listeners.get_mut(&key) {
            listeners.retain(|listener| listener.push(message.clone()));
        }
    }

    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.shut_down = true;
        for (_, listeners) in state.listeners.drain() {
            for listener in listeners {
                listener.close(Status::unavailable("resolver is shutting down"));
            }
        }
    }
}

struct ProfileEvents(Arc<ProfileWatcher>);

impl ProfileEvents {
    fn refresh(&self, profile: &ServiceProfile) {
        if let Some(namespace) = profile.namespace() {
            self.0.refresh(&namespace, &profile.name_any());
        }
    }
}

impl EventHandler<ServiceProfile> for ProfileEvents {
    fn on_add(&self, profile: &ServiceProfile) {
        self.refresh(profile);
    }
    fn on_update(&self, _old: &ServiceProfile, new: &ServiceProfile) {
        self.refresh(new);
    }
    fn on_delete(&self, profile: &ServiceProfile) {
        self.refresh(profile);
    }
}
