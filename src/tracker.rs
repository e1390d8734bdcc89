use std::collections::HashMap;
use std::sync::Mutex;

use k8s_openapi::api::discovery::v1::EndpointSlice;

use crate::consts;

/// Compares two opaque resource versions. They are monotonic tokens that are
/// numeric on every supported apiserver; when one does not parse, any
/// difference is treated as newer.
fn rv_newer(observed: &str, expected: &str) -> bool {
    match (observed.parse::<u64>(), expected.parse::<u64>()) {
        (Ok(observed), Ok(expected)) => observed > expected,
        _ => observed != expected,
    }
}

fn slice_owner(slice: &EndpointSlice) -> Option<(String, String)> {
    let namespace = slice.metadata.namespace.clone()?;
    let owner = slice
        .metadata
        .labels
        .as_ref()?
        .get(consts::SERVICE_NAME_LABEL)?
        .clone();
    Some((namespace, owner))
}

/// Records the resource version the controller expects each of its slices to
/// have, so informer events that merely echo our own writes do not re-queue
/// the owning Service, and so a cache that lags behind our writes can be
/// detected before reconciling on top of it.
#[derive(Default)]
pub struct EndpointSliceTracker {
    // (service namespace, service name) -> slice name -> expected RV.
    by_service: Mutex<HashMap<(String, String), HashMap<String, String>>>,
}

impl EndpointSliceTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wipes all state. Called on every leadership acquisition so a new
    /// leader never acts on expectations recorded by a previous one.
    pub fn reset(&self) {
        self.by_service.lock().unwrap().clear();
    }

    /// Records the observed resource version after a successful write.
    pub fn expect(&self, slice: &EndpointSlice) {
        let Some(owner) = slice_owner(slice) else {
            return;
        };
        let (Some(name), Some(rv)) = (
            slice.metadata.name.clone(),
            slice.metadata.resource_version.clone(),
        ) else {
            return;
        };
        self.by_service
            .lock()
            .unwrap()
            .entry(owner)
            .or_default()
            .insert(name, rv);
    }

    /// Drops the expectation for a slice the controller is about to delete,
    /// so the informer's delete event is recognized as our own.
    pub fn expect_deletion(&self, slice: &EndpointSlice) {
        let Some(owner) = slice_owner(slice) else {
            return;
        };
        let Some(name) = slice.metadata.name.as_deref() else {
            return;
        };
        let mut by_service = self.by_service.lock().unwrap();
        if let Some(slices) = by_service.get_mut(&owner) {
            slices.remove(name);
            if slices.is_empty() {
                by_service.remove(&owner);
            }
        }
    }

    /// True when the observed slice is newer than what we last wrote (or was
    /// never written by us at all) and the owning Service must be synced.
    #[must_use]
    pub fn should_sync(&self, slice: &EndpointSlice) -> bool {
        let Some(owner) = slice_owner(slice) else {
            return false;
        };
        let Some(name) = slice.metadata.name.as_deref() else {
            return false;
        };
        let observed = slice.metadata.resource_version.as_deref().unwrap_or("");
        let by_service = self.by_service.lock().unwrap();
        match by_service.get(&owner).and_then(|slices| slices.get(name)) {
            Some(expected) => rv_newer(observed, expected),
            None => true,
        }
    }

    /// Returns false when the deletion was unexpected: the slice is removed
    /// from the tracker and the caller must re-queue the owning Service so
    /// it can be recreated.
    #[must_use]
    pub fn handle_deletion(&self, slice: &EndpointSlice) -> bool {
        let Some(owner) = slice_owner(slice) else {
            return true;
        };
        let Some(name) = slice.metadata.name.as_deref() else {
            return true;
        };
        let mut by_service = self.by_service.lock().unwrap();
        let Some(slices) = by_service.get_mut(&owner) else {
            return true;
        };
        if slices.remove(name).is_none() {
            return true;
        }
        if slices.is_empty() {
            by_service.remove(&owner);
        }
        false
    }

    /// True when the listed slices lag behind the tracker: an expected slice
    /// is missing from the list, or a listed slice carries an older resource
    /// version than the one we wrote.
    #[must_use]
    pub fn stale_slices(&self, namespace: &str, service: &str, slices: &[EndpointSlice]) -> bool {
        let by_service = self.by_service.lock().unwrap();
        let Some(expected) = by_service.get(&(namespace.to_string(), service.to_string())) else {
            return false;
        };
        for (name, expected_rv) in expected {
            let Some(listed) = slices
                .iter()
                .find(|slice| slice.metadata.name.as_deref() == Some(name))
            else {
                return true;
            };
            let observed = listed.metadata.resource_version.as_deref().unwrap_or("");
            if rv_newer(expected_rv, observed) {
                return true;
            }
        }
        false
    }

    /// Wipes tracker state for a deleted Service.
    pub fn delete_service(&self, namespace: &str, service: &str) {
        self.by_service
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), service.to_string()));
    }
}
