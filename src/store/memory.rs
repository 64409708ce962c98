//! In-process store with the API server's concurrency and deletion semantics
//!
//! Used to run the controller without a cluster (tests, local dry runs). It
//! mirrors the behaviour the controller depends on:
//! - every write bumps `resourceVersion`; writes with a stale version conflict
//! - deleting an object with finalizers only sets `deletionTimestamp`
//! - removing the last finalizer of a deleting object erases it
//! - erasing a Cluster garbage-collects the Kubeconfigs it owns

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::ResourceExt;

use super::{ClusterStore, KubeconfigStore};
use crate::crd::{Cluster, Kubeconfig};
use crate::Error;

#[derive(Default)]
struct MemoryState {
    clusters: BTreeMap<String, Cluster>,
    kubeconfigs: BTreeMap<String, Kubeconfig>,
    version: u64,
    pending_conflicts: u32,
    writes: u64,
}

impl MemoryState {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    /// Consume one injected conflict, if any remain
    fn take_conflict(&mut self) -> bool {
        if self.pending_conflicts == 0 {
            return false;
        }
        self.pending_conflicts -= 1;
        true
    }

    fn init_meta(&mut self, meta: &mut ObjectMeta) {
        let version = self.next_version();
        meta.uid = Some(format!("uid-{}", version));
        meta.resource_version = Some(version);
        meta.creation_timestamp = Some(Time(Utc::now()));
        meta.deletion_timestamp = None;
    }

    fn purge_cluster(&mut self, name: &str) {
        let Some(cluster) = self.clusters.remove(name) else {
            return;
        };
        let uid = cluster.uid();
        self.kubeconfigs.retain(|_, kc| {
            !kc.owner_references()
                .iter()
                .any(|owner| Some(&owner.uid) == uid.as_ref())
        });
    }
}

/// Whether a write carrying `incoming` is based on the `stored` version
fn version_matches(incoming: &ObjectMeta, stored: &ObjectMeta) -> bool {
    match &incoming.resource_version {
        Some(version) => Some(version) == stored.resource_version.as_ref(),
        // An unconditional write, as with a PUT without resourceVersion
        None => true,
    }
}

/// Thread-safe in-memory store
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
}

impl InMemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next `count` writes fail with a conflict, as if another
    /// writer had raced each of them
    pub fn inject_conflicts(&self, count: u32) {
        self.lock().pending_conflicts = count;
    }

    /// Number of successful writes so far
    pub fn writes(&self) -> u64 {
        self.lock().writes
    }

    /// Whether a Cluster with this name is stored (deleting or not)
    pub fn contains(&self, name: &str) -> bool {
        self.lock().clusters.contains_key(name)
    }

    /// Names of all stored Kubeconfigs
    pub fn kubeconfig_names(&self) -> Vec<String> {
        self.lock().kubeconfigs.keys().cloned().collect()
    }
}

#[async_trait]
impl ClusterStore for InMemoryStore {
    async fn get(&self, name: &str) -> Result<Option<Cluster>, Error> {
        Ok(self.lock().clusters.get(name).cloned())
    }

    async fn list(&self) -> Result<Vec<Cluster>, Error> {
        Ok(self.lock().clusters.values().cloned().collect())
    }

    async fn create(&self, cluster: &Cluster) -> Result<Cluster, Error> {
        let name = cluster.name_any();
        let mut state = self.lock();
        if state.clusters.contains_key(&name) {
            return Err(Error::already_exists("Cluster", name));
        }
        let mut stored = cluster.clone();
        state.init_meta(&mut stored.metadata);
        state.clusters.insert(name, stored.clone());
        state.writes += 1;
        Ok(stored)
    }

    async fn update(&self, cluster: &Cluster) -> Result<Cluster, Error> {
        let name = cluster.name_any();
        let mut state = self.lock();
        let current = state
            .clusters
            .get(&name)
            .cloned()
            .ok_or_else(|| Error::not_found("Cluster", &name))?;
        if state.take_conflict() || !version_matches(&cluster.metadata, &current.metadata) {
            return Err(Error::conflict("Cluster", name));
        }

        // Status is a subresource: a main-resource update never touches it
        let mut stored = current;
        stored.spec = cluster.spec.clone();
        stored.metadata.finalizers = cluster.metadata.finalizers.clone();
        stored.metadata.annotations = cluster.metadata.annotations.clone();
        stored.metadata.labels = cluster.metadata.labels.clone();
        stored.metadata.resource_version = Some(state.next_version());
        state.writes += 1;

        let erase = stored.metadata.deletion_timestamp.is_some() && stored.finalizers().is_empty();
        if erase {
            state.clusters.insert(name.clone(), stored.clone());
            state.purge_cluster(&name);
        } else {
            state.clusters.insert(name, stored.clone());
        }
        Ok(stored)
    }

    async fn update_status(&self, cluster: &Cluster) -> Result<Cluster, Error> {
        let name = cluster.name_any();
        let mut state = self.lock();
        let current = state
            .clusters
            .get(&name)
            .cloned()
            .ok_or_else(|| Error::not_found("Cluster", &name))?;
        if state.take_conflict() || !version_matches(&cluster.metadata, &current.metadata) {
            return Err(Error::conflict("Cluster", name));
        }

        let mut stored = current;
        stored.status = cluster.status.clone();
        stored.metadata.resource_version = Some(state.next_version());
        state.writes += 1;
        state.clusters.insert(name, stored.clone());
        Ok(stored)
    }

    async fn delete(&self, name: &str) -> Result<(), Error> {
        let mut state = self.lock();
        let Some(current) = state.clusters.get(name).cloned() else {
            return Ok(());
        };

        if current.finalizers().is_empty() {
            state.purge_cluster(name);
            return Ok(());
        }
        if current.metadata.deletion_timestamp.is_none() {
            let mut stored = current;
            stored.metadata.deletion_timestamp = Some(Time(Utc::now()));
            stored.metadata.resource_version = Some(state.next_version());
            state.clusters.insert(name.to_string(), stored);
        }
        Ok(())
    }
}

#[async_trait]
impl KubeconfigStore for InMemoryStore {
    async fn get_kubeconfig(&self, name: &str) -> Result<Option<Kubeconfig>, Error> {
        Ok(self.lock().kubeconfigs.get(name).cloned())
    }

    async fn create_kubeconfig(&self, kubeconfig: &Kubeconfig) -> Result<Kubeconfig, Error> {
        let name = kubeconfig.name_any();
        let mut state = self.lock();
        if state.kubeconfigs.contains_key(&name) {
            return Err(Error::already_exists("Kubeconfig", name));
        }
        let mut stored = kubeconfig.clone();
        state.init_meta(&mut stored.metadata);
        state.kubeconfigs.insert(name, stored.clone());
        state.writes += 1;
        Ok(stored)
    }

    async fn update_kubeconfig(&self, kubeconfig: &Kubeconfig) -> Result<Kubeconfig, Error> {
        let name = kubeconfig.name_any();
        let mut state = self.lock();
        let current = state
            .kubeconfigs
            .get(&name)
            .cloned()
            .ok_or_else(|| Error::not_found("Kubeconfig", &name))?;
        if state.take_conflict() || !version_matches(&kubeconfig.metadata, &current.metadata) {
            return Err(Error::conflict("Kubeconfig", name));
        }

        let mut stored = kubeconfig.clone();
        stored.metadata.uid = current.metadata.uid.clone();
        stored.metadata.creation_timestamp = current.metadata.creation_timestamp.clone();
        stored.metadata.resource_version = Some(state.next_version());
        state.writes += 1;
        state.kubeconfigs.insert(name, stored.clone());
        Ok(stored)
    }
}
