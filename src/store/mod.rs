//! Resource store boundary
//!
//! The controller only talks to the store through these traits. Every write
//! carries the object's `resourceVersion`; a stale version fails with
//! [`Error::Conflict`](crate::Error::Conflict) and callers retry through
//! [`update_with_retry`].

mod kubernetes;
mod memory;

use async_trait::async_trait;
use kube::ResourceExt;

#[cfg(test)]
use mockall::automock;

use crate::crd::{Cluster, Kubeconfig};
use crate::retry::{update_with_retry, UpdateOutcome};
use crate::Error;

pub use self::kubernetes::KubeStore;
pub use self::memory::InMemoryStore;

/// Cluster operations consumed by the controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Get a Cluster by name, `None` if it does not exist
    async fn get(&self, name: &str) -> Result<Option<Cluster>, Error>;

    /// List all Clusters
    async fn list(&self) -> Result<Vec<Cluster>, Error>;

    /// Create a Cluster; fails with `AlreadyExists` if the name is taken
    async fn create(&self, cluster: &Cluster) -> Result<Cluster, Error>;

    /// Replace metadata and spec; fails with `Conflict` on a stale version
    async fn update(&self, cluster: &Cluster) -> Result<Cluster, Error>;

    /// Replace the status block; fails with `Conflict` on a stale version
    async fn update_status(&self, cluster: &Cluster) -> Result<Cluster, Error>;

    /// Request deletion; finalizers keep the object until they are removed
    async fn delete(&self, name: &str) -> Result<(), Error>;
}

/// Kubeconfig operations consumed by the kubeconfig publisher
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeconfigStore: Send + Sync {
    /// Get a Kubeconfig by name, `None` if it does not exist
    async fn get_kubeconfig(&self, name: &str) -> Result<Option<Kubeconfig>, Error>;

    /// Create a Kubeconfig; fails with `AlreadyExists` if the name is taken
    async fn create_kubeconfig(&self, kubeconfig: &Kubeconfig) -> Result<Kubeconfig, Error>;

    /// Replace a Kubeconfig; fails with `Conflict` on a stale version
    async fn update_kubeconfig(&self, kubeconfig: &Kubeconfig) -> Result<Kubeconfig, Error>;
}

/// Mutate a Cluster's metadata/spec with bounded conflict retry
pub async fn update_cluster_with_retry<M>(
    store: &dyn ClusterStore,
    operation: &str,
    cluster: Cluster,
    mutate: M,
) -> Result<UpdateOutcome<Cluster>, Error>
where
    M: FnMut(&mut Cluster) -> bool,
{
    let name = cluster.name_any();
    update_with_retry(
        operation,
        &name,
        cluster,
        || store.get(&name),
        |c| async move { store.update(&c).await },
        mutate,
    )
    .await
}

/// Mutate a Cluster's status with bounded conflict retry
pub async fn update_status_with_retry<M>(
    store: &dyn ClusterStore,
    operation: &str,
    cluster: Cluster,
    mutate: M,
) -> Result<UpdateOutcome<Cluster>, Error>
where
    M: FnMut(&mut Cluster) -> bool,
{
    let name = cluster.name_any();
    update_with_retry(
        operation,
        &name,
        cluster,
        || store.get(&name),
        |c| async move { store.update_status(&c).await },
        mutate,
    )
    .await
}
