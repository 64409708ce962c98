//! Kubernetes API backed store

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::debug;

use super::{ClusterStore, KubeconfigStore};
use crate::crd::{Cluster, Kubeconfig};
use crate::{Error, FIELD_MANAGER};

const CLUSTER_KIND: &str = "Cluster";
const KUBECONFIG_KIND: &str = "Kubeconfig";

/// Store implementation talking to the Kubernetes API server
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Create a new KubeStore wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn clusters(&self) -> Api<Cluster> {
        Api::all(self.client.clone())
    }

    fn kubeconfigs(&self) -> Api<Kubeconfig> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn get(&self, name: &str) -> Result<Option<Cluster>, Error> {
        self.clusters()
            .get_opt(name)
            .await
            .map_err(|e| Error::from_kube(CLUSTER_KIND, name, false, e))
    }

    async fn list(&self) -> Result<Vec<Cluster>, Error> {
        let list = self.clusters().list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn create(&self, cluster: &Cluster) -> Result<Cluster, Error> {
        let name = cluster.name_any();
        self.clusters()
            .create(&PostParams::default(), cluster)
            .await
            .map_err(|e| Error::from_kube(CLUSTER_KIND, &name, true, e))
    }

    async fn update(&self, cluster: &Cluster) -> Result<Cluster, Error> {
        let name = cluster.name_any();
        // replace carries metadata.resourceVersion, so a stale copy gets 409
        self.clusters()
            .replace(&name, &PostParams::default(), cluster)
            .await
            .map_err(|e| Error::from_kube(CLUSTER_KIND, &name, false, e))
    }

    async fn update_status(&self, cluster: &Cluster) -> Result<Cluster, Error> {
        let name = cluster.name_any();
        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": cluster.resource_version(),
            },
            "status": cluster.status,
        });

        self.clusters()
            .patch_status(
                &name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await
            .map_err(|e| Error::from_kube(CLUSTER_KIND, &name, false, e))
    }

    async fn delete(&self, name: &str) -> Result<(), Error> {
        match self.clusters().delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(cluster = %name, "Cluster not found (already deleted)");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl KubeconfigStore for KubeStore {
    async fn get_kubeconfig(&self, name: &str) -> Result<Option<Kubeconfig>, Error> {
        self.kubeconfigs()
            .get_opt(name)
            .await
            .map_err(|e| Error::from_kube(KUBECONFIG_KIND, name, false, e))
    }

    async fn create_kubeconfig(&self, kubeconfig: &Kubeconfig) -> Result<Kubeconfig, Error> {
        let name = kubeconfig.name_any();
        self.kubeconfigs()
            .create(&PostParams::default(), kubeconfig)
            .await
            .map_err(|e| Error::from_kube(KUBECONFIG_KIND, &name, true, e))
    }

    async fn update_kubeconfig(&self, kubeconfig: &Kubeconfig) -> Result<Kubeconfig, Error> {
        let name = kubeconfig.name_any();
        self.kubeconfigs()
            .replace(&name, &PostParams::default(), kubeconfig)
            .await
            .map_err(|e| Error::from_kube(KUBECONFIG_KIND, &name, false, e))
    }
}
