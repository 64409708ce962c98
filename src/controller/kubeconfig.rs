//! Kubeconfig publication
//!
//! Once a Cluster is provisioned, a Kubeconfig resource of the same name
//! points at the admin kubeconfig the tool wrote. It is owned by the Cluster
//! so the store garbage-collects it when the Cluster is erased.

use std::path::Path;

use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use crate::crd::{Cluster, Kubeconfig, KubeconfigSpec};
use crate::retry::update_with_retry;
use crate::store::KubeconfigStore;
use crate::Error;

/// Ensure the Kubeconfig for `cluster` exists and points at `kubeconfig_path`.
///
/// Returns the stored Kubeconfig, or `None` when a concurrent writer won
/// (create raced, or every update attempt conflicted).
pub async fn publish_kubeconfig(
    cluster: &Cluster,
    kubeconfig_path: &Path,
    store: &dyn KubeconfigStore,
) -> Result<Option<Kubeconfig>, Error> {
    let name = cluster.name_any();
    let path = kubeconfig_path.to_string_lossy().into_owned();

    let Some(existing) = store.get_kubeconfig(&name).await? else {
        let owner = cluster.controller_owner_ref(&()).ok_or_else(|| {
            Error::internal_with_context("kubeconfig", format!("cluster {} has no uid", name))
        })?;
        let mut kubeconfig = Kubeconfig::new(
            &name,
            KubeconfigSpec {
                config_path: path.clone(),
            },
        );
        kubeconfig.metadata.owner_references = Some(vec![owner]);

        return match store.create_kubeconfig(&kubeconfig).await {
            Ok(created) => {
                info!(cluster = %name, path = %path, "Published kubeconfig");
                Ok(Some(created))
            }
            Err(Error::AlreadyExists { .. }) => {
                debug!(cluster = %name, "Kubeconfig created concurrently");
                Ok(None)
            }
            Err(e) => Err(e),
        };
    };

    let outcome = update_with_retry(
        "publish kubeconfig",
        &name,
        existing,
        || store.get_kubeconfig(&name),
        |kc| async move { store.update_kubeconfig(&kc).await },
        |kc| {
            if kc.spec.config_path == path {
                return false;
            }
            kc.spec.config_path = path.clone();
            true
        },
    )
    .await?;
    Ok(outcome.into_latest())
}
