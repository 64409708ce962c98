//! API server health probe for provisioned clusters

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// Default budget for one probe, connection included
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Checks that a provisioned cluster's API server answers
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probe the API server reachable through the kubeconfig at
    /// `kubeconfig_path`; returns its reported version
    async fn probe(&self, cluster: &str, kubeconfig_path: &Path) -> Result<String, Error>;
}

/// Probe using a kube client built from the published kubeconfig
#[derive(Clone, Debug)]
pub struct KubeHealthProbe {
    timeout: Duration,
}

impl Default for KubeHealthProbe {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

impl KubeHealthProbe {
    /// Create a probe with a custom timeout
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn client(&self, cluster: &str, kubeconfig_path: &Path) -> Result<Client, Error> {
        let kubeconfig = Kubeconfig::read_from(kubeconfig_path).map_err(|e| {
            Error::health_check(
                cluster,
                format!("failed to read kubeconfig {}: {}", kubeconfig_path.display(), e),
            )
        })?;
        let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::health_check(cluster, format!("failed to load kubeconfig: {}", e)))?;
        config.connect_timeout = Some(self.timeout);
        config.read_timeout = Some(self.timeout);
        Client::try_from(config)
            .map_err(|e| Error::health_check(cluster, format!("failed to create client: {}", e)))
    }
}

#[async_trait]
impl HealthProbe for KubeHealthProbe {
    async fn probe(&self, cluster: &str, kubeconfig_path: &Path) -> Result<String, Error> {
        let client = self.client(cluster, kubeconfig_path).await?;
        let info = tokio::time::timeout(self.timeout, client.apiserver_version())
            .await
            .map_err(|_| Error::health_check(cluster, "timeout waiting for API server"))?
            .map_err(|e| Error::health_check(cluster, format!("API request failed: {}", e)))?;
        debug!(cluster = %cluster, version = %info.git_version, "API server reachable");
        Ok(info.git_version)
    }
}
