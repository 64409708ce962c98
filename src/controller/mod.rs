//! Cluster controller
//!
//! Keys flow from the watch bridge into the work queue; the dispatcher's
//! workers resolve each key to the stored Cluster and hand it to
//! [`reconcile`], which routes to the deletion path or the convergence path.

mod cluster;
mod health;
mod kubeconfig;
mod runner;
pub mod watch;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use kube::Client;

use crate::provisioner::{CommandProvisioner, Provisioner, ToolConfig};
use crate::retry::{ExponentialBackoff, RetryPolicy};
use crate::store::{ClusterStore, KubeStore, KubeconfigStore};

pub use cluster::{converge, finalize, reconcile, VERSION_ANNOTATION};
pub use health::{HealthProbe, KubeHealthProbe};
pub use kubeconfig::publish_kubeconfig;
pub use runner::Dispatcher;

#[cfg(test)]
pub use health::MockHealthProbe;

/// What the dispatcher should do with a key after a successful reconcile
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Reconcile again after `duration`
    pub fn requeue(duration: Duration) -> Self {
        Self {
            requeue_after: Some(duration),
        }
    }

    /// Wait for the next watch event
    pub fn await_change() -> Self {
        Self {
            requeue_after: None,
        }
    }

    /// Delay before the key is reconciled again, if any
    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

/// Tunables of the controller
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Number of concurrent reconcile workers
    pub workers: usize,
    /// Directory inline configs are materialised under
    pub state_dir: PathBuf,
    /// Period between health probes of a provisioned cluster
    pub health_interval: Duration,
    /// Requeue bound for failed keys
    pub retry: RetryPolicy,
    /// Per-key backoff between requeues of a failed key
    pub backoff: ExponentialBackoff,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            state_dir: PathBuf::from("/var/lib/cluster-provisioner"),
            health_interval: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            backoff: ExponentialBackoff::default(),
        }
    }
}

/// Controller context shared by every reconcile
///
/// Collaborators are trait objects so tests can swap the store, the tool and
/// the health probe. Use [`Context::builder`] for the Kubernetes-backed set:
///
/// ```ignore
/// let ctx = Context::builder(client)
///     .tool(ToolConfig::default())
///     .config(ControllerConfig::default())
///     .build();
/// ```
pub struct Context {
    /// Cluster store
    pub store: Arc<dyn ClusterStore>,
    /// Kubeconfig store
    pub kubeconfigs: Arc<dyn KubeconfigStore>,
    /// Provisioning tool
    pub provisioner: Arc<dyn Provisioner>,
    /// API server probe for provisioned clusters
    pub health: Arc<dyn HealthProbe>,
    /// Tunables
    pub config: ControllerConfig,
}

impl Context {
    /// Create a builder for the Kubernetes-backed context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Assemble a context from explicit collaborators
    pub fn from_parts(
        store: Arc<dyn ClusterStore>,
        kubeconfigs: Arc<dyn KubeconfigStore>,
        provisioner: Arc<dyn Provisioner>,
        health: Arc<dyn HealthProbe>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            store,
            kubeconfigs,
            provisioner,
            health,
            config,
        }
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    client: Client,
    provisioner: Option<Arc<dyn Provisioner>>,
    health: Option<Arc<dyn HealthProbe>>,
    tool: ToolConfig,
    config: ControllerConfig,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            provisioner: None,
            health: None,
            tool: ToolConfig::default(),
            config: ControllerConfig::default(),
        }
    }

    /// Set how the provisioning tool is invoked
    pub fn tool(mut self, tool: ToolConfig) -> Self {
        self.tool = tool;
        self
    }

    /// Set the controller tunables
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the provisioner (primarily for testing)
    pub fn provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    /// Override the health probe (primarily for testing)
    pub fn health_probe(mut self, health: Arc<dyn HealthProbe>) -> Self {
        self.health = Some(health);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let store = Arc::new(KubeStore::new(self.client));
        let tool = self.tool;
        Context {
            store: store.clone(),
            kubeconfigs: store,
            provisioner: self
                .provisioner
                .unwrap_or_else(|| Arc::new(CommandProvisioner::new(tool))),
            health: self
                .health
                .unwrap_or_else(|| Arc::new(KubeHealthProbe::default())),
            config: self.config,
        }
    }
}
