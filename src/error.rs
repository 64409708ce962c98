//! Error types for the cluster provisioner
//!
//! Errors are structured with fields to aid debugging in production. Each
//! variant carries the cluster (or resource) it concerns so log lines and
//! condition messages can be traced back to a single entity.

use thiserror::Error;

/// Main error type for provisioner operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error that did not map onto a more specific variant
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The resource vanished from the store
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind (Cluster, Kubeconfig)
        kind: String,
        /// Resource name
        name: String,
    },

    /// Optimistic-concurrency mismatch on update
    #[error("conflict updating {kind} {name}: resource version is stale")]
    Conflict {
        /// Resource kind (Cluster, Kubeconfig)
        kind: String,
        /// Resource name
        name: String,
    },

    /// Create of a resource that already exists
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Resource kind (Cluster, Kubeconfig)
        kind: String,
        /// Resource name
        name: String,
    },

    /// The desired config cannot be read or is not specified correctly
    #[error("invalid config for {cluster}: {message}")]
    InvalidConfig {
        /// Cluster whose spec is malformed
        cluster: String,
        /// What is wrong with it
        message: String,
    },

    /// The provisioning tool reported failure
    #[error("provisioning tool `{verb}` failed for {cluster}: {message}")]
    Provisioning {
        /// Cluster being provisioned or torn down
        cluster: String,
        /// Tool verb (apply, deprovision)
        verb: String,
        /// Exit status and tail of the tool output
        message: String,
    },

    /// The provisioned cluster did not answer its health probe
    #[error("health check failed for {cluster}: {message}")]
    HealthCheck {
        /// Cluster that was probed
        cluster: String,
        /// Probe failure
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where the error occurred (e.g., "queue", "dispatcher", "watcher")
        context: String,
    },
}

impl Error {
    /// Create a not-found error for a resource
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a conflict error for a resource
    pub fn conflict(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Conflict {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an already-exists error for a resource
    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an invalid config error for a cluster
    pub fn invalid_config(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidConfig {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a provisioning tool error
    pub fn provisioning(
        cluster: impl Into<String>,
        verb: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Provisioning {
            cluster: cluster.into(),
            verb: verb.into(),
            message: msg.into(),
        }
    }

    /// Create a health check error
    pub fn health_check(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::HealthCheck {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Map a kube API error for a named resource onto the store taxonomy.
    ///
    /// 404 becomes `NotFound`; 409 becomes `AlreadyExists` on create and
    /// `Conflict` otherwise. Everything else stays a `Kube` error.
    pub fn from_kube(kind: &str, name: &str, creating: bool, err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(ae) if ae.code == 404 => Self::not_found(kind, name),
            kube::Error::Api(ae) if ae.code == 409 && creating => {
                Self::already_exists(kind, name)
            }
            kube::Error::Api(ae) if ae.code == 409 => Self::conflict(kind, name),
            _ => Self::Kube { source: err },
        }
    }

    /// Whether the entity is gone from the store
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether this is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Whether requeueing the key can make progress without a spec change
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::NotFound { .. } | Self::InvalidConfig { .. })
    }

    /// Machine-readable reason recorded on a condition that failed with this error
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Kube { .. } | Self::NotFound { .. } | Self::AlreadyExists { .. } => {
                "StoreError"
            }
            Self::Conflict { .. } => "Conflict",
            Self::InvalidConfig { .. } => "InvalidConfig",
            Self::Provisioning { .. } => "ProvisioningFailed",
            Self::HealthCheck { .. } => "HealthCheckFailed",
            Self::Internal { .. } => "InternalError",
        }
    }
}
