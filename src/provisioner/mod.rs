//! Provisioning collaborator
//!
//! The controller drives an external tool that applies or tears down a
//! cluster from a config file. This module owns the boundary:
//! - [`Provisioner`]: the trait the reconciler calls (mocked in tests)
//! - [`DesiredConfig`]: resolution of a Cluster's spec to a config file and
//!   its content hash
//! - [`CommandProvisioner`]: the subprocess-backed implementation

mod command;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use kube::ResourceExt;
use sha2::{Digest, Sha256};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::Cluster;
use crate::Error;

pub use self::command::{split_args, CommandProvisioner, ToolConfig, CONFIG_PLACEHOLDER};

/// File name inline configs are materialised under
pub const INLINE_CONFIG_FILE: &str = "cluster.yml";

/// Prefix of the kubeconfig file the tool writes next to its config
pub const KUBECONFIG_PREFIX: &str = "kube_config_";

/// Operation requested from the provisioning tool
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Verb {
    /// Create or converge the cluster to the config
    Apply,
    /// Tear the cluster down
    Deprovision,
}

impl Verb {
    /// Lowercase name used in logs and errors
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Apply => "apply",
            Self::Deprovision => "deprovision",
        }
    }
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runs the external provisioning tool
///
/// Implementations block until the tool exits and forward its output
/// line-by-line while it runs. A non-zero exit is an error.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Run `verb` for `cluster` against the config file at `config_path`
    async fn run(&self, cluster: &str, verb: Verb, config_path: &Path) -> Result<(), Error>;
}

/// Lowercase hex SHA-256 of config bytes
pub fn config_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum ConfigSource {
    Inline(String),
    File,
}

/// A Cluster's desired config, resolved to a file path and content hash
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DesiredConfig {
    /// File the provisioning tool reads
    pub path: PathBuf,
    /// Hex SHA-256 of the config content
    pub hash: String,
    source: ConfigSource,
}

impl DesiredConfig {
    /// Resolve the spec of `cluster`.
    ///
    /// Exactly one of `config` and `configPath` must be set. Inline configs
    /// are placed under `state_dir/<cluster>/`; referenced files are read to
    /// compute the hash. Any problem is an `InvalidConfig` error.
    pub async fn resolve(cluster: &Cluster, state_dir: &Path) -> Result<Self, Error> {
        let name = cluster.name_any();
        match (&cluster.spec.config, &cluster.spec.config_path) {
            (Some(inline), None) => Ok(Self {
                path: state_dir.join(&name).join(INLINE_CONFIG_FILE),
                hash: config_hash(inline.as_bytes()),
                source: ConfigSource::Inline(inline.clone()),
            }),
            (None, Some(path)) => {
                let bytes = tokio::fs::read(path).await.map_err(|e| {
                    Error::invalid_config(&name, format!("cannot read configPath {}: {}", path, e))
                })?;
                Ok(Self {
                    path: PathBuf::from(path),
                    hash: config_hash(&bytes),
                    source: ConfigSource::File,
                })
            }
            (Some(_), Some(_)) => Err(Error::invalid_config(
                &name,
                "config and configPath are mutually exclusive",
            )),
            (None, None) => Err(Error::invalid_config(
                &name,
                "one of config or configPath must be set",
            )),
        }
    }

    /// Make sure the config file exists on disk before the tool runs
    pub async fn materialize(&self) -> Result<(), Error> {
        let ConfigSource::Inline(content) = &self.source else {
            return Ok(());
        };
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                Error::internal_with_context(
                    "state-dir",
                    format!("cannot create {}: {}", dir.display(), e),
                )
            })?;
        }
        tokio::fs::write(&self.path, content).await.map_err(|e| {
            Error::internal_with_context(
                "state-dir",
                format!("cannot write {}: {}", self.path.display(), e),
            )
        })?;
        debug!(path = %self.path.display(), "Materialized inline config");
        Ok(())
    }

    /// Where the tool leaves the kubeconfig of the provisioned cluster
    pub fn kubeconfig_path(&self) -> PathBuf {
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| INLINE_CONFIG_FILE.to_string());
        let dir = self.path.parent().unwrap_or_else(|| Path::new(""));
        dir.join(format!("{}{}", KUBECONFIG_PREFIX, file_name))
    }
}
