//! Kubeconfig Custom Resource Definition
//!
//! Published for each provisioned Cluster so other components can find the
//! admin kubeconfig the provisioning tool wrote next to the cluster config.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Location of the kubeconfig for a provisioned cluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "clusterprovisioner.io",
    version = "v1alpha1",
    kind = "Kubeconfig",
    plural = "kubeconfigs",
    namespaced = false,
    printcolumn = r#"{"name":"Path","type":"string","jsonPath":".spec.configPath"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KubeconfigSpec {
    /// Filesystem path of the kubeconfig written by the provisioning tool
    pub config_path: String,
}
