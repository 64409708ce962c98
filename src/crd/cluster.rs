//! Cluster Custom Resource Definition
//!
//! A Cluster declares the provisioning tool config it should be converged to.
//! The controller records what it actually applied in the status block.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{find_condition, Condition, ConditionStatus, ConditionType};

/// Desired state of a Cluster
///
/// Exactly one of `config` (inline) or `configPath` (file reference) must be set.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "clusterprovisioner.io",
    version = "v1alpha1",
    kind = "Cluster",
    plural = "clusters",
    status = "ClusterStatus",
    namespaced = false,
    printcolumn = r#"{"name":"Provisioned","type":"string","jsonPath":".status.conditions[?(@.type==\"Provisioned\")].status"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Inline provisioning tool config
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,

    /// Path to a provisioning tool config file readable by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,
}

/// Observed state of a Cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// SHA-256 of the last config the tool applied successfully
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub applied_config_hash: String,

    /// Conditions representing the cluster state; order is irrelevant
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl Cluster {
    /// Hash of the last successfully applied config, empty if never applied
    pub fn applied_config_hash(&self) -> &str {
        self.status
            .as_ref()
            .map(|s| s.applied_config_hash.as_str())
            .unwrap_or_default()
    }

    /// Current condition of the given type
    pub fn condition(&self, type_: ConditionType) -> Option<&Condition> {
        self.status
            .as_ref()
            .and_then(|s| find_condition(&s.conditions, type_))
    }

    /// Status of the given condition, `Unknown` when never recorded
    pub fn condition_status(&self, type_: ConditionType) -> ConditionStatus {
        self.condition(type_)
            .map(|c| c.status)
            .unwrap_or(ConditionStatus::Unknown)
    }

    /// Whether the given condition is `True`
    pub fn is_condition_true(&self, type_: ConditionType) -> bool {
        self.condition_status(type_) == ConditionStatus::True
    }

    /// Whether the store reported a deletion request for this cluster
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Value of an annotation, if present
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations().get(key).map(String::as_str)
    }
}
