//! Custom Resource Definitions for the cluster provisioner
//!
//! This module contains all CRD definitions watched or written by the controller.

mod cluster;
mod kubeconfig;
mod types;

pub use cluster::{Cluster, ClusterSpec, ClusterStatus};
pub use kubeconfig::{Kubeconfig, KubeconfigSpec};
pub use types::{find_condition, set_condition, Condition, ConditionStatus, ConditionType};
