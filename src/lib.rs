//! Cluster Provisioner - CRD-driven controller that converges `Cluster` resources
//!
//! Each `Cluster` names a desired cluster configuration, either inline or by
//! file path. The controller drives an external provisioning tool until the
//! applied configuration matches, publishes the resulting admin kubeconfig as
//! a `Kubeconfig` resource, probes the cluster's API server for readiness,
//! and tears the cluster down before letting the `Cluster` be deleted.
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (Cluster, Kubeconfig, conditions)
//! - [`queue`] - Rate-limited work queue keyed by cluster name
//! - [`controller`] - Reconcile logic, dispatcher workers and watch bridge
//! - [`finalizer`] - Finalizer attach/detach and deletion state
//! - [`condition`] - Condition transitions and tracked units of work
//! - [`retry`] - Backoff, requeue policy and bounded update retries
//! - [`provisioner`] - External provisioning tool invocation
//! - [`store`] - Resource store abstraction (Kubernetes API and in-memory)
//! - [`telemetry`] - Logging initialization
//! - [`error`] - Error types for the controller

#![deny(missing_docs)]

pub mod condition;
pub mod controller;
pub mod crd;
pub mod error;
pub mod finalizer;
pub mod provisioner;
pub mod queue;
pub mod retry;
pub mod store;
pub mod telemetry;

pub use error::Error;

/// Field manager recorded on every write to the API server
pub const FIELD_MANAGER: &str = "cluster-provisioner";
