//! Finalizer set and deletion lifecycle
//!
//! The controller's finalizer token blocks physical deletion of a Cluster
//! until external deprovisioning succeeded. Removing the token is the only
//! way a deletion completes.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Finalizer token owned by this controller
pub const CLUSTER_FINALIZER: &str = "clusterprovisioner.io/provisioner";

/// Set view over `metadata.finalizers`
///
/// Keeps insertion order of existing tokens and never holds duplicates.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FinalizerSet {
    tokens: Vec<String>,
}

impl FinalizerSet {
    /// Read the finalizers of an object, dropping duplicate tokens
    pub fn from_meta(meta: &ObjectMeta) -> Self {
        let mut set = Self::default();
        for token in meta.finalizers.iter().flatten() {
            set.attach(token);
        }
        set
    }

    /// Whether the token is present
    pub fn contains(&self, token: &str) -> bool {
        self.tokens.iter().any(|t| t == token)
    }

    /// Add the token; returns false if it was already present
    pub fn attach(&mut self, token: &str) -> bool {
        if self.contains(token) {
            return false;
        }
        self.tokens.push(token.to_string());
        true
    }

    /// Remove the token; returns false if it was absent
    pub fn detach(&mut self, token: &str) -> bool {
        let before = self.tokens.len();
        self.tokens.retain(|t| t != token);
        self.tokens.len() != before
    }

    /// Write the set back into object metadata
    pub fn apply_to(&self, meta: &mut ObjectMeta) {
        meta.finalizers = if self.tokens.is_empty() {
            None
        } else {
            Some(self.tokens.clone())
        };
    }
}

/// Attach `token` to an object's metadata; returns whether it changed
pub fn attach(meta: &mut ObjectMeta, token: &str) -> bool {
    let mut set = FinalizerSet::from_meta(meta);
    let changed = set.attach(token);
    if changed {
        set.apply_to(meta);
    }
    changed
}

/// Detach `token` from an object's metadata; returns whether it changed
pub fn detach(meta: &mut ObjectMeta, token: &str) -> bool {
    let mut set = FinalizerSet::from_meta(meta);
    let changed = set.detach(token);
    if changed {
        set.apply_to(meta);
    }
    changed
}

/// Where an entity stands in the deletion protocol for one finalizer token
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinalizerState {
    /// Token not present on a live entity
    Absent,
    /// Token present, entity active
    Attached,
    /// Deletion requested, token present, cleanup pending
    TearingDown,
    /// Deletion requested and token gone; the store erases the entity
    Removed,
}

impl FinalizerState {
    /// Derive the state from object metadata
    pub fn of(meta: &ObjectMeta, token: &str) -> Self {
        let attached = FinalizerSet::from_meta(meta).contains(token);
        match (meta.deletion_timestamp.is_some(), attached) {
            (false, false) => Self::Absent,
            (false, true) => Self::Attached,
            (true, true) => Self::TearingDown,
            (true, false) => Self::Removed,
        }
    }
}
