//! Condition tracking for multi-step cluster progress
//!
//! A unit of work (apply the config, probe the API server) is run under a
//! named condition. Its outcome becomes an [`Observation`], the pure
//! [`transition`] function folds it into the previous condition, and the
//! result is persisted with bounded conflict retry.
//!
//! Writes are suppressed when the observation did not change, and
//! `lastTransitionTime` only moves when the status flips. Status writes
//! produce watch events, so rewriting an identical condition would keep
//! re-triggering reconciles.

use std::future::Future;

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use tracing::debug;

use crate::crd::{
    find_condition, set_condition, Cluster, ClusterStatus, Condition, ConditionStatus,
    ConditionType,
};
use crate::retry::UpdateOutcome;
use crate::store::{update_status_with_retry, ClusterStore};
use crate::Error;

/// Reason recorded when a condition is gated on an unsatisfied prerequisite
pub const REASON_PREREQUISITE_NOT_MET: &str = "PrerequisiteNotMet";

/// Outcome of a unit of work, before it is folded into a condition
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Observation {
    /// The unit succeeded
    Satisfied {
        /// Machine-readable reason
        reason: String,
        /// Human-readable detail
        message: String,
    },
    /// The unit failed
    Failed {
        /// Machine-readable reason
        reason: String,
        /// The unit's error
        message: String,
    },
    /// The condition cannot be decided yet
    Undecided {
        /// Machine-readable reason
        reason: String,
        /// Human-readable detail
        message: String,
    },
}

impl Observation {
    /// A successful outcome
    pub fn satisfied(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Satisfied {
            reason: reason.into(),
            message: message.into(),
        }
    }

    /// A failed outcome, reason and message taken from the error
    pub fn failed(error: &Error) -> Self {
        Self::Failed {
            reason: error.reason().to_string(),
            message: error.to_string(),
        }
    }

    /// An outcome that leaves the condition undecided
    pub fn undecided(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Undecided {
            reason: reason.into(),
            message: message.into(),
        }
    }

    /// Condition status this observation maps to
    pub fn status(&self) -> ConditionStatus {
        match self {
            Self::Satisfied { .. } => ConditionStatus::True,
            Self::Failed { .. } => ConditionStatus::False,
            Self::Undecided { .. } => ConditionStatus::Unknown,
        }
    }

    fn parts(&self) -> (&str, &str) {
        match self {
            Self::Satisfied { reason, message }
            | Self::Failed { reason, message }
            | Self::Undecided { reason, message } => (reason, message),
        }
    }
}

/// Fold an observation into the previous condition of the same type.
///
/// Returns `None` when the observation matches the previous condition, in
/// which case nothing should be written. The transition time is carried
/// over unless the status changed.
pub fn transition(
    previous: Option<&Condition>,
    type_: ConditionType,
    observation: &Observation,
    now: DateTime<Utc>,
) -> Option<Condition> {
    let status = observation.status();
    let (reason, message) = observation.parts();

    let last_transition_time = match previous {
        Some(prev) if prev.status == status => prev.last_transition_time,
        _ => now,
    };
    let next = Condition {
        type_,
        status,
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time,
    };

    match previous {
        Some(prev) if prev.same_observation(&next) => None,
        _ => Some(next),
    }
}

/// Apply an observation to a cluster's status; returns whether it changed
pub fn apply_observation(
    cluster: &mut Cluster,
    type_: ConditionType,
    observation: &Observation,
    now: DateTime<Utc>,
) -> bool {
    let status = cluster.status.get_or_insert_with(ClusterStatus::default);
    let previous = find_condition(&status.conditions, type_);
    match transition(previous, type_, observation, now) {
        Some(next) => {
            set_condition(&mut status.conditions, next);
            true
        }
        None => false,
    }
}

/// What a unit of work reports when it did not fail
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Progress<T> {
    /// Work done; the condition becomes `True`
    Complete(T),
    /// Not decidable yet; the condition becomes `Unknown` with this reason
    Pending {
        /// Machine-readable reason
        reason: String,
        /// Human-readable detail
        message: String,
    },
}

impl<T> Progress<T> {
    /// A pending result
    pub fn pending(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Pending {
            reason: reason.into(),
            message: message.into(),
        }
    }
}

/// Result of a tracked unit
#[derive(Debug)]
pub enum TrackResult<T> {
    /// The unit succeeded with this value
    Complete(T),
    /// The unit reported the condition undecidable
    Pending,
    /// The unit was not run because its prerequisite is not `True`
    Blocked(ConditionType),
    /// The unit failed; the error is recorded on the condition
    Failed(Error),
}

/// A tracked unit's result together with the cluster after persisting it
#[derive(Debug)]
pub struct Tracked<T> {
    /// Latest stored cluster, `None` if the write was abandoned or the
    /// cluster disappeared
    pub cluster: Option<Cluster>,
    /// What the unit reported
    pub result: TrackResult<T>,
}

/// Runs units of work under named conditions and persists their outcome
pub struct ConditionTracker<'a> {
    store: &'a dyn ClusterStore,
}

impl<'a> ConditionTracker<'a> {
    /// Create a tracker writing through the given store
    pub fn new(store: &'a dyn ClusterStore) -> Self {
        Self { store }
    }

    /// Run `unit` under condition `type_` and persist the outcome.
    ///
    /// If the condition has a prerequisite that is not `True`, the unit is
    /// skipped and the condition recorded `Unknown`. A failing unit is
    /// reported through [`TrackResult::Failed`], not as an `Err`; `Err` is
    /// reserved for store failures while persisting.
    pub async fn track<T, U, Fut>(
        &self,
        cluster: Cluster,
        type_: ConditionType,
        unit: U,
    ) -> Result<Tracked<T>, Error>
    where
        U: FnOnce() -> Fut,
        Fut: Future<Output = Result<Progress<T>, Error>>,
    {
        let (observation, result) = match type_.prerequisite() {
            Some(prerequisite) if !cluster.is_condition_true(prerequisite) => (
                Observation::undecided(
                    REASON_PREREQUISITE_NOT_MET,
                    format!("waiting for {} to be True", prerequisite),
                ),
                TrackResult::Blocked(prerequisite),
            ),
            _ => match unit().await {
                Ok(Progress::Complete(value)) => (
                    Observation::satisfied("Succeeded", ""),
                    TrackResult::Complete(value),
                ),
                Ok(Progress::Pending { reason, message }) => (
                    Observation::undecided(reason, message),
                    TrackResult::Pending,
                ),
                Err(e) => (Observation::failed(&e), TrackResult::Failed(e)),
            },
        };

        let name = cluster.name_any();
        let now = Utc::now();
        let operation = format!("set {} condition", type_);
        let outcome = update_status_with_retry(self.store, &operation, cluster, |c| {
            apply_observation(c, type_, &observation, now)
        })
        .await?;

        if matches!(outcome, UpdateOutcome::Abandoned) {
            debug!(cluster = %name, condition = %type_, "Condition write abandoned");
        }

        Ok(Tracked {
            cluster: outcome.into_latest(),
            result,
        })
    }
}
