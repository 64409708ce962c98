//! Retry utilities: per-key exponential backoff, the requeue policy, and the
//! bounded compare-and-retry update primitive.
//!
//! Two retry scopes exist. Within a single reconcile, store updates that hit
//! an optimistic-concurrency conflict are retried immediately (refetch,
//! reapply, write) at most [`MAX_UPDATE_ATTEMPTS`] times and then abandoned.
//! Across reconciles, failed keys go back on the work queue with exponential
//! backoff until [`RetryPolicy::max_requeues`] is reached.
//!
//! # Example
//!
//! ```ignore
//! use cluster_provisioner::retry::{update_with_retry, UpdateOutcome};
//!
//! let outcome = update_with_retry(
//!     "attach finalizer",
//!     &name,
//!     cluster,
//!     || store.get(&name),
//!     |c| async move { store.update(&c).await },
//!     |c| finalizer::attach(c, FINALIZER),
//! )
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::Error;

/// Maximum store writes per update call site before the update is abandoned
pub const MAX_UPDATE_ATTEMPTS: u32 = 3;

/// Exponential backoff with jitter.
///
/// Delays start at `initial_delay`, grow by `multiplier` per attempt and are
/// capped at `max_delay`. With jitter enabled each delay is scaled by a
/// random factor in 0.5x..1.5x to avoid thundering herds.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    /// Delay for the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Multiplier applied per attempt
    pub multiplier: f64,
    /// Whether to randomise delays
    pub jitter: bool,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ExponentialBackoff {
    /// Backoff without jitter, useful where delays must be predictable
    pub fn deterministic(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier: 2.0,
            jitter: false,
        }
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = (self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent))
            .min(self.max_delay.as_secs_f64());

        if !self.jitter {
            return Duration::from_secs_f64(base);
        }

        // Add jitter: 0.5x to 1.5x of the delay
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64((base * jitter).min(self.max_delay.as_secs_f64()))
    }
}

/// What to do with a key whose reconcile failed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put the key back on the queue with backoff
    Requeue,
    /// Stop retrying; the next watch event starts a fresh cycle
    Drop,
}

/// Bounded-attempt requeue policy for failed keys
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Requeues allowed for one key before it is dropped
    pub max_requeues: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_requeues: 15 }
    }
}

impl RetryPolicy {
    /// Create a policy with the given requeue bound
    pub fn with_max_requeues(max_requeues: u32) -> Self {
        Self { max_requeues }
    }

    /// Decide whether a key that already failed `attempts` times is requeued
    pub fn decide(&self, attempts: u32, error: &Error) -> RetryDecision {
        if !error.is_retryable() {
            return RetryDecision::Drop;
        }
        if attempts >= self.max_requeues {
            warn!(
                attempts,
                error = %error,
                "Requeue limit reached, waiting for next change"
            );
            return RetryDecision::Drop;
        }
        RetryDecision::Requeue
    }
}

/// Result of a bounded compare-and-retry update
#[derive(Clone, Debug, PartialEq)]
pub enum UpdateOutcome<T> {
    /// The mutation was written; carries the stored object
    Applied(T),
    /// The mutation was already satisfied; nothing was written
    Unchanged(T),
    /// The object disappeared from the store
    Gone,
    /// Every attempt hit a conflict; the update was dropped
    Abandoned,
}

impl<T> UpdateOutcome<T> {
    /// The latest known object, if the update did not lose track of it
    pub fn into_latest(self) -> Option<T> {
        match self {
            Self::Applied(t) | Self::Unchanged(t) => Some(t),
            Self::Gone | Self::Abandoned => None,
        }
    }
}

/// Apply `mutate` to `current` and write it, retrying on conflicts.
///
/// `mutate` returns whether it changed the object; an unchanged object is
/// never written. On a conflict the latest object is fetched and the
/// mutation reapplied, up to [`MAX_UPDATE_ATTEMPTS`] writes in total. When
/// every write conflicts the update is abandoned silently (debug log). Other
/// errors propagate.
pub async fn update_with_retry<T, F, FFut, W, WFut, M>(
    operation: &str,
    name: &str,
    current: T,
    mut fetch: F,
    mut write: W,
    mut mutate: M,
) -> Result<UpdateOutcome<T>, Error>
where
    T: Clone,
    F: FnMut() -> FFut,
    FFut: Future<Output = Result<Option<T>, Error>>,
    W: FnMut(T) -> WFut,
    WFut: Future<Output = Result<T, Error>>,
    M: FnMut(&mut T) -> bool,
{
    let mut latest = current;

    for attempt in 1..=MAX_UPDATE_ATTEMPTS {
        let mut candidate = latest.clone();
        if !mutate(&mut candidate) {
            return Ok(UpdateOutcome::Unchanged(latest));
        }

        match write(candidate).await {
            Ok(stored) => return Ok(UpdateOutcome::Applied(stored)),
            Err(e) if e.is_not_found() => return Ok(UpdateOutcome::Gone),
            Err(e) if e.is_conflict() => {
                debug!(operation, name, attempt, "Update conflict, refetching");
                if attempt == MAX_UPDATE_ATTEMPTS {
                    break;
                }
                latest = match fetch().await? {
                    Some(fresh) => fresh,
                    None => return Ok(UpdateOutcome::Gone),
                };
            }
            Err(e) => return Err(e),
        }
    }

    debug!(
        operation,
        name,
        attempts = MAX_UPDATE_ATTEMPTS,
        "Abandoning update after repeated conflicts"
    );
    Ok(UpdateOutcome::Abandoned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_deterministic_backoff_doubles_and_caps() {
        let backoff =
            ExponentialBackoff::deterministic(Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(0), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(1), Duration::from_millis(200));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(800));
        assert_eq!(backoff.delay_for(4), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(60), Duration::from_secs(1));
    }

    #[test]
    fn test_jittered_backoff_stays_in_bounds() {
        let backoff = ExponentialBackoff::default();
        for attempt in 0..10 {
            let delay = backoff.delay_for(attempt);
            assert!(delay <= backoff.max_delay);
            assert!(delay >= Duration::from_millis(250));
        }
    }

    #[test]
    fn test_policy_requeues_until_limit() {
        let policy = RetryPolicy::with_max_requeues(2);
        let err = Error::provisioning("c1", "apply", "exit status 1");
        assert_eq!(policy.decide(0, &err), RetryDecision::Requeue);
        assert_eq!(policy.decide(1, &err), RetryDecision::Requeue);
        assert_eq!(policy.decide(2, &err), RetryDecision::Drop);
    }

    #[test]
    fn test_policy_drops_non_retryable_errors() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(0, &Error::not_found("Cluster", "c1")),
            RetryDecision::Drop
        );
        assert_eq!(
            policy.decide(0, &Error::invalid_config("c1", "no config")),
            RetryDecision::Drop
        );
    }

    /// Writes fail with a conflict for the first `conflicts` calls
    async fn run_update(conflicts: u32) -> (Result<UpdateOutcome<u32>, Error>, u32, u32) {
        let writes = Arc::new(AtomicU32::new(0));
        let fetches = Arc::new(AtomicU32::new(0));
        let w = writes.clone();
        let f = fetches.clone();

        let result = update_with_retry(
            "test",
            "c1",
            0u32,
            || {
                let f = f.clone();
                async move {
                    f.fetch_add(1, Ordering::SeqCst);
                    Ok(Some(10))
                }
            },
            |value| {
                let w = w.clone();
                async move {
                    if w.fetch_add(1, Ordering::SeqCst) < conflicts {
                        Err(Error::conflict("Cluster", "c1"))
                    } else {
                        Ok(value)
                    }
                }
            },
            |value| {
                *value += 1;
                true
            },
        )
        .await;

        (
            result,
            writes.load(Ordering::SeqCst),
            fetches.load(Ordering::SeqCst),
        )
    }

    #[tokio::test]
    async fn test_update_applies_first_try() {
        let (result, writes, fetches) = run_update(0).await;
        assert_eq!(result.unwrap(), UpdateOutcome::Applied(1));
        assert_eq!(writes, 1);
        assert_eq!(fetches, 0);
    }

    #[tokio::test]
    async fn test_update_refetches_and_reapplies_after_conflict() {
        let (result, writes, fetches) = run_update(2).await;
        // The third write is made against the refetched value (10) + 1
        assert_eq!(result.unwrap(), UpdateOutcome::Applied(11));
        assert_eq!(writes, 3);
        assert_eq!(fetches, 2);
    }

    #[tokio::test]
    async fn test_update_abandons_silently_after_three_conflicts() {
        let (result, writes, _) = run_update(u32::MAX).await;
        assert_eq!(result.unwrap(), UpdateOutcome::Abandoned);
        assert_eq!(writes, MAX_UPDATE_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_unchanged_mutation_is_not_written() {
        let writes = Arc::new(AtomicU32::new(0));
        let w = writes.clone();
        let result = update_with_retry(
            "test",
            "c1",
            5u32,
            || async { Ok(Some(5)) },
            |value| {
                let w = w.clone();
                async move {
                    w.fetch_add(1, Ordering::SeqCst);
                    Ok(value)
                }
            },
            |_| false,
        )
        .await;

        assert_eq!(result.unwrap(), UpdateOutcome::Unchanged(5));
        assert_eq!(writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_update_reports_gone_when_refetch_finds_nothing() {
        let result = update_with_retry(
            "test",
            "c1",
            0u32,
            || async { Ok(None) },
            |_| async { Err(Error::conflict("Cluster", "c1")) },
            |value| {
                *value += 1;
                true
            },
        )
        .await;
        assert_eq!(result.unwrap(), UpdateOutcome::Gone);
    }

    #[tokio::test]
    async fn test_non_conflict_errors_propagate() {
        let result = update_with_retry(
            "test",
            "c1",
            0u32,
            || async { Ok(Some(0)) },
            |_| async { Err(Error::internal_with_context("store", "unreachable")) },
            |value| {
                *value += 1;
                true
            },
        )
        .await;
        assert!(result.is_err());
    }
}
