//! Cluster reconciliation
//!
//! Convergence (live Cluster):
//! 1. Resolve the desired config and its hash
//! 2. If the hash differs from `status.appliedConfigHash`: attach the
//!    finalizer, apply under the `Provisioned` condition, record the hash
//! 3. Publish the Kubeconfig, probe the API server under `Ready`, annotate
//!    the Kubernetes version
//!
//! Deletion (Cluster with `deletionTimestamp`): deprovision under the
//! `Deprovisioned` condition, then detach the finalizer. The finalizer is
//! never removed past a failed deprovision.

use std::path::Path;
use std::sync::Arc;

use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use super::kubeconfig::publish_kubeconfig;
use super::{Action, Context};
use crate::condition::{
    apply_observation, ConditionTracker, Observation, Progress, TrackResult,
};
use crate::crd::{Cluster, ClusterStatus, ConditionType};
use crate::finalizer::{self, FinalizerState, CLUSTER_FINALIZER};
use crate::provisioner::{DesiredConfig, Verb};
use crate::retry::UpdateOutcome;
use crate::store::{update_cluster_with_retry, update_status_with_retry};
use crate::Error;

/// Annotation carrying the API server version of a ready cluster
pub const VERSION_ANNOTATION: &str = "clusterprovisioner.io/kubernetes-version";

/// Reconcile a Cluster
///
/// Routes to [`finalize`] when deletion was requested and to [`converge`]
/// otherwise. An `Err` sends the key through the retry policy.
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn reconcile(cluster: Arc<Cluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    if cluster.is_deleting() {
        finalize(&cluster, &ctx).await
    } else {
        converge(&cluster, &ctx).await
    }
}

/// Drive a live Cluster towards its spec
pub async fn converge(cluster: &Cluster, ctx: &Context) -> Result<Action, Error> {
    let desired = match DesiredConfig::resolve(cluster, &ctx.config.state_dir).await {
        Ok(desired) => desired,
        Err(e) if !e.is_retryable() => {
            warn!(error = %e, "cluster spec is malformed");
            record_failure(cluster.clone(), ConditionType::Provisioned, &e, ctx).await?;
            // A spec change is needed; retrying would only spin
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e),
    };

    let mut current = cluster.clone();
    // A matching hash only counts while the last attempt left Provisioned True
    if desired.hash == current.applied_config_hash()
        && current.is_condition_true(ConditionType::Provisioned)
    {
        debug!(hash = %desired.hash, "config already applied");
    } else {
        info!(hash = %desired.hash, "config changed; provisioning");
        match provision(current, &desired, ctx).await? {
            Some(provisioned) => current = provisioned,
            None => return Ok(Action::await_change()),
        }
    }

    observe(current, &desired, ctx).await
}

/// Attach the finalizer, run the tool and record the applied hash.
///
/// `None` means a write was abandoned or the Cluster vanished; the next
/// watch event restarts the cycle.
async fn provision(
    cluster: Cluster,
    desired: &DesiredConfig,
    ctx: &Context,
) -> Result<Option<Cluster>, Error> {
    let name = cluster.name_any();
    let store = ctx.store.as_ref();

    let attached = update_cluster_with_retry(store, "attach finalizer", cluster, |c| {
        finalizer::attach(&mut c.metadata, CLUSTER_FINALIZER)
    })
    .await?;
    let cluster = match attached {
        UpdateOutcome::Applied(c) | UpdateOutcome::Unchanged(c) => c,
        UpdateOutcome::Gone | UpdateOutcome::Abandoned => return Ok(None),
    };

    let tracked = ConditionTracker::new(store)
        .track(cluster, ConditionType::Provisioned, || async {
            desired.materialize().await?;
            ctx.provisioner
                .run(&name, Verb::Apply, &desired.path)
                .await?;
            Ok::<_, Error>(Progress::Complete(()))
        })
        .await?;

    match tracked.result {
        TrackResult::Complete(()) => {}
        TrackResult::Failed(e) => return Err(e),
        TrackResult::Pending | TrackResult::Blocked(_) => return Ok(None),
    }
    let Some(cluster) = tracked.cluster else {
        return Ok(None);
    };

    let hash = desired.hash.clone();
    let recorded = update_status_with_retry(store, "record applied config", cluster, |c| {
        let status = c.status.get_or_insert_with(ClusterStatus::default);
        if status.applied_config_hash == hash {
            return false;
        }
        status.applied_config_hash = hash.clone();
        true
    })
    .await?;

    let cluster = recorded.into_latest();
    if cluster.is_some() {
        info!("Successfully provisioned cluster");
    }
    Ok(cluster)
}

/// Post-provisioning steps: Kubeconfig, Ready, version annotation
async fn observe(cluster: Cluster, desired: &DesiredConfig, ctx: &Context) -> Result<Action, Error> {
    let name = cluster.name_any();

    if cluster.is_condition_true(ConditionType::Provisioned) {
        publish_kubeconfig(&cluster, &desired.kubeconfig_path(), ctx.kubeconfigs.as_ref()).await?;
    }

    let tracked = ConditionTracker::new(ctx.store.as_ref())
        .track(cluster, ConditionType::Ready, || async {
            let Some(kubeconfig) = ctx.kubeconfigs.get_kubeconfig(&name).await? else {
                return Ok(Progress::pending(
                    "KubeconfigMissing",
                    "no Kubeconfig published yet",
                ));
            };
            let version = ctx
                .health
                .probe(&name, Path::new(&kubeconfig.spec.config_path))
                .await?;
            Ok::<_, Error>(Progress::Complete(version))
        })
        .await?;

    match tracked.result {
        TrackResult::Complete(version) => {
            if let Some(cluster) = tracked.cluster {
                annotate_version(cluster, &version, ctx).await?;
            }
        }
        TrackResult::Failed(e) => warn!(error = %e, "cluster is not healthy"),
        TrackResult::Pending => debug!("readiness not decidable yet"),
        TrackResult::Blocked(prerequisite) => {
            debug!(%prerequisite, "readiness gated");
            return Ok(Action::await_change());
        }
    }

    Ok(Action::requeue(ctx.config.health_interval))
}

/// Record the API server version, written only when it differs
async fn annotate_version(cluster: Cluster, version: &str, ctx: &Context) -> Result<(), Error> {
    if !(cluster.is_condition_true(ConditionType::Provisioned)
        && cluster.is_condition_true(ConditionType::Ready))
    {
        return Ok(());
    }

    let outcome = update_cluster_with_retry(
        ctx.store.as_ref(),
        "annotate kubernetes version",
        cluster,
        |c| {
            if c.annotation(VERSION_ANNOTATION) == Some(version) {
                return false;
            }
            c.annotations_mut()
                .insert(VERSION_ANNOTATION.to_string(), version.to_string());
            true
        },
    )
    .await?;

    if let UpdateOutcome::Applied(_) = outcome {
        info!(version, "Recorded Kubernetes version");
    }
    Ok(())
}

/// Record a failure on a condition without running any unit
async fn record_failure(
    cluster: Cluster,
    type_: ConditionType,
    error: &Error,
    ctx: &Context,
) -> Result<(), Error> {
    let observation = Observation::failed(error);
    let now = chrono::Utc::now();
    update_status_with_retry(ctx.store.as_ref(), "record failure", cluster, |c| {
        apply_observation(c, type_, &observation, now)
    })
    .await?;
    Ok(())
}

/// Tear down a Cluster whose deletion was requested
///
/// Teardown runs under the `Deprovisioned` condition, so a failure (a
/// malformed spec included) is visible on the Cluster. The finalizer is
/// detached only after the tool reports a successful deprovision; any
/// failure leaves the Cluster in `TearingDown` and returns the error so the
/// dispatcher keeps retrying the key.
pub async fn finalize(cluster: &Cluster, ctx: &Context) -> Result<Action, Error> {
    let name = cluster.name_any();

    match FinalizerState::of(&cluster.metadata, CLUSTER_FINALIZER) {
        FinalizerState::TearingDown => {}
        state => {
            debug!(?state, "nothing to tear down");
            return Ok(Action::await_change());
        }
    }

    info!("Removing cluster");
    let tracked = ConditionTracker::new(ctx.store.as_ref())
        .track(cluster.clone(), ConditionType::Deprovisioned, || async {
            let desired = DesiredConfig::resolve(cluster, &ctx.config.state_dir).await?;
            desired.materialize().await?;
            ctx.provisioner
                .run(&name, Verb::Deprovision, &desired.path)
                .await?;
            Ok::<_, Error>(Progress::Complete(()))
        })
        .await?;

    match tracked.result {
        TrackResult::Complete(()) => {}
        TrackResult::Failed(e) => {
            warn!(error = %e, "teardown failed");
            return Err(e);
        }
        TrackResult::Pending | TrackResult::Blocked(_) => {
            return Ok(Action::requeue(ctx.config.health_interval));
        }
    }

    // The tool succeeded; a lost status write must not keep the finalizer
    let latest = tracked.cluster.unwrap_or_else(|| cluster.clone());
    let outcome = update_cluster_with_retry(
        ctx.store.as_ref(),
        "detach finalizer",
        latest,
        |c| finalizer::detach(&mut c.metadata, CLUSTER_FINALIZER),
    )
    .await?;

    match outcome {
        UpdateOutcome::Applied(_) | UpdateOutcome::Unchanged(_) | UpdateOutcome::Gone => {
            info!("Successfully removed cluster");
        }
        UpdateOutcome::Abandoned => {
            debug!("finalizer removal abandoned; waiting for next change");
        }
    }
    Ok(Action::await_change())
}
