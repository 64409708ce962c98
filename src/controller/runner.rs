//! Reconcile dispatcher: workers pulling keys from the work queue

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{reconcile, Context};
use crate::queue::WorkQueue;
use crate::retry::RetryDecision;
use crate::Error;

/// Runs reconcile workers over a shared work queue
///
/// Each worker handles one key at a time, including the blocking
/// provisioning call, before asking for the next. The queue guarantees no
/// key is held by two workers at once.
pub struct Dispatcher {
    queue: WorkQueue<String>,
    ctx: Arc<Context>,
}

impl Dispatcher {
    /// Create a dispatcher whose queue backs off with the context's settings
    pub fn new(ctx: Arc<Context>) -> Self {
        let queue = WorkQueue::with_backoff(ctx.config.backoff.clone());
        Self { queue, ctx }
    }

    /// Handle to the work queue, for the watch bridge
    pub fn queue(&self) -> WorkQueue<String> {
        self.queue.clone()
    }

    /// Run the configured number of workers until `shutdown` fires.
    ///
    /// On shutdown the queue stops handing out keys and in-flight reconciles
    /// (including running provisioning calls) are allowed to finish.
    pub async fn run(&self, shutdown: CancellationToken) {
        let workers = self.ctx.config.workers.max(1);
        info!(workers, "Starting reconcile workers");

        let handles: Vec<_> = (0..workers)
            .map(|id| {
                let queue = self.queue.clone();
                let ctx = self.ctx.clone();
                tokio::spawn(async move {
                    while let Some(key) = queue.get().await {
                        process(&queue, &ctx, &key).await;
                    }
                    debug!(worker = id, "Worker stopped");
                })
            })
            .collect();

        shutdown.cancelled().await;
        info!(in_flight = self.queue.in_flight(), "Shutting down, draining in-flight reconciles");
        self.queue.shut_down_with_drain().await;

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task failed");
            }
        }
        info!("All workers stopped");
    }

    /// Take one key, reconcile it and mark it done.
    ///
    /// Returns `false` once the queue is shut down. Lets callers drive the
    /// dispatcher step by step instead of running workers.
    pub async fn process_next(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        process(&self.queue, &self.ctx, &key).await;
        true
    }
}

/// Sync one key and release it, even if the reconcile panics
async fn process(queue: &WorkQueue<String>, ctx: &Arc<Context>, key: &String) {
    let synced = AssertUnwindSafe(sync_key(queue, ctx, key))
        .catch_unwind()
        .await;
    if synced.is_err() {
        let error = Error::internal_with_context("dispatcher", "reconcile panicked");
        requeue_failed(queue, ctx, key, &error);
    }
    queue.done(key);
}

/// Resolve a key to its Cluster and reconcile it
async fn sync_key(queue: &WorkQueue<String>, ctx: &Arc<Context>, key: &String) {
    debug!(cluster = %key, "Syncing");

    let cluster = match ctx.store.get(key).await {
        Ok(Some(cluster)) => cluster,
        Ok(None) => {
            debug!(cluster = %key, "Cluster no longer exists, dropping key");
            queue.forget(key);
            return;
        }
        Err(e) => {
            requeue_failed(queue, ctx, key, &e);
            return;
        }
    };
    let name = cluster.name_any();
    let deleting = cluster.is_deleting();

    match reconcile(Arc::new(cluster), ctx.clone()).await {
        Ok(action) => {
            queue.forget(key);
            if let Some(delay) = action.requeue_after() {
                queue.add_after(key.clone(), delay);
            }
        }
        Err(e) if e.is_not_found() => {
            debug!(cluster = %name, "Cluster vanished during reconcile, dropping key");
            queue.forget(key);
        }
        Err(e) if deleting => {
            // No watch event follows a failed teardown, so the key never drops
            warn!(cluster = %name, error = %e, "Teardown failed, requeueing");
            queue.add_rate_limited(key.clone());
        }
        Err(e) => requeue_failed(queue, ctx, key, &e),
    }
}

/// Apply the retry policy to a failed key
fn requeue_failed(queue: &WorkQueue<String>, ctx: &Context, key: &String, error: &Error) {
    let attempts = queue.num_requeues(key);
    match ctx.config.retry.decide(attempts, error) {
        RetryDecision::Requeue => {
            warn!(cluster = %key, attempts, error = %error, "Reconciliation failed, requeueing");
            queue.add_rate_limited(key.clone());
        }
        RetryDecision::Drop => {
            error!(cluster = %key, error = %error, "Reconciliation failed, dropping key");
            queue.forget(key);
        }
    }
}
