//! Watch bridge: turns store change notifications into work queue keys
//!
//! Every observed change enqueues the Cluster's name. Deletions need no
//! event of their own: a Cluster carrying our finalizer is updated with a
//! `deletionTimestamp` first, and that update is what drives teardown.

use std::fmt::Display;

use futures::{Stream, StreamExt, TryStreamExt};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::crd::Cluster;
use crate::queue::WorkQueue;

/// Stream of Cluster names, one item per observed add or update
pub fn cluster_keys(client: Client) -> impl Stream<Item = Result<String, watcher::Error>> + Send {
    let api: Api<Cluster> = Api::all(client);
    watcher(api, watcher::Config::default())
        .default_backoff()
        .touched_objects()
        .map_ok(|cluster| cluster.name_any())
}

/// Add every key from `keys` to `queue` until the stream ends or `cancel`
/// fires. Stream errors are logged and skipped; the watcher retries on its
/// own backoff.
pub async fn forward_keys<S, E>(keys: S, queue: WorkQueue<String>, cancel: CancellationToken)
where
    S: Stream<Item = Result<String, E>>,
    E: Display,
{
    info!("Starting cluster watch");
    tokio::pin!(keys);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Watch cancelled");
                break;
            }
            event = keys.next() => match event {
                Some(Ok(key)) => {
                    debug!(cluster = %key, "Change observed");
                    queue.add(key);
                }
                Some(Err(e)) => warn!(error = %e, "Watch error"),
                None => {
                    warn!("Watch stream ended");
                    break;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_keys_are_forwarded_and_deduplicated() {
        let queue = WorkQueue::new();
        let events = futures::stream::iter(vec![
            Ok("c1".to_string()),
            Err("connection reset"),
            Ok("c2".to_string()),
            Ok("c1".to_string()),
        ]);

        forward_keys(events, queue.clone(), CancellationToken::new()).await;

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await.as_deref(), Some("c1"));
        assert_eq!(queue.get().await.as_deref(), Some("c2"));
    }

    #[tokio::test]
    async fn test_cancel_stops_a_pending_stream() {
        let queue: WorkQueue<String> = WorkQueue::new();
        let cancel = CancellationToken::new();
        let pending = futures::stream::pending::<Result<String, String>>();

        let forwarding = tokio::spawn(forward_keys(pending, queue.clone(), cancel.clone()));
        cancel.cancel();
        forwarding.await.unwrap();
        assert!(queue.is_empty());
    }
}
