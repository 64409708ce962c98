//! Integration tests for the Cluster lifecycle
//!
//! These tests tell the story of a Cluster from creation through config
//! changes, failures and deletion. They run the real reconcile logic and
//! dispatcher against the in-memory store, with a recording provisioner in
//! place of the external tool.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kube::ResourceExt;

use cluster_provisioner::controller::{
    reconcile, Context, ControllerConfig, Dispatcher, HealthProbe, VERSION_ANNOTATION,
};
use cluster_provisioner::crd::{Cluster, ClusterSpec, ConditionStatus, ConditionType};
use cluster_provisioner::finalizer::CLUSTER_FINALIZER;
use cluster_provisioner::provisioner::{config_hash, Provisioner, Verb};
use cluster_provisioner::retry::{ExponentialBackoff, RetryPolicy};
use cluster_provisioner::store::{ClusterStore, InMemoryStore, KubeconfigStore};
use cluster_provisioner::Error;

// =============================================================================
// Test Fixtures
// =============================================================================

/// Provisioner that records every call with the config content it saw
#[derive(Default)]
struct RecordingProvisioner {
    calls: Mutex<Vec<(Verb, String)>>,
    failures: AtomicU32,
}

impl RecordingProvisioner {
    /// Fail the next `count` calls
    fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    fn calls(&self) -> Vec<(Verb, String)> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, verb: Verb) -> usize {
        self.calls().iter().filter(|(v, _)| *v == verb).count()
    }
}

#[async_trait]
impl Provisioner for RecordingProvisioner {
    async fn run(&self, cluster: &str, verb: Verb, config_path: &Path) -> Result<(), Error> {
        let content = tokio::fs::read_to_string(config_path)
            .await
            .unwrap_or_default();
        self.calls.lock().unwrap().push((verb, content));

        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::provisioning(
                cluster,
                verb.as_str(),
                "exit status: 1; last output:\nnode unreachable",
            ));
        }
        Ok(())
    }
}

/// Health probe that always answers with a fixed version
struct FixedVersion(&'static str);

#[async_trait]
impl HealthProbe for FixedVersion {
    async fn probe(&self, _cluster: &str, _kubeconfig_path: &Path) -> Result<String, Error> {
        Ok(self.0.to_string())
    }
}

struct Harness {
    store: Arc<InMemoryStore>,
    provisioner: Arc<RecordingProvisioner>,
    ctx: Arc<Context>,
    _state: tempfile::TempDir,
}

impl Harness {
    fn new() -> Self {
        let state = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let provisioner = Arc::new(RecordingProvisioner::default());
        let config = ControllerConfig {
            workers: 1,
            state_dir: state.path().to_path_buf(),
            health_interval: Duration::from_secs(60),
            retry: RetryPolicy::with_max_requeues(5),
            backoff: ExponentialBackoff::deterministic(
                Duration::from_millis(5),
                Duration::from_millis(20),
            ),
        };
        let ctx = Arc::new(Context::from_parts(
            store.clone(),
            store.clone(),
            provisioner.clone(),
            Arc::new(FixedVersion("v1.32.1")),
            config,
        ));
        Self {
            store,
            provisioner,
            ctx,
            _state: state,
        }
    }

    async fn create(&self, name: &str, config: &str) {
        let spec = ClusterSpec {
            config: Some(config.to_string()),
            config_path: None,
        };
        self.store.create(&Cluster::new(name, spec)).await.unwrap();
    }

    async fn get(&self, name: &str) -> Cluster {
        self.store.get(name).await.unwrap().unwrap()
    }

    async fn reconcile(&self, name: &str) -> Result<(), Error> {
        let cluster = self.get(name).await;
        reconcile(Arc::new(cluster), self.ctx.clone()).await.map(|_| ())
    }

    async fn set_config(&self, name: &str, config: &str) {
        let mut cluster = self.get(name).await;
        cluster.spec.config = Some(config.to_string());
        self.store.update(&cluster).await.unwrap();
    }
}

// =============================================================================
// Lifecycle Stories
// =============================================================================

/// Story: create, re-observe, change config, delete
///
/// The tool runs once per distinct config, the Kubeconfig follows the
/// Cluster, and deletion deprovisions exactly once before the Cluster is
/// erased.
#[tokio::test]
async fn story_cluster_lifecycle_from_create_to_delete() {
    let h = Harness::new();
    h.create("c1", "A").await;

    // First sighting: provision, publish, probe
    h.reconcile("c1").await.unwrap();
    let cluster = h.get("c1").await;
    assert_eq!(h.provisioner.calls(), vec![(Verb::Apply, "A".to_string())]);
    assert_eq!(cluster.applied_config_hash(), config_hash(b"A"));
    assert!(cluster.finalizers().contains(&CLUSTER_FINALIZER.to_string()));
    assert!(cluster.is_condition_true(ConditionType::Provisioned));
    assert!(cluster.is_condition_true(ConditionType::Ready));
    assert_eq!(cluster.annotation(VERSION_ANNOTATION), Some("v1.32.1"));
    let kubeconfig = h.store.get_kubeconfig("c1").await.unwrap().unwrap();
    assert!(kubeconfig.spec.config_path.ends_with("kube_config_cluster.yml"));

    // Periodic re-observation with nothing changed writes nothing
    let writes = h.store.writes();
    h.reconcile("c1").await.unwrap();
    assert_eq!(h.provisioner.count(Verb::Apply), 1);
    assert_eq!(h.store.writes(), writes);

    // New config: applied once more
    h.set_config("c1", "B").await;
    h.reconcile("c1").await.unwrap();
    assert_eq!(h.provisioner.calls()[1], (Verb::Apply, "B".to_string()));
    assert_eq!(h.get("c1").await.applied_config_hash(), config_hash(b"B"));

    // Deletion: the finalizer holds the Cluster until teardown succeeds
    h.store.delete("c1").await.unwrap();
    assert!(h.get("c1").await.is_deleting());
    h.reconcile("c1").await.unwrap();

    assert_eq!(h.provisioner.count(Verb::Deprovision), 1);
    assert_eq!(h.provisioner.calls()[2], (Verb::Deprovision, "B".to_string()));
    assert!(h.store.list().await.unwrap().is_empty());
    assert!(h.store.kubeconfig_names().is_empty());
}

/// Story: a failed apply is reported, then recovered on retry
#[tokio::test]
async fn story_failed_apply_recovers_on_retry() {
    let h = Harness::new();
    h.create("c1", "A").await;
    h.provisioner.fail_next(1);

    let err = h.reconcile("c1").await.unwrap_err();
    assert!(matches!(err, Error::Provisioning { .. }));

    let cluster = h.get("c1").await;
    let failed = cluster.condition(ConditionType::Provisioned).unwrap().clone();
    assert_eq!(failed.status, ConditionStatus::False);
    assert!(failed.message.contains("node unreachable"));
    assert_eq!(cluster.applied_config_hash(), "");
    assert!(cluster.condition(ConditionType::Ready).is_none());

    h.reconcile("c1").await.unwrap();
    let cluster = h.get("c1").await;
    let recovered = cluster.condition(ConditionType::Provisioned).unwrap();
    assert_eq!(recovered.status, ConditionStatus::True);
    assert!(recovered.last_transition_time >= failed.last_transition_time);
    assert_eq!(cluster.applied_config_hash(), config_hash(b"A"));
    assert_eq!(h.provisioner.count(Verb::Apply), 2);
}

/// Story: every write of a reconcile conflicts, so it gives up quietly
///
/// Three conflicting writes exhaust the update budget. The reconcile still
/// succeeds, nothing was provisioned, and the next attempt converges.
#[tokio::test]
async fn story_conflicting_writes_are_abandoned_then_converge() {
    let h = Harness::new();
    h.create("c1", "A").await;
    h.store.inject_conflicts(3);

    h.reconcile("c1").await.unwrap();
    let cluster = h.get("c1").await;
    assert!(cluster.finalizers().is_empty());
    assert!(h.provisioner.calls().is_empty());

    h.reconcile("c1").await.unwrap();
    assert_eq!(h.provisioner.count(Verb::Apply), 1);
    assert!(h.get("c1").await.is_condition_true(ConditionType::Ready));
}

/// Story: reverting to the last applied config after a failure re-applies it
///
/// The stored hash matches the reverted spec, but the failed attempt left
/// the cluster in an unknown state, so the tool must run again.
#[tokio::test]
async fn story_reverted_config_is_reapplied_after_failure() {
    let h = Harness::new();
    h.create("c1", "A").await;
    h.reconcile("c1").await.unwrap();

    h.set_config("c1", "B").await;
    h.provisioner.fail_next(1);
    assert!(h.reconcile("c1").await.is_err());
    let cluster = h.get("c1").await;
    assert_eq!(cluster.applied_config_hash(), config_hash(b"A"));
    assert_eq!(
        cluster.condition_status(ConditionType::Provisioned),
        ConditionStatus::False
    );

    h.set_config("c1", "A").await;
    h.reconcile("c1").await.unwrap();
    assert_eq!(h.provisioner.calls()[2], (Verb::Apply, "A".to_string()));
    let cluster = h.get("c1").await;
    assert!(cluster.is_condition_true(ConditionType::Provisioned));
    assert!(cluster.is_condition_true(ConditionType::Ready));

    // Converged again: the short-circuit holds
    h.reconcile("c1").await.unwrap();
    assert_eq!(h.provisioner.count(Verb::Apply), 3);
}

/// Story: a teardown that keeps failing stays visible and keeps retrying
#[tokio::test]
async fn story_persistent_teardown_failure_is_retried_past_the_limit() {
    let h = Harness::new();
    h.create("c1", "A").await;
    h.reconcile("c1").await.unwrap();
    h.store.delete("c1").await.unwrap();
    h.provisioner.fail_next(7);

    let dispatcher = Dispatcher::new(h.ctx.clone());
    let queue = dispatcher.queue();
    queue.add("c1".to_string());
    for _ in 0..7 {
        let processed = tokio::time::timeout(Duration::from_secs(5), dispatcher.process_next())
            .await
            .unwrap();
        assert!(processed);
    }

    // Beyond the requeue limit of 5, still held and still reporting why
    assert_eq!(queue.num_requeues(&"c1".to_string()), 7);
    let cluster = h.get("c1").await;
    assert!(cluster.finalizers().contains(&CLUSTER_FINALIZER.to_string()));
    assert_eq!(
        cluster.condition_status(ConditionType::Deprovisioned),
        ConditionStatus::False
    );

    tokio::time::timeout(Duration::from_secs(5), dispatcher.process_next())
        .await
        .unwrap();
    assert!(!h.store.contains("c1"));
    assert_eq!(h.provisioner.count(Verb::Deprovision), 8);
    queue.shut_down();
}

/// Story: Ready is never reported while provisioning keeps failing
#[tokio::test]
async fn story_ready_waits_for_provisioned() {
    let h = Harness::new();
    h.create("c1", "A").await;
    h.provisioner.fail_next(3);

    for _ in 0..3 {
        assert!(h.reconcile("c1").await.is_err());
        let cluster = h.get("c1").await;
        assert!(!cluster.is_condition_true(ConditionType::Ready));
        assert_eq!(
            cluster.condition_status(ConditionType::Provisioned),
            ConditionStatus::False
        );
    }

    h.reconcile("c1").await.unwrap();
    let cluster = h.get("c1").await;
    assert!(cluster.is_condition_true(ConditionType::Provisioned));
    assert!(cluster.is_condition_true(ConditionType::Ready));
}

/// Story: a failed teardown keeps the Cluster until a retry succeeds
#[tokio::test]
async fn story_failed_deprovision_keeps_the_cluster() {
    let h = Harness::new();
    h.create("c1", "A").await;
    h.reconcile("c1").await.unwrap();

    h.store.delete("c1").await.unwrap();
    h.provisioner.fail_next(1);
    assert!(h.reconcile("c1").await.is_err());
    assert!(h.store.contains("c1"));
    assert!(h
        .get("c1")
        .await
        .finalizers()
        .contains(&CLUSTER_FINALIZER.to_string()));

    h.reconcile("c1").await.unwrap();
    assert!(!h.store.contains("c1"));
    assert_eq!(h.provisioner.count(Verb::Deprovision), 2);
}

/// Story: a Cluster deleted before it was ever provisioned needs no teardown
#[tokio::test]
async fn story_unprovisioned_cluster_is_deleted_directly() {
    let h = Harness::new();
    h.create("c1", "A").await;

    h.store.delete("c1").await.unwrap();
    assert!(!h.store.contains("c1"));
    assert!(h.provisioner.calls().is_empty());
}

// =============================================================================
// Dispatcher Stories
// =============================================================================

/// Story: the dispatcher retries a failing key with backoff until it converges
#[tokio::test]
async fn story_dispatcher_retries_until_converged() {
    let h = Harness::new();
    h.create("c1", "A").await;
    h.provisioner.fail_next(2);

    let dispatcher = Dispatcher::new(h.ctx.clone());
    let queue = dispatcher.queue();
    queue.add("c1".to_string());

    for attempt in 1..=3u32 {
        // Requeued keys arrive after their backoff delay
        let processed = tokio::time::timeout(Duration::from_secs(5), dispatcher.process_next())
            .await
            .unwrap();
        assert!(processed);
        assert_eq!(h.provisioner.count(Verb::Apply), attempt as usize);
    }

    assert_eq!(queue.num_requeues(&"c1".to_string()), 0);
    assert!(h.get("c1").await.is_condition_true(ConditionType::Ready));
    queue.shut_down();
}

/// Story: several clusters are reconciled by concurrent workers
#[tokio::test]
async fn story_workers_converge_many_clusters() {
    let h = Harness::new();
    let names: Vec<String> = (0..4).map(|i| format!("c{i}")).collect();
    for name in &names {
        h.create(name, name).await;
    }

    let dispatcher = Arc::new(Dispatcher::new(h.ctx.clone()));
    let shutdown = tokio_util::sync::CancellationToken::new();
    let running = {
        let dispatcher = dispatcher.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { dispatcher.run(shutdown).await })
    };
    for name in &names {
        dispatcher.queue().add(name.clone());
    }

    let converged = async {
        loop {
            let clusters = h.store.list().await.unwrap();
            if clusters
                .iter()
                .all(|c| c.is_condition_true(ConditionType::Ready))
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), converged)
        .await
        .unwrap();

    shutdown.cancel();
    running.await.unwrap();
    assert_eq!(h.provisioner.count(Verb::Apply), names.len());
    for name in &names {
        let cluster = h.get(name).await;
        assert_eq!(cluster.applied_config_hash(), config_hash(name.as_bytes()));
    }
}
