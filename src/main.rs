//! Cluster Provisioner - converges Cluster resources with an external tool

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::{Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use cluster_provisioner::controller::{
    watch::{cluster_keys, forward_keys},
    Context, ControllerConfig, Dispatcher,
};
use cluster_provisioner::crd::{Cluster, Kubeconfig};
use cluster_provisioner::provisioner::{split_args, ToolConfig};
use cluster_provisioner::retry::{ExponentialBackoff, RetryPolicy};
use cluster_provisioner::telemetry::{init_telemetry, LogFormat, TelemetryConfig};

/// Cluster Provisioner - CRD-driven controller for cluster lifecycle
#[derive(Parser, Debug)]
#[command(name = "cluster-provisioner", version, about, long_about = None)]
struct Cli {
    /// Print CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Number of concurrent reconcile workers
    #[arg(long, env = "PROVISIONER_WORKERS", default_value_t = 2)]
    workers: usize,

    /// Directory for materialized inline configs and tool state
    #[arg(
        long,
        env = "PROVISIONER_STATE_DIR",
        default_value = "/var/lib/cluster-provisioner"
    )]
    state_dir: PathBuf,

    /// Provisioning tool executable
    #[arg(long, env = "PROVISIONER_TOOL", default_value = "rke")]
    tool: String,

    /// Arguments for applying a config; `{config}` is replaced by its path
    #[arg(
        long,
        env = "PROVISIONER_APPLY_ARGS",
        default_value = "up --config {config}"
    )]
    apply_args: String,

    /// Arguments for tearing a cluster down; `{config}` is replaced by its path
    #[arg(
        long,
        env = "PROVISIONER_DEPROVISION_ARGS",
        default_value = "remove --force --config {config}"
    )]
    deprovision_args: String,

    /// Kill the tool after this many seconds (0 waits indefinitely)
    #[arg(long, env = "PROVISIONER_TOOL_TIMEOUT_SECS", default_value_t = 0)]
    tool_timeout_secs: u64,

    /// Seconds between health probes of a provisioned cluster
    #[arg(long, env = "PROVISIONER_HEALTH_INTERVAL_SECS", default_value_t = 60)]
    health_interval_secs: u64,

    /// Failed reconciles of one key before it is dropped
    #[arg(long, env = "PROVISIONER_MAX_REQUEUES", default_value_t = 15)]
    max_requeues: u32,

    /// First requeue delay after a failure, in milliseconds
    #[arg(long, env = "PROVISIONER_BACKOFF_INITIAL_MS", default_value_t = 500)]
    backoff_initial_ms: u64,

    /// Upper bound on any requeue delay, in seconds
    #[arg(long, env = "PROVISIONER_BACKOFF_MAX_SECS", default_value_t = 300)]
    backoff_max_secs: u64,

    /// Log output format
    #[arg(long, env = "PROVISIONER_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

impl Cli {
    fn tool_config(&self) -> ToolConfig {
        ToolConfig {
            binary: self.tool.clone(),
            apply_args: split_args(&self.apply_args),
            deprovision_args: split_args(&self.deprovision_args),
            timeout: (self.tool_timeout_secs > 0)
                .then(|| Duration::from_secs(self.tool_timeout_secs)),
        }
    }

    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            workers: self.workers,
            state_dir: self.state_dir.clone(),
            health_interval: Duration::from_secs(self.health_interval_secs),
            retry: RetryPolicy::with_max_requeues(self.max_requeues),
            backoff: ExponentialBackoff {
                initial_delay: Duration::from_millis(self.backoff_initial_ms),
                max_delay: Duration::from_secs(self.backoff_max_secs),
                ..Default::default()
            },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Crypto provider for the kube client and health probes
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        for crd in [Cluster::crd(), Kubeconfig::crd()] {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        format: cli.log_format,
    })?;

    run_controller(cli).await
}

async fn run_controller(cli: Cli) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    tokio::fs::create_dir_all(&cli.state_dir)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create state dir {:?}: {}", cli.state_dir, e))?;

    let ctx = Arc::new(
        Context::builder(client.clone())
            .tool(cli.tool_config())
            .config(cli.controller_config())
            .build(),
    );
    let dispatcher = Dispatcher::new(ctx);
    let shutdown = CancellationToken::new();

    info!(
        tool = %cli.tool,
        state_dir = ?cli.state_dir,
        workers = cli.workers,
        "Starting cluster provisioner"
    );

    let watch = tokio::spawn(forward_keys(
        cluster_keys(client),
        dispatcher.queue(),
        shutdown.clone(),
    ));

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received shutdown signal"),
                Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
            }
            shutdown.cancel();
        });
    }

    dispatcher.run(shutdown.clone()).await;
    shutdown.cancel();
    if let Err(e) = watch.await {
        error!(error = %e, "Watch task failed");
    }

    info!("Cluster provisioner stopped");
    Ok(())
}
