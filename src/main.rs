//! Steward - control-plane orchestrator for a compute cluster

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use steward::config::{CloudConfig, Config, MembershipSource, NodeCapacity};
use steward::supervisor::Supervisor;

/// Steward - supervises the reconciliation loops that drive a compute
/// cluster toward its desired state
#[derive(Parser, Debug)]
#[command(name = "steward", version, about, long_about = None)]
struct Cli {
    /// Port for the diagnostics HTTP endpoint
    #[arg(long, default_value_t = steward::DEFAULT_DIAGNOSTICS_PORT)]
    port: u16,

    /// Address the diagnostics endpoint binds to (0.0.0.0 for all)
    #[arg(long, default_value = "127.0.0.1")]
    address: IpAddr,

    /// Cluster name stamped on managed resources
    #[arg(long, default_value = steward::DEFAULT_CLUSTER_NAME)]
    cluster_name: String,

    /// Cloud provider identifier; empty for no provider
    #[arg(long)]
    cloud_provider: Option<String>,

    /// Path to the cloud provider configuration file
    #[arg(long)]
    cloud_config: Option<PathBuf>,

    /// Pattern matching cloud instances that belong to the fleet
    /// (requires --cloud-provider)
    #[arg(long)]
    instance_pattern: Option<String>,

    /// Static machine list, comma separated (ignored when an instance
    /// pattern and cloud provider are configured)
    #[arg(long, value_delimiter = ',')]
    machines: Vec<String>,

    /// Seconds between fleet membership syncs
    #[arg(long, default_value_t = 10)]
    node_sync_period: u64,

    /// Seconds between node health monitor passes
    #[arg(long, default_value_t = 5)]
    node_monitor_period: u64,

    /// Seconds a running node may go unresponsive before being marked
    /// unhealthy
    #[arg(long, default_value_t = 40)]
    node_monitor_grace_period: u64,

    /// Seconds a starting node may go unresponsive before being marked
    /// unhealthy
    #[arg(long, default_value_t = 60)]
    node_startup_grace_period: u64,

    /// Seconds a node stays unresponsive before its pods are evicted
    #[arg(long, default_value_t = 300)]
    pod_eviction_timeout: u64,

    /// Attempts for initial node registration (interval equals the node
    /// sync period)
    #[arg(long, default_value_t = 10)]
    register_retry_count: u32,

    /// Steady pod-deletion rate during eviction, per second
    #[arg(long, default_value_t = 0.1)]
    deleting_pods_qps: f64,

    /// Pod-deletion burst capacity during eviction
    #[arg(long, default_value_t = 10)]
    deleting_pods_burst: u32,

    /// Cluster-wide pod network block, e.g. 10.244.0.0/16
    #[arg(long)]
    cluster_cidr: Option<String>,

    /// Carve per-node pod CIDRs out of the cluster block
    #[arg(long, default_value_t = false)]
    allocate_node_cidrs: bool,

    /// CPU provisioned on each node, in milli-cores
    #[arg(long, default_value_t = 1000)]
    node_milli_cpu: i64,

    /// Memory provisioned on each node, in bytes
    #[arg(long, default_value_t = 3 * 1024 * 1024 * 1024)]
    node_memory: i64,

    /// Concurrent endpoint sync operations
    #[arg(long, default_value_t = 5)]
    concurrent_endpoint_syncs: usize,

    /// Concurrent replica-count sync operations
    #[arg(long, default_value_t = 5)]
    concurrent_replica_syncs: usize,

    /// Seconds between endpoint resync passes
    #[arg(long, default_value_t = 10)]
    endpoint_sync_period: u64,

    /// Seconds between replica-count resync passes
    #[arg(long, default_value_t = 10)]
    replica_sync_period: u64,

    /// Seconds between namespace lifecycle passes
    #[arg(long, default_value_t = 300)]
    namespace_sync_period: u64,

    /// Seconds between resource-quota usage passes
    #[arg(long, default_value_t = 10)]
    resource_quota_sync_period: u64,

    /// Seconds between volume-claim binding passes
    #[arg(long, default_value_t = 10)]
    claim_binder_sync_period: u64,

    /// PEM-encoded RSA private key for signing service-account tokens
    #[arg(long)]
    service_account_private_key_file: Option<PathBuf>,
}

impl Cli {
    /// Resolve the flag surface into the immutable runtime configuration
    fn into_config(self) -> Config {
        let membership = MembershipSource::resolve(
            self.cloud_provider.as_deref(),
            self.instance_pattern.as_deref(),
            &self.machines,
        );
        let cloud = self.cloud_provider.map(|provider| CloudConfig {
            provider,
            config_file: self.cloud_config,
        });

        Config {
            diagnostics_address: self.address,
            diagnostics_port: self.port,
            cluster_name: self.cluster_name,
            node_sync_period: Duration::from_secs(self.node_sync_period),
            node_monitor_period: Duration::from_secs(self.node_monitor_period),
            node_monitor_grace_period: Duration::from_secs(self.node_monitor_grace_period),
            node_startup_grace_period: Duration::from_secs(self.node_startup_grace_period),
            pod_eviction_timeout: Duration::from_secs(self.pod_eviction_timeout),
            register_retry_count: self.register_retry_count,
            deleting_pods_qps: self.deleting_pods_qps,
            deleting_pods_burst: self.deleting_pods_burst,
            membership,
            cloud,
            cluster_cidr: self.cluster_cidr,
            allocate_node_cidrs: self.allocate_node_cidrs,
            node_capacity: NodeCapacity {
                milli_cpu: self.node_milli_cpu,
                memory_bytes: self.node_memory,
            },
            endpoint_sync_period: Duration::from_secs(self.endpoint_sync_period),
            concurrent_endpoint_syncs: self.concurrent_endpoint_syncs,
            replica_sync_period: Duration::from_secs(self.replica_sync_period),
            concurrent_replica_syncs: self.concurrent_replica_syncs,
            namespace_sync_period: Duration::from_secs(self.namespace_sync_period),
            resource_quota_sync_period: Duration::from_secs(self.resource_quota_sync_period),
            claim_binder_sync_period: Duration::from_secs(self.claim_binder_sync_period),
            token_sync_period: Config::default().token_sync_period,
            service_account_key_file: self.service_account_private_key_file,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = cli.into_config();

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; shutting down");
            signal_cancel.cancel();
        }
    });

    Supervisor::run(config, cancel)
        .await
        .map_err(|e| anyhow::anyhow!("supervisor failed: {}", e))
}
