//! Immutable runtime configuration
//!
//! The whole orchestrator is parameterized by a single [`Config`] value
//! constructed once at startup (flag parsing lives in the binary) and passed
//! by reference into every controller constructor. No controller mutates it.
//!
//! Membership ground truth is resolved here, once, into an explicit
//! [`MembershipSource`] variant rather than being re-decided each sync
//! cycle: a cloud pattern (when a cloud provider is configured) beats a
//! static machine list, with a log line recording the override.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, warn};

use crate::DEFAULT_CLUSTER_NAME;
use crate::DEFAULT_DIAGNOSTICS_PORT;

/// The authoritative source of fleet membership, resolved once at startup
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MembershipSource {
    /// Enumerate cloud instances whose names match this pattern
    CloudPattern(String),
    /// A statically configured machine list
    StaticList(Vec<String>),
    /// No source configured; membership is empty
    Unconfigured,
}

impl MembershipSource {
    /// Resolve the membership source from the configured inputs
    ///
    /// A cloud pattern is only meaningful together with a cloud provider.
    /// When both a usable pattern and a static list are present, the pattern
    /// wins and the override is logged (documented behavior, not an error).
    pub fn resolve(
        cloud_provider: Option<&str>,
        instance_pattern: Option<&str>,
        machines: &[String],
    ) -> Self {
        let pattern = match (cloud_provider, instance_pattern) {
            (Some(_), Some(p)) if !p.is_empty() => Some(p),
            (None, Some(p)) if !p.is_empty() => {
                warn!(pattern = %p, "instance pattern ignored without a cloud provider");
                None
            }
            _ => None,
        };

        match pattern {
            Some(p) => {
                if !machines.is_empty() {
                    info!(
                        pattern = %p,
                        machines = machines.len(),
                        "static machine list overridden by cloud instance pattern"
                    );
                }
                MembershipSource::CloudPattern(p.to_string())
            }
            None if !machines.is_empty() => MembershipSource::StaticList(machines.to_vec()),
            None => {
                warn!("no membership source configured; fleet membership will be empty");
                MembershipSource::Unconfigured
            }
        }
    }
}

/// Default capacity stamped on newly registered nodes
///
/// These are provisioning-time defaults, not discovered values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeCapacity {
    /// CPU provisioned on each node, in milli-cores
    pub milli_cpu: i64,
    /// Memory provisioned on each node, in bytes
    pub memory_bytes: i64,
}

impl Default for NodeCapacity {
    fn default() -> Self {
        Self {
            milli_cpu: 1000,
            memory_bytes: 3 * 1024 * 1024 * 1024,
        }
    }
}

/// Cloud provider selection
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CloudConfig {
    /// Provider identifier (e.g., "aws", "gce")
    pub provider: String,
    /// Optional provider configuration file
    pub config_file: Option<PathBuf>,
}

/// Fully-resolved orchestrator configuration
///
/// Constructed once by the binary; read-only everywhere else.
#[derive(Clone, Debug)]
pub struct Config {
    /// Address the diagnostics endpoint binds to
    pub diagnostics_address: IpAddr,
    /// Port the diagnostics endpoint serves on
    pub diagnostics_port: u16,

    /// Cluster name stamped on managed resources
    pub cluster_name: String,

    /// Period of the fleet membership sync loop
    pub node_sync_period: Duration,
    /// Period of the node health monitor loop
    pub node_monitor_period: Duration,
    /// How long a healthy node may go without a ready report
    pub node_monitor_grace_period: Duration,
    /// How long a newly seen node may take to post its first ready report
    pub node_startup_grace_period: Duration,
    /// How long a node stays unresponsive before its pods are evicted
    pub pod_eviction_timeout: Duration,
    /// Attempts for initial node registration (interval = sync period)
    pub register_retry_count: u32,

    /// Steady-state pod deletion rate during eviction, per second
    pub deleting_pods_qps: f64,
    /// Burst capacity for pod deletions during eviction
    pub deleting_pods_burst: u32,

    /// Authoritative membership source, resolved once
    pub membership: MembershipSource,
    /// Cloud provider selection, if any
    pub cloud: Option<CloudConfig>,

    /// Cluster-wide pod network block, e.g. "10.244.0.0/16"
    pub cluster_cidr: Option<String>,
    /// Whether per-node pod CIDRs are carved and assigned
    pub allocate_node_cidrs: bool,
    /// Capacity defaults stamped on registered nodes
    pub node_capacity: NodeCapacity,

    /// Sync period for the endpoint controller
    pub endpoint_sync_period: Duration,
    /// Concurrency width for endpoint syncs
    pub concurrent_endpoint_syncs: usize,
    /// Sync period for the replica-count controller
    pub replica_sync_period: Duration,
    /// Concurrency width for replica-count syncs
    pub concurrent_replica_syncs: usize,
    /// Sync period for namespace lifecycle
    pub namespace_sync_period: Duration,
    /// Sync period for resource-quota usage
    pub resource_quota_sync_period: Duration,
    /// Sync period for volume-claim binding
    pub claim_binder_sync_period: Duration,
    /// Sync period for service-account token issuance
    pub token_sync_period: Duration,

    /// PEM-encoded private key for signing service-account tokens
    pub service_account_key_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            diagnostics_address: IpAddr::from([127, 0, 0, 1]),
            diagnostics_port: DEFAULT_DIAGNOSTICS_PORT,
            cluster_name: DEFAULT_CLUSTER_NAME.to_string(),
            node_sync_period: Duration::from_secs(10),
            node_monitor_period: Duration::from_secs(5),
            node_monitor_grace_period: Duration::from_secs(40),
            node_startup_grace_period: Duration::from_secs(60),
            pod_eviction_timeout: Duration::from_secs(5 * 60),
            register_retry_count: 10,
            deleting_pods_qps: 0.1,
            deleting_pods_burst: 10,
            membership: MembershipSource::Unconfigured,
            cloud: None,
            cluster_cidr: None,
            allocate_node_cidrs: false,
            node_capacity: NodeCapacity::default(),
            endpoint_sync_period: Duration::from_secs(10),
            concurrent_endpoint_syncs: 5,
            replica_sync_period: Duration::from_secs(10),
            concurrent_replica_syncs: 5,
            namespace_sync_period: Duration::from_secs(5 * 60),
            resource_quota_sync_period: Duration::from_secs(10),
            claim_binder_sync_period: Duration::from_secs(10),
            token_sync_period: Duration::from_secs(30),
            service_account_key_file: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machines(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn cloud_pattern_wins_over_static_list() {
        let source = MembershipSource::resolve(
            Some("aws"),
            Some("minion-.*"),
            &machines(&["m1", "m2"]),
        );
        assert_eq!(source, MembershipSource::CloudPattern("minion-.*".into()));
    }

    #[test]
    fn pattern_without_provider_falls_back_to_static_list() {
        let source = MembershipSource::resolve(None, Some("minion-.*"), &machines(&["m1"]));
        assert_eq!(source, MembershipSource::StaticList(machines(&["m1"])));
    }

    #[test]
    fn static_list_used_when_no_pattern() {
        let source = MembershipSource::resolve(Some("aws"), None, &machines(&["m1", "m2"]));
        assert_eq!(
            source,
            MembershipSource::StaticList(machines(&["m1", "m2"]))
        );
    }

    #[test]
    fn empty_inputs_resolve_to_unconfigured() {
        let source = MembershipSource::resolve(None, None, &[]);
        assert_eq!(source, MembershipSource::Unconfigured);

        // An empty pattern string is the same as no pattern
        let source = MembershipSource::resolve(Some("aws"), Some(""), &[]);
        assert_eq!(source, MembershipSource::Unconfigured);
    }

    #[test]
    fn defaults_match_the_documented_surface() {
        let config = Config::default();
        assert_eq!(config.node_sync_period, Duration::from_secs(10));
        assert_eq!(config.node_monitor_period, Duration::from_secs(5));
        assert_eq!(config.node_monitor_grace_period, Duration::from_secs(40));
        assert_eq!(config.node_startup_grace_period, Duration::from_secs(60));
        assert_eq!(config.pod_eviction_timeout, Duration::from_secs(300));
        assert_eq!(config.register_retry_count, 10);
        assert!((config.deleting_pods_qps - 0.1).abs() < f64::EPSILON);
        assert_eq!(config.deleting_pods_burst, 10);
        assert_eq!(config.cluster_name, "kubernetes");
        assert!(!config.allocate_node_cidrs);
        assert_eq!(config.node_capacity.milli_cpu, 1000);
    }
}
