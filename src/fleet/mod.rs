//! Node fleet reconciler
//!
//! Owns the canonical health record for every node and runs the two core
//! loops of the orchestrator:
//!
//! - **Membership sync** reconciles the set of tracked nodes against the
//!   authoritative membership source (cloud inventory pattern or static
//!   machine list) every sync period, registering newcomers and removing
//!   departed nodes once they have no workloads left.
//! - **Health monitoring** classifies every node against its last observed
//!   ready report, driving the per-node state machine
//!   `Unknown -> Healthy -> Unresponsive -> Evicting -> Removed` (with
//!   recovery back to `Healthy`), queueing evictions with the rate-limited
//!   executor and assigning pod-network ranges to healthy nodes.
//!
//! The health table is keyed by node name in a sharded map, so the two
//! loops serialize per node rather than against one global lock. Cloud
//! enumeration failures retain the previous membership set for the cycle;
//! a flaky inventory never causes spurious removals.

pub mod cidr;
pub mod eviction;

pub use eviction::EvictionExecutor;

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{NodeApi, NodeHeartbeat, WorkloadApi};
use crate::cloud::CloudInstances;
use crate::config::{Config, MembershipSource};
use crate::fleet::cidr::{CidrAllocator, DEFAULT_NODE_PREFIX};
use crate::retry::{retry, RetryPolicy};
use crate::{Error, Result};

/// Health phase of a node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthPhase {
    /// Discovered but not yet classified (startup grace applies)
    Unknown,
    /// Reporting ready within the monitor grace period
    Healthy,
    /// Ready reports have stopped; eviction timer running
    Unresponsive,
    /// Eviction timer expired; workloads are being drained
    Evicting,
    /// Drained and gone from the authoritative membership set
    Removed,
}

impl HealthPhase {
    /// Whether the state machine permits this transition
    pub fn permits(self, next: HealthPhase) -> bool {
        use HealthPhase::*;
        matches!(
            (self, next),
            (Unknown, Healthy)
                | (Unknown, Unresponsive)
                | (Healthy, Unresponsive)
                | (Unresponsive, Healthy)
                | (Unresponsive, Evicting)
                | (Evicting, Healthy)
                | (Evicting, Removed)
        )
    }
}

impl std::fmt::Display for HealthPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthPhase::Unknown => "Unknown",
            HealthPhase::Healthy => "Healthy",
            HealthPhase::Unresponsive => "Unresponsive",
            HealthPhase::Evicting => "Evicting",
            HealthPhase::Removed => "Removed",
        };
        f.write_str(s)
    }
}

/// Which membership source produced a node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MembershipOrigin {
    /// Enumerated from the cloud inventory
    Cloud,
    /// Listed in the static machine configuration
    Static,
}

/// Registration progress with the cluster API
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Registration {
    Pending,
    InFlight,
    Registered,
    Failed,
}

/// Canonical health record for one node
#[derive(Clone, Debug)]
struct NodeEntry {
    phase: HealthPhase,
    last_ready: Option<DateTime<Utc>>,
    first_seen: DateTime<Utc>,
    unresponsive_since: Option<DateTime<Utc>>,
    pod_cidr: Option<String>,
    origin: MembershipOrigin,
    registration: Registration,
    pending_removal: bool,
    eviction_requested: bool,
}

impl NodeEntry {
    fn new(now: DateTime<Utc>, origin: MembershipOrigin) -> Self {
        Self {
            phase: HealthPhase::Unknown,
            last_ready: None,
            first_seen: now,
            unresponsive_since: None,
            pod_cidr: None,
            origin,
            registration: Registration::Pending,
            pending_removal: false,
            eviction_requested: false,
        }
    }
}

/// Deferred side effect decided while a node's record was locked
#[derive(Debug, PartialEq, Eq)]
enum MonitorAction {
    None,
    CancelEviction,
    SubmitEviction,
    CompleteRemoval,
}

fn chrono_dur(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// The node fleet reconciler
///
/// Exclusive owner of the node health table; nothing else in the process
/// mutates node records.
pub struct NodeFleetReconciler {
    config: Arc<Config>,
    node_api: Arc<dyn NodeApi>,
    workloads: Arc<dyn WorkloadApi>,
    cloud: Option<Arc<dyn CloudInstances>>,
    evictor: Arc<EvictionExecutor>,
    nodes: DashMap<String, NodeEntry>,
    cidrs: Option<StdMutex<CidrAllocator>>,
}

impl NodeFleetReconciler {
    /// Create the reconciler
    ///
    /// An unusable cluster CIDR disables range allocation with a reported
    /// error; everything else about the fleet keeps working.
    pub fn new(
        config: Arc<Config>,
        node_api: Arc<dyn NodeApi>,
        workloads: Arc<dyn WorkloadApi>,
        cloud: Option<Arc<dyn CloudInstances>>,
        evictor: Arc<EvictionExecutor>,
    ) -> Self {
        let cidrs = match (&config.cluster_cidr, config.allocate_node_cidrs) {
            (Some(block), true) => match CidrAllocator::new(block, DEFAULT_NODE_PREFIX) {
                Ok(allocator) => Some(StdMutex::new(allocator)),
                Err(e) => {
                    error!(error = %e, "pod CIDR allocation disabled");
                    None
                }
            },
            (None, true) => {
                warn!("allocate-node-cidrs is set but no cluster CIDR is configured");
                None
            }
            _ => None,
        };
        Self {
            config,
            node_api,
            workloads,
            cloud,
            evictor,
            nodes: DashMap::new(),
            cidrs,
        }
    }

    /// Run the membership sync loop until cancelled
    pub async fn run_membership(self: Arc<Self>, cancel: CancellationToken) {
        info!(period = ?self.config.node_sync_period, "fleet membership loop started");
        let mut ticker = interval(self.config.node_sync_period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.clone().sync_membership_once(Utc::now()).await,
            }
        }
        info!("fleet membership loop stopped");
    }

    /// Run the health monitor loop until cancelled
    pub async fn run_monitor(self: Arc<Self>, cancel: CancellationToken) {
        info!(period = ?self.config.node_monitor_period, "node health monitor started");
        let mut ticker = interval(self.config.node_monitor_period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.monitor_once(Utc::now()).await,
            }
        }
        info!("node health monitor stopped");
    }

    /// Resolve the authoritative membership set for this cycle
    async fn resolve_members(&self) -> Result<Vec<String>> {
        match &self.config.membership {
            MembershipSource::CloudPattern(pattern) => match &self.cloud {
                Some(cloud) => cloud.instances(pattern).await,
                None => Err(Error::configuration(
                    "instance pattern configured but no cloud provider handle is available",
                )),
            },
            MembershipSource::StaticList(names) => Ok(names.clone()),
            MembershipSource::Unconfigured => {
                debug!("no membership source configured; membership is empty");
                Ok(Vec::new())
            }
        }
    }

    fn membership_origin(&self) -> MembershipOrigin {
        match self.config.membership {
            MembershipSource::CloudPattern(_) => MembershipOrigin::Cloud,
            _ => MembershipOrigin::Static,
        }
    }

    /// One pass of the membership sync loop
    ///
    /// Enumeration failure retains the previous membership set unchanged
    /// for this cycle: stale-but-available beats unavailable.
    pub(crate) async fn sync_membership_once(self: Arc<Self>, now: DateTime<Utc>) {
        let members = match self.resolve_members().await {
            Ok(members) => members,
            Err(e) => {
                warn!(error = %e, "membership enumeration failed; retaining previous set");
                return;
            }
        };

        let registered = match self.node_api.list_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(error = %e, "listing registered nodes failed; retrying next cycle");
                return;
            }
        };
        let registered_names: HashSet<String> =
            registered.iter().map(|n| n.name.clone()).collect();

        // Ranges already recorded in the API must never be handed out again
        if let Some(cidrs) = &self.cidrs {
            let mut allocator = cidrs.lock().expect("cidr allocator lock poisoned");
            for node in &registered {
                if let Some(block) = &node.pod_cidr {
                    if allocator.assignment(&node.name).is_none() {
                        if let Err(e) = allocator.adopt(&node.name, block) {
                            warn!(node = %node.name, error = %e, "could not adopt existing pod CIDR");
                        }
                    }
                }
            }
        }

        let origin = self.membership_origin();
        let member_set: HashSet<&str> = members.iter().map(String::as_str).collect();

        // Discover new members; re-arm ones that came back
        for name in &members {
            match self.nodes.entry(name.clone()) {
                dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                    occupied.get_mut().pending_removal = false;
                }
                dashmap::mapref::entry::Entry::Vacant(vacant) => {
                    info!(node = %name, origin = ?origin, "node joined the fleet");
                    vacant.insert(NodeEntry::new(now, origin));
                }
            }
        }

        // Registered nodes we are not tracking and the source does not
        // claim: schedule for removal like any other departure
        for node in &registered {
            if !member_set.contains(node.name.as_str()) && !self.nodes.contains_key(&node.name) {
                info!(node = %node.name, "registered node missing from membership source");
                let mut entry = NodeEntry::new(now, origin);
                entry.registration = Registration::Registered;
                entry.pod_cidr = node.pod_cidr.clone();
                entry.pending_removal = true;
                self.nodes.insert(node.name.clone(), entry);
            }
        }

        // Kick off registration for nodes the API has not seen yet
        let to_register: Vec<String> = self
            .nodes
            .iter()
            .filter(|e| e.value().registration == Registration::Pending)
            .map(|e| e.key().clone())
            .collect();
        for name in to_register {
            if registered_names.contains(&name) {
                if let Some(mut entry) = self.nodes.get_mut(&name) {
                    entry.registration = Registration::Registered;
                    if entry.pod_cidr.is_none() {
                        entry.pod_cidr = registered
                            .iter()
                            .find(|n| n.name == name)
                            .and_then(|n| n.pod_cidr.clone());
                    }
                }
                continue;
            }
            if let Some(mut entry) = self.nodes.get_mut(&name) {
                entry.registration = Registration::InFlight;
            }
            tokio::spawn(self.clone().register_with_retry(name));
        }

        // Departures: tracked nodes the source no longer claims
        let departed: Vec<String> = self
            .nodes
            .iter()
            .filter(|e| !member_set.contains(e.key().as_str()))
            .map(|e| e.key().clone())
            .collect();
        for name in departed {
            if let Some(mut entry) = self.nodes.get_mut(&name) {
                entry.pending_removal = true;
            }
            match self.workloads.pods_on_node(&name).await {
                Ok(pods) if pods.is_empty() => self.remove_node(&name).await,
                Ok(pods) => debug!(
                    node = %name,
                    pods = pods.len(),
                    "departed node still has workloads; removal deferred"
                ),
                Err(e) => warn!(node = %name, error = %e, "could not check workloads on departed node"),
            }
        }
    }

    /// Register one node, retrying on the sync-period cadence before
    /// giving up
    pub(crate) async fn register_with_retry(self: Arc<Self>, name: String) {
        let policy = RetryPolicy::fixed(
            self.config.register_retry_count,
            self.config.node_sync_period,
        );
        let capacity = self.config.node_capacity;
        let api = self.node_api.clone();
        let node = name.clone();
        let outcome = retry(&policy, "register_node", || {
            let api = api.clone();
            let node = node.clone();
            async move { api.register_node(&node, capacity).await }
        })
        .await;

        match outcome {
            Ok(()) => {
                info!(node = %name, "node registered");
                if let Some(mut entry) = self.nodes.get_mut(&name) {
                    entry.registration = Registration::Registered;
                }
            }
            Err(e) => {
                warn!(node = %name, error = %e, "giving up on node registration");
                if let Some(mut entry) = self.nodes.get_mut(&name) {
                    entry.registration = Registration::Failed;
                }
            }
        }
    }

    /// Delete a node from the API and drop all local state for it
    async fn remove_node(&self, name: &str) {
        match self.node_api.delete_node(name).await {
            Ok(()) => {
                self.evictor.cancel(name);
                if let Some(cidrs) = &self.cidrs {
                    cidrs.lock().expect("cidr allocator lock poisoned").release(name);
                }
                self.nodes.remove(name);
                info!(node = %name, "node removed from the fleet");
            }
            Err(e) => {
                warn!(node = %name, error = %e, "node deletion failed; retrying next cycle");
            }
        }
    }

    /// One pass of the health monitor loop
    ///
    /// Nodes are evaluated sequentially, so one node's transitions are
    /// strictly ordered; ordering across nodes is not guaranteed. A failed
    /// status fetch skips the pass entirely and is retried next tick.
    pub(crate) async fn monitor_once(&self, now: DateTime<Utc>) {
        let heartbeats = match self.node_api.node_heartbeats().await {
            Ok(reports) => reports,
            Err(e) => {
                warn!(error = %e, "node status fetch failed; retrying next tick");
                return;
            }
        };
        let reports: std::collections::HashMap<&str, &NodeHeartbeat> =
            heartbeats.iter().map(|h| (h.name.as_str(), h)).collect();

        let mut names: Vec<String> = self.nodes.iter().map(|e| e.key().clone()).collect();
        names.sort();

        for name in names {
            let report = reports.get(name.as_str()).and_then(|h| h.last_ready);
            let action = self.observe(&name, report, now);
            match action {
                MonitorAction::None => {}
                MonitorAction::CancelEviction => {
                    self.evictor.cancel(&name);
                }
                MonitorAction::SubmitEviction => self.start_eviction(&name).await,
                MonitorAction::CompleteRemoval => self.complete_removal(&name).await,
            }
            self.ensure_pod_cidr(&name).await;
        }
    }

    /// Update one node's record from the latest report and decide the
    /// transition; holds the node's lock only, never across awaits
    fn observe(&self, name: &str, report: Option<DateTime<Utc>>, now: DateTime<Utc>) -> MonitorAction {
        let Some(mut entry) = self.nodes.get_mut(name) else {
            return MonitorAction::None;
        };

        if let Some(ts) = report {
            if entry.last_ready.map(|prev| ts > prev).unwrap_or(true) {
                entry.last_ready = Some(ts);
            }
        }

        let grace = match entry.phase {
            HealthPhase::Unknown => self.config.node_startup_grace_period,
            _ => self.config.node_monitor_grace_period,
        };
        let responsive = entry
            .last_ready
            .map(|t| now - t <= chrono_dur(grace))
            .unwrap_or(false);

        match entry.phase {
            HealthPhase::Unknown => {
                if responsive {
                    self.set_phase(&mut entry, name, HealthPhase::Healthy);
                } else {
                    let since = entry.last_ready.unwrap_or(entry.first_seen);
                    if now - since > chrono_dur(self.config.node_startup_grace_period) {
                        self.set_phase(&mut entry, name, HealthPhase::Unresponsive);
                        entry.unresponsive_since = Some(now);
                    }
                }
                MonitorAction::None
            }
            HealthPhase::Healthy => {
                if !responsive {
                    self.set_phase(&mut entry, name, HealthPhase::Unresponsive);
                    entry.unresponsive_since = Some(now);
                }
                MonitorAction::None
            }
            HealthPhase::Unresponsive => {
                if responsive {
                    self.set_phase(&mut entry, name, HealthPhase::Healthy);
                    entry.unresponsive_since = None;
                    entry.eviction_requested = false;
                    MonitorAction::CancelEviction
                } else {
                    let since = entry.unresponsive_since.unwrap_or(now);
                    if now - since > chrono_dur(self.config.pod_eviction_timeout) {
                        self.set_phase(&mut entry, name, HealthPhase::Evicting);
                        MonitorAction::SubmitEviction
                    } else {
                        MonitorAction::None
                    }
                }
            }
            HealthPhase::Evicting => {
                if responsive {
                    self.set_phase(&mut entry, name, HealthPhase::Healthy);
                    entry.unresponsive_since = None;
                    entry.eviction_requested = false;
                    MonitorAction::CancelEviction
                } else if !entry.eviction_requested {
                    // A previous submission attempt failed; try again
                    MonitorAction::SubmitEviction
                } else if entry.pending_removal && self.evictor.is_drained(name) {
                    MonitorAction::CompleteRemoval
                } else {
                    MonitorAction::None
                }
            }
            HealthPhase::Removed => MonitorAction::None,
        }
    }

    /// Enforce legal state-machine edges; an illegal edge is a bug and is
    /// logged rather than applied
    fn set_phase(
        &self,
        entry: &mut dashmap::mapref::one::RefMut<'_, String, NodeEntry>,
        name: &str,
        next: HealthPhase,
    ) {
        if entry.phase == next {
            return;
        }
        if !entry.phase.permits(next) {
            error!(node = %name, from = %entry.phase, to = %next, "illegal health transition suppressed");
            return;
        }
        info!(node = %name, from = %entry.phase, to = %next, "node health transition");
        entry.phase = next;
    }

    /// Queue deletion of every pod bound to an evicting node
    async fn start_eviction(&self, name: &str) {
        match self.workloads.pods_on_node(name).await {
            Ok(pods) => {
                self.evictor.submit(name, pods);
                if let Some(mut entry) = self.nodes.get_mut(name) {
                    entry.eviction_requested = true;
                }
            }
            Err(e) => {
                // Leave eviction_requested unset; next tick retries
                warn!(node = %name, error = %e, "could not list pods for eviction");
            }
        }
    }

    /// Finish the `Evicting -> Removed` edge once the node is drained and
    /// no longer a member
    async fn complete_removal(&self, name: &str) {
        if let Some(mut entry) = self.nodes.get_mut(name) {
            self.set_phase(&mut entry, name, HealthPhase::Removed);
        }
        self.remove_node(name).await;
    }

    /// Assign a pod-network range to a healthy node that lacks one
    ///
    /// Allocation failures are reported per node and never block other
    /// nodes; a failed API assignment retries next tick against the same
    /// (idempotent) allocation.
    async fn ensure_pod_cidr(&self, name: &str) {
        let Some(cidrs) = &self.cidrs else { return };

        let needs = self
            .nodes
            .get(name)
            .map(|e| e.phase == HealthPhase::Healthy && e.pod_cidr.is_none())
            .unwrap_or(false);
        if !needs {
            return;
        }

        let allocated = {
            let mut allocator = cidrs.lock().expect("cidr allocator lock poisoned");
            allocator.allocate(name)
        };
        let block = match allocated {
            Ok(block) => block,
            Err(e) => {
                error!(node = %name, error = %e, "pod CIDR allocation failed");
                return;
            }
        };

        if let Err(e) = self.node_api.assign_pod_cidr(name, &block).await {
            warn!(node = %name, cidr = %block, error = %e, "recording pod CIDR failed; will retry");
            return;
        }
        if let Some(cloud) = &self.cloud {
            if cloud.supports_pod_ranges() {
                if let Err(e) = cloud.assign_pod_range(name, &block).await {
                    warn!(node = %name, cidr = %block, error = %e, "cloud pod-range assignment failed");
                }
            }
        }
        if let Some(mut entry) = self.nodes.get_mut(name) {
            entry.pod_cidr = Some(block.clone());
        }
        info!(node = %name, cidr = %block, "assigned pod CIDR");
    }

    /// Current phase of a tracked node
    pub fn phase_of(&self, name: &str) -> Option<HealthPhase> {
        self.nodes.get(name).map(|e| e.phase)
    }

    /// Names of all tracked nodes
    pub fn tracked(&self) -> Vec<String> {
        let mut names: Vec<String> = self.nodes.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    #[cfg(test)]
    fn pod_cidr_of(&self, name: &str) -> Option<String> {
        self.nodes.get(name).and_then(|e| e.pod_cidr.clone())
    }

    #[cfg(test)]
    fn mark_registered(&self, name: &str) {
        if let Some(mut entry) = self.nodes.get_mut(name) {
            entry.registration = Registration::Registered;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as TestMutex;

    use crate::api::{MockNodeApi, MockWorkloadApi, NodeHeartbeat, PodRef, RegisteredNode};
    use crate::cloud::MockCloudInstances;
    use crate::config::CloudConfig;

    fn test_config(membership: MembershipSource) -> Arc<Config> {
        Arc::new(Config {
            membership,
            ..Config::default()
        })
    }

    fn quiet_evictor() -> Arc<EvictionExecutor> {
        let mut workloads = MockWorkloadApi::new();
        workloads.expect_delete_pod().returning(|_| Ok(()));
        Arc::new(EvictionExecutor::new(
            Arc::new(workloads),
            10.0,
            10,
            Duration::from_secs(5),
        ))
    }

    fn pod(name: &str) -> PodRef {
        PodRef {
            name: name.to_string(),
            namespace: "default".to_string(),
        }
    }

    fn heartbeat(name: &str, last_ready: Option<DateTime<Utc>>) -> NodeHeartbeat {
        NodeHeartbeat {
            name: name.to_string(),
            last_ready,
        }
    }

    /// Shared mutable heartbeat feed for the node_heartbeats mock
    fn heartbeat_feed(
        api: &mut MockNodeApi,
    ) -> Arc<TestMutex<Vec<NodeHeartbeat>>> {
        let feed = Arc::new(TestMutex::new(Vec::new()));
        let source = feed.clone();
        api.expect_node_heartbeats()
            .returning(move || Ok(source.lock().unwrap().clone()));
        feed
    }

    fn reconciler(
        config: Arc<Config>,
        node_api: MockNodeApi,
        workloads: MockWorkloadApi,
        cloud: Option<MockCloudInstances>,
        evictor: Arc<EvictionExecutor>,
    ) -> Arc<NodeFleetReconciler> {
        Arc::new(NodeFleetReconciler::new(
            config,
            Arc::new(node_api),
            Arc::new(workloads),
            cloud.map(|c| Arc::new(c) as Arc<dyn CloudInstances>),
            evictor,
        ))
    }

    // ======================================================================
    // Membership sync
    // ======================================================================

    #[tokio::test]
    async fn story_static_list_members_are_discovered_and_registered() {
        let mut node_api = MockNodeApi::new();
        node_api.expect_list_nodes().returning(|| Ok(vec![]));
        node_api
            .expect_register_node()
            .times(2)
            .returning(|_, _| Ok(()));

        let config = test_config(MembershipSource::StaticList(vec![
            "m1".to_string(),
            "m2".to_string(),
        ]));
        let fleet = reconciler(config, node_api, MockWorkloadApi::new(), None, quiet_evictor());

        fleet.clone().sync_membership_once(Utc::now()).await;
        assert_eq!(fleet.tracked(), vec!["m1", "m2"]);
        assert_eq!(fleet.phase_of("m1"), Some(HealthPhase::Unknown));

        // Let the spawned registration attempts land
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn story_cloud_enumeration_failure_retains_previous_membership() {
        let calls = Arc::new(TestMutex::new(0u32));
        let mut cloud = MockCloudInstances::new();
        let counter = calls.clone();
        cloud.expect_instances().returning(move |_| {
            let mut calls = counter.lock().unwrap();
            *calls += 1;
            if *calls == 1 {
                Ok(vec!["n1".to_string()])
            } else {
                Err(Error::cloud("testcloud", "inventory api is down"))
            }
        });

        let mut node_api = MockNodeApi::new();
        node_api.expect_list_nodes().returning(|| {
            Ok(vec![RegisteredNode {
                name: "n1".to_string(),
                pod_cidr: None,
            }])
        });
        // No node may be deleted on an enumeration failure
        node_api.expect_delete_node().times(0);

        let mut config = Config::default();
        config.membership = MembershipSource::CloudPattern("n.*".to_string());
        config.cloud = Some(CloudConfig {
            provider: "testcloud".to_string(),
            config_file: None,
        });
        let fleet = reconciler(
            Arc::new(config),
            node_api,
            MockWorkloadApi::new(),
            Some(cloud),
            quiet_evictor(),
        );

        fleet.clone().sync_membership_once(Utc::now()).await;
        assert_eq!(fleet.tracked(), vec!["n1"]);

        // Flaky cycle: the health table is unchanged
        fleet.clone().sync_membership_once(Utc::now()).await;
        assert_eq!(fleet.tracked(), vec!["n1"]);
    }

    #[tokio::test]
    async fn story_departed_idle_node_is_deleted() {
        let calls = Arc::new(TestMutex::new(0u32));
        let mut cloud = MockCloudInstances::new();
        let counter = calls.clone();
        cloud.expect_instances().returning(move |_| {
            let mut calls = counter.lock().unwrap();
            *calls += 1;
            if *calls == 1 {
                Ok(vec!["n1".to_string(), "n2".to_string()])
            } else {
                Ok(vec!["n1".to_string()])
            }
        });

        let mut node_api = MockNodeApi::new();
        node_api.expect_list_nodes().returning(|| {
            Ok(vec![
                RegisteredNode { name: "n1".to_string(), pod_cidr: None },
                RegisteredNode { name: "n2".to_string(), pod_cidr: None },
            ])
        });
        node_api
            .expect_delete_node()
            .withf(|name| name == "n2")
            .times(1)
            .returning(|_| Ok(()));

        let mut workloads = MockWorkloadApi::new();
        workloads.expect_pods_on_node().returning(|_| Ok(vec![]));

        let mut config = Config::default();
        config.membership = MembershipSource::CloudPattern("n.*".to_string());
        let fleet = reconciler(Arc::new(config), node_api, workloads, Some(cloud), quiet_evictor());

        fleet.clone().sync_membership_once(Utc::now()).await;
        assert_eq!(fleet.tracked(), vec!["n1", "n2"]);

        fleet.clone().sync_membership_once(Utc::now()).await;
        assert_eq!(fleet.tracked(), vec!["n1"]);
    }

    #[tokio::test]
    async fn story_departed_busy_node_removal_is_deferred() {
        let calls = Arc::new(TestMutex::new(0u32));
        let mut cloud = MockCloudInstances::new();
        let counter = calls.clone();
        cloud.expect_instances().returning(move |_| {
            let mut calls = counter.lock().unwrap();
            *calls += 1;
            if *calls == 1 {
                Ok(vec!["n1".to_string()])
            } else {
                Ok(vec![])
            }
        });

        let mut node_api = MockNodeApi::new();
        node_api.expect_list_nodes().returning(|| {
            Ok(vec![RegisteredNode { name: "n1".to_string(), pod_cidr: None }])
        });
        node_api.expect_delete_node().times(0);

        let mut workloads = MockWorkloadApi::new();
        workloads
            .expect_pods_on_node()
            .returning(|_| Ok(vec![pod("p1")]));

        let mut config = Config::default();
        config.membership = MembershipSource::CloudPattern("n.*".to_string());
        let fleet = reconciler(Arc::new(config), node_api, workloads, Some(cloud), quiet_evictor());

        fleet.clone().sync_membership_once(Utc::now()).await;
        fleet.clone().sync_membership_once(Utc::now()).await;

        // Still tracked: a node with live workloads is never force-dropped
        // by membership alone
        assert_eq!(fleet.tracked(), vec!["n1"]);
    }

    // ======================================================================
    // Health monitoring
    // ======================================================================

    /// Walk a single static node through discovery with a live heartbeat
    async fn healthy_fleet(
        feed_ready: DateTime<Utc>,
    ) -> (Arc<NodeFleetReconciler>, Arc<TestMutex<Vec<NodeHeartbeat>>>) {
        let mut node_api = MockNodeApi::new();
        node_api.expect_list_nodes().returning(|| {
            Ok(vec![RegisteredNode { name: "m1".to_string(), pod_cidr: None }])
        });
        let feed = heartbeat_feed(&mut node_api);

        let mut workloads = MockWorkloadApi::new();
        workloads
            .expect_pods_on_node()
            .returning(|_| Ok(vec![pod("p1"), pod("p2")]));

        let config = test_config(MembershipSource::StaticList(vec!["m1".to_string()]));
        let fleet = reconciler(config, node_api, workloads, None, quiet_evictor());

        fleet.clone().sync_membership_once(feed_ready).await;
        fleet.mark_registered("m1");

        feed.lock().unwrap().clear();
        feed.lock()
            .unwrap()
            .push(heartbeat("m1", Some(feed_ready)));
        fleet.monitor_once(feed_ready).await;
        assert_eq!(fleet.phase_of("m1"), Some(HealthPhase::Healthy));
        (fleet, feed)
    }

    #[tokio::test]
    async fn story_grace_period_overrun_marks_node_unresponsive() {
        let t0 = Utc::now();
        let (fleet, _feed) = healthy_fleet(t0).await;

        // 39 seconds of silence: still inside the 40s grace period
        fleet.monitor_once(t0 + chrono::Duration::seconds(39)).await;
        assert_eq!(fleet.phase_of("m1"), Some(HealthPhase::Healthy));

        // 41 seconds of silence: grace exceeded
        fleet.monitor_once(t0 + chrono::Duration::seconds(41)).await;
        assert_eq!(fleet.phase_of("m1"), Some(HealthPhase::Unresponsive));
    }

    #[tokio::test]
    async fn story_eviction_starts_after_timeout_and_queues_all_pods() {
        let t0 = Utc::now();
        let (fleet, _feed) = healthy_fleet(t0).await;

        let unresponsive_at = t0 + chrono::Duration::seconds(41);
        fleet.monitor_once(unresponsive_at).await;
        assert_eq!(fleet.phase_of("m1"), Some(HealthPhase::Unresponsive));

        // Four minutes unresponsive: inside the five-minute eviction timeout
        fleet
            .monitor_once(unresponsive_at + chrono::Duration::seconds(240))
            .await;
        assert_eq!(fleet.phase_of("m1"), Some(HealthPhase::Unresponsive));

        // Past the timeout: eviction begins, both pods queued
        fleet
            .monitor_once(unresponsive_at + chrono::Duration::seconds(301))
            .await;
        assert_eq!(fleet.phase_of("m1"), Some(HealthPhase::Evicting));
        assert_eq!(fleet.evictor.pending("m1"), 2);
    }

    #[tokio::test]
    async fn story_recovery_from_evicting_cancels_pending_deletions() {
        let t0 = Utc::now();
        let (fleet, feed) = healthy_fleet(t0).await;

        let unresponsive_at = t0 + chrono::Duration::seconds(41);
        fleet.monitor_once(unresponsive_at).await;
        let evicting_at = unresponsive_at + chrono::Duration::seconds(301);
        fleet.monitor_once(evicting_at).await;
        assert_eq!(fleet.phase_of("m1"), Some(HealthPhase::Evicting));
        assert_eq!(fleet.evictor.pending("m1"), 2);

        // A fresh ready report arrives
        let recovered_at = evicting_at + chrono::Duration::seconds(5);
        feed.lock().unwrap().clear();
        feed.lock()
            .unwrap()
            .push(heartbeat("m1", Some(recovered_at)));
        fleet.monitor_once(recovered_at).await;

        assert_eq!(fleet.phase_of("m1"), Some(HealthPhase::Healthy));
        assert!(fleet.evictor.is_drained("m1"));
    }

    #[tokio::test]
    async fn story_repeated_ready_reports_are_idempotent() {
        let t0 = Utc::now();
        let (fleet, feed) = healthy_fleet(t0).await;

        for i in 1..5 {
            let now = t0 + chrono::Duration::seconds(i);
            feed.lock().unwrap().clear();
            feed.lock().unwrap().push(heartbeat("m1", Some(now)));
            fleet.monitor_once(now).await;
            assert_eq!(fleet.phase_of("m1"), Some(HealthPhase::Healthy));
        }
    }

    #[tokio::test]
    async fn story_startup_grace_is_longer_than_monitor_grace() {
        let mut node_api = MockNodeApi::new();
        node_api.expect_list_nodes().returning(|| Ok(vec![]));
        node_api.expect_register_node().returning(|_, _| Ok(()));
        let feed = heartbeat_feed(&mut node_api);

        let config = test_config(MembershipSource::StaticList(vec!["m1".to_string()]));
        let fleet = reconciler(config, node_api, MockWorkloadApi::new(), None, quiet_evictor());

        let t0 = Utc::now();
        fleet.clone().sync_membership_once(t0).await;
        feed.lock().unwrap().push(heartbeat("m1", None));

        // 45s without a first report: beyond monitor grace (40s) but inside
        // startup grace (60s), so the node is still settling
        fleet.monitor_once(t0 + chrono::Duration::seconds(45)).await;
        assert_eq!(fleet.phase_of("m1"), Some(HealthPhase::Unknown));

        // 61s: startup grace exceeded
        fleet.monitor_once(t0 + chrono::Duration::seconds(61)).await;
        assert_eq!(fleet.phase_of("m1"), Some(HealthPhase::Unresponsive));
    }

    #[tokio::test]
    async fn story_drained_departed_node_reaches_removed() {
        let calls = Arc::new(TestMutex::new(0u32));
        let mut cloud = MockCloudInstances::new();
        let counter = calls.clone();
        cloud.expect_instances().returning(move |_| {
            let mut calls = counter.lock().unwrap();
            *calls += 1;
            if *calls == 1 {
                Ok(vec!["n1".to_string()])
            } else {
                Ok(vec![])
            }
        });

        let mut node_api = MockNodeApi::new();
        node_api.expect_list_nodes().returning(|| {
            Ok(vec![RegisteredNode { name: "n1".to_string(), pod_cidr: None }])
        });
        node_api
            .expect_delete_node()
            .withf(|name| name == "n1")
            .times(1)
            .returning(|_| Ok(()));
        let feed = heartbeat_feed(&mut node_api);

        // The node still hosts pods while unresponsive; they are what the
        // evictor drains
        let pods = Arc::new(TestMutex::new(vec![pod("p1")]));
        let mut workloads = MockWorkloadApi::new();
        let pod_source = pods.clone();
        workloads
            .expect_pods_on_node()
            .returning(move |_| Ok(pod_source.lock().unwrap().clone()));

        let mut config = Config::default();
        config.membership = MembershipSource::CloudPattern("n.*".to_string());
        let fleet = reconciler(Arc::new(config), node_api, workloads, Some(cloud), quiet_evictor());

        let t0 = Utc::now();
        fleet.clone().sync_membership_once(t0).await;
        fleet.mark_registered("n1");
        feed.lock().unwrap().push(heartbeat("n1", Some(t0)));
        fleet.monitor_once(t0).await;
        assert_eq!(fleet.phase_of("n1"), Some(HealthPhase::Healthy));

        // Node drops out of the inventory while still busy: deferred
        fleet.clone().sync_membership_once(t0 + chrono::Duration::seconds(10)).await;
        assert_eq!(fleet.tracked(), vec!["n1"]);

        // It goes silent, times out, and starts evicting
        feed.lock().unwrap().clear();
        feed.lock().unwrap().push(heartbeat("n1", Some(t0)));
        let unresponsive_at = t0 + chrono::Duration::seconds(41);
        fleet.monitor_once(unresponsive_at).await;
        let evicting_at = unresponsive_at + chrono::Duration::seconds(301);
        fleet.monitor_once(evicting_at).await;
        assert_eq!(fleet.phase_of("n1"), Some(HealthPhase::Evicting));

        // Eviction drains (simulate executor completion), node disappears
        fleet.evictor.cancel("n1");
        pods.lock().unwrap().clear();
        fleet
            .monitor_once(evicting_at + chrono::Duration::seconds(5))
            .await;
        assert!(fleet.phase_of("n1").is_none());
    }

    // ======================================================================
    // CIDR assignment
    // ======================================================================

    #[tokio::test]
    async fn story_healthy_nodes_get_disjoint_pod_cidrs_once() {
        let mut node_api = MockNodeApi::new();
        node_api.expect_list_nodes().returning(|| Ok(vec![]));
        node_api.expect_register_node().returning(|_, _| Ok(()));
        let assigned = Arc::new(TestMutex::new(Vec::<(String, String)>::new()));
        let sink = assigned.clone();
        node_api
            .expect_assign_pod_cidr()
            .returning(move |name, cidr| {
                sink.lock()
                    .unwrap()
                    .push((name.to_string(), cidr.to_string()));
                Ok(())
            });
        let feed = heartbeat_feed(&mut node_api);

        let mut config = Config::default();
        config.membership =
            MembershipSource::StaticList(vec!["m1".to_string(), "m2".to_string()]);
        config.allocate_node_cidrs = true;
        config.cluster_cidr = Some("10.244.0.0/16".to_string());
        let fleet = reconciler(
            Arc::new(config),
            node_api,
            MockWorkloadApi::new(),
            None,
            quiet_evictor(),
        );

        let t0 = Utc::now();
        fleet.clone().sync_membership_once(t0).await;
        feed.lock().unwrap().push(heartbeat("m1", Some(t0)));
        feed.lock().unwrap().push(heartbeat("m2", Some(t0)));

        // Several ticks: assignment happens exactly once per node
        for i in 0..3 {
            fleet.monitor_once(t0 + chrono::Duration::seconds(i)).await;
        }

        let assigned = assigned.lock().unwrap().clone();
        assert_eq!(assigned.len(), 2);
        assert_ne!(assigned[0].1, assigned[1].1);
        assert_eq!(fleet.pod_cidr_of("m1").as_deref(), Some("10.244.0.0/24"));
        assert_eq!(fleet.pod_cidr_of("m2").as_deref(), Some("10.244.1.0/24"));
    }

    #[tokio::test]
    async fn story_cidr_exhaustion_blocks_one_node_not_the_fleet() {
        let mut node_api = MockNodeApi::new();
        node_api.expect_list_nodes().returning(|| Ok(vec![]));
        node_api.expect_register_node().returning(|_, _| Ok(()));
        node_api.expect_assign_pod_cidr().returning(|_, _| Ok(()));
        let feed = heartbeat_feed(&mut node_api);

        // A /23 block carved into /24s holds exactly two node subnets, so
        // the third node exhausts the space
        let mut config = Config::default();
        config.membership = MembershipSource::StaticList(vec![
            "m1".to_string(),
            "m2".to_string(),
            "m3".to_string(),
        ]);
        config.allocate_node_cidrs = true;
        config.cluster_cidr = Some("10.0.0.0/23".to_string());
        let fleet = reconciler(
            Arc::new(config),
            node_api,
            MockWorkloadApi::new(),
            None,
            quiet_evictor(),
        );

        let t0 = Utc::now();
        fleet.clone().sync_membership_once(t0).await;
        for name in ["m1", "m2", "m3"] {
            feed.lock().unwrap().push(heartbeat(name, Some(t0)));
        }
        fleet.monitor_once(t0).await;

        // The two winners hold disjoint ranges; the loser is still Healthy
        assert_eq!(fleet.pod_cidr_of("m1").as_deref(), Some("10.0.0.0/24"));
        assert_eq!(fleet.pod_cidr_of("m2").as_deref(), Some("10.0.1.0/24"));
        assert_eq!(fleet.pod_cidr_of("m3"), None);
        assert_eq!(fleet.phase_of("m3"), Some(HealthPhase::Healthy));
    }
}
