//! Cluster API collaborator traits
//!
//! The orchestrator never talks to the cluster API server directly; every
//! controller works against the traits in this module. The traits allow
//! mocking the API in tests while the real [`KubeApi`] client is used in
//! production. They are split by consumer: the fleet reconciler uses
//! [`NodeApi`] and [`WorkloadApi`], the peer controllers use [`ObjectApi`].
//!
//! The API server is assumed to apply changes atomically per object; an
//! update conflict surfaces as a retryable [`crate::Error::Api`] and is
//! picked up again on the caller's next tick.

mod kube;

pub use kube::KubeApi;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[cfg(test)]
use mockall::automock;

use crate::config::NodeCapacity;
use crate::Result;

/// A node as registered with the cluster API
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisteredNode {
    /// Node name (fleet identity)
    pub name: String,
    /// Pod-network CIDR recorded on the node, if assigned
    pub pod_cidr: Option<String>,
}

/// The latest liveness report observed for a node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeHeartbeat {
    /// Node name
    pub name: String,
    /// Timestamp of the last ready report; `None` if the node never
    /// reported ready
    pub last_ready: Option<DateTime<Utc>>,
}

/// Identity of a pod bound to a node
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PodRef {
    /// Pod name
    pub name: String,
    /// Namespace the pod lives in
    pub namespace: String,
}

impl std::fmt::Display for PodRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Resource types the peer controllers resync
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Services (endpoint controller input)
    Service,
    /// Replication units (replica-count controller input)
    ReplicaUnit,
    /// Namespaces (lifecycle controller input)
    Namespace,
    /// Resource quotas (usage sync input)
    ResourceQuota,
    /// Persistent volume claims (binder input)
    VolumeClaim,
    /// Service accounts (token controller input)
    ServiceAccount,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResourceKind::Service => "service",
            ResourceKind::ReplicaUnit => "replicaunit",
            ResourceKind::Namespace => "namespace",
            ResourceKind::ResourceQuota => "resourcequota",
            ResourceKind::VolumeClaim => "volumeclaim",
            ResourceKind::ServiceAccount => "serviceaccount",
        };
        f.write_str(s)
    }
}

/// Reference to a cluster object a peer controller reconciles
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    /// Object name
    pub name: String,
    /// Namespace; `None` for cluster-scoped objects
    pub namespace: Option<String>,
}

impl ObjectRef {
    /// Reference to a cluster-scoped object
    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
        }
    }

    /// Reference to a namespaced object
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: Some(namespace.into()),
        }
    }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Node registration and status operations used by the fleet reconciler
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeApi: Send + Sync {
    /// List the nodes currently registered with the cluster API
    async fn list_nodes(&self) -> Result<Vec<RegisteredNode>>;

    /// Register a node with the given provisioning-time capacity
    async fn register_node(&self, name: &str, capacity: NodeCapacity) -> Result<()>;

    /// Delete a node from the cluster API
    async fn delete_node(&self, name: &str) -> Result<()>;

    /// Record the assigned pod-network CIDR on a node
    async fn assign_pod_cidr(&self, name: &str, cidr: &str) -> Result<()>;

    /// Fetch the latest liveness reports for all registered nodes
    async fn node_heartbeats(&self) -> Result<Vec<NodeHeartbeat>>;
}

/// Pod operations used by the fleet reconciler and eviction executor
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadApi: Send + Sync {
    /// List the pods currently bound to a node
    async fn pods_on_node(&self, node: &str) -> Result<Vec<PodRef>>;

    /// Delete a single pod
    async fn delete_pod(&self, pod: &PodRef) -> Result<()>;
}

/// Object operations used by the peer reconciliation controllers
///
/// Each `sync_*`/apply operation is the per-object corrective action of one
/// peer controller; the controller owns cadence and fan-out, the API applies
/// the change atomically.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectApi: Send + Sync {
    /// List the objects of one resource kind
    async fn list(&self, kind: ResourceKind) -> Result<Vec<ObjectRef>>;

    /// Rebuild the endpoints of a service from its ready pods
    async fn sync_endpoints(&self, service: &ObjectRef) -> Result<()>;

    /// Refresh the observed replica count of a replication unit
    async fn sync_replica_count(&self, unit: &ObjectRef) -> Result<()>;

    /// Drive a terminating namespace toward empty and release it
    async fn finalize_namespace(&self, namespace: &ObjectRef) -> Result<()>;

    /// Recompute and record quota usage
    async fn refresh_quota_usage(&self, quota: &ObjectRef) -> Result<()>;

    /// Bind an unbound volume claim to an available volume
    async fn bind_volume_claim(&self, claim: &ObjectRef) -> Result<()>;

    /// Whether a service account already has an issued token secret
    async fn has_token_secret(&self, account: &ObjectRef) -> Result<bool>;

    /// Store a freshly issued token for a service account
    async fn store_token_secret(&self, account: &ObjectRef, token: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_ref_displays_namespace_and_name() {
        let pod = PodRef {
            name: "web-0".into(),
            namespace: "prod".into(),
        };
        assert_eq!(pod.to_string(), "prod/web-0");
    }

    #[test]
    fn object_ref_display_follows_scope() {
        assert_eq!(ObjectRef::cluster_scoped("ns-1").to_string(), "ns-1");
        assert_eq!(
            ObjectRef::namespaced("prod", "web").to_string(),
            "prod/web"
        );
    }
}
