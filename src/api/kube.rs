//! Kube-backed implementation of the cluster API traits
//!
//! [`KubeApi`] wraps a single `kube::Client` and implements every
//! collaborator trait the controllers consume. Exactly one instance is
//! constructed per process, by the supervisor; failure to construct it is
//! the orchestrator's sole fatal startup condition.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Namespace, Node, NodeStatus, PersistentVolume, PersistentVolumeClaim, Pod,
    ReplicationController, ResourceQuota, Secret, Service, ServiceAccount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::debug;

use crate::api::{NodeApi, NodeHeartbeat, ObjectApi, ObjectRef, PodRef, RegisteredNode,
    ResourceKind, WorkloadApi};
use crate::config::NodeCapacity;
use crate::{Error, Result, FIELD_MANAGER};

/// Annotation tying a token secret to its service account
const TOKEN_ACCOUNT_ANNOTATION: &str = "kubernetes.io/service-account.name";

/// Secret type for issued service-account tokens
const TOKEN_SECRET_TYPE: &str = "kubernetes.io/service-account-token";

/// The one real cluster API client
#[derive(Clone)]
pub struct KubeApi {
    client: Client,
}

impl KubeApi {
    /// Connect to the cluster API using the ambient kubeconfig/in-cluster
    /// environment
    ///
    /// This is the sole fatal startup path: if no client can be constructed,
    /// nothing else in the process may run.
    pub async fn connect() -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self { client })
    }

    /// Wrap an already-constructed client (used by the binary when a custom
    /// API endpoint is configured)
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pods_in(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn pods_matching(&self, namespace: &str, selector: &BTreeMap<String, String>)
        -> Result<Vec<Pod>>
    {
        let selector = selector
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");
        let params = ListParams::default().labels(&selector);
        Ok(self.pods_in(namespace).list(&params).await?.items)
    }
}

/// Whether a pod reports Ready
fn pod_is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| conds.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
        .unwrap_or(false)
}

/// Extract the timestamp of the last Ready report from node conditions
fn last_ready_time(status: Option<&NodeStatus>) -> Option<chrono::DateTime<chrono::Utc>> {
    status
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conds| {
            conds
                .iter()
                .find(|c| c.type_ == "Ready" && c.status == "True")
                .and_then(|c| c.last_heartbeat_time.as_ref())
                .map(|t| t.0)
        })
}

#[async_trait]
impl NodeApi for KubeApi {
    async fn list_nodes(&self) -> Result<Vec<RegisteredNode>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api.list(&ListParams::default()).await?;
        Ok(nodes
            .items
            .into_iter()
            .map(|node| RegisteredNode {
                pod_cidr: node.spec.as_ref().and_then(|s| s.pod_cidr.clone()),
                name: node.name_any(),
            })
            .collect())
    }

    async fn register_node(&self, name: &str, capacity: NodeCapacity) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());

        let mut capacity_list = BTreeMap::new();
        capacity_list.insert("cpu".to_string(), Quantity(format!("{}m", capacity.milli_cpu)));
        capacity_list.insert("memory".to_string(), Quantity(capacity.memory_bytes.to_string()));

        let node = Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: None,
            status: Some(NodeStatus {
                capacity: Some(capacity_list),
                ..Default::default()
            }),
        };

        match api.create(&PostParams::default(), &node).await {
            Ok(_) => Ok(()),
            // Already registered by a previous attempt
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_node(&self, name: &str) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn assign_pod_cidr(&self, name: &str, cidr: &str) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = serde_json::json!({
            "spec": { "podCIDR": cidr }
        });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn node_heartbeats(&self) -> Result<Vec<NodeHeartbeat>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api.list(&ListParams::default()).await?;
        Ok(nodes
            .items
            .into_iter()
            .map(|node| NodeHeartbeat {
                last_ready: last_ready_time(node.status.as_ref()),
                name: node.name_any(),
            })
            .collect())
    }
}

#[async_trait]
impl WorkloadApi for KubeApi {
    async fn pods_on_node(&self, node: &str) -> Result<Vec<PodRef>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={}", node));
        let pods = api.list(&params).await?;
        Ok(pods
            .items
            .into_iter()
            .map(|pod| PodRef {
                namespace: pod.namespace().unwrap_or_default(),
                name: pod.name_any(),
            })
            .collect())
    }

    async fn delete_pod(&self, pod: &PodRef) -> Result<()> {
        match self.pods_in(&pod.namespace).delete(&pod.name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            // Already gone counts as deleted
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Collect `ObjectRef`s from a cluster-wide list of any resource type
async fn list_refs<K>(client: Client) -> Result<Vec<ObjectRef>>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
    K::DynamicType: Default,
{
    let api: Api<K> = Api::all(client);
    let objects = api.list(&ListParams::default()).await?;
    Ok(objects
        .items
        .iter()
        .map(|obj| ObjectRef {
            name: obj.name_any(),
            namespace: obj.namespace(),
        })
        .collect())
}

#[async_trait]
impl ObjectApi for KubeApi {
    async fn list(&self, kind: ResourceKind) -> Result<Vec<ObjectRef>> {
        let client = self.client.clone();
        match kind {
            ResourceKind::Service => list_refs::<Service>(client).await,
            ResourceKind::ReplicaUnit => list_refs::<ReplicationController>(client).await,
            ResourceKind::Namespace => list_refs::<Namespace>(client).await,
            ResourceKind::ResourceQuota => list_refs::<ResourceQuota>(client).await,
            ResourceKind::VolumeClaim => list_refs::<PersistentVolumeClaim>(client).await,
            ResourceKind::ServiceAccount => list_refs::<ServiceAccount>(client).await,
        }
    }

    async fn sync_endpoints(&self, service: &ObjectRef) -> Result<()> {
        let namespace = service.namespace.as_deref().unwrap_or("default");
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let svc = services.get(&service.name).await?;

        // Selector-less services (headless externals) manage their own
        // endpoints
        let Some(selector) = svc.spec.as_ref().and_then(|s| s.selector.clone()) else {
            debug!(service = %service, "service has no selector, skipping");
            return Ok(());
        };

        let pods = self.pods_matching(namespace, &selector).await?;
        let addresses: Vec<serde_json::Value> = pods
            .iter()
            .filter(|pod| pod_is_ready(pod))
            .filter_map(|pod| pod.status.as_ref().and_then(|s| s.pod_ip.as_ref()))
            .map(|ip| serde_json::json!({ "ip": ip }))
            .collect();

        let ports: Vec<serde_json::Value> = svc
            .spec
            .as_ref()
            .and_then(|s| s.ports.as_ref())
            .map(|ports| {
                ports
                    .iter()
                    .map(|sp| {
                        let port = match &sp.target_port {
                            Some(IntOrString::Int(p)) => *p,
                            _ => sp.port,
                        };
                        match &sp.name {
                            Some(name) => serde_json::json!({ "name": name, "port": port }),
                            None => serde_json::json!({ "port": port }),
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        let subsets = if addresses.is_empty() {
            serde_json::json!([])
        } else {
            serde_json::json!([{ "addresses": addresses, "ports": ports }])
        };

        let endpoints = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Endpoints",
            "metadata": { "name": service.name, "namespace": namespace },
            "subsets": subsets,
        });

        let api: Api<k8s_openapi::api::core::v1::Endpoints> =
            Api::namespaced(self.client.clone(), namespace);
        api.patch(
            &service.name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&endpoints),
        )
        .await?;
        Ok(())
    }

    async fn sync_replica_count(&self, unit: &ObjectRef) -> Result<()> {
        let namespace = unit.namespace.as_deref().unwrap_or("default");
        let api: Api<ReplicationController> = Api::namespaced(self.client.clone(), namespace);
        let rc = api.get(&unit.name).await?;

        let Some(selector) = rc.spec.as_ref().and_then(|s| s.selector.clone()) else {
            return Ok(());
        };

        let observed = self
            .pods_matching(namespace, &selector)
            .await?
            .iter()
            .filter(|pod| pod.metadata.deletion_timestamp.is_none())
            .count() as i32;

        let patch = serde_json::json!({ "status": { "replicas": observed } });
        api.patch_status(&unit.name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn finalize_namespace(&self, namespace: &ObjectRef) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = api.get(&namespace.name).await?;

        let terminating = ns
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .map(|phase| phase == "Terminating")
            .unwrap_or(false);
        if !terminating {
            return Ok(());
        }

        let pods = self.pods_in(&namespace.name).list(&ListParams::default()).await?;
        if pods.items.is_empty() {
            let patch = serde_json::json!({ "spec": { "finalizers": [] } });
            api.patch(
                &namespace.name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
            return Ok(());
        }

        for pod in &pods.items {
            let name = pod.name_any();
            match self.pods_in(&namespace.name).delete(&name, &DeleteParams::default()).await {
                Ok(_) => {}
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn refresh_quota_usage(&self, quota: &ObjectRef) -> Result<()> {
        let namespace = quota.namespace.as_deref().unwrap_or("default");
        let pods = self.pods_in(namespace).list(&ListParams::default()).await?;
        let active = pods
            .items
            .iter()
            .filter(|pod| pod.metadata.deletion_timestamp.is_none())
            .count();

        let api: Api<ResourceQuota> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "status": { "used": { "pods": active.to_string() } }
        });
        api.patch_status(&quota.name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn bind_volume_claim(&self, claim: &ObjectRef) -> Result<()> {
        let namespace = claim.namespace.as_deref().unwrap_or("default");
        let claims: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let pvc = claims.get(&claim.name).await?;

        if pvc.spec.as_ref().and_then(|s| s.volume_name.as_ref()).is_some() {
            return Ok(());
        }

        let volumes: Api<PersistentVolume> = Api::all(self.client.clone());
        let available = volumes
            .list(&ListParams::default())
            .await?
            .items
            .into_iter()
            .find(|pv| pv.spec.as_ref().map(|s| s.claim_ref.is_none()).unwrap_or(false));

        // No volume available yet; the claim stays pending and is retried
        // on the next resync pass
        let Some(volume) = available else {
            debug!(claim = %claim, "no available volume for claim");
            return Ok(());
        };

        let volume_name = volume.name_any();
        let claim_patch = serde_json::json!({
            "spec": { "volumeName": volume_name }
        });
        let volume_patch = serde_json::json!({
            "spec": {
                "claimRef": {
                    "kind": "PersistentVolumeClaim",
                    "name": claim.name,
                    "namespace": namespace,
                }
            }
        });

        volumes
            .patch(&volume_name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&volume_patch))
            .await?;
        claims
            .patch(&claim.name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&claim_patch))
            .await?;
        Ok(())
    }

    async fn has_token_secret(&self, account: &ObjectRef) -> Result<bool> {
        let namespace = account.namespace.as_deref().unwrap_or("default");
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let all = secrets.list(&ListParams::default()).await?;
        Ok(all.items.iter().any(|secret| {
            let for_account = secret
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(TOKEN_ACCOUNT_ANNOTATION))
                .map(|owner| owner == &account.name)
                .unwrap_or(false);
            let token_type = secret.type_.as_deref() == Some(TOKEN_SECRET_TYPE);
            for_account && token_type
        }))
    }

    async fn store_token_secret(&self, account: &ObjectRef, token: &str) -> Result<()> {
        let namespace = account.namespace.as_deref().unwrap_or("default");
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);

        let mut annotations = BTreeMap::new();
        annotations.insert(TOKEN_ACCOUNT_ANNOTATION.to_string(), account.name.clone());
        let mut data = BTreeMap::new();
        data.insert("token".to_string(), token.to_string());

        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(format!("{}-token", account.name)),
                namespace: Some(namespace.to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            type_: Some(TOKEN_SECRET_TYPE.to_string()),
            string_data: Some(data),
            ..Default::default()
        };

        match secrets.create(&PostParams::default(), &secret).await {
            Ok(_) => Ok(()),
            // A concurrent pass already issued it
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(Error::from(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeCondition, PodCondition, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn ready_condition(status: &str, heartbeat: chrono::DateTime<chrono::Utc>) -> NodeCondition {
        NodeCondition {
            type_: "Ready".to_string(),
            status: status.to_string(),
            last_heartbeat_time: Some(Time(heartbeat)),
            ..Default::default()
        }
    }

    #[test]
    fn last_ready_time_reads_the_ready_condition() {
        let heartbeat = chrono::Utc::now();
        let status = NodeStatus {
            conditions: Some(vec![
                NodeCondition {
                    type_: "DiskPressure".to_string(),
                    status: "False".to_string(),
                    ..Default::default()
                },
                ready_condition("True", heartbeat),
            ]),
            ..Default::default()
        };
        assert_eq!(last_ready_time(Some(&status)), Some(heartbeat));
    }

    #[test]
    fn last_ready_time_ignores_not_ready_reports() {
        let status = NodeStatus {
            conditions: Some(vec![ready_condition("False", chrono::Utc::now())]),
            ..Default::default()
        };
        assert_eq!(last_ready_time(Some(&status)), None);
        assert_eq!(last_ready_time(None), None);
    }

    #[test]
    fn pod_readiness_requires_a_true_ready_condition() {
        let mut pod = Pod::default();
        assert!(!pod_is_ready(&pod));

        pod.status = Some(PodStatus {
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert!(pod_is_ready(&pod));
    }
}
