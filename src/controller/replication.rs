//! Replica-count sync controller

use std::sync::Arc;

use async_trait::async_trait;

use crate::api::{ObjectApi, ObjectRef, ResourceKind};
use crate::config::Config;
use crate::controller::{Reconciler, ResyncController};
use crate::Result;

/// Keeps each replication unit's observed replica count current
pub struct ReplicaCountSync {
    api: Arc<dyn ObjectApi>,
}

impl ReplicaCountSync {
    /// Create the reconciler over the shared API client
    pub fn new(api: Arc<dyn ObjectApi>) -> Self {
        Self { api }
    }

    /// Build the fully-configured controller instance
    pub fn controller(api: Arc<dyn ObjectApi>, config: &Config) -> ResyncController<Self> {
        ResyncController::new(
            Self::new(api),
            config.replica_sync_period,
            config.concurrent_replica_syncs,
        )
    }
}

#[async_trait]
impl Reconciler for ReplicaCountSync {
    fn name(&self) -> &'static str {
        "replica-sync"
    }

    async fn list(&self) -> Result<Vec<ObjectRef>> {
        self.api.list(ResourceKind::ReplicaUnit).await
    }

    async fn reconcile(&self, object: &ObjectRef) -> Result<()> {
        self.api.sync_replica_count(object).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockObjectApi;
    use crate::Error;

    #[tokio::test]
    async fn syncs_every_unit_despite_individual_failures() {
        let mut api = MockObjectApi::new();
        api.expect_list().returning(|_| {
            Ok(vec![
                ObjectRef::namespaced("default", "rc-1"),
                ObjectRef::namespaced("default", "rc-2"),
            ])
        });
        api.expect_sync_replica_count()
            .times(2)
            .returning(|unit| {
                if unit.name == "rc-1" {
                    Err(Error::internal("test", "conflict"))
                } else {
                    Ok(())
                }
            });

        let config = Config::default();
        ReplicaCountSync::controller(Arc::new(api), &config)
            .resync_once()
            .await;
    }
}
