//! Namespace lifecycle controller
//!
//! Walks terminating namespaces toward empty on a slow cadence, deleting
//! leftover objects and releasing the namespace once nothing remains.

use std::sync::Arc;

use async_trait::async_trait;

use crate::api::{ObjectApi, ObjectRef, ResourceKind};
use crate::config::Config;
use crate::controller::{Reconciler, ResyncController};
use crate::Result;

/// Drives terminating namespaces to completion
pub struct NamespaceLifecycle {
    api: Arc<dyn ObjectApi>,
}

impl NamespaceLifecycle {
    /// Create the reconciler over the shared API client
    pub fn new(api: Arc<dyn ObjectApi>) -> Self {
        Self { api }
    }

    /// Build the fully-configured controller instance
    pub fn controller(api: Arc<dyn ObjectApi>, config: &Config) -> ResyncController<Self> {
        ResyncController::new(Self::new(api), config.namespace_sync_period, 1)
    }
}

#[async_trait]
impl Reconciler for NamespaceLifecycle {
    fn name(&self) -> &'static str {
        "namespace-lifecycle"
    }

    async fn list(&self) -> Result<Vec<ObjectRef>> {
        self.api.list(ResourceKind::Namespace).await
    }

    async fn reconcile(&self, object: &ObjectRef) -> Result<()> {
        self.api.finalize_namespace(object).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockObjectApi;

    #[tokio::test]
    async fn finalizes_each_listed_namespace() {
        let mut api = MockObjectApi::new();
        api.expect_list()
            .withf(|kind| *kind == ResourceKind::Namespace)
            .returning(|_| Ok(vec![ObjectRef::cluster_scoped("doomed")]));
        api.expect_finalize_namespace()
            .withf(|ns| ns.name == "doomed")
            .times(1)
            .returning(|_| Ok(()));

        let config = Config::default();
        NamespaceLifecycle::controller(Arc::new(api), &config)
            .resync_once()
            .await;
    }
}
