//! Volume-claim binding controller

use std::sync::Arc;

use async_trait::async_trait;

use crate::api::{ObjectApi, ObjectRef, ResourceKind};
use crate::config::Config;
use crate::controller::{Reconciler, ResyncController};
use crate::Result;

/// Binds pending volume claims to available volumes
pub struct ClaimBinder {
    api: Arc<dyn ObjectApi>,
}

impl ClaimBinder {
    /// Create the reconciler over the shared API client
    pub fn new(api: Arc<dyn ObjectApi>) -> Self {
        Self { api }
    }

    /// Build the fully-configured controller instance
    pub fn controller(api: Arc<dyn ObjectApi>, config: &Config) -> ResyncController<Self> {
        ResyncController::new(Self::new(api), config.claim_binder_sync_period, 1)
    }
}

#[async_trait]
impl Reconciler for ClaimBinder {
    fn name(&self) -> &'static str {
        "claim-binder"
    }

    async fn list(&self) -> Result<Vec<ObjectRef>> {
        self.api.list(ResourceKind::VolumeClaim).await
    }

    async fn reconcile(&self, object: &ObjectRef) -> Result<()> {
        self.api.bind_volume_claim(object).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockObjectApi;

    #[tokio::test]
    async fn attempts_binding_for_each_claim() {
        let mut api = MockObjectApi::new();
        api.expect_list()
            .returning(|_| Ok(vec![ObjectRef::namespaced("default", "data")]));
        api.expect_bind_volume_claim().times(1).returning(|_| Ok(()));

        let config = Config::default();
        ClaimBinder::controller(Arc::new(api), &config)
            .resync_once()
            .await;
    }
}
