//! Resource-quota usage sync controller

use std::sync::Arc;

use async_trait::async_trait;

use crate::api::{ObjectApi, ObjectRef, ResourceKind};
use crate::config::Config;
use crate::controller::{Reconciler, ResyncController};
use crate::Result;

/// Recomputes recorded quota usage from observed objects
pub struct QuotaUsageSync {
    api: Arc<dyn ObjectApi>,
}

impl QuotaUsageSync {
    /// Create the reconciler over the shared API client
    pub fn new(api: Arc<dyn ObjectApi>) -> Self {
        Self { api }
    }

    /// Build the fully-configured controller instance
    pub fn controller(api: Arc<dyn ObjectApi>, config: &Config) -> ResyncController<Self> {
        ResyncController::new(Self::new(api), config.resource_quota_sync_period, 1)
    }
}

#[async_trait]
impl Reconciler for QuotaUsageSync {
    fn name(&self) -> &'static str {
        "quota-usage-sync"
    }

    async fn list(&self) -> Result<Vec<ObjectRef>> {
        self.api.list(ResourceKind::ResourceQuota).await
    }

    async fn reconcile(&self, object: &ObjectRef) -> Result<()> {
        self.api.refresh_quota_usage(object).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MockObjectApi;

    #[tokio::test]
    async fn refreshes_usage_for_each_quota() {
        let mut api = MockObjectApi::new();
        api.expect_list()
            .returning(|_| Ok(vec![ObjectRef::namespaced("team-a", "compute")]));
        api.expect_refresh_quota_usage().times(1).returning(|_| Ok(()));

        let config = Config::default();
        QuotaUsageSync::controller(Arc::new(api), &config)
            .resync_once()
            .await;
    }
}
