//! Endpoint sync controller
//!
//! Rebuilds every service's endpoints from its ready pods on each resync
//! pass. This is the widest fan-out controller: endpoint freshness is what
//! keeps traffic off dead pods, so it runs with a configurable concurrency
//! width.

use std::sync::Arc;

use async_trait::async_trait;

use crate::api::{ObjectApi, ObjectRef, ResourceKind};
use crate::config::Config;
use crate::controller::{Reconciler, ResyncController};
use crate::Result;

/// Reconciles service endpoints against ready pods
pub struct EndpointSync {
    api: Arc<dyn ObjectApi>,
}

impl EndpointSync {
    /// Create the reconciler over the shared API client
    pub fn new(api: Arc<dyn ObjectApi>) -> Self {
        Self { api }
    }

    /// Build the fully-configured controller instance
    pub fn controller(api: Arc<dyn ObjectApi>, config: &Config) -> ResyncController<Self> {
        ResyncController::new(
            Self::new(api),
            config.endpoint_sync_period,
            config.concurrent_endpoint_syncs,
        )
    }
}

#[async_trait]
impl Reconciler for EndpointSync {
    fn name(&self) -> &'static str {
        "endpoint-sync"
    }

    async fn list(&self) -> Result<Vec<ObjectRef>> {
        self.api.list(ResourceKind::Service).await
    }

    async fn reconcile(&self, object: &ObjectRef) -> Result<()> {
        self.api.sync_endpoints(object).await
    }
}
