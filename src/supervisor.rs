//! Controller supervisor
//!
//! The process-wide entry point. Construction order is fixed: one cluster
//! API client (the sole fatal startup condition), one cloud-provider
//! handle, then every controller exactly once, each on its own long-lived
//! task. After launch the supervisor blocks on the cancellation signal;
//! process lifetime is cluster lifetime.
//!
//! Controller-specific setup failures (an unknown cloud provider, a
//! missing service-account signing key) disable the affected controller
//! with a reported error and never stop the rest.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::api::{KubeApi, NodeApi, ObjectApi, WorkloadApi};
use crate::cloud::{init_cloud_provider, CloudInstances};
use crate::config::Config;
use crate::controller::{
    ClaimBinder, EndpointSync, NamespaceLifecycle, QuotaUsageSync, ReplicaCountSync,
    TokenGenerator, TokenIssuer,
};
use crate::fleet::{EvictionExecutor, NodeFleetReconciler};
use crate::{diagnostics, Result};

/// How long the eviction executor waits before re-offering a failed
/// deletion
const EVICTION_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Process-wide controller supervisor
pub struct Supervisor;

impl Supervisor {
    /// Construct collaborators, start every controller, and block until
    /// the cancellation signal fires
    pub async fn run(config: Config, cancel: CancellationToken) -> Result<()> {
        let config = Arc::new(config);

        // The one cluster API client; nothing runs without it
        let api = Arc::new(KubeApi::connect().await?);

        // The one cloud-provider handle; absence is degraded, not fatal
        let cloud = match init_cloud_provider(config.cloud.as_ref(), None) {
            Ok(handle) => handle,
            Err(e) => {
                error!(error = %e, "cloud provider unavailable; membership falls back to configuration");
                None
            }
        };

        Self::launch(config, api.clone(), api.clone(), api, cloud, cancel).await
    }

    /// Start every controller exactly once, then wait for cancellation
    ///
    /// Split from [`run`](Self::run) so the launch wiring is testable with
    /// mocked collaborators.
    pub(crate) async fn launch(
        config: Arc<Config>,
        node_api: Arc<dyn NodeApi>,
        workloads: Arc<dyn WorkloadApi>,
        objects: Arc<dyn ObjectApi>,
        cloud: Option<Arc<dyn CloudInstances>>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let diagnostics_addr =
            SocketAddr::new(config.diagnostics_address, config.diagnostics_port);
        let diagnostics_cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = diagnostics::serve(diagnostics_addr, diagnostics_cancel).await {
                error!(error = %e, "diagnostics endpoint failed");
            }
        });

        let evictor = Arc::new(EvictionExecutor::new(
            workloads.clone(),
            config.deleting_pods_qps,
            config.deleting_pods_burst,
            EVICTION_RETRY_INTERVAL,
        ));
        tokio::spawn(evictor.clone().run(cancel.clone()));

        let fleet = Arc::new(NodeFleetReconciler::new(
            config.clone(),
            node_api,
            workloads,
            cloud,
            evictor,
        ));
        tokio::spawn(fleet.clone().run_membership(cancel.clone()));
        tokio::spawn(fleet.run_monitor(cancel.clone()));

        tokio::spawn(EndpointSync::controller(objects.clone(), &config).run(cancel.clone()));
        tokio::spawn(ReplicaCountSync::controller(objects.clone(), &config).run(cancel.clone()));
        tokio::spawn(NamespaceLifecycle::controller(objects.clone(), &config).run(cancel.clone()));
        tokio::spawn(QuotaUsageSync::controller(objects.clone(), &config).run(cancel.clone()));
        tokio::spawn(ClaimBinder::controller(objects.clone(), &config).run(cancel.clone()));

        match &config.service_account_key_file {
            Some(path) => match TokenGenerator::load(path).await {
                Ok(generator) => {
                    tokio::spawn(
                        TokenIssuer::controller(objects, generator, &config).run(cancel.clone()),
                    );
                }
                // Token issuance is skipped; every other controller runs
                Err(e) => error!(error = %e, "service-account token controller disabled"),
            },
            None => {
                info!("no service-account signing key configured; token controller disabled");
            }
        }

        info!(cluster = %config.cluster_name, "all controllers started");
        cancel.cancelled().await;
        info!("shutdown signal received; supervisor exiting");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::api::{MockNodeApi, MockObjectApi, MockWorkloadApi};
    use crate::config::MembershipSource;

    /// Collaborator mocks that tolerate any number of controller ticks
    fn permissive_mocks() -> (MockNodeApi, MockWorkloadApi, MockObjectApi) {
        let mut node_api = MockNodeApi::new();
        node_api.expect_list_nodes().returning(|| Ok(vec![]));
        node_api.expect_node_heartbeats().returning(|| Ok(vec![]));
        node_api.expect_register_node().returning(|_, _| Ok(()));

        let mut workloads = MockWorkloadApi::new();
        workloads.expect_pods_on_node().returning(|_| Ok(vec![]));
        workloads.expect_delete_pod().returning(|_| Ok(()));

        let mut objects = MockObjectApi::new();
        objects.expect_list().returning(|_| Ok(vec![]));

        (node_api, workloads, objects)
    }

    #[tokio::test]
    async fn launch_starts_everything_and_honors_cancellation() {
        let (node_api, workloads, objects) = permissive_mocks();
        let mut config = Config::default();
        // Port 0 keeps the diagnostics listener from clashing with other
        // tests on the same machine
        config.diagnostics_port = 0;
        config.membership = MembershipSource::StaticList(vec!["m1".to_string()]);

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            stopper.cancel();
        });

        let result = Supervisor::launch(
            Arc::new(config),
            Arc::new(node_api),
            Arc::new(workloads),
            Arc::new(objects),
            None,
            cancel,
        )
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn missing_signing_key_only_disables_token_issuance() {
        let (node_api, workloads, objects) = permissive_mocks();
        let mut config = Config::default();
        config.diagnostics_port = 0;
        config.service_account_key_file = Some("/nonexistent/sa.pem".into());

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        });

        // The unreadable key must not make launch fail
        let result = Supervisor::launch(
            Arc::new(config),
            Arc::new(node_api),
            Arc::new(workloads),
            Arc::new(objects),
            None,
            cancel,
        )
        .await;
        assert!(result.is_ok());
    }
}
