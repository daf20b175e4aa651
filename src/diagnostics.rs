//! Read-only diagnostics endpoint
//!
//! Serves `/healthz` on the configured address. Purely observational; no
//! handler has any effect on reconciliation behavior.

use std::net::SocketAddr;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{Error, Result};

async fn healthz() -> &'static str {
    "ok"
}

fn router() -> Router {
    Router::new().route("/healthz", get(healthz))
}

/// Serve diagnostics on an already-bound listener until cancelled
pub async fn serve_on(listener: TcpListener, cancel: CancellationToken) -> Result<()> {
    axum::serve(listener, router())
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .map_err(|e| Error::internal("diagnostics", e.to_string()))
}

/// Bind the diagnostics endpoint and serve until cancelled
pub async fn serve(addr: SocketAddr, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::internal("diagnostics", format!("bind {}: {}", addr, e)))?;
    info!(address = %addr, "diagnostics endpoint listening");
    serve_on(listener, cancel).await
}
