//! Steward - control-plane orchestrator for a compute cluster
//!
//! Steward supervises a fleet of independent reconciliation loops that drive
//! observed cluster state toward desired state. The core of the system is
//! node fleet lifecycle management: tracking node liveness under unreliable
//! heartbeats, pacing workload eviction off unhealthy nodes, and carving
//! per-node pod-network ranges out of a cluster-wide block.
//!
//! # Architecture
//!
//! One process, one long-lived task per controller:
//! - The [`supervisor`] constructs a single cluster-API client and a single
//!   cloud-provider handle, starts every controller exactly once, and then
//!   blocks on a cancellation signal.
//! - The [`fleet`] reconciler owns the canonical health record for every
//!   node and runs two loops: membership sync against the cloud inventory
//!   (or a static machine list) and health monitoring against node status
//!   reports. Destructive pod deletion is delegated to a rate-limited
//!   eviction executor.
//! - Peer controllers (endpoints, replica counts, namespaces, quotas,
//!   volume claims, service-account tokens) are instances of the generic
//!   resync harness in [`controller`].
//!
//! Controllers share nothing in-process beyond the API client; the node
//! health table is owned exclusively by the fleet reconciler.
//!
//! # Modules
//!
//! - [`api`] - Cluster API collaborator traits and the kube-backed client
//! - [`cloud`] - Cloud-provider inventory trait and registry
//! - [`config`] - Immutable runtime configuration
//! - [`controller`] - Generic resync harness and the peer controllers
//! - [`diagnostics`] - Read-only health endpoint
//! - [`error`] - Error types for the orchestrator
//! - [`fleet`] - Node fleet reconciler, CIDR allocation, eviction executor
//! - [`retry`] - Bounded retry for registration and other transient calls
//! - [`supervisor`] - Process entry point and controller launch

#![deny(missing_docs)]

pub mod api;
pub mod cloud;
pub mod config;
pub mod controller;
pub mod diagnostics;
pub mod error;
pub mod fleet;
pub mod retry;
pub mod supervisor;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default port for the diagnostics HTTP endpoint
pub const DEFAULT_DIAGNOSTICS_PORT: u16 = 10252;

/// Default cluster name stamped on managed resources
pub const DEFAULT_CLUSTER_NAME: &str = "kubernetes";

/// Field manager identity used for apply patches
pub const FIELD_MANAGER: &str = "steward-controller";
