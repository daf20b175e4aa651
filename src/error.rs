//! Error types for the orchestrator
//!
//! Errors are structured with fields to aid debugging in production and
//! carry enough context for the supervisor's taxonomy: fatal (API client
//! construction), degraded-continue (cloud enumeration, credentials),
//! retryable (transient API calls), and policy-rejected (rate limiting,
//! which is backpressure and never surfaces as an `Error`).

use thiserror::Error;

/// Main error type for orchestrator operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Cluster API error
    #[error("cluster api error: {source}")]
    Api {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Cloud-provider inventory error
    #[error("cloud provider error [{provider}]: {message}")]
    Cloud {
        /// Provider identifier (aws, gce, ...)
        provider: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of what's invalid
        message: String,
        /// The offending flag or field, if known
        field: Option<String>,
    },

    /// Pod-network range allocation error for a single node
    #[error("cidr allocation error for {node}: {message}")]
    CidrAllocation {
        /// Node the allocation was for
        node: String,
        /// Description of what failed
        message: String,
    },

    /// Credential material could not be loaded or used
    #[error("credential error [{path}]: {message}")]
    Credentials {
        /// Path of the credential file
        path: String,
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "fleet", "evictor")
        context: String,
    },
}

impl Error {
    /// Create a cloud error with the given provider and message
    pub fn cloud(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Cloud {
            provider: provider.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable cloud error (e.g., unknown provider)
    pub fn cloud_permanent(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Cloud {
            provider: provider.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a configuration error with the given message
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a configuration error naming the offending flag
    pub fn configuration_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a CIDR allocation error for a specific node
    pub fn cidr_for(node: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::CidrAllocation {
            node: node.into(),
            message: msg.into(),
        }
    }

    /// Create a credential error for the given file path
    pub fn credentials(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Credentials {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Configuration, credential, and allocation errors require operator
    /// action and are not retryable. Cloud errors carry their own flag.
    /// Cluster API errors depend on the response code.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Api { source } => {
                // Retry transient API errors, not 4xx rejections
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code)
                )
            }
            Error::Cloud { retryable, .. } => *retryable,
            Error::Configuration { .. } => false,
            Error::CidrAllocation { .. } => false,
            Error::Credentials { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Get the node name if this error is associated with a specific node
    pub fn node(&self) -> Option<&str> {
        match self {
            Error::CidrAllocation { node, .. } => Some(node),
            _ => None,
        }
    }
}
