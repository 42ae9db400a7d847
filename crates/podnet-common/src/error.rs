//! Error taxonomy for pod network provisioning.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`PodnetError`].
pub type PodnetResult<T> = Result<T, PodnetError>;

/// Errors raised while provisioning pod networks.
#[derive(Error, Diagnostic, Debug)]
pub enum PodnetError {
    /// Malformed or contradictory network configuration or lease input.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(podnet::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Unknown network type or macvlan mode.
    #[error("Unsupported: {feature}")]
    #[diagnostic(
        code(podnet::unsupported),
        help("Supported network types are ptp, bridge, macvlan and flannel")
    )]
    Unsupported {
        /// The unsupported feature.
        feature: String,
    },

    /// An external plugin failed or returned unusable output.
    #[error("Plugin {plugin} failed: {message}")]
    #[diagnostic(code(podnet::plugin))]
    Plugin {
        /// Plugin executable name.
        plugin: String,
        /// The error message.
        message: String,
    },

    /// A link, address or route operation failed.
    #[error("Kernel operation '{operation}' failed: {message}")]
    #[diagnostic(
        code(podnet::kernel),
        help("Network provisioning requires CAP_NET_ADMIN")
    )]
    Kernel {
        /// The failed operation.
        operation: String,
        /// The error message.
        message: String,
    },

    /// A host resource exists with divergent properties.
    #[error("Resource conflict: {message}")]
    #[diagnostic(code(podnet::conflict))]
    Conflict {
        /// The error message.
        message: String,
    },

    /// Invalid pod identifier.
    #[error("Invalid pod ID: {id}")]
    #[diagnostic(
        code(podnet::pod::invalid_id),
        help("Pod IDs are UUIDs, e.g. 6c9bd5e8-4b0c-4e3b-8b1e-0f3a9c2d7e41")
    )]
    InvalidPodId {
        /// The invalid pod ID.
        id: String,
    },

    /// Provisioning of one network failed.
    #[error("Network {name}: {operation}")]
    #[diagnostic(code(podnet::network))]
    Network {
        /// Network name.
        name: String,
        /// The step that failed.
        operation: String,
        /// Underlying error.
        #[source]
        source: Box<PodnetError>,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(podnet::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(podnet::serialization))]
    Serialization(String),
}

impl PodnetError {
    /// Shorthand for a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Shorthand for a kernel operation error.
    pub fn kernel(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Kernel {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Wrap this error with the network name and the step that failed.
    #[must_use]
    pub fn in_network(self, name: &str, operation: impl Into<String>) -> Self {
        Self::Network {
            name: name.to_string(),
            operation: operation.into(),
            source: Box::new(self),
        }
    }

    /// Innermost error, skipping [`PodnetError::Network`] context layers.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Network { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<serde_json::Error> for PodnetError {
    fn from(err: serde_json::Error) -> Self {
        PodnetError::Serialization(err.to_string())
    }
}
