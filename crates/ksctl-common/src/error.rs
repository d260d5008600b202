//! Errors raised while reading, resolving and persisting cluster state

use thiserror::Error;

/// Failure of a state, storage or version lookup operation
#[derive(Debug, Error)]
pub enum Error {
    /// Input or stored state that an operator has to fix by hand
    #[error("{}{message}", scope_prefix(.cluster))]
    Validation {
        /// Cluster the bad input belongs to, when known
        cluster: Option<String>,
        /// What is wrong
        message: String,
    },

    /// Requested release was never published for the component
    #[error("invalid {component} version '{requested}', valid versions: {valid}")]
    InvalidVersion {
        /// k3s, kubeadm or etcd
        component: String,
        /// Version the caller asked for
        requested: String,
        /// Accepted versions, space separated
        valid: String,
    },

    /// State backend could not read or write the document
    #[error("storage {operation} failed: {message}")]
    Storage {
        /// read, write or setup
        operation: &'static str,
        /// Backend's description of the failure
        message: String,
    },

    /// Stored document does not decode
    #[error("malformed state document: {0}")]
    Serialization(String),

    /// Release listing could not be fetched
    #[error("listing releases of {repository}: {message}")]
    Poller {
        /// `org/repo` being queried
        repository: String,
        /// What went wrong
        message: String,
    },

    /// Unexpected failure inside ksctl itself
    #[error("{context}: {message}")]
    Internal {
        /// Subsystem that failed
        context: String,
        /// What went wrong
        message: String,
    },

    /// Filesystem error
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn scope_prefix(cluster: &Option<String>) -> String {
    cluster
        .as_deref()
        .map(|name| format!("cluster {name}: "))
        .unwrap_or_default()
}

impl Error {
    /// Validation error not tied to a cluster
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: None,
            message: msg.into(),
        }
    }

    /// Validation error about a named cluster
    pub fn validation_for(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: Some(cluster.into()),
            message: msg.into(),
        }
    }

    /// Unknown release, listing the ones that would have been accepted
    pub fn invalid_version(
        component: impl Into<String>,
        requested: impl Into<String>,
        valid: &[String],
    ) -> Self {
        Self::InvalidVersion {
            component: component.into(),
            requested: requested.into(),
            valid: valid.join(" "),
        }
    }

    /// Backend failure during `operation`
    pub fn storage(operation: &'static str, msg: impl Into<String>) -> Self {
        Self::Storage {
            operation,
            message: msg.into(),
        }
    }

    /// Document that does not decode
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Release listing failure for `org/repo`
    pub fn poller(repository: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Poller {
            repository: repository.into(),
            message: msg.into(),
        }
    }

    /// Internal failure without a more specific subsystem
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::internal_with_context("ksctl", msg)
    }

    /// Internal failure in `context`
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Whether repeating the same call could succeed
    ///
    /// Bad input and undecodable documents stay bad. Backends and the
    /// release API can recover on their own.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::Validation { .. } | Error::InvalidVersion { .. } | Error::Serialization(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Result alias for state operations
pub type Result<T> = std::result::Result<T, Error>;
