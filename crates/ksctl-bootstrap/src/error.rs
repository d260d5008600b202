//! Error types for cluster bootstrap
//!
//! Lower layers already carry host and script context. This layer adds the
//! provisioning step a failure happened in.

use thiserror::Error;

use ksctl_ssh::SshError;

/// Errors raised while bootstrapping a cluster
#[derive(Debug, Error)]
pub enum Error {
    /// Remote execution failed
    #[error(transparent)]
    Ssh(#[from] SshError),

    /// State, validation or version resolution failed
    #[error(transparent)]
    Common(#[from] ksctl_common::Error),

    /// Certificate generation failed
    #[error("pki error: {message}")]
    Pki {
        /// Description of what failed
        message: String,
    },

    /// A provisioning step failed
    #[error("{step}: {source}")]
    Step {
        /// Step name, e.g. `control plane 0 install`
        step: String,
        /// What went wrong inside the step
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create a PKI error
    pub fn pki(msg: impl Into<String>) -> Self {
        Self::Pki {
            message: msg.into(),
        }
    }

    /// Shorthand for a validation failure
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Common(ksctl_common::Error::validation(msg))
    }

    /// Wrap `self` with the name of the step it happened in
    pub fn in_step(self, step: impl Into<String>) -> Self {
        Self::Step {
            step: step.into(),
            source: Box::new(self),
        }
    }

    /// Innermost error, below any step context
    pub fn root(&self) -> &Error {
        match self {
            Self::Step { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether retrying the whole step later could succeed
    pub fn is_retryable(&self) -> bool {
        match self.root() {
            Self::Ssh(e) => e.is_retryable() || e.is_transient(),
            Self::Common(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Result type alias for bootstrap operations
pub type Result<T> = std::result::Result<T, Error>;

/// Attach step context to any error convertible into [`Error`]
pub trait StepContext<T> {
    /// Name the step on failure
    fn step(self, step: &str) -> Result<T>;
}

impl<T, E: Into<Error>> StepContext<T> for std::result::Result<T, E> {
    fn step(self, step: &str) -> Result<T> {
        self.map_err(|e| e.into().in_step(step))
    }
}
