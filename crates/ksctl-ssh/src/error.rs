//! SSH error types
//!
//! Variants are grouped by how the executor reacts to them: key problems
//! are fatal, dial problems are retried with backoff, channel faults are
//! retried inside the current attempt, and script failures consume the
//! script's own retry budget.

use thiserror::Error;

/// Errors raised while connecting to hosts and running scripts
#[derive(Debug, Error)]
pub enum SshError {
    /// Private key text could not be parsed
    #[error("invalid ssh private key: {message}")]
    InvalidKey {
        /// Parser message
        message: String,
    },

    /// Private key is passphrase protected; ksctl only handles plain keys
    #[error("ssh private key is encrypted, an unencrypted key is required")]
    EncryptedKey,

    /// Keypair generation or validation failed
    #[error("ssh keypair generation failed: {message}")]
    KeyGeneration {
        /// Description of what failed
        message: String,
    },

    /// TCP connect or SSH handshake failed
    #[error("failed to dial {host}: {message}")]
    Dial {
        /// Target address
        host: String,
        /// Description of what failed
        message: String,
    },

    /// Server refused the key
    #[error("authentication as {user} rejected by {host}")]
    Authentication {
        /// Target address
        host: String,
        /// Remote user
        user: String,
    },

    /// Offered host key does not match the out-of-band scan
    #[error("host key mismatch for {host} ({algorithm}): expected {expected}, offered {offered}")]
    HostKeyMismatch {
        /// Target address
        host: String,
        /// Key algorithm offered by the server
        algorithm: String,
        /// Fingerprint(s) obtained from the scan
        expected: String,
        /// Fingerprint offered during the handshake
        offered: String,
    },

    /// Server offered a host key type other than RSA or Ed25519
    #[error("unsupported host key algorithm {algorithm} offered by {host}")]
    UnsupportedHostKey {
        /// Target address
        host: String,
        /// Offered algorithm
        algorithm: String,
    },

    /// Out-of-band host key scan failed
    #[error("host key scan of {host} failed: {message}")]
    HostKeyScan {
        /// Target address
        host: String,
        /// Description of what failed
        message: String,
    },

    /// A session channel could not be opened on an established connection
    #[error("failed to open channel on {host}: {message}")]
    ChannelOpen {
        /// Target address
        host: String,
        /// Description of what failed
        message: String,
    },

    /// The remote command ended without reporting an exit status
    #[error("command on {host} finished without exit status")]
    MissingExitStatus {
        /// Target address
        host: String,
    },

    /// Any other protocol level failure
    #[error("ssh protocol error: {message}")]
    Protocol {
        /// Description of what failed
        message: String,
    },

    /// A script exhausted its attempts
    #[error("script '{script}' failed on {host} after {attempts} attempt(s): {reason}; stderr: {stderr}")]
    ScriptFailed {
        /// Script name
        script: String,
        /// Target address
        host: String,
        /// Attempts made
        attempts: u32,
        /// Captured stderr of the last attempt
        stderr: String,
        /// Exit status or transport failure of the last attempt
        reason: String,
    },
}

impl SshError {
    /// Faults that are retried inside a single script attempt
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SshError::ChannelOpen { .. } | SshError::MissingExitStatus { .. }
        )
    }

    /// Faults worth redialing for
    ///
    /// Key and host identity problems are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SshError::Dial { .. } | SshError::HostKeyScan { .. } | SshError::Protocol { .. }
        )
    }
}

impl From<russh::Error> for SshError {
    fn from(e: russh::Error) -> Self {
        SshError::Protocol {
            message: e.to_string(),
        }
    }
}

/// Result type alias for SSH operations
pub type Result<T> = std::result::Result<T, SshError>;

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: A VM still booting refuses connections, then accepts them
    ///
    /// Dial failures are retried; a host presenting an unexpected key is not,
    /// no matter how often we would try.
    #[test]
    fn story_dial_faults_retry_but_identity_faults_do_not() {
        let dial = SshError::Dial {
            host: "10.0.0.4".into(),
            message: "connection refused".into(),
        };
        assert!(dial.is_retryable());
        assert!(!dial.is_transient());

        let mismatch = SshError::HostKeyMismatch {
            host: "10.0.0.4".into(),
            algorithm: "ssh-ed25519".into(),
            expected: "SHA256:aaa".into(),
            offered: "SHA256:bbb".into(),
        };
        assert!(!mismatch.is_retryable());
        assert!(mismatch.to_string().contains("SHA256:bbb"));

        assert!(!SshError::EncryptedKey.is_retryable());
    }

    #[test]
    fn channel_faults_are_transient() {
        assert!(SshError::MissingExitStatus { host: "h".into() }.is_transient());
        assert!(SshError::ChannelOpen {
            host: "h".into(),
            message: "administratively prohibited".into()
        }
        .is_transient());
    }

    #[test]
    fn script_failure_names_script_and_stderr() {
        let err = SshError::ScriptFailed {
            script: "kubeadm init".into(),
            host: "203.0.113.10".into(),
            attempts: 3,
            stderr: "port 6443 in use".into(),
            reason: "exit status 1".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("kubeadm init"));
        assert!(msg.contains("203.0.113.10"));
        assert!(msg.contains("port 6443 in use"));
        assert!(msg.contains("3 attempt(s)"));
    }
}
