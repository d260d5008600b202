//! Connection seam between the executor and the wire

use std::fmt;

use async_trait::async_trait;

use crate::error::Result;

/// Where and as whom to run scripts
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    /// Address reachable from the machine running ksctl
    pub host: String,
    /// Remote user name
    pub username: String,
    /// Private key text (PEM or OpenSSH)
    pub private_key: String,
    /// SSH port
    pub port: u16,
}

impl RemoteTarget {
    /// Target on the default SSH port
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        private_key: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            private_key: private_key.into(),
            port: 22,
        }
    }
}

impl fmt::Debug for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTarget")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

/// Captured result of one remote command
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
    /// Exit status reported by the server
    pub exit_status: u32,
}

impl CommandOutput {
    /// True when the command exited with status 0
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

/// Opens authenticated, identity-checked connections
#[async_trait]
pub trait Transport: Send + Sync {
    /// Dial `target`, verify its host key and authenticate
    async fn connect(&self, target: &RemoteTarget) -> Result<Box<dyn Session>>;
}

/// An established connection; each `exec` runs on a fresh channel
#[async_trait]
pub trait Session: Send {
    /// Run `command` and wait for it to exit
    async fn exec(&mut self, command: &str) -> Result<CommandOutput>;

    /// Close the connection
    async fn close(&mut self) -> Result<()>;
}
