//! SSH transport built on russh

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::keys::{PrivateKeyWithHashAlg, PublicKey};
use russh::{ChannelMsg, Disconnect};
use tracing::debug;

use crate::error::{Result, SshError};
use crate::host_identity::{verify_host_key, HostKeyScanner, ScannedKey, SshKeyscan};
use crate::keypair::parse_private_key;
use crate::transport::{CommandOutput, RemoteTarget, Session, Transport};

const STDERR_STREAM: u32 = 1;

/// Accepts the server only if its key matches the out-of-band scan
struct VerifyingHandler {
    host: String,
    scanned: Vec<ScannedKey>,
}

impl client::Handler for VerifyingHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        verify_host_key(&self.host, server_public_key, &self.scanned)?;
        Ok(true)
    }
}

/// Dials hosts with russh after scanning their keys
pub struct RusshTransport {
    scanner: Arc<dyn HostKeyScanner>,
    config: Arc<client::Config>,
    connect_timeout: Duration,
}

impl RusshTransport {
    /// Transport using the system `ssh-keyscan`
    pub fn new() -> Self {
        Self::with_scanner(Arc::new(SshKeyscan::default()))
    }

    /// Transport using a custom host key source
    pub fn with_scanner(scanner: Arc<dyn HostKeyScanner>) -> Self {
        let config = client::Config {
            // Install scripts can stay silent for minutes; keep the link alive instead
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 6,
            ..Default::default()
        };
        Self {
            scanner,
            config: Arc::new(config),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for RusshTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for RusshTransport {
    async fn connect(&self, target: &RemoteTarget) -> Result<Box<dyn Session>> {
        let key = parse_private_key(&target.private_key)?;
        let scanned = self.scanner.scan(&target.host, target.port).await?;

        let handler = VerifyingHandler {
            host: target.host.clone(),
            scanned,
        };

        let dial = client::connect(
            self.config.clone(),
            (target.host.as_str(), target.port),
            handler,
        );
        let mut handle = tokio::time::timeout(self.connect_timeout, dial)
            .await
            .map_err(|_| SshError::Dial {
                host: target.host.clone(),
                message: format!("timed out after {:?}", self.connect_timeout),
            })?
            .map_err(|e| match e {
                SshError::Protocol { message } => SshError::Dial {
                    host: target.host.clone(),
                    message,
                },
                other => other,
            })?;

        let hash = handle.best_supported_rsa_hash().await?.flatten();
        let auth = handle
            .authenticate_publickey(
                target.username.clone(),
                PrivateKeyWithHashAlg::new(Arc::new(key), hash),
            )
            .await?;

        if !auth.success() {
            return Err(SshError::Authentication {
                host: target.host.clone(),
                user: target.username.clone(),
            });
        }

        debug!(host = %target.host, user = %target.username, "ssh session established");
        Ok(Box::new(RusshSession {
            host: target.host.clone(),
            handle,
        }))
    }
}

struct RusshSession {
    host: String,
    handle: Handle<VerifyingHandler>,
}

#[async_trait]
impl Session for RusshSession {
    async fn exec(&mut self, command: &str) -> Result<CommandOutput> {
        let mut channel =
            self.handle
                .channel_open_session()
                .await
                .map_err(|e| SshError::ChannelOpen {
                    host: self.host.clone(),
                    message: e.to_string(),
                })?;

        channel.exec(true, command).await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_status = None;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext } if ext == STDERR_STREAM => {
                    stderr.extend_from_slice(data)
                }
                ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                _ => {}
            }
        }

        let exit_status = exit_status.ok_or_else(|| SshError::MissingExitStatus {
            host: self.host.clone(),
        })?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_status,
        })
    }

    async fn close(&mut self) -> Result<()> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await?;
        Ok(())
    }
}
