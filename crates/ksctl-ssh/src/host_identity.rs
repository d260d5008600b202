//! Host identity verification
//!
//! Before trusting a handshake, the key a server offers is compared with
//! the keys obtained out-of-band by `ssh-keyscan`. Only RSA and Ed25519 host
//! keys are accepted.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use russh::keys::{Algorithm, HashAlg, PublicKey};
use tracing::debug;

use crate::error::{Result, SshError};

/// A host key learned out-of-band
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScannedKey {
    /// Key family, `ssh-rsa` or `ssh-ed25519`
    pub algorithm: String,
    /// `SHA256:` fingerprint
    pub fingerprint: String,
}

/// Looks up the host keys a machine is expected to present
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HostKeyScanner: Send + Sync {
    /// Scan `host:port` for RSA and Ed25519 keys
    async fn scan(&self, host: &str, port: u16) -> Result<Vec<ScannedKey>>;
}

/// Scanner backed by the local `ssh-keyscan` binary
#[derive(Clone, Debug)]
pub struct SshKeyscan {
    timeout: Duration,
}

impl Default for SshKeyscan {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

#[async_trait]
impl HostKeyScanner for SshKeyscan {
    async fn scan(&self, host: &str, port: u16) -> Result<Vec<ScannedKey>> {
        let scan_err = |message: String| SshError::HostKeyScan {
            host: host.to_string(),
            message,
        };

        let child = tokio::process::Command::new("ssh-keyscan")
            .args(["-t", "rsa,ed25519", "-p", &port.to_string(), host])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| scan_err(format!("timed out after {:?}", self.timeout)))?
            .map_err(|e| scan_err(e.to_string()))?;

        let text = String::from_utf8_lossy(&output.stdout);
        let keys = parse_keyscan_output(host, &text)?;
        debug!(host, keys = keys.len(), "scanned host keys");
        Ok(keys)
    }
}

// =============================================================================
// Pure Functions (unit-testable)
// =============================================================================

fn accepted_family(algorithm: &Algorithm) -> Option<&'static str> {
    match algorithm {
        Algorithm::Rsa { .. } => Some("ssh-rsa"),
        Algorithm::Ed25519 => Some("ssh-ed25519"),
        _ => None,
    }
}

/// Parse `ssh-keyscan` output (`host algorithm base64` per line)
pub fn parse_keyscan_output(host: &str, text: &str) -> Result<Vec<ScannedKey>> {
    let mut keys = Vec::new();
    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace().skip(1);
        let (Some(alg), Some(data)) = (fields.next(), fields.next()) else {
            continue;
        };

        let key = PublicKey::from_openssh(&format!("{alg} {data}")).map_err(|e| {
            SshError::HostKeyScan {
                host: host.to_string(),
                message: format!("unparseable key line: {e}"),
            }
        })?;

        if let Some(family) = accepted_family(&key.algorithm()) {
            keys.push(ScannedKey {
                algorithm: family.to_string(),
                fingerprint: key.fingerprint(HashAlg::Sha256).to_string(),
            });
        }
    }

    if keys.is_empty() {
        return Err(SshError::HostKeyScan {
            host: host.to_string(),
            message: "no rsa or ed25519 host keys found".to_string(),
        });
    }
    Ok(keys)
}

/// Accept `offered` only if a scanned key of the same family has its fingerprint
pub fn verify_host_key(host: &str, offered: &PublicKey, scanned: &[ScannedKey]) -> Result<()> {
    let algorithm = offered.algorithm();
    let Some(family) = accepted_family(&algorithm) else {
        return Err(SshError::UnsupportedHostKey {
            host: host.to_string(),
            algorithm: algorithm.as_str().to_string(),
        });
    };

    let fingerprint = offered.fingerprint(HashAlg::Sha256).to_string();
    let candidates: Vec<&ScannedKey> = scanned.iter().filter(|k| k.algorithm == family).collect();

    if candidates.iter().any(|k| k.fingerprint == fingerprint) {
        debug!(host, algorithm = family, "host key verified");
        return Ok(());
    }

    let expected = if candidates.is_empty() {
        "none".to_string()
    } else {
        candidates
            .iter()
            .map(|k| k.fingerprint.as_str())
            .collect::<Vec<_>>()
            .join(",")
    };

    Err(SshError::HostKeyMismatch {
        host: host.to_string(),
        algorithm: family.to_string(),
        expected,
        offered: fingerprint,
    })
}
