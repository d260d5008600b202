//! SSH key material
//!
//! ksctl generates one RSA keypair per cluster, installs the public half on
//! every VM through the cloud layer and keeps the private half in state.

use russh::keys::ssh_key::private::{KeypairData, RsaKeypair};
use russh::keys::ssh_key::LineEnding;
use russh::keys::{Algorithm, PrivateKey, PublicKey};
use tracing::debug;

use ksctl_common::state::SshKeyPairState;

use crate::error::{Result, SshError};

/// RSA modulus size for generated cluster keys
pub const RSA_KEY_BITS: usize = 4096;

const KEY_COMMENT: &str = "ksctl";

/// Generate the cluster keypair (RSA 4096) off the async runtime
pub async fn generate_ssh_keypair() -> Result<SshKeyPairState> {
    tokio::task::spawn_blocking(|| generate_keypair(Algorithm::Rsa { hash: None }))
        .await
        .map_err(|e| SshError::KeyGeneration {
            message: format!("key generation task failed: {e}"),
        })?
}

/// Generate and validate a keypair of the given algorithm
pub fn generate_keypair(algorithm: Algorithm) -> Result<SshKeyPairState> {
    let gen_err = |e: &dyn std::fmt::Display| SshError::KeyGeneration {
        message: e.to_string(),
    };

    let key = match algorithm {
        Algorithm::Rsa { .. } => {
            let rsa = RsaKeypair::random(&mut rand::rngs::OsRng, RSA_KEY_BITS)
                .map_err(|e| gen_err(&e))?;
            PrivateKey::new(KeypairData::from(rsa), KEY_COMMENT).map_err(|e| gen_err(&e))?
        }
        other => {
            let mut key =
                PrivateKey::random(&mut rand::rngs::OsRng, other).map_err(|e| gen_err(&e))?;
            key.set_comment(KEY_COMMENT);
            key
        }
    };

    let private_key = key
        .to_openssh(LineEnding::LF)
        .map_err(|e| gen_err(&e))?
        .to_string();
    let public_key = key.public_key().to_openssh().map_err(|e| gen_err(&e))?;

    validate_keypair(&public_key, &private_key)?;
    debug!(algorithm = key.algorithm().as_str(), "generated ssh keypair");

    Ok(SshKeyPairState {
        public_key,
        private_key,
    })
}

/// Check that both halves parse and belong together
pub fn validate_keypair(public_key: &str, private_key: &str) -> Result<()> {
    let private = parse_private_key(private_key)?;
    let public = PublicKey::from_openssh(public_key).map_err(|e| SshError::InvalidKey {
        message: format!("public key: {e}"),
    })?;

    if private.public_key().key_data() != public.key_data() {
        return Err(SshError::KeyGeneration {
            message: "public key does not belong to private key".to_string(),
        });
    }
    Ok(())
}

/// Parse an unencrypted private key in PEM or OpenSSH form
///
/// Passphrase protected keys are rejected with [`SshError::EncryptedKey`].
pub fn parse_private_key(text: &str) -> Result<PrivateKey> {
    if text.contains("ENCRYPTED") {
        return Err(SshError::EncryptedKey);
    }

    let key = russh::keys::decode_secret_key(text, None).map_err(|e| match e {
        russh::keys::Error::KeyIsEncrypted => SshError::EncryptedKey,
        other => SshError::InvalidKey {
            message: other.to_string(),
        },
    })?;

    if key.is_encrypted() {
        return Err(SshError::EncryptedKey);
    }
    Ok(key)
}
