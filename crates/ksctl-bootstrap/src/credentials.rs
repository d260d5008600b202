//! Cluster SSH keypair
//!
//! Generated at most once per cluster. A keypair already in the document is
//! validated and kept, never replaced, since its public half is installed on
//! machines that may already exist.

use std::future::Future;

use tracing::info;

use ksctl_common::state::SshKeyPairState;
use ksctl_common::ClusterState;
use ksctl_ssh::keypair::{generate_ssh_keypair, validate_keypair};

use crate::error::{Result, StepContext};

/// Keypair of the cluster, generating an RSA key and persisting it on first use
pub async fn ensure_ssh_keypair(state: &ClusterState) -> Result<SshKeyPairState> {
    ensure_keypair_with(state, generate_ssh_keypair).await
}

/// Same as [`ensure_ssh_keypair`] with a caller supplied generator
pub async fn ensure_keypair_with<F, Fut>(state: &ClusterState, generate: F) -> Result<SshKeyPairState>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ksctl_ssh::Result<SshKeyPairState>>,
{
    let pair = state
        .ensure(
            "ssh keypair",
            |doc| doc.ssh_key_pair.clone(),
            || async { generate().await.step("generate ssh keypair") },
            |doc, pair: &SshKeyPairState| doc.ssh_key_pair = Some(pair.clone()),
        )
        .await?;

    validate_keypair(&pair.public_key, &pair.private_key).step("stored ssh keypair")?;
    info!("ssh keypair ready");
    Ok(pair)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ksctl_common::state::ClusterType;
    use ksctl_common::store::MemoryStore;
    use ksctl_common::StorageDocument;
    use ksctl_ssh::keypair::generate_keypair;
    use russh::keys::Algorithm;
    use std::sync::Arc;

    fn state(doc: StorageDocument) -> (Arc<MemoryStore>, ClusterState) {
        let store = Arc::new(MemoryStore::with_document(doc.clone()));
        (store.clone(), ClusterState::new(store, doc))
    }

    async fn ed25519() -> ksctl_ssh::Result<SshKeyPairState> {
        generate_keypair(Algorithm::Ed25519)
    }

    fn doc() -> StorageDocument {
        StorageDocument::new("aws", "fra1", "demo", ClusterType::SelfManaged)
    }

    /// Story: The keypair survives a resumed run
    ///
    /// The first call generates and persists a key, the second finds it in
    /// the document and returns it without writing again.
    #[tokio::test]
    async fn story_keypair_is_generated_once() {
        let (store, state) = state(doc());

        let first = ensure_keypair_with(&state, ed25519).await.unwrap();
        assert!(first.public_key.starts_with("ssh-ed25519 "));
        assert!(first.private_key.contains("BEGIN OPENSSH PRIVATE KEY"));
        assert_eq!(store.write_count(), 1);

        let second = ensure_ssh_keypair(&state).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.write_count(), 1);
        assert_eq!(store.snapshot().unwrap().ssh_key_pair, Some(first));
    }

    #[tokio::test]
    async fn corrupt_stored_keypair_is_reported_not_replaced() {
        let mut d = doc();
        d.ssh_key_pair = Some(SshKeyPairState {
            public_key: "ssh-rsa AAAA".into(),
            private_key: "garbage".into(),
        });
        let (store, state) = state(d);

        let err = ensure_keypair_with(&state, ed25519).await.unwrap_err();

        assert!(err.to_string().starts_with("stored ssh keypair"));
        assert_eq!(store.write_count(), 0);
    }
}
