//! Resumable provisioning handle
//!
//! `ClusterState` owns the in-memory copy of a cluster's `StorageDocument`
//! and the store it is persisted to. Mutations happen inside a single
//! critical section: the closure edits a copy, the copy is written to the
//! store, and only then does it replace the in-memory document. A failed
//! write therefore leaves memory identical to what was last persisted.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::state::StorageDocument;
use crate::store::StateStore;

/// Shared, persisted view of one cluster
#[derive(Clone)]
pub struct ClusterState {
    doc: Arc<Mutex<StorageDocument>>,
    store: Arc<dyn StateStore>,
}

impl ClusterState {
    /// Wrap an already loaded document
    pub fn new(store: Arc<dyn StateStore>, doc: StorageDocument) -> Self {
        Self {
            doc: Arc::new(Mutex::new(doc)),
            store,
        }
    }

    /// Read the document from `store`
    pub async fn load(store: Arc<dyn StateStore>) -> Result<Self> {
        let doc = store.read().await?;
        Ok(Self::new(store, doc))
    }

    /// Clone of the current document
    pub async fn snapshot(&self) -> StorageDocument {
        self.doc.lock().await.clone()
    }

    /// Run `f` against the current document without mutating it
    pub async fn read<R>(&self, f: impl FnOnce(&StorageDocument) -> R) -> R {
        let doc = self.doc.lock().await;
        f(&doc)
    }

    /// Mutate the document and persist it before returning
    ///
    /// If the write fails the in-memory document is left untouched.
    pub async fn update<R>(
        &self,
        step: &str,
        f: impl FnOnce(&mut StorageDocument) -> R,
    ) -> Result<R> {
        let mut doc = self.doc.lock().await;
        let mut next = doc.clone();
        let out = f(&mut next);

        if let Err(e) = self.store.write(&next).await {
            warn!(step, error = %e, "persisting step failed, state rolled back");
            return Err(e);
        }

        *doc = next;
        debug!(step, "state persisted");
        Ok(out)
    }

    /// Skip-or-create for one provisioning step
    ///
    /// `existing` looks for the step's result in the document. When found it
    /// is returned as is and `create` never runs. Otherwise `create` runs
    /// without holding the document lock (it usually talks to remote hosts)
    /// and `apply` records its result, which is persisted before returning.
    pub async fn ensure<T, E, Fut>(
        &self,
        step: &str,
        existing: impl FnOnce(&StorageDocument) -> Option<T>,
        create: impl FnOnce() -> Fut,
        apply: impl FnOnce(&mut StorageDocument, &T),
    ) -> std::result::Result<T, E>
    where
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Error>,
    {
        if let Some(found) = self.read(existing).await {
            debug!(step, "already present in state, skipping");
            return Ok(found);
        }

        let created = create().await?;
        self.update(step, |doc| apply(doc, &created)).await?;
        info!(step, "created and persisted");
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ClusterType, SshKeyPairState};
    use crate::store::{MemoryStore, MockStateStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn doc() -> StorageDocument {
        StorageDocument::new("aws", "fra1", "demo", ClusterType::SelfManaged)
    }

    /// Story: A resumed run does not regenerate the cluster keypair
    ///
    /// The first run creates the keypair and persists it. The second run
    /// finds it in the document and never calls the generator.
    #[tokio::test]
    async fn story_ensure_skips_steps_already_in_state() {
        let store = Arc::new(MemoryStore::with_document(doc()));
        let state = ClusterState::load(store.clone()).await.unwrap();
        let generated = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let generated = generated.clone();
            let pair: SshKeyPairState = state
                .ensure(
                    "ssh keypair",
                    |d| d.ssh_key_pair.clone(),
                    || async move {
                        generated.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, Error>(SshKeyPairState {
                            public_key: "ssh-rsa AAAA".into(),
                            private_key: "secret".into(),
                        })
                    },
                    |d, p| d.ssh_key_pair = Some(p.clone()),
                )
                .await
                .unwrap();
            assert_eq!(pair.public_key, "ssh-rsa AAAA");
        }

        assert_eq!(generated.load(Ordering::SeqCst), 1);
        assert_eq!(store.write_count(), 1);
        assert!(store.snapshot().unwrap().ssh_key_pair.is_some());
    }

    /// Story: The backend rejects a write
    ///
    /// Memory must not drift ahead of what is persisted, otherwise the next
    /// run would see a different document than this one did.
    #[tokio::test]
    async fn story_failed_persist_rolls_back_memory() {
        let store = Arc::new(MemoryStore::with_document(doc()));
        let state = ClusterState::load(store.clone()).await.unwrap();

        store.fail_writes(true);
        let err = state
            .update("kubeconfig", |d| d.cluster_kubeconfig = Some("x".into()))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "storage write failed: injected write failure");
        assert!(state.snapshot().await.cluster_kubeconfig.is_none());

        store.fail_writes(false);
        state
            .update("kubeconfig", |d| d.cluster_kubeconfig = Some("x".into()))
            .await
            .unwrap();
        assert_eq!(
            state.snapshot().await.cluster_kubeconfig.as_deref(),
            Some("x")
        );
    }

    #[tokio::test]
    async fn create_failure_persists_nothing() {
        let mut store = MockStateStore::new();
        store.expect_write().never();
        let state = ClusterState::new(Arc::new(store), doc());

        let res: std::result::Result<String, Error> = state
            .ensure(
                "token",
                |_| None,
                || async { Err(Error::internal("remote failed")) },
                |d, t: &String| d.cluster_kubeconfig = Some(t.clone()),
            )
            .await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn concurrent_updates_are_serialized() {
        let store = Arc::new(MemoryStore::with_document(doc()));
        let state = ClusterState::load(store.clone()).await.unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let state = state.clone();
                tokio::spawn(async move {
                    state
                        .update("append", move |d| {
                            let cur = d.region.clone();
                            d.region = format!("{cur}-{i}");
                        })
                        .await
                })
            })
            .collect();
        for t in tasks {
            t.await.unwrap().unwrap();
        }

        let region = state.snapshot().await.region;
        assert_eq!(region.matches('-').count(), 8);
        assert_eq!(store.write_count(), 8);
        assert_eq!(store.snapshot().unwrap().region, region);
    }
}
