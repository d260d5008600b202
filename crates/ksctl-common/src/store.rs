//! State backends
//!
//! The bootstrap layer only needs `setup`, `read` and `write`. The MongoDB
//! and ConfigMap backends live with the cloud layer; this crate ships the
//! local JSON file backend and an in-memory backend.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::error::{Error, Result};
use crate::state::{ClusterType, StorageDocument};

/// Persistence backend for one cluster's `StorageDocument`
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Bind the store to a cluster identity, creating an empty document if none exists
    async fn setup(
        &self,
        cloud_provider: &str,
        region: &str,
        cluster_name: &str,
        cluster_type: ClusterType,
    ) -> Result<()>;

    /// Read the current document
    async fn read(&self) -> Result<StorageDocument>;

    /// Replace the persisted document
    async fn write(&self, doc: &StorageDocument) -> Result<()>;
}

/// JSON file backend
pub struct LocalStore {
    path: PathBuf,
    /// Guards against two writers interleaving the temp-file swap
    write_lock: tokio::sync::Mutex<()>,
    identity: RwLock<Option<(String, String)>>,
}

impl LocalStore {
    /// Create a store backed by the JSON file at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
            identity: RwLock::new(None),
        }
    }

    /// Location of the state file
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, doc: &StorageDocument) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let json = serde_json::to_vec_pretty(doc)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await?;
        restrict_permissions(&tmp).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!(path = %self.path.display(), bytes = json.len(), "state written");
        Ok(())
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[async_trait]
impl StateStore for LocalStore {
    async fn setup(
        &self,
        cloud_provider: &str,
        region: &str,
        cluster_name: &str,
        cluster_type: ClusterType,
    ) -> Result<()> {
        match tokio::fs::try_exists(&self.path).await? {
            true => {
                let existing = self.read().await?;
                if existing.cluster_name != cluster_name || existing.region != region {
                    return Err(Error::validation_for(
                        cluster_name,
                        format!(
                            "state file {} belongs to cluster {} in {}",
                            self.path.display(),
                            existing.cluster_name,
                            existing.region
                        ),
                    ));
                }
            }
            false => {
                let doc =
                    StorageDocument::new(cloud_provider, region, cluster_name, cluster_type);
                self.persist(&doc).await?;
            }
        }

        *self.identity.write() = Some((cluster_name.to_string(), region.to_string()));
        Ok(())
    }

    async fn read(&self) -> Result<StorageDocument> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|e| {
            Error::storage("read", format!("{}: {}", self.path.display(), e))
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn write(&self, doc: &StorageDocument) -> Result<()> {
        let identity = self.identity.read().clone();
        if let Some((name, region)) = identity {
            if doc.cluster_name != name || doc.region != region {
                return Err(Error::validation_for(
                    &doc.cluster_name,
                    format!("store is bound to cluster {name} in {region}"),
                ));
            }
        }
        self.persist(doc)
            .await
            .map_err(|e| Error::storage("write", e.to_string()))
    }
}

/// In-memory backend that counts writes and can be armed to fail them
#[derive(Default)]
pub struct MemoryStore {
    doc: Mutex<Option<StorageDocument>>,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already holds `doc`
    pub fn with_document(doc: StorageDocument) -> Self {
        Self {
            doc: Mutex::new(Some(doc)),
            ..Default::default()
        }
    }

    /// Number of successful writes so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make every following write fail (or succeed again)
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Last written document
    pub fn snapshot(&self) -> Option<StorageDocument> {
        self.doc.lock().clone()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn setup(
        &self,
        cloud_provider: &str,
        region: &str,
        cluster_name: &str,
        cluster_type: ClusterType,
    ) -> Result<()> {
        let mut doc = self.doc.lock();
        if doc.is_none() {
            *doc = Some(StorageDocument::new(
                cloud_provider,
                region,
                cluster_name,
                cluster_type,
            ));
        }
        Ok(())
    }

    async fn read(&self) -> Result<StorageDocument> {
        self.doc
            .lock()
            .clone()
            .ok_or_else(|| Error::storage("read", "no document stored"))
    }

    async fn write(&self, doc: &StorageDocument) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::storage("write", "injected write failure"));
        }
        *self.doc.lock() = Some(doc.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
