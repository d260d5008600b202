//! CLI commands

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use tracing::debug;

use ksctl_common::state::ClusterType;
use ksctl_common::store::LocalStore;
use ksctl_common::{ClusterState, StateStore};

use crate::Result;

pub mod bootstrap;
pub mod keygen;
pub mod kubeconfig;

/// Cluster identity and the state file it is persisted in
#[derive(Args, Debug, Clone)]
pub struct ClusterArgs {
    /// Path of the JSON state file
    #[arg(long, env = "KSCTL_STATE")]
    pub state: PathBuf,

    /// Cluster name
    #[arg(long, env = "KSCTL_CLUSTER_NAME")]
    pub cluster_name: String,

    /// Region the machines run in
    #[arg(long, env = "KSCTL_REGION")]
    pub region: String,

    /// Cloud the machines were provisioned on
    #[arg(long, env = "KSCTL_CLOUD", default_value = "local")]
    pub cloud: String,
}

impl ClusterArgs {
    /// Bind the state file to this cluster, creating it when missing
    pub async fn open(&self) -> Result<ClusterState> {
        let store = Arc::new(LocalStore::new(&self.state));
        store
            .setup(
                &self.cloud,
                &self.region,
                &self.cluster_name,
                ClusterType::SelfManaged,
            )
            .await?;
        debug!(path = %self.state.display(), cluster = %self.cluster_name, "state file opened");
        Ok(ClusterState::load(store).await?)
    }
}
