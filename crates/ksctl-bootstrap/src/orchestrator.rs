//! Create flow for a self-managed cluster
//!
//! Every step persists its result before the next one starts, so running the
//! flow again after a failure resumes where it stopped: persisted keys,
//! certificates and join credentials are reused, install scripts run again.

use futures::future::try_join_all;
use tracing::info;

use ksctl_common::state::Operation;

use crate::credentials::ensure_ssh_keypair;
use crate::distribution::{BootstrapContext, BootstrapProvider};
use crate::error::{Result, StepContext};
use crate::prebootstrap::{CloudResourceState, PreBootstrap};

/// What to install
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootstrapOptions {
    /// Distribution bringing up Kubernetes
    pub provider: BootstrapProvider,
    /// Requested Kubernetes version, `""` for the latest
    pub k8s_version: String,
    /// Requested etcd version, `""` for the latest
    pub etcd_version: String,
    /// CNI the caller wants to run
    pub cni: String,
}

impl BootstrapOptions {
    /// Latest versions of everything with the distribution's built in CNI
    pub fn new(provider: BootstrapProvider) -> Self {
        Self {
            provider,
            k8s_version: String::new(),
            etcd_version: String::new(),
            cni: String::new(),
        }
    }

    /// Pin the Kubernetes version
    pub fn with_k8s_version(mut self, version: impl Into<String>) -> Self {
        self.k8s_version = version.into();
        self
    }

    /// Pin the etcd version
    pub fn with_etcd_version(mut self, version: impl Into<String>) -> Self {
        self.etcd_version = version.into();
        self
    }

    /// Select a CNI
    pub fn with_cni(mut self, cni: impl Into<String>) -> Self {
        self.cni = cni.into();
        self
    }
}

/// Drives pre-bootstrap and the distribution over the whole topology
pub struct ClusterBootstrap {
    ctx: BootstrapContext,
    options: BootstrapOptions,
}

impl ClusterBootstrap {
    /// Bootstrap with the given collaborators and options
    pub fn new(ctx: BootstrapContext, options: BootstrapOptions) -> Self {
        Self { ctx, options }
    }

    /// Run the create flow; returns whether an external CNI must be installed
    pub async fn run(&self, cloud: &CloudResourceState) -> Result<bool> {
        let started = std::time::Instant::now();
        let provider = self.options.provider;
        info!(%provider, "bootstrapping cluster");

        ensure_ssh_keypair(&self.ctx.state).await?;

        let pre = PreBootstrap::new(self.ctx.clone());
        pre.setup(cloud, Operation::Create).await?;
        pre.configure_loadbalancer().await?;

        let datastores = cloud.public_ips.data_stores.len();
        try_join_all(
            (0..datastores).map(|i| pre.configure_datastore(i, &self.options.etcd_version)),
        )
        .await?;

        let distribution = provider.distribution(self.ctx.clone());
        distribution.setup(Operation::Create).await?;
        let version = distribution
            .k8s_version(&self.options.k8s_version)
            .await
            .step("resolve kubernetes version")?;
        let external_cni = distribution.cni(&self.options.cni).await?;
        info!(%provider, version = %version, external_cni, "distribution selected");

        for i in 0..cloud.public_ips.control_planes.len() {
            distribution.configure_control_plane(i).await?;
        }

        let workers = cloud.public_ips.worker_planes.len();
        try_join_all((0..workers).map(|i| distribution.join_workerplane(i))).await?;

        info!(
            %provider,
            control_planes = cloud.public_ips.control_planes.len(),
            workers,
            elapsed = ?started.elapsed(),
            "cluster bootstrapped"
        );
        Ok(external_cni)
    }
}
