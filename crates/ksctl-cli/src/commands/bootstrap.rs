//! `ksctl bootstrap` - turn provisioned machines into a cluster
//!
//! Reads the machine inventory written by the cloud layer, then runs the
//! create flow against the state file. Re-running after a failure resumes
//! from the last persisted step.
//!
//! # Usage
//!
//! ```bash
//! ksctl bootstrap --state demo.json --cluster-name demo --region fra1 \
//!     --inventory machines.json --distribution kubeadm --cni cilium
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use tracing::{info, warn};

use ksctl_bootstrap::{
    BootstrapContext, BootstrapOptions, BootstrapProvider, CloudResourceState, ClusterBootstrap,
};
use ksctl_common::poller::GithubReleasePoller;
use ksctl_ssh::{ExecutorConfig, RemoteExecutor};

use super::ClusterArgs;
use crate::{Error, Result};

/// Bootstrap a self-managed cluster
#[derive(Args, Debug)]
pub struct BootstrapArgs {
    #[command(flatten)]
    pub cluster: ClusterArgs,

    /// JSON file with the machines' addresses and SSH login
    #[arg(long, env = "KSCTL_INVENTORY")]
    pub inventory: PathBuf,

    /// Kubernetes distribution: k3s or kubeadm
    #[arg(long, default_value = "k3s")]
    pub distribution: BootstrapProvider,

    /// Kubernetes version (default: latest)
    #[arg(long, default_value = "")]
    pub k8s_version: String,

    /// etcd version (default: latest)
    #[arg(long, default_value = "")]
    pub etcd_version: String,

    /// CNI to run; anything but the distribution's built in one must be installed afterwards
    #[arg(long, default_value = "")]
    pub cni: String,

    /// Skip the pause before the first command on each machine
    #[arg(long)]
    pub fast: bool,
}

async fn load_inventory(path: &Path) -> Result<CloudResourceState> {
    let inventory_err = |message: String| Error::Inventory {
        path: path.to_path_buf(),
        message,
    };
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| inventory_err(e.to_string()))?;
    let cloud: CloudResourceState =
        serde_json::from_slice(&bytes).map_err(|e| inventory_err(e.to_string()))?;
    cloud.validate()?;
    Ok(cloud)
}

fn executor_config(fast: bool) -> ExecutorConfig {
    let config = ExecutorConfig::default();
    if fast {
        ExecutorConfig {
            settle_delay: Duration::ZERO,
            ..config
        }
    } else {
        config
    }
}

/// Advice for failures that a plain rerun can get past
fn resume_hint(err: &ksctl_bootstrap::Error) -> Option<&'static str> {
    err.is_retryable()
        .then_some("bootstrap stopped on a transient failure, run the same command again to resume")
}

/// Run the bootstrap command
pub async fn run(args: BootstrapArgs) -> Result<()> {
    let cloud = load_inventory(&args.inventory).await?;
    let state = args.cluster.open().await?;

    let ctx = BootstrapContext::new(
        state,
        RemoteExecutor::ssh().with_config(executor_config(args.fast)),
        Arc::new(GithubReleasePoller::new()?),
    );
    let options = BootstrapOptions::new(args.distribution)
        .with_k8s_version(args.k8s_version)
        .with_etcd_version(args.etcd_version)
        .with_cni(args.cni.clone());

    let external_cni = match ClusterBootstrap::new(ctx, options).run(&cloud).await {
        Ok(external_cni) => external_cni,
        Err(e) => {
            if let Some(hint) = resume_hint(&e) {
                warn!(cluster = %args.cluster.cluster_name, cause = %e.root(), "{hint}");
            }
            return Err(e.into());
        }
    };

    info!(
        cluster = %args.cluster.cluster_name,
        distribution = %args.distribution,
        "cluster is ready"
    );
    if external_cni {
        println!(
            "cluster is up without a pod network, install {} before scheduling workloads",
            if args.cni.is_empty() { "a CNI" } else { args.cni.as_str() }
        );
    }
    println!(
        "kubeconfig: ksctl kubeconfig --state {}",
        args.cluster.state.display()
    );
    Ok(())
}
