//! Kubernetes distribution contract
//!
//! Both k3s and kubeadm bring up the same topology: control planes behind a
//! load balancer, backed by an external etcd, joined by workers. The
//! [`KubernetesDistribution`] trait is what the orchestrator drives; the
//! concrete implementation is picked once from [`BootstrapProvider`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;

use ksctl_common::poller::ReleasePoller;
use ksctl_common::state::{BaseBootstrapState, Instances, KubernetesBootstrapState, Operation};
use ksctl_common::{ClusterState, StorageDocument};
use ksctl_ssh::{RemoteExecutor, RemoteTarget};

use crate::error::{Error, Result};
use crate::k3s::K3s;
use crate::kubeadm::Kubeadm;
use crate::pki::EtcdCertificates;

/// Lifecycle every distribution implements
#[async_trait]
pub trait KubernetesDistribution: Send + Sync {
    /// Record distribution state in the document
    async fn setup(&self, operation: Operation) -> Result<()>;

    /// Bring up control plane `index`; index 0 initializes the cluster
    async fn configure_control_plane(&self, index: usize) -> Result<()>;

    /// Join worker `index` to the cluster
    async fn join_workerplane(&self, index: usize) -> Result<()>;

    /// Resolve and record the Kubernetes version; `""` selects the latest
    async fn k8s_version(&self, requested: &str) -> Result<String>;

    /// Pick and record the CNI; returns true when an external CNI must be installed
    async fn cni(&self, name: &str) -> Result<bool>;
}

/// Which distribution bootstraps the cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootstrapProvider {
    /// Lightweight k3s servers using the external etcd as datastore
    K3s,
    /// Upstream kubeadm
    Kubeadm,
}

impl BootstrapProvider {
    /// Name stored in `bootstrap_provider`
    pub fn as_str(self) -> &'static str {
        match self {
            Self::K3s => "k3s",
            Self::Kubeadm => "kubeadm",
        }
    }

    /// Build the distribution driving this provider
    pub fn distribution(self, ctx: BootstrapContext) -> Box<dyn KubernetesDistribution> {
        match self {
            Self::K3s => Box::new(K3s::new(ctx)),
            Self::Kubeadm => Box::new(Kubeadm::new(ctx)),
        }
    }
}

impl fmt::Display for BootstrapProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BootstrapProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "k3s" => Ok(Self::K3s),
            "kubeadm" => Ok(Self::Kubeadm),
            other => Err(Error::validation(format!(
                "unknown bootstrap provider '{other}', expected k3s or kubeadm"
            ))),
        }
    }
}

/// Collaborators shared by every provisioner of one cluster operation
#[derive(Clone)]
pub struct BootstrapContext {
    /// Persisted cluster document
    pub state: ClusterState,
    /// Runs scripts on the nodes
    pub executor: RemoteExecutor,
    /// Source of release versions
    pub poller: Arc<dyn ReleasePoller>,
}

impl BootstrapContext {
    /// Bundle the collaborators
    pub fn new(
        state: ClusterState,
        executor: RemoteExecutor,
        poller: Arc<dyn ReleasePoller>,
    ) -> Self {
        Self {
            state,
            executor,
            poller,
        }
    }
}

/// Node roles addressed by index
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeRole {
    /// Kubernetes control plane
    ControlPlane,
    /// Kubernetes worker
    WorkerPlane,
    /// etcd member
    DataStore,
    /// HAProxy in front of the API servers
    LoadBalancer,
}

impl NodeRole {
    fn label(self) -> &'static str {
        match self {
            Self::ControlPlane => "control plane",
            Self::WorkerPlane => "worker plane",
            Self::DataStore => "datastore",
            Self::LoadBalancer => "load balancer",
        }
    }

    /// Addresses of this role in `instances`
    pub fn addresses(self, instances: &Instances) -> Vec<&str> {
        match self {
            Self::ControlPlane => instances.control_planes.iter().map(String::as_str).collect(),
            Self::WorkerPlane => instances.worker_planes.iter().map(String::as_str).collect(),
            Self::DataStore => instances.data_stores.iter().map(String::as_str).collect(),
            Self::LoadBalancer if instances.load_balancer.is_empty() => Vec::new(),
            Self::LoadBalancer => vec![instances.load_balancer.as_str()],
        }
    }
}

// =============================================================================
// Document accessors shared by the provisioners
// =============================================================================

pub(crate) fn bootstrap_state(doc: &StorageDocument) -> Result<&KubernetesBootstrapState> {
    doc.k8s_bootstrap.as_ref().ok_or_else(|| {
        Error::validation(format!(
            "cluster {} has no bootstrap state, run setup first",
            doc.cluster_name
        ))
    })
}

pub(crate) fn base_state(doc: &StorageDocument) -> Result<&BaseBootstrapState> {
    bootstrap_state(doc).map(|b| &b.base)
}

/// SSH target for node `index` of `role`, dialed on its public address
pub(crate) fn node_target(doc: &StorageDocument, role: NodeRole, index: usize) -> Result<RemoteTarget> {
    let base = base_state(doc)?;
    let host = role
        .addresses(&base.public_ips)
        .get(index)
        .map(|h| h.to_string())
        .ok_or_else(|| {
            Error::validation(format!("{} {index} does not exist", role.label()))
        })?;

    Ok(RemoteTarget::new(
        host,
        base.ssh_info.user_name.clone(),
        base.ssh_info.private_key.clone(),
    ))
}

/// Public and private load balancer addresses
pub(crate) fn load_balancer(doc: &StorageDocument) -> Result<(String, String)> {
    let base = base_state(doc)?;
    let public = base.public_ips.load_balancer.clone();
    let private = base.private_ips.load_balancer.clone();
    if public.is_empty() || private.is_empty() {
        return Err(Error::validation("load balancer addresses are missing"));
    }
    Ok((public, private))
}

/// etcd material written to control planes and datastores
pub(crate) fn etcd_certificates(doc: &StorageDocument) -> Result<EtcdCertificates> {
    let base = base_state(doc)?;
    match (&base.ca_cert, &base.etcd_cert, &base.etcd_key) {
        (Some(ca), Some(cert), Some(key)) => Ok(EtcdCertificates {
            ca_cert: ca.clone(),
            etcd_cert: cert.clone(),
            etcd_key: key.clone(),
        }),
        _ => Err(Error::validation("etcd certificates have not been generated")),
    }
}

pub(crate) fn control_plane_count(doc: &StorageDocument) -> usize {
    doc.base().map_or(0, |b| b.public_ips.control_planes.len())
}
