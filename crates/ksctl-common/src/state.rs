//! Persisted cluster document
//!
//! One `StorageDocument` exists per cluster. Every provisioning step reads
//! its prerequisites from it and writes its results back before the next
//! step starts, so a crashed run can resume from the last completed step.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether the cluster is self-managed on VMs or a cloud managed offering
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterType {
    /// Kubernetes bootstrapped by ksctl on plain VMs
    #[default]
    SelfManaged,
    /// Control plane provided by the cloud (EKS, AKS, ...)
    Managed,
}

impl fmt::Display for ClusterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterType::SelfManaged => write!(f, "selfmanaged"),
            ClusterType::Managed => write!(f, "managed"),
        }
    }
}

/// Whether the current run creates a cluster or resumes/extends an existing one
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    /// First run: bootstrap state is initialized from scratch
    Create,
    /// Any later run: existing bootstrap state is kept
    Get,
}

/// Addresses of every machine role, either all public or all private
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instances {
    /// Control plane nodes; index 0 is the initializing node
    #[serde(default)]
    pub control_planes: Vec<String>,
    /// Worker nodes
    #[serde(default)]
    pub worker_planes: Vec<String>,
    /// External etcd nodes
    #[serde(default)]
    pub data_stores: Vec<String>,
    /// HAProxy node fronting the API servers
    #[serde(default)]
    pub load_balancer: String,
}

/// Login used for every node of the cluster
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshInfo {
    /// Remote user name
    pub user_name: String,
    /// Private key in PEM or OpenSSH text form
    pub private_key: String,
}

impl fmt::Debug for SshInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshInfo")
            .field("user_name", &self.user_name)
            .field("private_key", &redact(&self.private_key))
            .finish()
    }
}

/// Cluster SSH keypair generated by ksctl
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshKeyPairState {
    /// Authorized-keys line
    pub public_key: String,
    /// OpenSSH private key text
    pub private_key: String,
}

impl fmt::Debug for SshKeyPairState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshKeyPairState")
            .field("public_key", &self.public_key)
            .field("private_key", &redact(&self.private_key))
            .finish()
    }
}

/// Resolved component versions
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versions {
    /// k3s release channel, e.g. `v1.30.3+k3s1`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k3s: Option<String>,
    /// Kubernetes minor version for kubeadm, e.g. `v1.31`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeadm: Option<String>,
    /// etcd release, e.g. `v3.5.15`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd: Option<String>,
    /// HAProxy major.minor line, e.g. `3.0`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub haproxy: Option<String>,
}

/// State shared by both distributions
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseBootstrapState {
    /// Public addresses, used to reach the nodes over SSH
    #[serde(default)]
    pub public_ips: Instances,
    /// Private addresses, used for in-cluster traffic
    #[serde(default)]
    pub private_ips: Instances,
    /// Login for every node
    #[serde(default)]
    pub ssh_info: SshInfo,
    /// etcd CA certificate (PEM)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<String>,
    /// etcd server/client certificate (PEM)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd_cert: Option<String>,
    /// etcd certificate key (PEM)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd_key: Option<String>,
}

/// k3s specific bootstrap state
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct K3sBootstrapState {
    /// Server token read from control plane 0 after init
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k3s_token: Option<String>,
    /// Flannel is disabled because another CNI will be installed
    #[serde(default)]
    pub external_cni: bool,
}

impl fmt::Debug for K3sBootstrapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("K3sBootstrapState")
            .field("k3s_token", &self.k3s_token.as_deref().map(redact))
            .field("external_cni", &self.external_cni)
            .finish()
    }
}

/// kubeadm specific bootstrap state
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubeadmBootstrapState {
    /// Current join token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_token: Option<String>,
    /// When `bootstrap_token` stops being accepted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_token_expire_time_utc: Option<DateTime<Utc>>,
    /// Key protecting the uploaded control plane certificates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_key: Option<String>,
    /// SHA-256 of the cluster CA public key, hex encoded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery_token_ca_cert_hash: Option<String>,
}

impl fmt::Debug for KubeadmBootstrapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeadmBootstrapState")
            .field("bootstrap_token", &self.bootstrap_token.as_deref().map(redact))
            .field(
                "bootstrap_token_expire_time_utc",
                &self.bootstrap_token_expire_time_utc,
            )
            .field("certificate_key", &self.certificate_key.as_deref().map(redact))
            .field(
                "discovery_token_ca_cert_hash",
                &self.discovery_token_ca_cert_hash,
            )
            .finish()
    }
}

/// Everything the bootstrap layer records about a cluster
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubernetesBootstrapState {
    /// Role addresses, login and etcd certificates
    #[serde(default)]
    pub base: BaseBootstrapState,
    /// Present when the cluster uses k3s
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k3s: Option<K3sBootstrapState>,
    /// Present when the cluster uses kubeadm
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeadm: Option<KubeadmBootstrapState>,
}

/// The persisted per-cluster document
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageDocument {
    /// Cluster name chosen by the operator
    pub cluster_name: String,
    /// Cloud region
    pub region: String,
    /// Infrastructure provider (aws, azure, civo, local, ...)
    pub cloud_provider: String,
    /// Self-managed or managed
    #[serde(default)]
    pub cluster_type: ClusterType,
    /// Distribution bootstrapping the cluster (k3s or kubeadm)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_provider: Option<String>,
    /// Resolved component versions
    #[serde(default)]
    pub versions: Versions,
    /// Bootstrap progress, created on the first create run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k8s_bootstrap: Option<KubernetesBootstrapState>,
    /// Admin kubeconfig rewritten for external access
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_kubeconfig: Option<String>,
    /// Context name inside `cluster_kubeconfig`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_kubeconfig_context: Option<String>,
    /// SSH keypair installed on every node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key_pair: Option<SshKeyPairState>,
}

impl StorageDocument {
    /// Create an empty document for a cluster identity
    pub fn new(
        cloud_provider: impl Into<String>,
        region: impl Into<String>,
        cluster_name: impl Into<String>,
        cluster_type: ClusterType,
    ) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            region: region.into(),
            cloud_provider: cloud_provider.into(),
            cluster_type,
            ..Default::default()
        }
    }

    /// Kubeconfig context name: `{cluster}-{region}-{clusterType}-{provider}-ksctl`
    pub fn kubeconfig_context_name(&self) -> String {
        format!(
            "{}-{}-{}-{}-ksctl",
            self.cluster_name, self.region, self.cluster_type, self.cloud_provider
        )
    }

    /// Shared bootstrap state, if setup has run
    pub fn base(&self) -> Option<&BaseBootstrapState> {
        self.k8s_bootstrap.as_ref().map(|b| &b.base)
    }
}

fn redact(value: &str) -> &'static str {
    if value.is_empty() {
        ""
    } else {
        "<redacted>"
    }
}
