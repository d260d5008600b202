//! Self-managed Kubernetes bootstrap
//!
//! Turns a set of plain VMs into a cluster: HAProxy in front of the API
//! servers, an external etcd secured by its own CA, and either k3s or
//! kubeadm on the control and worker planes. Every step records its result
//! in the cluster's [`ksctl_common::StorageDocument`] so an interrupted run
//! can be resumed.

#![deny(missing_docs)]

pub mod credentials;
pub mod distribution;
pub mod error;
pub mod k3s;
pub mod kubeadm;
pub mod kubeconfig;
pub mod orchestrator;
pub mod pki;
pub mod prebootstrap;

mod scripts;
#[cfg(test)]
mod test_support;

pub use distribution::{BootstrapContext, BootstrapProvider, KubernetesDistribution, NodeRole};
pub use error::{Error, Result, StepContext};
pub use orchestrator::{BootstrapOptions, ClusterBootstrap};
pub use prebootstrap::{CloudResourceState, PreBootstrap};
