//! Common types and utilities shared by the ksctl bootstrap crates
//!
//! Holds the persisted cluster document, the storage seam it is written
//! through, the skip-or-create provisioning handle, retry helpers and the
//! release version poller.

#![deny(missing_docs)]

pub mod error;
pub mod poller;
pub mod provision;
pub mod retry;
pub mod state;
pub mod store;
pub mod telemetry;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

use std::time::Duration;

pub use error::{Error, Result};
pub use provision::ClusterState;
pub use state::StorageDocument;
pub use store::StateStore;

/// Log file on every remote host that install and join scripts append to
pub const REMOTE_LOG_FILE: &str = "ksctl.log";

/// Lifetime of a kubeadm bootstrap token
pub const BOOTSTRAP_TOKEN_TTL: Duration = Duration::from_secs(20 * 60);

/// A bootstrap token with this much validity or less is regenerated before a join
pub const BOOTSTRAP_TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(10 * 60);

/// Port the Kubernetes API server is reached on, directly and through the load balancer
pub const API_SERVER_PORT: u16 = 6443;

/// etcd client port
pub const ETCD_CLIENT_PORT: u16 = 2379;

/// etcd peer port
pub const ETCD_PEER_PORT: u16 = 2380;
