//! Fixtures for the provisioner unit tests

use std::sync::Arc;

use ksctl_common::testing::StaticPoller;
use ksctl_common::state::{ClusterType, Instances, KubernetesBootstrapState};
use ksctl_common::store::MemoryStore;
use ksctl_common::{ClusterState, StorageDocument};
use ksctl_ssh::testing::ScriptedTransport;
use ksctl_ssh::{ExecutorConfig, RemoteExecutor};

use crate::distribution::BootstrapContext;
use crate::pki::EtcdCertificates;

pub(crate) fn instances(prefix: &str, cps: usize, wps: usize, dss: usize) -> Instances {
    Instances {
        control_planes: (0..cps).map(|i| format!("{prefix}.1{i}")).collect(),
        worker_planes: (0..wps).map(|i| format!("{prefix}.2{i}")).collect(),
        data_stores: (0..dss).map(|i| format!("{prefix}.3{i}")).collect(),
        load_balancer: format!("{prefix}.9"),
    }
}

/// Document as left by pre-bootstrap setup: addresses, login and certificates
pub(crate) fn bootstrapped_doc(cps: usize, wps: usize, dss: usize) -> StorageDocument {
    let mut doc = StorageDocument::new("aws", "fra1", "demo", ClusterType::SelfManaged);
    let mut b = KubernetesBootstrapState::default();
    b.base.public_ips = instances("203.0.113", cps, wps, dss);
    b.base.private_ips = instances("10.0.0", cps, wps, dss);
    b.base.ssh_info.user_name = "ubuntu".into();
    b.base.ssh_info.private_key = "PRIVATE KEY".into();
    b.base.ca_cert = Some("CA PEM".into());
    b.base.etcd_cert = Some("ETCD PEM".into());
    b.base.etcd_key = Some("ETCD KEY PEM".into());
    doc.k8s_bootstrap = Some(b);
    doc
}

pub(crate) fn certs() -> EtcdCertificates {
    EtcdCertificates {
        ca_cert: "CA PEM".into(),
        etcd_cert: "ETCD PEM".into(),
        etcd_key: "ETCD KEY PEM".into(),
    }
}

pub(crate) struct Harness {
    pub transport: ScriptedTransport,
    pub store: Arc<MemoryStore>,
    pub ctx: BootstrapContext,
}

impl Harness {
    pub(crate) fn new(doc: StorageDocument) -> Self {
        let transport = ScriptedTransport::new();
        let store = Arc::new(MemoryStore::with_document(doc.clone()));
        let executor =
            RemoteExecutor::new(Arc::new(transport.clone())).with_config(ExecutorConfig::fast());
        let ctx = BootstrapContext::new(
            ClusterState::new(store.clone(), doc),
            executor,
            Arc::new(StaticPoller::with_defaults()),
        );
        Self {
            transport,
            store,
            ctx,
        }
    }

    pub(crate) async fn doc(&self) -> StorageDocument {
        self.ctx.state.snapshot().await
    }
}
