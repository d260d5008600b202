//! Load balancer and external etcd
//!
//! Runs before any distribution: copies the addresses and login handed over
//! by the cloud layer into the document, generates the etcd certificates
//! once, installs HAProxy in front of the API servers and brings up every
//! etcd member.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use ksctl_common::poller::{exact, resolve_version};
use ksctl_common::state::{Instances, KubernetesBootstrapState, Operation, SshInfo};
use ksctl_common::{StorageDocument, API_SERVER_PORT, ETCD_CLIENT_PORT, ETCD_PEER_PORT};
use ksctl_ssh::{OutputMode, Script, ScriptPipeline};

use crate::distribution::{
    base_state, bootstrap_state, etcd_certificates, node_target, BootstrapContext, NodeRole,
};
use crate::error::{Error, Result, StepContext};
use crate::pki::{self, EtcdCertificates};
use crate::scripts::store_etcd_certs;

/// HAProxy release line installed on the load balancer
pub const HAPROXY_VERSION: &str = "3.0";

const ETCD_DIR: &str = "/var/lib/etcd";

/// Machines provisioned by the cloud layer
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudResourceState {
    /// Login user on every VM
    pub ssh_user: String,
    /// Private key matching the public key installed on every VM; empty when
    /// the VMs were provisioned with the cluster keypair from state
    #[serde(default)]
    pub ssh_private_key: String,
    /// Addresses reachable from where ksctl runs
    pub public_ips: Instances,
    /// Addresses on the cluster network
    pub private_ips: Instances,
}

impl fmt::Debug for CloudResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudResourceState")
            .field("ssh_user", &self.ssh_user)
            .field("ssh_private_key", &"<redacted>")
            .field("public_ips", &self.public_ips)
            .field("private_ips", &self.private_ips)
            .finish()
    }
}

impl CloudResourceState {
    /// Check the topology can be bootstrapped
    pub fn validate(&self) -> Result<()> {
        let cps = self.public_ips.control_planes.len();
        if cps == 0 {
            return Err(Error::validation("at least one control plane is required"));
        }
        if cps >= 3 && cps % 2 == 0 {
            return Err(Error::validation(format!(
                "{cps} control planes requested, an odd number is required for quorum"
            )));
        }
        if self.public_ips.data_stores.is_empty() {
            return Err(Error::validation("at least one datastore is required"));
        }
        if self.public_ips.load_balancer.is_empty() || self.private_ips.load_balancer.is_empty() {
            return Err(Error::validation("load balancer addresses are missing"));
        }
        if self.ssh_user.is_empty() {
            return Err(Error::validation("ssh user is required"));
        }

        let pairs = [
            ("control plane", &self.public_ips.control_planes, &self.private_ips.control_planes),
            ("worker plane", &self.public_ips.worker_planes, &self.private_ips.worker_planes),
            ("datastore", &self.public_ips.data_stores, &self.private_ips.data_stores),
        ];
        for (role, public, private) in pairs {
            if public.len() != private.len() {
                return Err(Error::validation(format!(
                    "{role}: {} public but {} private addresses",
                    public.len(),
                    private.len()
                )));
            }
        }
        Ok(())
    }
}

/// Key to log in with: the inventory's if it has one, else the cluster keypair
fn login_key(cloud: &CloudResourceState, doc: &StorageDocument) -> Result<String> {
    if !cloud.ssh_private_key.is_empty() {
        return Ok(cloud.ssh_private_key.clone());
    }
    doc.ssh_key_pair
        .as_ref()
        .map(|pair| pair.private_key.clone())
        .ok_or_else(|| {
            Error::validation(
                "inventory has no ssh private key and the cluster has no keypair, run `ksctl keygen` first",
            )
        })
}

/// Provisions the nodes every distribution depends on
pub struct PreBootstrap {
    ctx: BootstrapContext,
}

impl PreBootstrap {
    /// Pre-bootstrap over the given collaborators
    pub fn new(ctx: BootstrapContext) -> Self {
        Self { ctx }
    }

    /// Record the cloud machines and make sure etcd certificates exist
    pub async fn setup(&self, cloud: &CloudResourceState, operation: Operation) -> Result<()> {
        cloud.validate()?;
        if operation == Operation::Get {
            self.ctx
                .state
                .read(|doc| bootstrap_state(doc).map(|_| ()))
                .await?;
        }

        let private_key = self
            .ctx
            .state
            .read(|doc| login_key(cloud, doc))
            .await?;

        self.ctx
            .state
            .update("pre-bootstrap setup", |doc| {
                if operation == Operation::Create && doc.k8s_bootstrap.is_none() {
                    doc.k8s_bootstrap = Some(KubernetesBootstrapState::default());
                }
                if let Some(b) = doc.k8s_bootstrap.as_mut() {
                    b.base.public_ips = cloud.public_ips.clone();
                    b.base.private_ips = cloud.private_ips.clone();
                    b.base.ssh_info = SshInfo {
                        user_name: cloud.ssh_user.clone(),
                        private_key,
                    };
                }
            })
            .await?;

        let datastores = cloud.private_ips.data_stores.clone();
        self.ctx
            .state
            .ensure(
                "etcd certificates",
                |doc| etcd_certificates(doc).ok(),
                || async move { pki::generate_etcd_certs(&datastores) },
                |doc, certs: &EtcdCertificates| {
                    if let Some(b) = doc.k8s_bootstrap.as_mut() {
                        b.base.ca_cert = Some(certs.ca_cert.clone());
                        b.base.etcd_cert = Some(certs.etcd_cert.clone());
                        b.base.etcd_key = Some(certs.etcd_key.clone());
                    }
                },
            )
            .await?;

        info!("initialized bootstrap state from cloud");
        Ok(())
    }

    /// Install HAProxy balancing the API server port over every control plane
    pub async fn configure_loadbalancer(&self) -> Result<()> {
        let (target, control_planes) = self
            .ctx
            .state
            .read(|doc| -> Result<_> {
                let target = node_target(doc, NodeRole::LoadBalancer, 0)?;
                let ips = base_state(doc)?.private_ips.control_planes.clone();
                Ok((target, ips))
            })
            .await?;

        info!(host = %target.host, "configuring load balancer");
        self.ctx
            .executor
            .run(
                &target,
                loadbalancer_scripts(HAPROXY_VERSION, &control_planes),
                OutputMode::WithoutOutput,
            )
            .await
            .step("configure load balancer")?;

        self.ctx
            .state
            .update("haproxy version", |doc| {
                doc.versions.haproxy = Some(HAPROXY_VERSION.to_string())
            })
            .await?;

        info!(host = %target.host, "configured load balancer");
        Ok(())
    }

    /// Install and start etcd member `index`
    pub async fn configure_datastore(&self, index: usize, version: &str) -> Result<()> {
        let releases = self.ctx.poller.releases("etcd-io", "etcd").await?;
        let version = resolve_version("etcd", &releases, version, exact, exact)?;

        let (target, members, certs) = self
            .ctx
            .state
            .read(|doc| -> Result<_> {
                let target = node_target(doc, NodeRole::DataStore, index)?;
                let members = base_state(doc)?.private_ips.data_stores.clone();
                Ok((target, members, etcd_certificates(doc)?))
            })
            .await?;

        info!(index, host = %target.host, version = %version, "configuring datastore");
        self.ctx
            .executor
            .run(
                &target,
                datastore_scripts(&version, &certs, &members, index)?,
                OutputMode::WithoutOutput,
            )
            .await
            .step(&format!("configure datastore {index}"))?;

        self.ctx
            .state
            .update("etcd version", |doc| doc.versions.etcd = Some(version.clone()))
            .await?;

        info!(index, "configured datastore");
        Ok(())
    }
}

// =============================================================================
// Scripts
// =============================================================================

fn loadbalancer_scripts(version: &str, control_planes: &[String]) -> ScriptPipeline {
    let servers: String = control_planes
        .iter()
        .enumerate()
        .map(|(i, ip)| format!("  server k3sserver-{} {ip}:{API_SERVER_PORT} check\n", i + 1))
        .collect();

    ScriptPipeline::new()
        .with(
            Script::new(
                "install haproxy",
                format!(
                    r#"
sudo DEBIAN_FRONTEND=noninteractive apt update -y
sudo DEBIAN_FRONTEND=noninteractive apt-get install --no-install-recommends software-properties-common -y
sudo DEBIAN_FRONTEND=noninteractive add-apt-repository ppa:vbernat/haproxy-{version} -y
sudo DEBIAN_FRONTEND=noninteractive apt-get install haproxy={version}.\* -y
"#
                ),
            )
            .retry(9),
        )
        .with(
            Script::new(
                "enable and start haproxy",
                "\nsudo systemctl start haproxy\nsudo systemctl enable haproxy\n",
            )
            .retry(3),
        )
        .with(Script::new(
            "create haproxy configuration",
            format!(
                r#"
cat <<EOF > haproxy.cfg
frontend kubernetes-frontend
  bind *:{API_SERVER_PORT}
  mode tcp
  option tcplog
  timeout client 10s
  default_backend kubernetes-backend

backend kubernetes-backend
  timeout connect 10s
  timeout server 10s
  mode tcp
  option tcp-check
  balance roundrobin
{servers}EOF

sudo mv haproxy.cfg /etc/haproxy/haproxy.cfg
"#
            ),
        ))
        .with(Script::new("restart haproxy", "\nsudo systemctl restart haproxy\n").retry(3))
}

/// `infra0=https://ip:2380,...` for `--initial-cluster`
fn initial_cluster(members: &[String]) -> String {
    members
        .iter()
        .enumerate()
        .map(|(i, ip)| format!("infra{i}=https://{ip}:{ETCD_PEER_PORT}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn datastore_scripts(
    version: &str,
    certs: &EtcdCertificates,
    members: &[String],
    index: usize,
) -> Result<ScriptPipeline> {
    let ip = members
        .get(index)
        .ok_or_else(|| Error::validation(format!("datastore {index} has no private address")))?;
    debug!(members = members.len(), "etcd initial cluster");

    Ok(ScriptPipeline::new()
        .with(
            Script::new(
                "fetch etcd binaries",
                format!(
                    r#"
ETCD_VER={version}
DOWNLOAD_URL=https://storage.googleapis.com/etcd

sudo rm -f /tmp/etcd-${{ETCD_VER}}-linux-amd64.tar.gz
sudo rm -rf /tmp/etcd-download-test
mkdir -p /tmp/etcd-download-test

curl -L ${{DOWNLOAD_URL}}/${{ETCD_VER}}/etcd-${{ETCD_VER}}-linux-amd64.tar.gz -o /tmp/etcd-${{ETCD_VER}}-linux-amd64.tar.gz
"#
                ),
            )
            .retry(9),
        )
        .with(Script::new(
            "install etcd binaries",
            format!(
                r#"
ETCD_VER={version}
tar xzvf /tmp/etcd-${{ETCD_VER}}-linux-amd64.tar.gz -C /tmp/etcd-download-test --strip-components=1
sudo rm -f /tmp/etcd-${{ETCD_VER}}-linux-amd64.tar.gz

sudo mv -v /tmp/etcd-download-test/etcd /usr/local/bin
sudo mv -v /tmp/etcd-download-test/etcdctl /usr/local/bin
sudo mv -v /tmp/etcd-download-test/etcdutl /usr/local/bin

sudo rm -rf /tmp/etcd-download-test
"#
            ),
        ))
        .with(store_etcd_certs(ETCD_DIR, certs))
        .with(Script::new(
            "configure etcd systemd unit",
            format!(
                r#"
cat <<EOF > etcd.service
[Unit]
Description=etcd

[Service]
ExecStart=/usr/local/bin/etcd \\
  --name infra{index} \\
  --initial-advertise-peer-urls https://{ip}:{ETCD_PEER_PORT} \\
  --listen-peer-urls https://{ip}:{ETCD_PEER_PORT} \\
  --listen-client-urls https://{ip}:{ETCD_CLIENT_PORT},https://127.0.0.1:{ETCD_CLIENT_PORT} \\
  --advertise-client-urls https://{ip}:{ETCD_CLIENT_PORT} \\
  --initial-cluster-token etcd-cluster-1 \\
  --initial-cluster {cluster} \\
  --log-outputs={ETCD_DIR}/etcd.log \\
  --initial-cluster-state new \\
  --peer-auto-tls \\
  --snapshot-count '10000' \\
  --wal-dir={ETCD_DIR}/wal \\
  --client-cert-auth \\
  --trusted-ca-file={ETCD_DIR}/ca.pem \\
  --cert-file={ETCD_DIR}/etcd.pem \\
  --key-file={ETCD_DIR}/etcd-key.pem \\
  --data-dir={ETCD_DIR}/data
Restart=on-failure
RestartSec=5

[Install]
WantedBy=multi-user.target
EOF

sudo mv -v etcd.service /etc/systemd/system
"#,
                cluster = initial_cluster(members),
            ),
        ))
        .with(
            Script::new(
                "start etcd",
                "\nsudo systemctl daemon-reload\nsudo systemctl enable etcd\nsudo systemctl start etcd\n",
            )
            .retry(3),
        ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{bootstrapped_doc, certs, instances, Harness};
    use ksctl_common::state::ClusterType;
    use ksctl_common::StorageDocument;

    fn cloud(cps: usize, wps: usize, dss: usize) -> CloudResourceState {
        CloudResourceState {
            ssh_user: "ubuntu".into(),
            ssh_private_key: "PRIVATE KEY".into(),
            public_ips: instances("203.0.113", cps, wps, dss),
            private_ips: instances("10.0.0", cps, wps, dss),
        }
    }

    fn empty() -> Harness {
        Harness::new(StorageDocument::new(
            "aws",
            "fra1",
            "demo",
            ClusterType::SelfManaged,
        ))
    }

    #[test]
    fn topology_validation() {
        assert!(cloud(3, 1, 1).validate().is_ok());
        assert!(cloud(1, 0, 1).validate().is_ok());
        assert!(cloud(0, 1, 1).validate().is_err());
        assert!(cloud(4, 1, 1).validate().is_err());
        assert!(cloud(3, 1, 0).validate().is_err());

        let mut c = cloud(3, 2, 1);
        c.private_ips.worker_planes.pop();
        let err = c.validate().unwrap_err();
        assert!(err.to_string().contains("worker plane: 2 public but 1 private"));

        let mut c = cloud(1, 0, 1);
        c.private_ips.load_balancer.clear();
        assert!(c.validate().is_err());
    }

    #[test]
    fn debug_hides_private_key() {
        let shown = format!("{:?}", cloud(1, 0, 1));
        assert!(!shown.contains("PRIVATE KEY"));
        assert!(shown.contains("ubuntu"));
    }

    #[tokio::test]
    async fn setup_copies_cloud_state_and_generates_certificates() {
        let h = empty();
        let pre = PreBootstrap::new(h.ctx.clone());

        pre.setup(&cloud(3, 1, 3), Operation::Create).await.unwrap();

        let doc = h.store.snapshot().unwrap();
        let base = doc.base().unwrap();
        assert_eq!(base.public_ips.control_planes.len(), 3);
        assert_eq!(base.private_ips.data_stores[2], "10.0.0.32");
        assert_eq!(base.ssh_info.user_name, "ubuntu");
        assert!(base.ca_cert.as_deref().unwrap().contains("BEGIN CERTIFICATE"));
        assert!(base.etcd_key.as_deref().unwrap().contains("PRIVATE KEY"));
        assert!(h.transport.executed().is_empty());
    }

    /// Story: Resuming a create keeps the certificates etcd already trusts
    #[tokio::test]
    async fn story_rerun_keeps_certificates() {
        let h = empty();
        let pre = PreBootstrap::new(h.ctx.clone());
        pre.setup(&cloud(1, 0, 1), Operation::Create).await.unwrap();
        let first = h.doc().await.base().unwrap().ca_cert.clone();

        let mut moved = cloud(1, 1, 1);
        moved.public_ips.worker_planes = vec!["198.51.100.7".into()];
        pre.setup(&moved, Operation::Create).await.unwrap();

        let doc = h.doc().await;
        assert_eq!(doc.base().unwrap().ca_cert, first);
        assert_eq!(doc.base().unwrap().public_ips.worker_planes, ["198.51.100.7"]);
    }

    #[tokio::test]
    async fn missing_inventory_key_falls_back_to_cluster_keypair() {
        let mut doc = StorageDocument::new("aws", "fra1", "demo", ClusterType::SelfManaged);
        doc.ssh_key_pair = Some(ksctl_common::state::SshKeyPairState {
            public_key: "ssh-ed25519 AAAA".into(),
            private_key: "CLUSTER KEY".into(),
        });
        let h = Harness::new(doc);
        let mut c = cloud(1, 0, 1);
        c.ssh_private_key.clear();
        assert!(c.validate().is_ok());

        PreBootstrap::new(h.ctx.clone())
            .setup(&c, Operation::Create)
            .await
            .unwrap();

        assert_eq!(h.doc().await.base().unwrap().ssh_info.private_key, "CLUSTER KEY");
    }

    #[tokio::test]
    async fn inventory_key_wins_over_cluster_keypair() {
        let mut doc = StorageDocument::new("aws", "fra1", "demo", ClusterType::SelfManaged);
        doc.ssh_key_pair = Some(ksctl_common::state::SshKeyPairState {
            public_key: "ssh-ed25519 AAAA".into(),
            private_key: "CLUSTER KEY".into(),
        });
        let h = Harness::new(doc);

        PreBootstrap::new(h.ctx.clone())
            .setup(&cloud(1, 0, 1), Operation::Create)
            .await
            .unwrap();

        assert_eq!(h.doc().await.base().unwrap().ssh_info.private_key, "PRIVATE KEY");
    }

    #[tokio::test]
    async fn no_key_anywhere_is_rejected_before_writing() {
        let h = empty();
        let mut c = cloud(1, 0, 1);
        c.ssh_private_key.clear();

        let err = PreBootstrap::new(h.ctx.clone())
            .setup(&c, Operation::Create)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("ksctl keygen"));
        assert_eq!(h.store.write_count(), 0);
    }

    #[tokio::test]
    async fn setup_on_get_requires_existing_state() {
        let h = empty();
        let pre = PreBootstrap::new(h.ctx.clone());

        assert!(pre.setup(&cloud(1, 0, 1), Operation::Get).await.is_err());
        assert_eq!(h.store.write_count(), 0);
    }

    #[tokio::test]
    async fn invalid_cloud_state_writes_nothing() {
        let h = empty();
        let pre = PreBootstrap::new(h.ctx.clone());

        assert!(pre.setup(&cloud(4, 0, 1), Operation::Create).await.is_err());
        assert_eq!(h.store.write_count(), 0);
    }

    #[tokio::test]
    async fn loadbalancer_routes_to_every_control_plane() {
        let h = Harness::new(bootstrapped_doc(3, 0, 1));
        let pre = PreBootstrap::new(h.ctx.clone());

        pre.configure_loadbalancer().await.unwrap();

        let cmds = h.transport.executed_on("203.0.113.9");
        assert_eq!(cmds.len(), 4);
        assert!(cmds[0].contains("ppa:vbernat/haproxy-3.0"));
        let cfg = &cmds[2];
        assert!(cfg.contains("bind *:6443"));
        assert!(cfg.contains("balance roundrobin"));
        for (i, ip) in ["10.0.0.10", "10.0.0.11", "10.0.0.12"].iter().enumerate() {
            assert!(cfg.contains(&format!("server k3sserver-{} {ip}:6443 check", i + 1)));
        }
        assert_eq!(h.doc().await.versions.haproxy.as_deref(), Some("3.0"));
    }

    #[tokio::test]
    async fn failed_haproxy_install_records_no_version() {
        let h = Harness::new(bootstrapped_doc(1, 0, 1));
        h.transport.fail("add-apt-repository", 9, "E: Unable to locate package");
        let pre = PreBootstrap::new(h.ctx.clone());

        let err = pre.configure_loadbalancer().await.unwrap_err();

        assert!(err.to_string().starts_with("configure load balancer"));
        assert!(h.doc().await.versions.haproxy.is_none());
        assert_eq!(h.transport.executed_on("203.0.113.9").len(), 9);
    }

    #[tokio::test]
    async fn datastore_joins_the_full_member_list() {
        let h = Harness::new(bootstrapped_doc(1, 0, 3));
        let pre = PreBootstrap::new(h.ctx.clone());

        pre.configure_datastore(1, "").await.unwrap();

        let cmds = h.transport.executed_on("203.0.113.31");
        assert_eq!(cmds.len(), 5);
        assert!(cmds[0].contains("ETCD_VER=v3.5.15"));
        let unit = &cmds[3];
        assert!(unit.contains("--name infra1"));
        assert!(unit.contains("--listen-peer-urls https://10.0.0.31:2380"));
        assert!(unit.contains(
            "--initial-cluster infra0=https://10.0.0.30:2380,infra1=https://10.0.0.31:2380,infra2=https://10.0.0.32:2380"
        ));
        assert!(h.transport.executed_on("203.0.113.30").is_empty());
        assert_eq!(h.doc().await.versions.etcd.as_deref(), Some("v3.5.15"));
    }

    #[tokio::test]
    async fn unknown_etcd_version_is_rejected_before_connecting() {
        let h = Harness::new(bootstrapped_doc(1, 0, 1));
        let pre = PreBootstrap::new(h.ctx.clone());

        let err = pre.configure_datastore(0, "v3.4.0").await.unwrap_err();

        assert!(matches!(
            err,
            Error::Common(ksctl_common::Error::InvalidVersion { .. })
        ));
        assert!(h.transport.connects().is_empty());
    }

    #[test]
    fn datastore_index_out_of_range() {
        let members = vec!["10.0.0.30".to_string()];
        assert!(datastore_scripts("v3.5.15", &certs(), &members, 1).is_err());
    }
}
