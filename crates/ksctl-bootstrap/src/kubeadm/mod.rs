//! kubeadm distribution
//!
//! Control plane 0 runs `kubeadm init` against the external etcd with a
//! bootstrap token and certificate key chosen up front, then publishes the
//! discovery hash of its CA. Other control planes join with the uploaded
//! certificates, workers join with the token alone. kubeadm ships no pod
//! network, so an external CNI is always required.

mod scripts;
mod token;

pub use self::token::needs_refresh;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use ksctl_common::poller::{exact, resolve_version, truncate_to_minor};
use ksctl_common::state::{KubeadmBootstrapState, Operation};
use ksctl_common::StorageDocument;
use ksctl_ssh::{OutputMode, RemoteExecutor, RemoteTarget, ScriptPipeline};

use crate::distribution::{
    base_state, bootstrap_state, control_plane_count, etcd_certificates, load_balancer,
    node_target, BootstrapContext, KubernetesDistribution, NodeRole,
};
use crate::error::{Error, Result, StepContext};
use crate::kubeconfig::KubeconfigRewrite;

use self::scripts::{InitConfig, JoinCredentials};
use self::token::{expiry_from, TokenRefresher};

const PROVIDER: &str = "kubeadm";

/// Context name in the admin.conf kubeadm writes
const DEFAULT_CONTEXT: &str = "kubernetes-admin@kubernetes";

/// Upstream kubeadm with external etcd
pub struct Kubeadm {
    ctx: BootstrapContext,
    tokens: TokenRefresher,
}

fn kubeadm_state(doc: &StorageDocument) -> Option<&KubeadmBootstrapState> {
    doc.k8s_bootstrap.as_ref().and_then(|b| b.kubeadm.as_ref())
}

fn kubeadm_state_mut(doc: &mut StorageDocument) -> Option<&mut KubeadmBootstrapState> {
    doc.k8s_bootstrap
        .as_mut()
        .map(|b| b.kubeadm.get_or_insert_with(KubeadmBootstrapState::default))
}

/// Run a single read-only script and return its trimmed, non-empty output
async fn fetch(
    executor: RemoteExecutor,
    target: RemoteTarget,
    pipeline: ScriptPipeline,
    what: &str,
) -> Result<String> {
    let out = executor
        .run(&target, pipeline, OutputMode::WithOutput)
        .await
        .step(what)?;
    out.trimmed(0)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::validation(format!("{what} returned no output")))
}

impl Kubeadm {
    /// Distribution over the given collaborators
    pub fn new(ctx: BootstrapContext) -> Self {
        Self {
            ctx,
            tokens: TokenRefresher::default(),
        }
    }

    fn executor(&self) -> RemoteExecutor {
        self.ctx.executor.fast()
    }

    fn version(doc: &StorageDocument) -> Result<String> {
        doc.versions
            .kubeadm
            .clone()
            .ok_or_else(|| Error::validation("kubeadm version has not been resolved"))
    }

    /// Discovery hash and certificate key published by control plane 0
    fn join_material(doc: &StorageDocument) -> Result<(String, String)> {
        let state = kubeadm_state(doc);
        match (
            state.and_then(|k| k.discovery_token_ca_cert_hash.clone()),
            state.and_then(|k| k.certificate_key.clone()),
        ) {
            (Some(hash), Some(key)) => Ok((hash, key)),
            _ => Err(Error::validation(
                "kubeadm join material missing, control plane 0 must be configured first",
            )),
        }
    }

    async fn init_first_control_plane(&self, doc: &StorageDocument) -> Result<()> {
        let target = node_target(doc, NodeRole::ControlPlane, 0)?;
        let version = Self::version(doc)?;
        let certs = etcd_certificates(doc)?;
        let (public_lb, private_lb) = load_balancer(doc)?;
        let datastores = NodeRole::DataStore.addresses(&base_state(doc)?.private_ips);

        self.executor()
            .run(
                &target,
                scripts::install_control_plane(&version, &certs),
                OutputMode::WithoutOutput,
            )
            .await
            .step("kubeadm control plane 0 install")?;

        let certificate_key: String = self
            .ctx
            .state
            .ensure(
                "kubeadm certificate key",
                |d| kubeadm_state(d).and_then(|k| k.certificate_key.clone()),
                || fetch(self.executor(), target.clone(), scripts::certificate_key(), "certificate key"),
                |d, key| {
                    if let Some(k) = kubeadm_state_mut(d) {
                        k.certificate_key = Some(key.clone());
                    }
                },
            )
            .await?;

        let (bootstrap_token, _): (String, DateTime<Utc>) = self
            .ctx
            .state
            .ensure(
                "kubeadm bootstrap token",
                |d| {
                    kubeadm_state(d).and_then(|k| {
                        k.bootstrap_token
                            .clone()
                            .zip(k.bootstrap_token_expire_time_utc)
                    })
                },
                || async {
                    let created_at = Utc::now();
                    let token = fetch(
                        self.executor(),
                        target.clone(),
                        scripts::generate_token(),
                        "bootstrap token",
                    )
                    .await?;
                    Ok::<_, Error>((token, expiry_from(created_at)))
                },
                |d, created: &(String, DateTime<Utc>)| {
                    if let Some(k) = kubeadm_state_mut(d) {
                        k.bootstrap_token = Some(created.0.clone());
                        k.bootstrap_token_expire_time_utc = Some(created.1);
                    }
                },
            )
            .await?;

        let init = InitConfig {
            version: &version,
            bootstrap_token: &bootstrap_token,
            certificate_key: &certificate_key,
            public_lb: &public_lb,
            private_lb: &private_lb,
            datastore_private_ips: &datastores,
        };
        self.executor()
            .run(&target, scripts::init(&init), OutputMode::WithoutOutput)
            .await
            .step("kubeadm init")?;

        self.ctx
            .state
            .ensure(
                "kubeadm discovery hash",
                |d| kubeadm_state(d).and_then(|k| k.discovery_token_ca_cert_hash.clone()),
                || {
                    fetch(
                        self.executor(),
                        target.clone(),
                        scripts::discovery_hash(),
                        "discovery token ca cert hash",
                    )
                },
                |d, hash| {
                    if let Some(k) = kubeadm_state_mut(d) {
                        k.discovery_token_ca_cert_hash = Some(hash.clone());
                    }
                },
            )
            .await?;
        Ok(())
    }

    async fn join_control_plane(&self, doc: &StorageDocument, index: usize) -> Result<()> {
        let target = node_target(doc, NodeRole::ControlPlane, index)?;
        let version = Self::version(doc)?;
        let (discovery_hash, certificate_key) = Self::join_material(doc)?;
        let certs = etcd_certificates(doc)?;
        let (_, private_lb) = load_balancer(doc)?;

        self.executor()
            .run(
                &target,
                scripts::install_control_plane(&version, &certs),
                OutputMode::WithoutOutput,
            )
            .await
            .step(&format!("kubeadm control plane {index} install"))?;

        let token = self.tokens.fresh_token(&self.ctx).await?;
        let creds = JoinCredentials {
            private_lb: &private_lb,
            token: &token,
            discovery_hash: &discovery_hash,
        };
        self.executor()
            .run(
                &target,
                scripts::join_control_plane(&creds, &certificate_key),
                OutputMode::WithoutOutput,
            )
            .await
            .step(&format!("kubeadm control plane {index} join"))?;
        Ok(())
    }

    async fn fetch_kubeconfig(&self, doc: &StorageDocument) -> Result<()> {
        let target = node_target(doc, NodeRole::ControlPlane, 0)?;
        let (public_lb, private_lb) = load_balancer(doc)?;
        let context = doc.kubeconfig_context_name();

        self.ctx
            .state
            .ensure(
                "kubeadm kubeconfig",
                |d| d.cluster_kubeconfig.clone(),
                || async {
                    let out = self
                        .executor()
                        .run(&target, scripts::kubeconfig(), OutputMode::WithOutput)
                        .await
                        .step("kubeadm kubeconfig")?;
                    let raw = out.outputs.into_iter().next().unwrap_or_default();
                    if raw.trim().is_empty() {
                        return Err(Error::validation("kubeadm admin.conf is empty"));
                    }
                    Ok::<_, Error>(KubeconfigRewrite {
                        internal_address: &private_lb,
                        external_address: &public_lb,
                        default_context: DEFAULT_CONTEXT,
                        context: &context,
                    }
                    .apply(&raw))
                },
                |d, kubeconfig| {
                    d.cluster_kubeconfig_context = Some(d.kubeconfig_context_name());
                    d.cluster_kubeconfig = Some(kubeconfig.clone());
                },
            )
            .await?;
        info!("kubeconfig stored");
        Ok(())
    }
}

#[async_trait]
impl KubernetesDistribution for Kubeadm {
    async fn setup(&self, operation: Operation) -> Result<()> {
        self.ctx
            .state
            .read(|doc| bootstrap_state(doc).map(|_| ()))
            .await?;

        self.ctx
            .state
            .update("kubeadm setup", |doc| {
                if operation == Operation::Create {
                    if let Some(b) = doc.k8s_bootstrap.as_mut() {
                        b.kubeadm.get_or_insert_with(KubeadmBootstrapState::default);
                    }
                    doc.bootstrap_provider = Some(PROVIDER.to_string());
                }
            })
            .await?;
        Ok(())
    }

    async fn configure_control_plane(&self, index: usize) -> Result<()> {
        let doc = self.ctx.state.snapshot().await;
        info!(index, "configuring kubeadm control plane");

        if index == 0 {
            self.init_first_control_plane(&doc).await?;
        } else {
            self.join_control_plane(&doc, index).await?;
        }

        if index + 1 == control_plane_count(&doc) {
            let doc = self.ctx.state.snapshot().await;
            self.fetch_kubeconfig(&doc).await?;
        }

        info!(index, "configured kubeadm control plane");
        Ok(())
    }

    async fn join_workerplane(&self, index: usize) -> Result<()> {
        let doc = self.ctx.state.snapshot().await;
        let target = node_target(&doc, NodeRole::WorkerPlane, index)?;
        let version = Self::version(&doc)?;
        let (discovery_hash, _) = Self::join_material(&doc)?;
        let (_, private_lb) = load_balancer(&doc)?;

        info!(index, "joining kubeadm worker plane");
        self.executor()
            .run(&target, scripts::install_tools(&version), OutputMode::WithoutOutput)
            .await
            .step(&format!("kubeadm worker plane {index} install"))?;

        let token = self.tokens.fresh_token(&self.ctx).await?;
        let creds = JoinCredentials {
            private_lb: &private_lb,
            token: &token,
            discovery_hash: &discovery_hash,
        };
        self.executor()
            .run(&target, scripts::join_worker(&creds), OutputMode::WithoutOutput)
            .await
            .step(&format!("kubeadm worker plane {index} join"))?;

        info!(index, "configured kubeadm worker plane");
        Ok(())
    }

    async fn k8s_version(&self, requested: &str) -> Result<String> {
        let releases = self.ctx.poller.releases("kubernetes", "kubernetes").await?;
        let version = resolve_version(PROVIDER, &releases, requested, truncate_to_minor, exact)?;

        self.ctx
            .state
            .update("kubeadm version", |doc| doc.versions.kubeadm = Some(version.clone()))
            .await?;
        debug!(version = %version, "resolved kubeadm version");
        Ok(version)
    }

    async fn cni(&self, name: &str) -> Result<bool> {
        debug!(cni = name, "kubeadm has no built in cni, external cni required");
        Ok(true)
    }
}
