//! k3s distribution
//!
//! Control plane 0 installs a k3s server against the external etcd and hands
//! out the server token. Further servers and the agents join with that token
//! through the private load balancer address.

mod scripts;

use async_trait::async_trait;
use tracing::{debug, info};

use ksctl_common::poller::{exact, resolve_version, with_k3s_suffix};
use ksctl_common::state::{K3sBootstrapState, Operation};
use ksctl_common::StorageDocument;
use ksctl_ssh::OutputMode;

use crate::distribution::{
    base_state, bootstrap_state, control_plane_count, etcd_certificates, load_balancer,
    node_target, BootstrapContext, KubernetesDistribution, NodeRole,
};
use crate::error::{Error, Result, StepContext};
use crate::kubeconfig::KubeconfigRewrite;

use self::scripts::ServerInstall;

const PROVIDER: &str = "k3s";

/// Built in CNI names that keep flannel enabled
const BUILTIN_CNI: &[&str] = &["flannel", ""];

/// k3s servers backed by external etcd
pub struct K3s {
    ctx: BootstrapContext,
}

impl K3s {
    /// Distribution over the given collaborators; flannel until [`cni`](KubernetesDistribution::cni) says otherwise
    pub fn new(ctx: BootstrapContext) -> Self {
        Self { ctx }
    }

    fn version(doc: &StorageDocument) -> Result<String> {
        doc.versions
            .k3s
            .clone()
            .ok_or_else(|| Error::validation("k3s version has not been resolved"))
    }

    fn token(doc: &StorageDocument) -> Option<String> {
        doc.k8s_bootstrap
            .as_ref()
            .and_then(|b| b.k3s.as_ref())
            .and_then(|k| k.k3s_token.clone())
    }

    fn external_cni(doc: &StorageDocument) -> bool {
        doc.k8s_bootstrap
            .as_ref()
            .and_then(|b| b.k3s.as_ref())
            .is_some_and(|k| k.external_cni)
    }

    fn server_install<'a>(
        doc: &StorageDocument,
        version: &'a str,
        lb: &'a (String, String),
        join_token: Option<&'a str>,
        datastores: &'a [&'a str],
    ) -> ServerInstall<'a> {
        ServerInstall {
            version,
            datastore_private_ips: datastores,
            public_lb: &lb.0,
            private_lb: &lb.1,
            external_cni: Self::external_cni(doc),
            join_token,
        }
    }

    async fn init_first_server(&self, doc: &StorageDocument) -> Result<()> {
        let target = node_target(doc, NodeRole::ControlPlane, 0)?;
        let version = Self::version(doc)?;
        let certs = etcd_certificates(doc)?;
        let lb = load_balancer(doc)?;
        let datastores = NodeRole::DataStore.addresses(&base_state(doc)?.private_ips);

        let install = Self::server_install(doc, &version, &lb, None, &datastores);
        self.ctx
            .executor
            .fast()
            .run(&target, scripts::control_plane(&certs, &install), OutputMode::WithoutOutput)
            .await
            .step("k3s control plane 0 install")?;

        let executor = self.ctx.executor.fast();
        self.ctx
            .state
            .ensure(
                "k3s server token",
                Self::token,
                || async move {
                    let out = executor
                        .run(&target, scripts::server_token(), OutputMode::WithOutput)
                        .await
                        .step("k3s server token")?;
                    out.trimmed(0)
                        .filter(|t| !t.is_empty())
                        .ok_or_else(|| Error::validation("k3s server token is empty"))
                },
                |doc, token| {
                    if let Some(b) = doc.k8s_bootstrap.as_mut() {
                        b.k3s.get_or_insert_with(K3sBootstrapState::default).k3s_token =
                            Some(token.clone());
                    }
                },
            )
            .await?;
        Ok(())
    }

    async fn join_server(&self, doc: &StorageDocument, index: usize) -> Result<()> {
        let target = node_target(doc, NodeRole::ControlPlane, index)?;
        let version = Self::version(doc)?;
        let token = Self::token(doc).ok_or_else(|| {
            Error::validation("k3s server token missing, control plane 0 must be configured first")
        })?;
        let certs = etcd_certificates(doc)?;
        let lb = load_balancer(doc)?;
        let datastores = NodeRole::DataStore.addresses(&base_state(doc)?.private_ips);

        let install = Self::server_install(doc, &version, &lb, Some(&token), &datastores);
        self.ctx
            .executor
            .fast()
            .run(&target, scripts::control_plane(&certs, &install), OutputMode::WithoutOutput)
            .await
            .step(&format!("k3s control plane {index} join"))?;
        Ok(())
    }

    async fn fetch_kubeconfig(&self, doc: &StorageDocument) -> Result<()> {
        let target = node_target(doc, NodeRole::ControlPlane, 0)?;
        let (public_lb, _) = load_balancer(doc)?;
        let context = doc.kubeconfig_context_name();
        let executor = self.ctx.executor.fast();

        self.ctx
            .state
            .ensure(
                "k3s kubeconfig",
                |d| d.cluster_kubeconfig.clone(),
                || async move {
                    let out = executor
                        .run(&target, scripts::kubeconfig(), OutputMode::WithOutput)
                        .await
                        .step("k3s kubeconfig")?;
                    let raw = out.outputs.into_iter().next().unwrap_or_default();
                    if raw.trim().is_empty() {
                        return Err(Error::validation("k3s kubeconfig is empty"));
                    }
                    Ok::<_, Error>(KubeconfigRewrite {
                        internal_address: "127.0.0.1",
                        external_address: &public_lb,
                        default_context: "default",
                        context: &context,
                    }
                    .apply(&raw))
                },
                |doc, kubeconfig| {
                    doc.cluster_kubeconfig_context = Some(doc.kubeconfig_context_name());
                    doc.cluster_kubeconfig = Some(kubeconfig.clone());
                },
            )
            .await?;
        info!("kubeconfig stored");
        Ok(())
    }
}

#[async_trait]
impl KubernetesDistribution for K3s {
    async fn setup(&self, operation: Operation) -> Result<()> {
        self.ctx
            .state
            .read(|doc| bootstrap_state(doc).map(|_| ()))
            .await?;

        self.ctx
            .state
            .update("k3s setup", |doc| {
                if operation == Operation::Create {
                    if let Some(b) = doc.k8s_bootstrap.as_mut() {
                        b.k3s.get_or_insert_with(K3sBootstrapState::default);
                    }
                    doc.bootstrap_provider = Some(PROVIDER.to_string());
                }
            })
            .await?;
        Ok(())
    }

    async fn configure_control_plane(&self, index: usize) -> Result<()> {
        let doc = self.ctx.state.snapshot().await;
        info!(index, "configuring k3s control plane");

        if index == 0 {
            self.init_first_server(&doc).await?;
        } else {
            self.join_server(&doc, index).await?;
        }

        if index + 1 == control_plane_count(&doc) {
            let doc = self.ctx.state.snapshot().await;
            self.fetch_kubeconfig(&doc).await?;
        }

        info!(index, "configured k3s control plane");
        Ok(())
    }

    async fn join_workerplane(&self, index: usize) -> Result<()> {
        let doc = self.ctx.state.snapshot().await;
        let target = node_target(&doc, NodeRole::WorkerPlane, index)?;
        let version = Self::version(&doc)?;
        let token = Self::token(&doc).ok_or_else(|| {
            Error::validation("k3s server token missing, control plane 0 must be configured first")
        })?;
        let (_, private_lb) = load_balancer(&doc)?;

        info!(index, "joining k3s worker plane");
        self.ctx
            .executor
            .fast()
            .run(
                &target,
                scripts::worker(&version, &private_lb, &token),
                OutputMode::WithoutOutput,
            )
            .await
            .step(&format!("k3s worker plane {index} join"))?;

        info!(index, "configured k3s worker plane");
        Ok(())
    }

    async fn k8s_version(&self, requested: &str) -> Result<String> {
        let releases = self.ctx.poller.releases("k3s-io", "k3s").await?;
        let version = resolve_version(PROVIDER, &releases, requested, exact, with_k3s_suffix)?;

        self.ctx
            .state
            .update("k3s version", |doc| doc.versions.k3s = Some(version.clone()))
            .await?;
        debug!(version = %version, "resolved k3s version");
        Ok(version)
    }

    async fn cni(&self, name: &str) -> Result<bool> {
        let external = !BUILTIN_CNI.contains(&name);
        self.ctx
            .state
            .update("k3s cni", |doc| {
                if let Some(b) = doc.k8s_bootstrap.as_mut() {
                    b.k3s.get_or_insert_with(K3sBootstrapState::default).external_cni = external;
                }
            })
            .await?;
        debug!(cni = name, external, "k3s cni selected");
        Ok(external)
    }
}

#[cfg(test)]
mod tests;
