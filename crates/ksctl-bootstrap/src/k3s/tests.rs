use super::*;
use crate::test_support::{bootstrapped_doc, Harness};

const TOKEN: &str = "K10abcdef::server:secret";

async fn ready(cps: usize, wps: usize) -> (Harness, K3s) {
    let h = Harness::new(bootstrapped_doc(cps, wps, 1));
    let k3s = K3s::new(h.ctx.clone());
    k3s.setup(Operation::Create).await.unwrap();
    k3s.k8s_version("").await.unwrap();
    h.transport
        .respond("/var/lib/rancher/k3s/server/token", &format!("{TOKEN}\n"));
    h.transport.respond(
        "/etc/rancher/k3s/k3s.yaml",
        "clusters:\n- cluster:\n    server: https://127.0.0.1:6443\n  name: default\ncurrent-context: default\n",
    );
    (h, k3s)
}

#[tokio::test]
async fn setup_marks_the_cluster_as_k3s() {
    let h = Harness::new(bootstrapped_doc(1, 0, 1));
    let k3s = K3s::new(h.ctx.clone());

    k3s.setup(Operation::Create).await.unwrap();

    let doc = h.store.snapshot().unwrap();
    assert_eq!(doc.bootstrap_provider.as_deref(), Some("k3s"));
    assert!(doc.k8s_bootstrap.unwrap().k3s.is_some());
}

#[tokio::test]
async fn setup_without_pre_bootstrap_fails() {
    let mut doc = bootstrapped_doc(1, 0, 1);
    doc.k8s_bootstrap = None;
    let h = Harness::new(doc);

    assert!(K3s::new(h.ctx.clone()).setup(Operation::Create).await.is_err());
    assert_eq!(h.store.write_count(), 0);
}

#[tokio::test]
async fn version_requests_gain_the_k3s_suffix() {
    let h = Harness::new(bootstrapped_doc(1, 0, 1));
    let k3s = K3s::new(h.ctx.clone());

    assert_eq!(k3s.k8s_version("v1.30.3").await.unwrap(), "v1.30.3+k3s1");
    assert_eq!(h.doc().await.versions.k3s.as_deref(), Some("v1.30.3+k3s1"));

    let err = k3s.k8s_version("v1.29.0").await.unwrap_err();
    assert!(matches!(
        err,
        Error::Common(ksctl_common::Error::InvalidVersion { .. })
    ));
}

#[tokio::test]
async fn only_flannel_is_builtin() {
    let h = Harness::new(bootstrapped_doc(1, 0, 1));
    let k3s = K3s::new(h.ctx.clone());

    assert!(!k3s.cni("flannel").await.unwrap());
    assert!(!k3s.cni("").await.unwrap());
    assert!(k3s.cni("cilium").await.unwrap());

    let stored = h.store.snapshot().unwrap();
    assert!(K3s::external_cni(&stored));
}

/// Story: A resumed process never asks for the CNI again
///
/// The first process chose cilium and stopped before control plane 1. A
/// fresh `K3s` over the persisted document must still disable flannel.
#[tokio::test]
async fn story_resumed_join_keeps_flannel_disabled() {
    let (h, k3s) = ready(3, 0).await;
    k3s.cni("cilium").await.unwrap();
    k3s.configure_control_plane(0).await.unwrap();

    let resumed = Harness::new(h.store.snapshot().unwrap());
    let k3s = K3s::new(resumed.ctx.clone());
    k3s.configure_control_plane(1).await.unwrap();

    let joined = resumed.transport.executed_on("203.0.113.11");
    assert!(joined.iter().any(|c| c.contains("--flannel-backend=none")));
}

/// Story: A three server k3s cluster comes up behind the load balancer
///
/// Server 0 installs and hands out its token, the other servers join with
/// it, and only the last one triggers the kubeconfig download.
#[tokio::test]
async fn story_three_servers_share_one_token() {
    let (h, k3s) = ready(3, 0).await;
    k3s.cni("cilium").await.unwrap();

    k3s.configure_control_plane(0).await.unwrap();
    let doc = h.doc().await;
    assert_eq!(
        doc.k8s_bootstrap.as_ref().unwrap().k3s.as_ref().unwrap().k3s_token.as_deref(),
        Some(TOKEN)
    );
    assert!(doc.cluster_kubeconfig.is_none());

    k3s.configure_control_plane(1).await.unwrap();
    assert!(h.doc().await.cluster_kubeconfig.is_none());

    k3s.configure_control_plane(2).await.unwrap();
    let doc = h.doc().await;
    let kubeconfig = doc.cluster_kubeconfig.unwrap();
    assert!(kubeconfig.contains("server: https://203.0.113.9:6443"));
    assert!(kubeconfig.contains("current-context: demo-fra1-selfmanaged-aws-ksctl"));
    assert_eq!(
        doc.cluster_kubeconfig_context.as_deref(),
        Some("demo-fra1-selfmanaged-aws-ksctl")
    );

    let joined = h.transport.executed_on("203.0.113.12");
    assert!(joined.iter().any(|c| c.contains(&format!("--token {TOKEN}"))
        && c.contains("--server https://10.0.0.9:6443")
        && c.contains("--flannel-backend=none")));
    assert_eq!(h.transport.count_on("203.0.113.10", "k3s/server/token"), 1);
    assert_eq!(h.transport.count_on("203.0.113.10", "k3s.yaml"), 1);
}

#[tokio::test]
async fn rerunning_server_zero_reinstalls_but_keeps_the_token() {
    let (h, k3s) = ready(3, 0).await;

    k3s.configure_control_plane(0).await.unwrap();
    k3s.configure_control_plane(0).await.unwrap();

    assert_eq!(h.transport.count("control-setup.sh &>> ksctl.log"), 2);
    assert_eq!(h.transport.count("k3s/server/token"), 1);
}

#[tokio::test]
async fn single_server_cluster_fetches_kubeconfig_from_server_zero() {
    let (h, k3s) = ready(1, 0).await;

    k3s.configure_control_plane(0).await.unwrap();

    assert!(h.doc().await.cluster_kubeconfig.is_some());
}

#[tokio::test]
async fn joining_before_server_zero_is_rejected() {
    let (h, k3s) = ready(3, 1).await;

    let err = k3s.configure_control_plane(1).await.unwrap_err();
    assert!(err.to_string().contains("control plane 0 must be configured first"));
    assert!(k3s.join_workerplane(0).await.is_err());
    assert!(h.transport.executed().is_empty());
}

#[tokio::test]
async fn worker_joins_with_server_token() {
    let (h, k3s) = ready(1, 2).await;
    k3s.configure_control_plane(0).await.unwrap();
    let writes = h.store.write_count();

    k3s.join_workerplane(1).await.unwrap();

    let cmds = h.transport.executed_on("203.0.113.21");
    assert_eq!(cmds.len(), 1);
    assert!(cmds[0].contains(&format!("agent --token {TOKEN} --server https://10.0.0.9:6443")));
    assert_eq!(h.store.write_count(), writes);
}

#[tokio::test]
async fn failed_install_leaves_state_untouched() {
    let (h, k3s) = ready(1, 0).await;
    h.transport.fail("control-setup.sh", 9, "curl: (6) could not resolve host");

    let err = k3s.configure_control_plane(0).await.unwrap_err();

    assert!(err.to_string().starts_with("k3s control plane 0 install"));
    let doc = h.doc().await;
    assert!(doc.k8s_bootstrap.unwrap().k3s.unwrap().k3s_token.is_none());
    assert_eq!(h.transport.count("k3s/server/token"), 0);
}
