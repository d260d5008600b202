//! k3s node scripts

use ksctl_common::API_SERVER_PORT;
use ksctl_ssh::{Script, ScriptPipeline};

use crate::pki::EtcdCertificates;
use crate::scripts::{etcd_client_endpoints, run_as_file, store_etcd_certs};

/// Where k3s servers read the etcd client certificates from
pub(crate) const CERT_DIR: &str = "/var/lib/etcd";

const INSTALL_RETRIES: u32 = 9;
const WORKER_RETRIES: u32 = 3;

/// Inputs of a k3s server install
pub(crate) struct ServerInstall<'a> {
    pub version: &'a str,
    pub datastore_private_ips: &'a [&'a str],
    pub public_lb: &'a str,
    pub private_lb: &'a str,
    pub external_cni: bool,
    /// Set when joining an existing cluster
    pub join_token: Option<&'a str>,
}

/// Certificates then the server install for one control plane
pub(crate) fn control_plane(certs: &EtcdCertificates, install: &ServerInstall<'_>) -> ScriptPipeline {
    ScriptPipeline::new()
        .with(store_etcd_certs(CERT_DIR, certs))
        .with(server(install))
}

fn server(p: &ServerInstall<'_>) -> Script {
    let mut flags = Vec::new();
    if let Some(token) = p.join_token {
        flags.push(format!("--token {token}"));
    }
    flags.push("--node-taint CriticalAddonsOnly=true:NoExecute".to_string());
    flags.push(format!(
        "--datastore-endpoint \"{}\"",
        etcd_client_endpoints(p.datastore_private_ips)
    ));
    flags.push(format!("--datastore-cafile={CERT_DIR}/ca.pem"));
    flags.push(format!("--datastore-keyfile={CERT_DIR}/etcd-key.pem"));
    flags.push(format!("--datastore-certfile={CERT_DIR}/etcd.pem"));
    if p.external_cni {
        flags.push("--flannel-backend=none".to_string());
        flags.push("--disable-network-policy".to_string());
    }
    if p.join_token.is_some() {
        flags.push(format!("--server https://{}:{API_SERVER_PORT}", p.private_lb));
    }
    flags.push(format!("--tls-san {}", p.public_lb));
    flags.push(format!("--tls-san {}", p.private_lb));

    let (file, name) = match (p.join_token.is_some(), p.external_cni) {
        (false, false) => ("control-setup.sh", "start k3s control plane 0 with flannel"),
        (false, true) => ("control-setup.sh", "start k3s control plane 0 without cni"),
        (true, false) => ("control-setupN.sh", "join k3s control plane with flannel"),
        (true, true) => ("control-setupN.sh", "join k3s control plane without cni"),
    };

    let content = format!(
        "/bin/bash /usr/local/bin/k3s-uninstall.sh || echo \"already deleted\"\n\
         curl -sfL https://get.k3s.io | INSTALL_K3S_CHANNEL=\"{}\" sh -s - server \\\n\t{}",
        p.version,
        flags.join(" \\\n\t")
    );

    Script::new(name, run_as_file(file, &content)).retry(INSTALL_RETRIES)
}

/// Read the server token from control plane 0
pub(crate) fn server_token() -> ScriptPipeline {
    ScriptPipeline::new().with(Script::new(
        "get k3s server token",
        "sudo cat /var/lib/rancher/k3s/server/token\n",
    ))
}

/// Read the admin kubeconfig from control plane 0
pub(crate) fn kubeconfig() -> ScriptPipeline {
    ScriptPipeline::new().with(Script::new(
        "get k3s kubeconfig",
        "sudo cat /etc/rancher/k3s/k3s.yaml\n",
    ))
}

/// Join a worker through the load balancer
pub(crate) fn worker(version: &str, private_lb: &str, token: &str) -> ScriptPipeline {
    let content = format!(
        "/bin/bash /usr/local/bin/k3s-agent-uninstall.sh || echo \"already deleted\"\n\
         export K3S_DEBUG=true\n\
         curl -sfL https://get.k3s.io | INSTALL_K3S_CHANNEL=\"{version}\" sh -s - agent --token {token} --server https://{private_lb}:{API_SERVER_PORT}"
    );
    ScriptPipeline::new().with(
        Script::new("join k3s worker plane", run_as_file("worker-setup.sh", &content))
            .retry(WORKER_RETRIES),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn certs() -> EtcdCertificates {
        EtcdCertificates {
            ca_cert: "CA".into(),
            etcd_cert: "CERT".into(),
            etcd_key: "KEY".into(),
        }
    }

    fn install(join_token: Option<&'static str>, external_cni: bool) -> ServerInstall<'static> {
        ServerInstall {
            version: "v1.30.3+k3s1",
            datastore_private_ips: &["10.0.1.1", "10.0.1.2"],
            public_lb: "203.0.113.9",
            private_lb: "10.0.0.9",
            external_cni,
            join_token,
        }
    }

    #[test]
    fn first_server_points_at_external_etcd() {
        let mut p = control_plane(&certs(), &install(None, false));
        assert_eq!(p.len(), 2);
        assert_eq!(p.next_script().unwrap().name, "store etcd certificates");

        let server = p.next_script().unwrap();
        assert_eq!(server.max_retries, 9);
        let body = &server.body;
        assert!(body.contains("cat <<EOF > control-setup.sh"));
        assert!(body.contains("k3s-uninstall.sh || echo"));
        assert!(body.contains("INSTALL_K3S_CHANNEL=\"v1.30.3+k3s1\" sh -s - server"));
        assert!(body.contains(
            "--datastore-endpoint \"https://10.0.1.1:2379,https://10.0.1.2:2379\""
        ));
        assert!(body.contains("--datastore-cafile=/var/lib/etcd/ca.pem"));
        assert!(body.contains("--tls-san 203.0.113.9"));
        assert!(body.contains("--tls-san 10.0.0.9"));
        assert!(!body.contains("--flannel-backend=none"));
        assert!(!body.contains("--token"));
        assert!(body.contains("sudo ./control-setup.sh &>> ksctl.log"));
    }

    #[test]
    fn joining_server_without_cni_disables_flannel() {
        let mut p = control_plane(&certs(), &install(Some("K10tok"), true));
        p.next_script();
        let body = p.next_script().unwrap().body;

        assert!(body.contains("control-setupN.sh"));
        assert!(body.contains("--token K10tok"));
        assert!(body.contains("--server https://10.0.0.9:6443"));
        assert!(body.contains("--flannel-backend=none"));
        assert!(body.contains("--disable-network-policy"));
    }

    #[test]
    fn worker_joins_through_private_lb() {
        let mut p = worker("v1.30.3+k3s1", "10.0.0.9", "K10tok");
        let script = p.next_script().unwrap();
        assert_eq!(script.max_retries, 3);
        assert!(script.body.contains("k3s-agent-uninstall.sh"));
        assert!(script.body.contains("export K3S_DEBUG=true"));
        assert!(script
            .body
            .contains("sh -s - agent --token K10tok --server https://10.0.0.9:6443"));
    }

    #[test]
    fn fetch_scripts_run_once() {
        let mut token = server_token();
        assert!(!token.next_script().unwrap().can_retry);
        let mut kubeconfig = kubeconfig();
        assert!(kubeconfig
            .next_script()
            .unwrap()
            .body
            .contains("/etc/rancher/k3s/k3s.yaml"));
    }
}
