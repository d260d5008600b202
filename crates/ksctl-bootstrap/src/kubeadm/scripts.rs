//! kubeadm node scripts

use ksctl_common::{API_SERVER_PORT, ETCD_CLIENT_PORT, REMOTE_LOG_FILE};
use ksctl_ssh::{Script, ScriptPipeline};

use crate::pki::EtcdCertificates;
use crate::scripts::store_etcd_certs;

/// Where the API servers read the etcd client certificates from
pub(crate) const CERT_DIR: &str = "/etcd/kubernetes/pki/etcd";

/// Description attached to every bootstrap token ksctl creates
const TOKEN_DESCRIPTION: &str = "ksctl bootstrap token";

const POD_SUBNET: &str = "10.244.0.0/16";
const SERVICE_SUBNET: &str = "10.96.0.0/12";

/// Container runtime, kubelet, kubeadm and kubectl for `version` (`vX.Y`)
pub(crate) fn install_tools(version: &str) -> ScriptPipeline {
    ScriptPipeline::new()
        .with(Script::new(
            "disable swap and load kernel modules",
            r#"
sudo sed -i '/ swap / s/^\(.*\)$/#\1/g' /etc/fstab
sudo swapoff -a

cat <<EOF | sudo tee /etc/modules-load.d/k8s.conf
overlay
br_netfilter
EOF

sudo modprobe overlay
sudo modprobe br_netfilter

cat <<EOF | sudo tee /etc/sysctl.d/k8s.conf
net.bridge.bridge-nf-call-iptables  = 1
net.bridge.bridge-nf-call-ip6tables = 1
net.ipv4.ip_forward                 = 1
EOF

sudo sysctl --system
"#,
        ))
        .with(
            Script::new(
                "install containerd",
                r#"
sudo apt-get update -y
sudo apt-get install ca-certificates curl gnupg -y

sudo install -m 0755 -d /etc/apt/keyrings
curl -fsSL https://download.docker.com/linux/ubuntu/gpg | sudo gpg --dearmor -o /etc/apt/keyrings/docker.gpg --yes
sudo chmod a+r /etc/apt/keyrings/docker.gpg

echo \
  "deb [arch="$(dpkg --print-architecture)" signed-by=/etc/apt/keyrings/docker.gpg] https://download.docker.com/linux/ubuntu \
  "$(. /etc/os-release && echo "$VERSION_CODENAME")" stable" | \
  sudo tee /etc/apt/sources.list.d/docker.list > /dev/null

sudo apt-get update -y
sudo apt-get install containerd.io -y
"#,
            )
            .retry(3),
        )
        .with(Script::new(
            "containerd config",
            r#"
sudo mkdir -p /etc/containerd
containerd config default > config.toml
sudo mv -v config.toml /etc/containerd/config.toml
"#,
        ))
        .with(
            Script::new(
                "restart containerd with systemd cgroups",
                r#"
sudo sed -i 's/SystemdCgroup \= false/SystemdCgroup \= true/g' /etc/containerd/config.toml
sudo systemctl enable containerd
sudo systemctl restart containerd
"#,
            )
            .retry(3),
        )
        .with(
            Script::new(
                "install kubeadm, kubectl, kubelet",
                format!(
                    r#"
sudo apt-get update -y
sudo apt-get install -y apt-transport-https ca-certificates curl gpg

curl -fsSL https://pkgs.k8s.io/core:/stable:/{version}/deb/Release.key | sudo gpg --dearmor -o /etc/apt/keyrings/kubernetes-apt-keyring.gpg --yes

echo 'deb [signed-by=/etc/apt/keyrings/kubernetes-apt-keyring.gpg] https://pkgs.k8s.io/core:/stable:/{version}/deb/ /' | sudo tee /etc/apt/sources.list.d/kubernetes.list

sudo apt-get update -y
sudo apt-get install -y kubelet kubeadm kubectl
sudo systemctl enable kubelet
"#
                ),
            )
            .retry(9),
        )
        .with(Script::new(
            "hold kubernetes packages",
            "sudo apt-mark hold kubelet kubeadm kubectl\n",
        ))
}

/// Tools plus the etcd client certificates, run on every control plane
pub(crate) fn install_control_plane(version: &str, certs: &EtcdCertificates) -> ScriptPipeline {
    install_tools(version).with(store_etcd_certs(CERT_DIR, certs))
}

pub(crate) fn certificate_key() -> ScriptPipeline {
    ScriptPipeline::new().with(Script::new(
        "generate certificate key",
        "sudo kubeadm certs certificate-key\n",
    ))
}

pub(crate) fn generate_token() -> ScriptPipeline {
    ScriptPipeline::new().with(Script::new(
        "generate bootstrap token",
        "kubeadm token generate\n",
    ))
}

pub(crate) fn renew_token() -> ScriptPipeline {
    ScriptPipeline::new().with(Script::new(
        "renew bootstrap token",
        format!("kubeadm token create --ttl 20m --description \"{TOKEN_DESCRIPTION}\"\n"),
    ))
}

pub(crate) fn discovery_hash() -> ScriptPipeline {
    ScriptPipeline::new().with(Script::new(
        "fetch discovery token ca cert hash",
        "sudo openssl x509 -in /etc/kubernetes/pki/ca.crt -noout -pubkey | openssl rsa -pubin -outform DER 2>/dev/null | sha256sum | cut -d' ' -f1\n",
    ))
}

pub(crate) fn kubeconfig() -> ScriptPipeline {
    ScriptPipeline::new().with(Script::new(
        "fetch kubeconfig",
        "sudo cat /etc/kubernetes/admin.conf\n",
    ))
}

/// Inputs of `kubeadm init` on control plane 0
pub(crate) struct InitConfig<'a> {
    /// `vX.Y`; the patch release `.0` is appended
    pub version: &'a str,
    pub bootstrap_token: &'a str,
    pub certificate_key: &'a str,
    pub public_lb: &'a str,
    pub private_lb: &'a str,
    pub datastore_private_ips: &'a [&'a str],
}

fn external_etcd_endpoints(ips: &[&str]) -> String {
    ips.iter()
        .map(|ip| format!("    - https://{ip}:{ETCD_CLIENT_PORT}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// `kubeadm-config.yml` for the first control plane
pub(crate) fn init_config(c: &InitConfig<'_>) -> String {
    format!(
        r#"apiVersion: kubeadm.k8s.io/v1beta3
kind: InitConfiguration
bootstrapTokens:
- groups:
  - system:bootstrappers:kubeadm:default-node-token
  token: {token}
  ttl: 20m
  description: "{TOKEN_DESCRIPTION}"
  usages:
  - signing
  - authentication
certificateKey: {certificate_key}
nodeRegistration:
  criSocket: unix:///var/run/containerd/containerd.sock
  imagePullPolicy: IfNotPresent
  taints: null
---
apiVersion: kubeadm.k8s.io/v1beta3
kind: ClusterConfiguration
apiServer:
  timeoutForControlPlane: 4m0s
  certSANs:
    - "{private_lb}"
    - "{public_lb}"
    - "127.0.0.1"
certificatesDir: /etc/kubernetes/pki
clusterName: kubernetes
controllerManager: {{}}
dns: {{}}
etcd:
  external:
    endpoints:
{endpoints}
    caFile: "{CERT_DIR}/ca.pem"
    certFile: "{CERT_DIR}/etcd.pem"
    keyFile: "{CERT_DIR}/etcd-key.pem"
imageRepository: registry.k8s.io
kubernetesVersion: {version}.0
controlPlaneEndpoint: "{private_lb}:{API_SERVER_PORT}"
networking:
  dnsDomain: cluster.local
  serviceSubnet: {SERVICE_SUBNET}
  podSubnet: {POD_SUBNET}
scheduler: {{}}"#,
        token = c.bootstrap_token,
        certificate_key = c.certificate_key,
        private_lb = c.private_lb,
        public_lb = c.public_lb,
        endpoints = external_etcd_endpoints(c.datastore_private_ips),
        version = c.version,
    )
}

/// Write the init configuration and run `kubeadm init` unless already done
pub(crate) fn init(c: &InitConfig<'_>) -> ScriptPipeline {
    ScriptPipeline::new()
        .with(
            Script::new(
                "store kubeadm init configuration",
                format!("\ncat <<EOF > kubeadm-config.yml\n{}\nEOF\n", init_config(c)),
            )
            .retry(3),
        )
        .with(
            Script::new(
                "kubeadm init",
                format!(
                    r#"
if [ -f /etc/kubernetes/admin.conf ]; then
  echo "control plane already initialized" &>> {REMOTE_LOG_FILE}
else
  sudo kubeadm init --config kubeadm-config.yml --upload-certs &>> {REMOTE_LOG_FILE}
fi

mkdir -p $HOME/.kube
sudo cp -f /etc/kubernetes/admin.conf $HOME/.kube/config
sudo chown $(id -u):$(id -g) $HOME/.kube/config
"#
                ),
            )
            .retry(3),
        )
}

/// Credentials a node presents to `kubeadm join`
pub(crate) struct JoinCredentials<'a> {
    pub private_lb: &'a str,
    pub token: &'a str,
    pub discovery_hash: &'a str,
}

fn join(name: &str, creds: &JoinCredentials<'_>, control_plane_key: Option<&str>) -> ScriptPipeline {
    let control_plane = control_plane_key
        .map(|key| format!(" --control-plane --certificate-key {key}"))
        .unwrap_or_default();

    ScriptPipeline::new().with(
        Script::new(
            name,
            format!(
                r#"
if [ -f /etc/kubernetes/kubelet.conf ]; then
  echo "node already joined" &>> {REMOTE_LOG_FILE}
else
  sudo kubeadm join {lb}:{API_SERVER_PORT} --token {token} --discovery-token-ca-cert-hash sha256:{hash}{control_plane} &>> {REMOTE_LOG_FILE}
fi
"#,
                lb = creds.private_lb,
                token = creds.token,
                hash = creds.discovery_hash,
            ),
        )
        .retry(3),
    )
}

pub(crate) fn join_control_plane(creds: &JoinCredentials<'_>, certificate_key: &str) -> ScriptPipeline {
    join("join kubeadm control plane", creds, Some(certificate_key))
}

pub(crate) fn join_worker(creds: &JoinCredentials<'_>) -> ScriptPipeline {
    join("join kubeadm worker plane", creds, None)
}
