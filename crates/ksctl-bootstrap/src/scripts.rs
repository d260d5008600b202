//! Script building blocks shared by every node role

use ksctl_common::REMOTE_LOG_FILE;
use ksctl_ssh::Script;

use crate::pki::EtcdCertificates;

/// Write the etcd CA, certificate and key into `dir` on the node
pub(crate) fn store_etcd_certs(dir: &str, certs: &EtcdCertificates) -> Script {
    Script::new(
        "store etcd certificates",
        format!(
            r#"
sudo mkdir -p {dir}

cat <<EOF > ca.pem
{ca}
EOF

cat <<EOF > etcd.pem
{cert}
EOF

cat <<EOF > etcd-key.pem
{key}
EOF

sudo mv -v ca.pem etcd.pem etcd-key.pem {dir}
"#,
            ca = certs.ca_cert.trim_end(),
            cert = certs.etcd_cert.trim_end(),
            key = certs.etcd_key.trim_end(),
        ),
    )
}

/// Write `content` to `file`, make it executable and run it with its output
/// appended to the remote log
pub(crate) fn run_as_file(file: &str, content: &str) -> String {
    format!(
        r#"
cat <<EOF > {file}
#!/bin/bash
{content}
EOF

sudo chmod +x {file}
sudo ./{file} &>> {REMOTE_LOG_FILE}
"#,
        content = content.trim()
    )
}

/// Comma separated `https://ip:2379` list for the etcd members
pub(crate) fn etcd_client_endpoints(private_ips: &[&str]) -> String {
    private_ips
        .iter()
        .map(|ip| format!("https://{ip}:{}", ksctl_common::ETCD_CLIENT_PORT))
        .collect::<Vec<_>>()
        .join(",")
}
