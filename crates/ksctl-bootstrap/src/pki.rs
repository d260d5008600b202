//! etcd certificate authority
//!
//! The external datastore is secured with a dedicated CA. One certificate
//! signed by it serves as the etcd server and peer certificate and as the
//! client certificate the API servers present, so its SANs cover every
//! datastore member plus loopback.

use std::net::IpAddr;

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use tracing::debug;

use crate::error::{Error, Result};

/// Validity of the etcd CA (2 years)
pub const CA_VALIDITY_DAYS: i64 = 2 * 365;

/// Validity of the etcd certificate (1 year)
pub const CERT_VALIDITY_DAYS: i64 = 365;

const CA_COMMON_NAME: &str = "etcd cluster";
const CERT_COMMON_NAME: &str = "etcd";
const ORGANIZATION: &str = "ksctl";

/// PEM encoded etcd CA and the certificate it signed
#[derive(Clone)]
pub struct EtcdCertificates {
    /// CA certificate
    pub ca_cert: String,
    /// etcd server/client certificate
    pub etcd_cert: String,
    /// Private key of `etcd_cert`
    pub etcd_key: String,
}

impl std::fmt::Debug for EtcdCertificates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdCertificates")
            .field("ca_cert", &self.ca_cert.len())
            .field("etcd_cert", &self.etcd_cert.len())
            .field("etcd_key", &"<redacted>")
            .finish()
    }
}

fn validity(days: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    (now, now + ::time::Duration::days(days))
}

fn name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(ORGANIZATION.to_string()),
    );
    dn
}

/// Subject alternative names for the etcd certificate
fn etcd_sans(datastore_private_ips: &[String]) -> Result<Vec<SanType>> {
    let mut sans = vec![SanType::IpAddress(IpAddr::from([127, 0, 0, 1]))];
    for ip in datastore_private_ips {
        let addr: IpAddr = ip
            .parse()
            .map_err(|_| Error::validation(format!("invalid datastore private ip '{ip}'")))?;
        sans.push(SanType::IpAddress(addr));
    }
    let localhost = Ia5String::try_from("localhost".to_string())
        .map_err(|e| Error::pki(format!("invalid DNS name 'localhost': {e}")))?;
    sans.push(SanType::DnsName(localhost));
    Ok(sans)
}

/// Generate the etcd CA and a certificate valid for every datastore
pub fn generate_etcd_certs(datastore_private_ips: &[String]) -> Result<EtcdCertificates> {
    let sans = etcd_sans(datastore_private_ips)?;

    let mut ca_params = CertificateParams::default();
    ca_params.distinguished_name = name(CA_COMMON_NAME);
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let (not_before, not_after) = validity(CA_VALIDITY_DAYS);
    ca_params.not_before = not_before;
    ca_params.not_after = not_after;

    let ca_key = KeyPair::generate()
        .map_err(|e| Error::pki(format!("failed to generate CA key: {e}")))?;
    let ca_cert = ca_params
        .self_signed(&ca_key)
        .map_err(|e| Error::pki(format!("failed to create CA cert: {e}")))?;
    let ca_cert_pem = ca_cert.pem();

    let mut params = CertificateParams::default();
    params.distinguished_name = name(CERT_COMMON_NAME);
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    let (not_before, not_after) = validity(CERT_VALIDITY_DAYS);
    params.not_before = not_before;
    params.not_after = not_after;
    params.subject_alt_names = sans;

    let etcd_key = KeyPair::generate()
        .map_err(|e| Error::pki(format!("failed to generate etcd key: {e}")))?;
    let issuer = Issuer::from_ca_cert_pem(&ca_cert_pem, &ca_key)
        .map_err(|e| Error::pki(format!("failed to create issuer: {e}")))?;
    let etcd_cert = params
        .signed_by(&etcd_key, &issuer)
        .map_err(|e| Error::pki(format!("failed to sign etcd cert: {e}")))?;

    debug!(
        members = datastore_private_ips.len(),
        "generated etcd certificate authority"
    );

    Ok(EtcdCertificates {
        ca_cert: ca_cert_pem,
        etcd_cert: etcd_cert.pem(),
        etcd_key: etcd_key.serialize_pem(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use x509_parser::extensions::GeneralName;
    use x509_parser::pem::parse_x509_pem;

    fn ips() -> Vec<String> {
        vec!["10.0.1.10".to_string(), "10.0.1.11".to_string()]
    }

    #[test]
    fn etcd_cert_covers_every_datastore_and_loopback() {
        let certs = generate_etcd_certs(&ips()).unwrap();

        let (_, pem) = parse_x509_pem(certs.etcd_cert.as_bytes()).unwrap();
        let cert = pem.parse_x509().unwrap();
        let san = cert.subject_alternative_name().unwrap().unwrap();

        let ips: Vec<String> = san
            .value
            .general_names
            .iter()
            .filter_map(|n| match n {
                GeneralName::IPAddress(b) if b.len() == 4 => {
                    Some(IpAddr::from([b[0], b[1], b[2], b[3]]).to_string())
                }
                _ => None,
            })
            .collect();
        assert_eq!(ips, vec!["127.0.0.1", "10.0.1.10", "10.0.1.11"]);
        assert!(san
            .value
            .general_names
            .iter()
            .any(|n| matches!(n, GeneralName::DNSName("localhost"))));
    }

    #[test]
    fn etcd_cert_is_signed_by_the_ca() {
        let certs = generate_etcd_certs(&ips()).unwrap();

        let (_, ca_pem) = parse_x509_pem(certs.ca_cert.as_bytes()).unwrap();
        let ca = ca_pem.parse_x509().unwrap();
        let (_, leaf_pem) = parse_x509_pem(certs.etcd_cert.as_bytes()).unwrap();
        let leaf = leaf_pem.parse_x509().unwrap();

        assert!(ca.is_ca());
        assert_eq!(leaf.issuer().to_string(), ca.subject().to_string());
        assert!(certs.etcd_key.contains("PRIVATE KEY"));
    }

    #[test]
    fn ca_outlives_the_leaf() {
        let certs = generate_etcd_certs(&ips()).unwrap();
        let (_, ca_pem) = parse_x509_pem(certs.ca_cert.as_bytes()).unwrap();
        let (_, leaf_pem) = parse_x509_pem(certs.etcd_cert.as_bytes()).unwrap();

        let ca_end = ca_pem.parse_x509().unwrap().validity().not_after.timestamp();
        let leaf_end = leaf_pem.parse_x509().unwrap().validity().not_after.timestamp();
        assert!(ca_end > leaf_end);
    }

    #[test]
    fn malformed_ip_is_a_validation_error() {
        let err = generate_etcd_certs(&["10.0.1.300".to_string()]).unwrap_err();
        assert!(matches!(err, Error::Common(_)));
    }
}
