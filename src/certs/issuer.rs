//! Certificate issuance for a fleet run: one self-signed CA and one
//! multi-SAN leaf shared by every TLS-terminating worker.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SanType, SerialNumber, PKCS_ECDSA_P256_SHA256,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::errors::{FleetError, Result};

const CA_COMMON_NAME: &str = "hydra root CA";
const LEAF_COMMON_NAME: &str = "hydra backend";
const ORGANIZATION: &str = "hydra";

/// PEM-encoded CA and leaf material for one run.
///
/// Field names on the wire match what downstream config generators already consume.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateBundle {
    #[serde(rename = "LeafCertPEM")]
    pub leaf_cert_pem: String,
    #[serde(rename = "LeafKeyPEM")]
    pub leaf_key_pem: String,
    #[serde(rename = "RootCACertPEM")]
    pub root_ca_cert_pem: String,
    #[serde(rename = "RootCAKeyPEM")]
    pub root_ca_key_pem: String,
}

impl std::fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("leaf_cert_pem", &self.leaf_cert_pem.len())
            .field("root_ca_cert_pem", &self.root_ca_cert_pem.len())
            .finish_non_exhaustive()
    }
}

/// Subject alternative names split by extension.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubjectAltNames {
    pub dns_names: BTreeSet<String>,
    pub ip_addresses: BTreeSet<IpAddr>,
}

impl SubjectAltNames {
    /// Partition `names` into IP literals and hostnames. Loopback v4/v6 are
    /// always present; blank entries are dropped.
    pub fn partition<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut sans = SubjectAltNames::default();
        sans.ip_addresses.insert(IpAddr::V4(Ipv4Addr::LOCALHOST));
        sans.ip_addresses.insert(IpAddr::V6(Ipv6Addr::LOCALHOST));

        for name in names {
            let name = name.as_ref().trim();
            if name.is_empty() {
                continue;
            }
            match name.parse::<IpAddr>() {
                Ok(ip) => {
                    sans.ip_addresses.insert(ip);
                }
                Err(_) => {
                    sans.dns_names.insert(name.to_string());
                }
            }
        }

        sans
    }

    fn to_rcgen(&self) -> Result<Vec<SanType>> {
        let mut out = Vec::with_capacity(self.dns_names.len() + self.ip_addresses.len());
        for name in &self.dns_names {
            let dns = name.as_str().try_into().map_err(|e: rcgen::Error| FleetError::CertificateGeneration {
                message: format!("invalid DNS name '{}': {}", name, e),
                source: Some(e),
            })?;
            out.push(SanType::DnsName(dns));
        }
        out.extend(self.ip_addresses.iter().copied().map(SanType::IpAddress));
        Ok(out)
    }
}

/// Issue a fresh CA and a leaf signed by it, valid for every entry of `names`
/// plus loopback.
pub fn issue<I, S>(not_before: OffsetDateTime, not_after: OffsetDateTime, names: I) -> Result<CertificateBundle>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    if not_after <= not_before {
        return Err(FleetError::certificate(format!(
            "validity window is empty: not_before {} is not before not_after {}",
            not_before, not_after
        )));
    }

    let sans = SubjectAltNames::partition(names);

    let ca_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
    let mut ca_params = CertificateParams::default();
    ca_params.distinguished_name.push(DnType::CommonName, CA_COMMON_NAME);
    ca_params.distinguished_name.push(DnType::OrganizationName, ORGANIZATION);
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::DigitalSignature];
    ca_params.extended_key_usages =
        vec![ExtendedKeyUsagePurpose::ServerAuth, ExtendedKeyUsagePurpose::ClientAuth];
    ca_params.not_before = not_before;
    ca_params.not_after = not_after;
    ca_params.serial_number = Some(random_serial());
    let ca_cert = ca_params.self_signed(&ca_key)?;

    let leaf_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
    let mut leaf_params = CertificateParams::default();
    leaf_params.distinguished_name.push(DnType::CommonName, LEAF_COMMON_NAME);
    leaf_params.distinguished_name.push(DnType::OrganizationName, ORGANIZATION);
    leaf_params.is_ca = IsCa::NoCa;
    leaf_params.key_usages =
        vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
    leaf_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    leaf_params.subject_alt_names = sans.to_rcgen()?;
    leaf_params.not_before = not_before;
    leaf_params.not_after = not_after;
    leaf_params.serial_number = Some(random_serial());
    let leaf_cert = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key)?;

    debug!(
        dns_names = ?sans.dns_names,
        ip_addresses = ?sans.ip_addresses,
        "Issued leaf certificate"
    );
    info!(
        san_count = sans.dns_names.len() + sans.ip_addresses.len(),
        not_after = %not_after,
        "Generated fleet certificate authority and leaf certificate"
    );

    Ok(CertificateBundle {
        leaf_cert_pem: leaf_cert.pem(),
        leaf_key_pem: leaf_key.serialize_pem(),
        root_ca_cert_pem: ca_cert.pem(),
        root_ca_key_pem: ca_key.serialize_pem(),
    })
}

fn random_serial() -> SerialNumber {
    // 16 random bytes with the top bit cleared keeps the DER integer positive.
    let mut bytes = *uuid::Uuid::new_v4().as_bytes();
    bytes[0] &= 0x7f;
    SerialNumber::from_slice(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::time::Duration;
    use x509_parser::extensions::GeneralName;
    use x509_parser::prelude::*;

    fn one_year() -> (OffsetDateTime, OffsetDateTime) {
        let now = OffsetDateTime::now_utc();
        (now, now + Duration::days(365))
    }

    #[test]
    fn partition_splits_ips_and_hostnames() {
        let sans = SubjectAltNames::partition(["a.example", "10.1.2.3", " ", "fe80::1"]);
        assert!(sans.dns_names.contains("a.example"));
        assert!(sans.ip_addresses.contains(&"10.1.2.3".parse::<IpAddr>().unwrap()));
        assert!(sans.ip_addresses.contains(&"fe80::1".parse::<IpAddr>().unwrap()));
        assert!(sans.ip_addresses.contains(&IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert!(sans.ip_addresses.contains(&IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert_eq!(sans.dns_names.len(), 1);
    }

    #[test]
    fn leaf_carries_requested_and_loopback_sans() {
        let (nb, na) = one_year();
        let bundle = issue(nb, na, ["a.example", "127.0.0.1"]).expect("issue");

        let (_, pem) = x509_parser::pem::parse_x509_pem(bundle.leaf_cert_pem.as_bytes()).unwrap();
        let (_, cert) = X509Certificate::from_der(&pem.contents).unwrap();
        let san = cert.subject_alternative_name().unwrap().expect("SAN present");

        let mut dns = Vec::new();
        let mut ips = Vec::new();
        for name in &san.value.general_names {
            match name {
                GeneralName::DNSName(d) => dns.push(d.to_string()),
                GeneralName::IPAddress(raw) => ips.push(raw.to_vec()),
                _ => {}
            }
        }
        assert_eq!(dns, vec!["a.example".to_string()]);
        assert!(ips.contains(&vec![127, 0, 0, 1]));
        assert!(ips.contains(&Ipv6Addr::LOCALHOST.octets().to_vec()));
        assert_eq!(ips.len(), 2, "127.0.0.1 is deduplicated with the loopback default");
        assert!(!cert.is_ca());
    }

    #[test]
    fn root_is_a_ca() {
        let (nb, na) = one_year();
        let bundle = issue(nb, na, ["localhost"]).expect("issue");
        let (_, pem) = x509_parser::pem::parse_x509_pem(bundle.root_ca_cert_pem.as_bytes()).unwrap();
        let (_, cert) = X509Certificate::from_der(&pem.contents).unwrap();
        assert!(cert.is_ca());
        let usage = cert.key_usage().unwrap().expect("key usage present");
        assert!(usage.value.key_cert_sign());
    }

    #[test]
    fn every_issue_uses_fresh_keys() {
        let (nb, na) = one_year();
        let first = issue(nb, na, ["localhost"]).unwrap();
        let second = issue(nb, na, ["localhost"]).unwrap();
        assert_ne!(first.root_ca_key_pem, second.root_ca_key_pem);
        assert_ne!(first.leaf_key_pem, second.leaf_key_pem);
    }

    #[test]
    fn empty_validity_window_is_rejected() {
        let now = OffsetDateTime::now_utc();
        let err = issue(now, now, ["localhost"]).unwrap_err();
        assert!(matches!(err, FleetError::CertificateGeneration { .. }));
    }

    #[test]
    fn non_ascii_hostname_is_a_generation_error() {
        let (nb, na) = one_year();
        let err = issue(nb, na, ["bücher.example"]).unwrap_err();
        assert!(matches!(err, FleetError::CertificateGeneration { .. }));
    }

    #[test]
    fn bundle_json_uses_pem_field_names() {
        let bundle = CertificateBundle {
            leaf_cert_pem: "a".into(),
            leaf_key_pem: "b".into(),
            root_ca_cert_pem: "c".into(),
            root_ca_key_pem: "d".into(),
        };
        let value = serde_json::to_value(&bundle).unwrap();
        assert_eq!(value["LeafCertPEM"], "a");
        assert_eq!(value["LeafKeyPEM"], "b");
        assert_eq!(value["RootCACertPEM"], "c");
        assert_eq!(value["RootCAKeyPEM"], "d");
    }
}
