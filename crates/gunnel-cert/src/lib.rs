//! Self-signed certificate generation for development and testing.
//!
//! Production hubs obtain their certificate from an external provider
//! (ACME); this crate only covers the zero-config local path so a hub can
//! come up with TLS 1.3 on the QUIC listener without any ceremony.

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CertError {
    #[error("certificate generation failed: {0}")]
    GenerationFailed(String),

    #[error("key serialization failed: {0}")]
    KeyFailed(String),
}

/// A generated certificate with its private key, in both DER (for quinn)
/// and PEM (for file storage) forms.
pub struct SelfSignedCert {
    pub cert_der: CertificateDer<'static>,
    pub key_der: PrivateKeyDer<'static>,
    pub cert_pem: String,
    pub key_pem: String,
}

impl SelfSignedCert {
    pub fn save_to_files(&self, cert_path: &str, key_path: &str) -> std::io::Result<()> {
        std::fs::write(cert_path, &self.cert_pem)?;
        std::fs::write(key_path, &self.key_pem)
    }
}

/// Generate an ephemeral self-signed certificate valid for localhost and
/// wildcard subdomains of the given domain.
///
/// Clients connecting to a hub running on such a certificate must opt in
/// to insecure verification.
pub fn generate_self_signed(domain: &str) -> Result<SelfSignedCert, CertError> {
    let mut params = rcgen::CertificateParams::default();

    let mut dn = rcgen::DistinguishedName::new();
    dn.push(rcgen::DnType::CommonName, "Gunnel Development Certificate");
    dn.push(rcgen::DnType::OrganizationName, "Gunnel Dev");
    params.distinguished_name = dn;

    let mut sans = vec![
        rcgen::SanType::DnsName(
            rcgen::Ia5String::try_from("localhost")
                .map_err(|e| CertError::GenerationFailed(e.to_string()))?,
        ),
        rcgen::SanType::IpAddress(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)),
        rcgen::SanType::IpAddress(std::net::IpAddr::V6(std::net::Ipv6Addr::LOCALHOST)),
    ];
    if !domain.is_empty() {
        for name in [domain.to_string(), format!("*.{domain}")] {
            sans.push(rcgen::SanType::DnsName(
                rcgen::Ia5String::try_from(name.as_str())
                    .map_err(|e| CertError::GenerationFailed(e.to_string()))?,
            ));
        }
    }
    params.subject_alt_names = sans;

    let key_pair =
        rcgen::KeyPair::generate().map_err(|e| CertError::GenerationFailed(e.to_string()))?;

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CertError::GenerationFailed(e.to_string()))?;

    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| CertError::KeyFailed(format!("{e:?}")))?;

    Ok(SelfSignedCert {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
        cert_der: cert.der().clone(),
        key_der,
    })
}
