//! Transport configuration and TLS material.

use crate::{TransportError, TransportResult};
use quinn::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Tunables for QUIC sessions and streams. Defaults match the values the
/// protocol was designed against; all of them are exposed through the hub
/// and agent configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Keep-alive ping period.
    pub keep_alive_interval: Duration,
    /// Connection is dropped after this much silence.
    pub max_idle_timeout: Duration,
    /// Upper bound on concurrent bidirectional streams per session.
    pub max_concurrent_streams: u32,
    /// Budget for dial + TLS handshake.
    pub handshake_timeout: Duration,
    /// Per-call read/write deadline, refreshed on success.
    pub io_deadline: Duration,
    /// Janitor sweep period; streams inactive longer than this are closed.
    pub sweep_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: Duration::from_secs(15),
            max_idle_timeout: Duration::from_secs(120),
            max_concurrent_streams: 5000,
            handshake_timeout: Duration::from_secs(60),
            io_deadline: Duration::from_secs(15),
            sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> TransportResult<()> {
        if self.keep_alive_interval.is_zero() {
            return Err(TransportError::Config(
                "keep-alive interval must be > 0".to_string(),
            ));
        }
        if self.max_idle_timeout < self.keep_alive_interval * 2 {
            return Err(TransportError::Config(
                "idle timeout must be at least 2x the keep-alive interval".to_string(),
            ));
        }
        Ok(())
    }

    fn quinn_transport(&self) -> TransportResult<quinn::TransportConfig> {
        let mut transport = quinn::TransportConfig::default();
        transport.keep_alive_interval(Some(self.keep_alive_interval));
        transport.max_idle_timeout(Some(
            self.max_idle_timeout
                .try_into()
                .map_err(|_| TransportError::Config("idle timeout out of range".to_string()))?,
        ));
        transport.max_concurrent_bidi_streams(self.max_concurrent_streams.into());
        Ok(transport)
    }
}

/// Server certificate material: a chain plus its private key.
///
/// Production hubs get this from the certificate collaborator (ACME);
/// development hubs generate it via `gunnel-cert`.
pub struct ServerTls {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl ServerTls {
    /// Ephemeral self-signed material for local development and tests.
    pub fn self_signed(domain: &str) -> TransportResult<Self> {
        let cert = gunnel_cert::generate_self_signed(domain)
            .map_err(|e| TransportError::Tls(e.to_string()))?;
        Ok(Self {
            cert_chain: vec![cert.cert_der],
            key: cert.key_der,
        })
    }

    /// Load PEM-encoded certificate chain and private key from disk.
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> TransportResult<Self> {
        let cert_file = File::open(cert_path)
            .map_err(|e| TransportError::Tls(format!("failed to open cert file: {e}")))?;
        let cert_chain = rustls_pemfile::certs(&mut BufReader::new(cert_file))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TransportError::Tls(format!("failed to parse certs: {e}")))?;

        let key_file = File::open(key_path)
            .map_err(|e| TransportError::Tls(format!("failed to open key file: {e}")))?;
        let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
            .map_err(|e| TransportError::Tls(format!("failed to parse key: {e}")))?
            .ok_or_else(|| TransportError::Tls("no private key found".to_string()))?;

        Ok(Self { cert_chain, key })
    }

    pub(crate) fn build(
        self,
        config: &TransportConfig,
    ) -> TransportResult<quinn::ServerConfig> {
        let server_crypto = quinn::rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(self.cert_chain, self.key)
            .map_err(|e| TransportError::Tls(format!("invalid cert/key: {e}")))?;

        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
                .map_err(|e| TransportError::Tls(e.to_string()))?,
        ));
        server_config.transport_config(Arc::new(config.quinn_transport()?));

        Ok(server_config)
    }
}

/// Client-side verification mode.
#[derive(Debug, Clone, Default)]
pub struct ClientTls {
    /// Accept any server certificate. Off by default; only for development
    /// hubs running on self-signed certificates.
    pub insecure: bool,
}

impl ClientTls {
    pub fn insecure() -> Self {
        Self { insecure: true }
    }

    pub(crate) fn build(
        &self,
        config: &TransportConfig,
    ) -> TransportResult<quinn::ClientConfig> {
        let client_crypto = if self.insecure {
            quinn::rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(SkipVerification::new())
                .with_no_client_auth()
        } else {
            let mut roots = quinn::rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            quinn::rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        };

        let mut client_config = quinn::ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
                .map_err(|e| TransportError::Tls(e.to_string()))?,
        ));
        client_config.transport_config(Arc::new(config.quinn_transport()?));

        Ok(client_config)
    }
}

/// Certificate verifier that accepts anything. Explicit opt-in only.
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl quinn::rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &quinn::rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[quinn::rustls::pki_types::CertificateDer<'_>],
        _server_name: &quinn::rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: quinn::rustls::pki_types::UnixTime,
    ) -> Result<quinn::rustls::client::danger::ServerCertVerified, quinn::rustls::Error> {
        Ok(quinn::rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &quinn::rustls::pki_types::CertificateDer<'_>,
        _dss: &quinn::rustls::DigitallySignedStruct,
    ) -> Result<quinn::rustls::client::danger::HandshakeSignatureValid, quinn::rustls::Error> {
        Ok(quinn::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &quinn::rustls::pki_types::CertificateDer<'_>,
        _dss: &quinn::rustls::DigitallySignedStruct,
    ) -> Result<quinn::rustls::client::danger::HandshakeSignatureValid, quinn::rustls::Error> {
        Ok(quinn::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<quinn::rustls::SignatureScheme> {
        use quinn::rustls::SignatureScheme;
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
