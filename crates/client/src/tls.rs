//! Server certificate verification with optional pinning.
//!
//! Certificates are first checked against the bundled web PKI roots. Only
//! when that fails does a pin get a say:
//!
//! - a subject pin accepts a chain that is valid for the pinned name instead
//!   of the host used to connect (the certificate is trusted, the name is not);
//! - a thumbprint pin accepts exactly one certificate, self-signed or not,
//!   identified by its SHA-1 (or SHA-256) fingerprint.
//!
//! When both are given the subject pin decides.

use std::net::IpAddr;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{ClientError, Result};

/// Accepted fallbacks when normal validation fails.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificatePin {
    /// Name the certificate must be valid for.
    pub subject: Option<String>,
    /// Hex fingerprint of the expected certificate.
    pub thumbprint: Option<String>,
}

impl CertificatePin {
    pub fn is_empty(&self) -> bool {
        self.subject.is_none() && self.thumbprint.is_none()
    }
}

/// Uppercase hex SHA-1 of a DER certificate, as Windows shows thumbprints.
pub fn sha1_thumbprint(der: &[u8]) -> String {
    hex::encode_upper(Sha1::digest(der))
}

pub fn sha256_thumbprint(der: &[u8]) -> String {
    hex::encode_upper(Sha256::digest(der))
}

fn normalize_thumbprint(value: &str) -> String {
    value
        .chars()
        .filter(|c| !matches!(c, ':' | ' ' | '-'))
        .collect::<String>()
        .to_ascii_uppercase()
}

/// Parses a host into the name rustls checks the certificate against.
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    if let Ok(ip) = host.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }
    ServerName::try_from(host.to_string())
        .map_err(|_| ClientError::Tls(format!("invalid server name {host}")))
}

/// Web PKI verification first, then the pin.
#[derive(Debug)]
pub struct PinnedVerifier {
    inner: Arc<WebPkiServerVerifier>,
    subject: Option<ServerName<'static>>,
    thumbprint: Option<String>,
}

impl PinnedVerifier {
    pub fn new(roots: RootCertStore, pin: &CertificatePin) -> Result<Self> {
        let inner = WebPkiServerVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| ClientError::Tls(e.to_string()))?;
        let subject = pin.subject.as_deref().map(server_name).transpose()?;
        Ok(Self {
            inner,
            subject,
            thumbprint: pin.thumbprint.as_deref().map(normalize_thumbprint),
        })
    }

    fn thumbprint_matches(&self, end_entity: &CertificateDer<'_>) -> bool {
        match &self.thumbprint {
            Some(expected) => {
                *expected == sha1_thumbprint(end_entity) || *expected == sha256_thumbprint(end_entity)
            }
            None => false,
        }
    }
}

impl ServerCertVerifier for PinnedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let error = match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Ok(verified) => return Ok(verified),
            Err(error) => error,
        };

        // A subject pin decides alone; the thumbprint is not consulted.
        if let Some(subject) = &self.subject {
            return match self.inner.verify_server_cert(
                end_entity,
                intermediates,
                subject,
                ocsp_response,
                now,
            ) {
                Ok(verified) => {
                    debug!(subject = ?subject, "Accepted certificate by subject");
                    Ok(verified)
                }
                Err(e) => {
                    warn!(subject = ?subject, error = %e, "Certificate rejected for the pinned subject");
                    Err(error)
                }
            };
        }

        if self.thumbprint_matches(end_entity) {
            debug!("Accepted certificate by thumbprint");
            return Ok(ServerCertVerified::assertion());
        }
        Err(error)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

fn web_pki_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    roots
}

/// Client config for `https`/`wss` endpoints.
pub fn client_config(pin: &CertificatePin) -> Result<rustls::ClientConfig> {
    let verifier = PinnedVerifier::new(web_pki_roots(), pin)?;
    let mut config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}
