//! TLS setup for the HTTP listener.

use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;

/// Loads a PEM certificate chain and private key into a server config.
///
/// ALPN is pinned to HTTP/1.1 since WebSocket upgrades need it.
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<rustls::ServerConfig> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("build server tls config")?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

/// Builds an acceptor from certificate and key files.
pub fn acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let config = load_server_config(cert_path, key_path)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = fs::File::open(path)
        .with_context(|| format!("open certificate {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("read certificate {}", path.display()))?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in {}", path.display());
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = fs::File::open(path)
        .with_context(|| format!("open private key {}", path.display()))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("read private key {}", path.display()))?
        .with_context(|| format!("no private key found in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_files_are_reported() {
        let temp = TempDir::new().unwrap();
        let err = load_server_config(&temp.path().join("cert.pem"), &temp.path().join("key.pem"))
            .unwrap_err();
        assert!(err.to_string().contains("open certificate"));
    }

    #[test]
    fn test_empty_certificate_file_is_rejected() {
        let temp = TempDir::new().unwrap();
        let cert = temp.path().join("cert.pem");
        let key = temp.path().join("key.pem");
        fs::write(&cert, "").unwrap();
        fs::write(&key, "").unwrap();

        let err = load_server_config(&cert, &key).unwrap_err();
        assert!(err.to_string().contains("no certificates found"));
    }

    #[test]
    fn test_missing_key_is_rejected() {
        let temp = TempDir::new().unwrap();
        let key = temp.path().join("key.pem");
        fs::write(&key, "not a pem file\n").unwrap();

        let err = load_key(&key).unwrap_err();
        assert!(err.to_string().contains("no private key found"));
    }
}
