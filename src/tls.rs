use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, ensure, Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

/// TLS acceptor for the proxy listener, built from the configured certificate
/// chain and private key. ALPN is pinned to HTTP/1.1, which is what the
/// request pipeline speaks.
pub fn build_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let certs = read_cert_chain(cert_path)?;
    let key = read_private_key(key_path)?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .with_context(|| {
            format!(
                "listener certificate {} rejected (key mismatch?)",
                cert_path.display()
            )
        })?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn read_cert_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let data = std::fs::read(path)
        .with_context(|| format!("failed to read listener certificate {}", path.display()))?;
    let certs = rustls_pemfile::certs(&mut &data[..])
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("failed to parse listener certificate {}", path.display()))?;
    ensure!(
        !certs.is_empty(),
        "no certificates found in {}",
        path.display()
    );
    Ok(certs)
}

fn read_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let data = std::fs::read(path)
        .with_context(|| format!("failed to read listener key {}", path.display()))?;
    // accepts PKCS#8, RSA, and SEC1 keys; the first key in the file wins
    match rustls_pemfile::private_key(&mut &data[..])
        .with_context(|| format!("failed to parse listener key {}", path.display()))?
    {
        Some(key) => Ok(key),
        None => bail!("no private key found in {}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_certificate_is_a_hard_error() {
        let err = build_tls_acceptor(
            Path::new("/nonexistent/server.crt"),
            Path::new("/nonexistent/server.key"),
        )
        .map(|_| ())
        .unwrap_err();
        assert!(err.to_string().contains("listener certificate"));
    }

    #[test]
    fn pem_without_certificates_is_rejected() {
        let dir = TempDir::new().unwrap();
        let cert = dir.path().join("server.crt");
        std::fs::write(&cert, b"not a pem file").unwrap();

        let err = read_cert_chain(&cert).unwrap_err();
        assert!(err.to_string().contains("no certificates found"));
    }

    #[test]
    fn pem_without_a_key_is_rejected() {
        let dir = TempDir::new().unwrap();
        let key = dir.path().join("server.key");
        std::fs::write(&key, b"not a pem file").unwrap();

        let err = read_private_key(&key).unwrap_err();
        assert!(err.to_string().contains("no private key found"));
    }
}
