//! TLS setup for the device tunnel listener

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::info;

/// Build a TLS acceptor from PEM certificate chain and private key files.
pub fn load_tls_acceptor(cert_path: &Path, key_path: &Path) -> anyhow::Result<TlsAcceptor> {
    info!("Loading TLS certificate from: {}", cert_path.display());
    let cert_file = File::open(cert_path)
        .with_context(|| format!("Failed to open cert file {}", cert_path.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse certs")?;

    info!("Loading TLS private key from: {}", key_path.display());
    let key_file = File::open(key_path)
        .with_context(|| format!("Failed to open key file {}", key_path.display()))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .context("Failed to parse key")?
        .context("No private key found")?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Invalid cert/key")?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_cert_file_is_an_error() {
        let result = load_tls_acceptor(
            Path::new("/nonexistent/cert.pem"),
            Path::new("/nonexistent/key.pem"),
        );
        assert!(result.is_err());
    }
}
