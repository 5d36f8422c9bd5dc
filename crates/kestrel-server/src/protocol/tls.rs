use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use kestrel_common::{KestrelError, Result};
use rustls::pki_types::CertificateDer;
use rustls::ServerConfig as RustlsConfig;
use tokio_rustls::TlsAcceptor;

/// Loads a PEM certificate chain and private key into a TLS acceptor that
/// advertises HTTP/2 and HTTP/1.1 over ALPN.
pub fn load_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    // Ignored when another provider is already installed
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cert_file = File::open(cert_path)
        .map_err(|e| KestrelError::Tls(format!("Failed to open certificate {}: {}", cert_path.display(), e)))?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .filter_map(|r| r.ok())
        .collect();
    if certs.is_empty() {
        return Err(KestrelError::Tls(format!(
            "No certificates found in {}",
            cert_path.display()
        )));
    }

    let key_file = File::open(key_path)
        .map_err(|e| KestrelError::Tls(format!("Failed to open key {}: {}", key_path.display(), e)))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| KestrelError::Tls(format!("Failed to read key {}: {}", key_path.display(), e)))?
        .ok_or_else(|| KestrelError::Tls(format!("No private key found in {}", key_path.display())))?;

    let mut config = RustlsConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}
