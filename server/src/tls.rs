//! TLS configuration

use anyhow::{Context, Result};
use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer},
    ServerConfig as RustlsConfig,
};
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::info;

use crate::config::ServerConfig;

/// Configure TLS for the server
pub async fn configure_tls(config: &ServerConfig) -> Result<Option<TlsAcceptor>> {
    let (cert_path, key_path) = match (&config.tls_cert_path, &config.tls_key_path) {
        (Some(cert), Some(key)) => (cert, key),
        _ => {
            if config.require_tls {
                anyhow::bail!("TLS is required but certificate and key paths are not configured");
            }
            info!("TLS not configured, running in HTTP mode (insecure)");
            return Ok(None);
        }
    };

    info!("Loading TLS certificate from {}", cert_path);

    let cert_file = tokio::fs::read(cert_path).await
        .context("Failed to read TLS certificate")?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &*cert_file)
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse TLS certificate")?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in certificate file");
    }

    let key_file = tokio::fs::read(key_path).await
        .context("Failed to read TLS private key")?;
    let keys: Vec<PrivateKeyDer<'static>> = rustls_pemfile::pkcs8_private_keys(&mut &*key_file)
        .map(|key| key.map(Into::into))
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse TLS private key")?;

    if keys.is_empty() {
        // Try RSA format
        let keys_rsa: Vec<PrivateKeyDer<'static>> = rustls_pemfile::rsa_private_keys(&mut &*key_file)
            .map(|key| key.map(Into::into))
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to parse TLS private key as RSA")?;

        if keys_rsa.is_empty() {
            anyhow::bail!("No private keys found in key file");
        }

        build_tls_config(certs, keys_rsa).map(Some)
    } else {
        build_tls_config(certs, keys).map(Some)
    }
}

fn build_tls_config(
    certs: Vec<CertificateDer<'static>>,
    mut keys: Vec<PrivateKeyDer<'static>>,
) -> Result<TlsAcceptor> {
    let mut tls_config = RustlsConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, keys.remove(0))
        .context("Failed to build TLS config")?;

    tls_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}
