//! Listener TLS material.
//!
//! Loads PEM certificate chain and private key into a rustls server config
//! offering h2 and http/1.1 over ALPN. Certificate problems surface at bind
//! time, before any traffic is accepted.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;

use crate::config::TlsSettings;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("read tls material: {0}")]
    Io(#[from] std::io::Error),

    #[error("no certificates found in cert_file")]
    NoCertificates,

    #[error("no private key found in key_file")]
    NoPrivateKey,

    #[error("tls configuration: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Build the listener's rustls config from the configured PEM files.
pub fn server_config(settings: &TlsSettings) -> Result<Arc<rustls::ServerConfig>, TlsError> {
    crate::transport::ensure_crypto_provider();
    let mut cert_reader = BufReader::new(File::open(&settings.cert_file)?);
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut cert_reader).collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates);
    }

    let mut key_reader = BufReader::new(File::open(&settings.key_file)?);
    let key: PrivateKeyDer<'static> =
        rustls_pemfile::private_key(&mut key_reader)?.ok_or(TlsError::NoPrivateKey)?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}
