//! Builds a `rustls` server configuration from the PEM certificate/key
//! paths configured for `SMTP_SECURE` mode, used for both the STARTTLS
//! upgrade handshake and (in tests) an ephemeral self-signed acceptor.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use rustls_pemfile::{certs, pkcs8_private_keys};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

/// Loads a cert chain + private key from disk and builds a `TlsAcceptor`
/// for the SMTP STARTTLS upgrade.
pub fn load_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("building TLS server config")?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("opening cert file {path}"))?;
    let mut reader = BufReader::new(file);
    certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("parsing PEM certificates from {path}"))
}

fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("opening key file {path}"))?;
    let mut reader = BufReader::new(file);
    let mut keys = pkcs8_private_keys(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("parsing PKCS#8 private key from {path}"))?;

    keys.pop()
        .map(PrivateKeyDer::Pkcs8)
        .ok_or_else(|| anyhow!("no PKCS#8 private key found in {path}"))
}

/// Generates an ephemeral self-signed certificate/key pair for integration
/// tests that exercise STARTTLS without requiring fixture PEM files on disk.
#[cfg(test)]
pub fn ephemeral_acceptor() -> Result<TlsAcceptor> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .context("generating ephemeral self-signed certificate")?;

    let cert_der = CertificateDer::from(cert.cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(cert.signing_key.serialize_der())
        .map_err(|e| anyhow!("encoding ephemeral private key: {e}"))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .context("building ephemeral TLS server config")?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ephemeral_acceptor_builds_successfully() {
        ephemeral_acceptor().expect("ephemeral acceptor should build");
    }
}
