//! # TLS Configuration
//!
//! Loads a certificate/key pair from disk, or generates a throwaway
//! self-signed one for local development when none is given.

use anyhow::Context;
use rcgen::generate_simple_self_signed;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

pub fn load_or_generate(
    cert: Option<&Path>,
    key: Option<&Path>,
) -> anyhow::Result<Arc<rustls::ServerConfig>> {
    let (certs, private_key) = match (cert, key) {
        (Some(cert_path), Some(key_path)) => load_from_files(cert_path, key_path)?,
        _ => {
            warn!("no --cert/--key given, generating a throwaway self-signed certificate for localhost");
            self_signed()?
        }
    };

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, private_key)
        .context("building TLS server config from certificate/key")?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

fn load_from_files(
    cert_path: &Path,
    key_path: &Path,
) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert_file = File::open(cert_path)
        .with_context(|| format!("opening certificate file {}", cert_path.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .context("parsing PEM certificate chain")?;
    if certs.is_empty() {
        anyhow::bail!("certificate file {} contained no certificates", cert_path.display());
    }

    let key_file = File::open(key_path)
        .with_context(|| format!("opening private key file {}", key_path.display()))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .context("parsing PEM private key")?
        .ok_or_else(|| anyhow::anyhow!("private key file {} contained no key", key_path.display()))?;

    Ok((certs, key))
}

fn self_signed() -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let certified = generate_simple_self_signed(vec!["localhost".to_string()])
        .context("generating self-signed certificate")?;
    let cert_der = certified.cert.der().clone();
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        certified.signing_key.serialize_der(),
    ));
    Ok((vec![cert_der], key_der))
}
