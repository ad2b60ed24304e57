use anyhow::Context;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use std::sync::Arc;

/// Build a server TLS config from the configured PEM pair, falling
/// back to a freshly generated self-signed certificate for `hostname`
/// when no private key is configured.
pub async fn make_server_config(
    hostname: &str,
    tls_private_key: &Option<String>,
    tls_certificate: &Option<String>,
) -> anyhow::Result<Arc<ServerConfig>> {
    let mut certificates = vec![];
    let private_key = match tls_private_key {
        Some(path) => {
            let data = tokio::fs::read(path)
                .await
                .with_context(|| format!("reading private key from {path}"))?;
            PrivateKeyDer::from_pem_slice(&data)
                .with_context(|| format!("loading private key from {path}"))?
        }
        None => {
            let key = rcgen::generate_simple_self_signed(vec![hostname.to_string()])?;
            certificates.push(CertificateDer::from_slice(key.cert.der()).into_owned());
            PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key.key_pair.serialize_der()))
        }
    };

    if let Some(path) = tls_certificate {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading certificates from {path}"))?;
        certificates = CertificateDer::pem_slice_iter(&data)
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("loading certificates from {path}"))?;
    }

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certificates, private_key)?;

    Ok(Arc::new(config))
}
