//! TLS acceptor built from PEM certificate material on disk.
use std::{fs::File, io::BufReader, sync::Arc};

use eyre::{Result, WrapErr, eyre};
use rustls_pemfile::{certs, private_key};
use tokio_rustls::TlsAcceptor;

use crate::config::models::TlsConfig;

/// Load the certificate chain and private key named by `config`.
///
/// ALPN advertises HTTP/2 and HTTP/1.1.
pub fn load_tls_acceptor(config: &TlsConfig) -> Result<TlsAcceptor> {
    let cert_file = &mut BufReader::new(
        File::open(&config.cert_path)
            .wrap_err_with(|| format!("Failed to open cert file {}", config.cert_path))?,
    );
    let key_file = &mut BufReader::new(
        File::open(&config.key_path)
            .wrap_err_with(|| format!("Failed to open key file {}", config.key_path))?,
    );

    let cert_chain = certs(cert_file)
        .collect::<Result<Vec<_>, _>>()
        .wrap_err("Failed to parse certificate chain")?;
    if cert_chain.is_empty() {
        return Err(eyre!("No certificates found in {}", config.cert_path));
    }
    let key = private_key(key_file)
        .wrap_err("Failed to parse private key")?
        .ok_or_else(|| eyre!("No private key found in {}", config.key_path))?;

    let mut server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .wrap_err("Certificate and private key do not form a valid pair")?;
    server_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    tracing::info!("Loaded TLS certificate from {}", config.cert_path);
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}
