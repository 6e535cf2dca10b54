//! TLS listener support.
//!
//! The encrypted listener shares the connector abstraction with the plain
//! one; the only difference is that the accepted stream is wrapped by a
//! rustls acceptor before the handshake begins.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::rustls::ServerConfig as RustlsConfig;
use tokio_rustls::TlsAcceptor;

use crate::config::TlsSettings;
use crate::engine::BoxedStream;
use crate::error::ServerError;

/// Builds a TLS acceptor from PEM certificate chain and private key files.
pub fn build_acceptor(settings: &TlsSettings) -> Result<TlsAcceptor, ServerError> {
    let cert_file = File::open(&settings.cert_path)
        .map_err(|e| ServerError::Network(format!("Cannot open cert {}: {e}", settings.cert_path)))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<_, _>>()
        .map_err(|e| ServerError::Network(format!("Bad certificate chain: {e}")))?;

    let key_file = File::open(&settings.key_path)
        .map_err(|e| ServerError::Network(format!("Cannot open key {}: {e}", settings.key_path)))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| ServerError::Network(format!("Bad private key: {e}")))?
        .ok_or_else(|| ServerError::Network("No private key found".into()))?;

    let config = RustlsConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Network(format!("TLS config rejected: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Wraps an accepted TCP stream with TLS when an acceptor is configured.
///
/// Returns the type-erased stream and whether it is secure.
pub(crate) async fn maybe_wrap(
    stream: TcpStream,
    acceptor: Option<&TlsAcceptor>,
) -> Result<(BoxedStream, bool), ServerError> {
    match acceptor {
        Some(acceptor) => {
            let tls = acceptor
                .accept(stream)
                .await
                .map_err(|e| ServerError::Network(format!("TLS accept failed: {e}")))?;
            Ok((Box::new(tls), true))
        }
        None => Ok((Box::new(stream), false)),
    }
}
