//! TLS listener setup from PEM strings.

use std::io;
use std::sync::Arc;

use rustls::ServerConfig as RustlsConfig;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::config::TlsConfig;
use crate::error::ServerError;

/// Builds the acceptor for `config`, or `None` when TLS is off.
pub(crate) fn acceptor(config: &TlsConfig) -> Result<Option<TlsAcceptor>, ServerError> {
    let (Some(cert), Some(key)) = (&config.cert, &config.key) else {
        return Ok(None);
    };

    let mut chain = load_certs(cert)?;
    if chain.is_empty() {
        return Err(ServerError::Tls("no certificate found in cert".to_string()));
    }
    if let Some(ca) = &config.ca {
        chain.extend(load_certs(ca)?);
    }

    let key = load_key(key)?;
    let provider = provider(config.ciphers.as_deref())?;

    let mut tls_config = RustlsConfig::builder_with_provider(Arc::new(provider))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(chain, key)?;
    tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Some(TlsAcceptor::from(Arc::new(tls_config))))
}

fn load_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>, ServerError> {
    rustls_pemfile::certs(&mut pem.as_bytes()).collect::<Result<Vec<_>, io::Error>>().map_err(|e| ServerError::Tls(format!("invalid certificate pem: {e}")))
}

fn load_key(pem: &str) -> Result<PrivateKeyDer<'static>, ServerError> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| ServerError::Tls(format!("invalid private key pem: {e}")))?
        .ok_or_else(|| ServerError::Tls("no private key found in key".to_string()))
}

/// The ring provider, restricted to the named suites when `ciphers` is set.
fn provider(ciphers: Option<&str>) -> Result<CryptoProvider, ServerError> {
    let mut provider = rustls::crypto::ring::default_provider();
    let Some(ciphers) = ciphers else {
        return Ok(provider);
    };

    let wanted: Vec<&str> = ciphers.split([':', ',']).map(str::trim).filter(|name| !name.is_empty()).collect();
    provider.cipher_suites.retain(|suite| {
        let name = format!("{:?}", suite.suite());
        wanted.iter().any(|wanted| wanted.eq_ignore_ascii_case(&name))
    });

    if provider.cipher_suites.is_empty() {
        return Err(ServerError::Tls(format!("none of the cipher suites {ciphers:?} is supported")));
    }
    debug!(suites = provider.cipher_suites.len(), "restricted tls cipher suites");
    Ok(provider)
}
