//! rustls configuration from PEM-encoded certificates and keys.

use std::sync::{Arc, Once};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};

use crate::error::Error;

/// Install the ring crypto provider once, before any config is built.
fn install_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Build the server-side TLS configuration.
///
/// `cert_pem`/`key_pem` are the server certificate chain and private key.
/// When `client_ca_pem` is given, client certificates are verified if
/// presented: a peer without a certificate still connects, but one with an
/// untrusted certificate is rejected during the handshake. The validated
/// peer certificates surface on the connection for middleware.
pub(crate) fn server_config(
    cert_pem: &[u8],
    key_pem: &[u8],
    client_ca_pem: Option<&[u8]>,
) -> Result<ServerConfig, Error> {
    install_provider();

    let certs = certs_from_pem(cert_pem)?;
    let key = key_from_pem(key_pem)?;

    let builder = match client_ca_pem {
        Some(ca_pem) => {
            let mut roots = RootCertStore::empty();
            for cert in certs_from_pem(ca_pem)? {
                roots
                    .add(cert)
                    .map_err(|e| Error::Tls(format!("failed to add client CA certificate: {e}")))?;
            }
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .allow_unauthenticated()
                .build()
                .map_err(|e| Error::Tls(format!("failed to build client verifier: {e}")))?;
            ServerConfig::builder().with_client_cert_verifier(verifier)
        }
        None => ServerConfig::builder().with_no_client_auth(),
    };

    builder
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(format!("failed to parse the server certificate or key: {e}")))
}

/// Build the client-side TLS configuration.
///
/// `ca_pem` pins the root of trust; without it the bundled web PKI roots
/// apply. `identity` is an optional client certificate chain and key for
/// mutual TLS.
pub(crate) fn client_config(
    ca_pem: Option<&[u8]>,
    identity: Option<(&[u8], &[u8])>,
) -> Result<ClientConfig, Error> {
    install_provider();

    let mut roots = RootCertStore::empty();
    match ca_pem {
        Some(ca_pem) => {
            for cert in certs_from_pem(ca_pem)? {
                roots
                    .add(cert)
                    .map_err(|e| Error::Tls(format!("failed to add CA certificate: {e}")))?;
            }
        }
        None => {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);
    match identity {
        Some((cert_pem, key_pem)) => {
            let certs = certs_from_pem(cert_pem)?;
            let key = key_from_pem(key_pem)?;
            builder.with_client_auth_cert(certs, key).map_err(|e| {
                Error::Tls(format!("failed to parse the client certificate or key: {e}"))
            })
        }
        None => Ok(builder.with_no_client_auth()),
    }
}

fn certs_from_pem(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, Error> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<_, _>>()
        .map_err(|e| Error::Tls(format!("failed to parse PEM certificates: {e}")))?;
    if certs.is_empty() {
        return Err(Error::Tls("no certificate found in PEM input".into()));
    }
    Ok(certs)
}

fn key_from_pem(pem: &[u8]) -> Result<PrivateKeyDer<'static>, Error> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| Error::Tls(format!("failed to parse PEM private key: {e}")))?
        .ok_or_else(|| Error::Tls("no private key found in PEM input".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_garbage_pem() {
        assert!(matches!(
            server_config(b"not a cert", b"not a key", None),
            Err(Error::Tls(_))
        ));
        assert!(matches!(
            client_config(Some(b"not a cert"), None),
            Err(Error::Tls(_))
        ));
    }
}
