//! Shared plumbing for the integration tests: a throwaway PKI and helpers
//! for booting servers and raw framed clients.

#![allow(dead_code)]

use std::sync::Arc;

use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use riptide::{Client, ConnOptions, Error, Server, TlsOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

/// CA plus server and client identities, all PEM encoded. The client
/// certificate carries CommonName `test-client`.
pub struct TestPki {
    pub ca_pem: Vec<u8>,
    pub server_cert_pem: Vec<u8>,
    pub server_key_pem: Vec<u8>,
    pub client_cert_pem: Vec<u8>,
    pub client_key_pem: Vec<u8>,
}

pub fn test_pki() -> TestPki {
    let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "riptide test ca");
    let ca_key = KeyPair::generate().unwrap();
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();

    let server_params =
        CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()]).unwrap();
    let server_key = KeyPair::generate().unwrap();
    let server_cert = server_params
        .signed_by(&server_key, &ca_cert, &ca_key)
        .unwrap();

    let mut client_params = CertificateParams::new(Vec::<String>::new()).unwrap();
    client_params
        .distinguished_name
        .push(DnType::CommonName, "test-client");
    let client_key = KeyPair::generate().unwrap();
    let client_cert = client_params
        .signed_by(&client_key, &ca_cert, &ca_key)
        .unwrap();

    TestPki {
        ca_pem: ca_cert.pem().into_bytes(),
        server_cert_pem: server_cert.pem().into_bytes(),
        server_key_pem: server_key.serialize_pem().into_bytes(),
        client_cert_pem: client_cert.pem().into_bytes(),
        client_key_pem: client_key.serialize_pem().into_bytes(),
    }
}

/// Bind a TLS server on an ephemeral port with client-certificate
/// verification against the test CA. Middleware and hooks go on before
/// `spawn_server`.
pub async fn bind_tls_server(pki: &TestPki) -> Server {
    let mut server = Server::bind("127.0.0.1:0").await.unwrap();
    server
        .use_tls(
            &pki.server_cert_pem,
            &pki.server_key_pem,
            Some(&pki.ca_pem),
        )
        .unwrap();
    server
}

/// Run the accept loop in the background.
pub fn spawn_server(server: Server) -> (Arc<Server>, JoinHandle<Result<(), Error>>) {
    let server = Arc::new(server);
    let task = {
        let server = server.clone();
        tokio::spawn(async move { server.start().await })
    };
    (server, task)
}

/// Dial with the test CA; `with_client_cert` adds the client identity for
/// mutual TLS.
pub async fn dial(addr: &str, pki: &TestPki, with_client_cert: bool) -> Client {
    dial_with_options(addr, pki, with_client_cert, ConnOptions::default()).await
}

pub async fn dial_with_options(
    addr: &str,
    pki: &TestPki,
    with_client_cert: bool,
    options: ConnOptions,
) -> Client {
    let tls = TlsOptions {
        ca: Some(pki.ca_pem.clone()),
        client_cert: with_client_cert.then(|| pki.client_cert_pem.clone()),
        client_key: with_client_cert.then(|| pki.client_key_pem.clone()),
    };
    Client::dial(addr, tls, options).await.unwrap()
}

/// A bare TLS stream to the server, for speaking raw frames in protocol
/// tests.
pub async fn raw_tls_client(
    addr: &str,
    pki: &TestPki,
) -> tokio_rustls::client::TlsStream<TcpStream> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut pki.ca_pem.as_slice()) {
        roots.add(cert.unwrap()).unwrap();
    }
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));

    let tcp = TcpStream::connect(addr).await.unwrap();
    let server_name = rustls::pki_types::ServerName::try_from("127.0.0.1".to_string()).unwrap();
    connector.connect(server_name, tcp).await.unwrap()
}

/// Write one length-prefixed frame (4-byte little-endian header).
pub async fn raw_write_frame<S: AsyncWrite + Unpin>(stream: &mut S, body: &[u8]) {
    stream
        .write_all(&(body.len() as u32).to_le_bytes())
        .await
        .unwrap();
    stream.write_all(body).await.unwrap();
    stream.flush().await.unwrap();
}

/// Read one length-prefixed frame.
pub async fn raw_read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await.unwrap();
    let len = u32::from_le_bytes(header) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.unwrap();
    body
}
