//! The client side: dial a server and drive the same connection engine.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustls::pki_types::ServerName;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;

use crate::conn::{run_conn, Conn, ConnOptions};
use crate::error::Error;
use crate::message::Response;
use crate::middleware::{Chains, NotMiddleware, ReqMiddleware, ResMiddleware};
use crate::transport::framed::framed_split;
use crate::transport::websocket::websocket_split;
use crate::transport::{tls, FrameSource, SharedDeadline};

/// TLS material for dialing, all PEM encoded.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// Root of trust for the server certificate. Without it the bundled
    /// web PKI roots apply.
    pub ca: Option<Vec<u8>>,
    /// Client certificate chain for mutual TLS.
    pub client_cert: Option<Vec<u8>>,
    /// Private key matching `client_cert`.
    pub client_key: Option<Vec<u8>>,
}

impl TlsOptions {
    fn identity(&self) -> Result<Option<(&[u8], &[u8])>, Error> {
        match (&self.client_cert, &self.client_key) {
            (Some(cert), Some(key)) => Ok(Some((cert.as_slice(), key.as_slice()))),
            (None, None) => Ok(None),
            _ => Err(Error::Config(
                "client certificate and key must be provided together".into(),
            )),
        }
    }
}

/// A dialed connection. Register middleware between dialing and
/// [`start`](Client::start); once started, the read task runs until the
/// server goes away or [`close`](Client::close).
pub struct Client {
    conn: Arc<Conn>,
    source: Mutex<Option<Box<dyn FrameSource>>>,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Dial a TLS server speaking length-prefixed frames.
    pub async fn dial(addr: &str, tls_opts: TlsOptions, options: ConnOptions) -> Result<Client, Error> {
        options.validate()?;

        let config = tls::client_config(tls_opts.ca.as_deref(), tls_opts.identity()?)?;
        let connector = TlsConnector::from(Arc::new(config));
        let server_name = server_name_for(addr)?;

        let tcp = TcpStream::connect(addr).await?;
        let remote = tcp.peer_addr().ok();
        let stream = connector.connect(server_name, tcp).await?;
        let peer_certs = stream
            .get_ref()
            .1
            .peer_certificates()
            .map(|certs| certs.to_vec())
            .unwrap_or_default();

        let deadline = SharedDeadline::new(options.read_deadline);
        let (source, sink) = framed_split(stream, &options, deadline.clone());
        let conn = Conn::new(sink, remote, peer_certs, Chains::default(), deadline);

        Ok(Client {
            conn,
            source: Mutex::new(Some(source)),
            read_task: Mutex::new(None),
        })
    }

    /// Dial a WebSocket server (`ws://` or `wss://`).
    pub async fn dial_websocket(
        url: &str,
        tls_opts: TlsOptions,
        options: ConnOptions,
    ) -> Result<Client, Error> {
        options.validate()?;

        let parsed = url::Url::parse(url).map_err(|e| Error::Config(format!("invalid URL: {e}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| Error::Config("URL has no host".into()))?
            .to_string();
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| Error::Config("URL has no port".into()))?;

        let tcp = TcpStream::connect((host.as_str(), port)).await?;
        let remote = tcp.peer_addr().ok();
        let deadline = SharedDeadline::new(options.read_deadline);

        let (source, sink, peer_certs) = match parsed.scheme() {
            "ws" => {
                let (ws, _) = tokio_tungstenite::client_async(url, tcp).await?;
                let (source, sink) = websocket_split(ws, &options, deadline.clone());
                (source, sink, Vec::new())
            }
            "wss" => {
                let config = tls::client_config(tls_opts.ca.as_deref(), tls_opts.identity()?)?;
                let connector = TlsConnector::from(Arc::new(config));
                let server_name = ServerName::try_from(host.clone())
                    .map_err(|e| Error::Tls(format!("invalid server name {host}: {e}")))?;
                let stream = connector.connect(server_name, tcp).await?;
                let peer_certs = stream
                    .get_ref()
                    .1
                    .peer_certificates()
                    .map(|certs| certs.to_vec())
                    .unwrap_or_default();
                let (ws, _) = tokio_tungstenite::client_async(url, stream).await?;
                let (source, sink) = websocket_split(ws, &options, deadline.clone());
                (source, sink, peer_certs)
            }
            other => {
                return Err(Error::Config(format!(
                    "unsupported WebSocket scheme: {other}"
                )))
            }
        };

        let conn = Conn::new(sink, remote, peer_certs, Chains::default(), deadline);
        Ok(Client {
            conn,
            source: Mutex::new(Some(source)),
            read_task: Mutex::new(None),
        })
    }

    /// The underlying connection.
    pub fn conn(&self) -> &Arc<Conn> {
        &self.conn
    }

    /// Append request middleware. Must happen before [`start`](Client::start).
    pub fn req_middleware(&self, mw: impl ReqMiddleware + 'static) {
        self.conn.req_middleware(mw);
    }

    /// Append response middleware. Must happen before [`start`](Client::start).
    pub fn res_middleware(&self, mw: impl ResMiddleware + 'static) {
        self.conn.res_middleware(mw);
    }

    /// Append notification middleware. Must happen before [`start`](Client::start).
    pub fn not_middleware(&self, mw: impl NotMiddleware + 'static) {
        self.conn.not_middleware(mw);
    }

    /// Spawn the read task. From here on the connection dispatches
    /// incoming messages and middleware chains are frozen.
    pub fn start(&self) -> Result<(), Error> {
        let source = self
            .source
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::Config("client already started".into()))?;
        let handle = tokio::spawn(run_conn(self.conn.clone(), source));
        *self.read_task.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// See [`Conn::send_request`].
    pub async fn send_request<P: Serialize>(
        &self,
        method: &str,
        params: Option<P>,
        cb: impl FnOnce(Result<Response, Error>) + Send + 'static,
    ) -> Result<String, Error> {
        self.conn.send_request(method, params, cb).await
    }

    /// See [`Conn::send_request_with_deadline`].
    pub async fn send_request_with_deadline<P: Serialize>(
        &self,
        method: &str,
        params: Option<P>,
        deadline: Duration,
        cb: impl FnOnce(Result<Response, Error>) + Send + 'static,
    ) -> Result<String, Error> {
        self.conn
            .send_request_with_deadline(method, params, deadline, cb)
            .await
    }

    /// See [`Conn::call`].
    pub async fn call<P: Serialize>(
        &self,
        method: &str,
        params: Option<P>,
    ) -> Result<Response, Error> {
        self.conn.call(method, params).await
    }

    /// See [`Conn::send_notification`].
    pub async fn send_notification<P: Serialize>(
        &self,
        method: &str,
        params: Option<P>,
    ) -> Result<(), Error> {
        self.conn.send_notification(method, params).await
    }

    /// Close the connection and wait for the read task to exit.
    pub async fn close(&self) -> Result<(), Error> {
        self.conn.close().await?;
        self.join().await;
        Ok(())
    }

    /// Wait until the read task exits, e.g. because the server closed the
    /// connection.
    pub async fn join(&self) {
        let handle = self.read_task.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

fn server_name_for(addr: &str) -> Result<ServerName<'static>, Error> {
    let host = match addr.rsplit_once(':') {
        Some((host, _)) => host,
        None => addr,
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(host.to_string())
        .map_err(|e| Error::Tls(format!("invalid server name {host}: {e}")))
}
