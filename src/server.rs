//! The accept loop and connection registry.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use rustls::pki_types::CertificateDer;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::conn::{run_conn, Conn, ConnOptions};
use crate::error::Error;
use crate::message::Response;
use crate::middleware::{Chains, NotMiddleware, ReqMiddleware, ResMiddleware};
use crate::transport::framed::framed_split;
use crate::transport::websocket::websocket_split;
use crate::transport::{tls, FrameSink, FrameSource, SharedDeadline};

type ConnHook = Arc<dyn Fn(Arc<Conn>) -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;
type DisconnHook = Arc<dyn Fn(Arc<Conn>) + Send + Sync>;
type Registry = Arc<Mutex<HashMap<String, Arc<Conn>>>>;

/// A riptide server: accepts connections, attaches the inherited middleware
/// chains to each, and tracks live connections by id.
///
/// Configure with the `&mut self` methods, then share the server and call
/// [`start`](Server::start); it blocks until [`close`](Server::close).
pub struct Server {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    websocket: bool,
    options: ConnOptions,
    chains: Chains,
    conn_handler: Option<ConnHook>,
    disconn_handler: Option<DisconnHook>,
    conns: Registry,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Server {
    /// Bind the listener. The network address is fixed from here on;
    /// everything else is configured before `start`.
    pub async fn bind(addr: &str) -> Result<Server, Error> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Server {
            listener,
            tls: None,
            websocket: false,
            options: ConnOptions::default(),
            chains: Chains::default(),
            conn_handler: None,
            disconn_handler: None,
            conns: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        self.listener.local_addr().map_err(Error::Io)
    }

    /// Enable TLS. `cert_pem`/`key_pem` are the server certificate and
    /// private key. With `client_ca_pem`, client certificates are verified
    /// if presented and surface on the connection for middleware.
    pub fn use_tls(
        &mut self,
        cert_pem: &[u8],
        key_pem: &[u8],
        client_ca_pem: Option<&[u8]>,
    ) -> Result<(), Error> {
        let config = tls::server_config(cert_pem, key_pem, client_ca_pem)?;
        self.tls = Some(TlsAcceptor::from(Arc::new(config)));
        Ok(())
    }

    /// Accept WebSocket connections instead of raw length-prefixed streams.
    pub fn use_websocket(&mut self) {
        self.websocket = true;
    }

    /// Replace the per-connection options applied to accepted connections.
    pub fn set_options(&mut self, options: ConnOptions) -> Result<(), Error> {
        options.validate()?;
        self.options = options;
        Ok(())
    }

    /// Append request middleware inherited by every future connection.
    pub fn req_middleware(&mut self, mw: impl ReqMiddleware + 'static) {
        self.chains.req.push(Arc::new(mw));
    }

    /// Append response middleware inherited by every future connection.
    pub fn res_middleware(&mut self, mw: impl ResMiddleware + 'static) {
        self.chains.res.push(Arc::new(mw));
    }

    /// Append notification middleware inherited by every future connection.
    pub fn not_middleware(&mut self, mw: impl NotMiddleware + 'static) {
        self.chains.not.push(Arc::new(mw));
    }

    /// Hook run after accept, before the engine starts. An error refuses
    /// the connection. The hook may register connection-scope middleware
    /// and send initial requests.
    pub fn on_connect<F, Fut>(&mut self, hook: F)
    where
        F: Fn(Arc<Conn>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), Error>> + Send + 'static,
    {
        self.conn_handler = Some(Arc::new(move |conn| -> BoxFuture<'static, Result<(), Error>> {
            Box::pin(hook(conn))
        }));
    }

    /// Hook run exactly once after a connection reaches its terminal state.
    pub fn on_disconnect<F>(&mut self, hook: F)
    where
        F: Fn(Arc<Conn>) + Send + Sync + 'static,
    {
        self.disconn_handler = Some(Arc::new(hook));
    }

    /// Accept connections until [`close`](Server::close). Blocks.
    pub async fn start(&self) -> Result<(), Error> {
        self.options.validate()?;
        info!(addr = %self.local_addr()?, "server started");

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,

                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            self.tracker.spawn(handle_conn(stream, peer, self.acceptance()));
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Stop accepting, close every registered connection (in-flight reads
    /// and writes are discarded), and wait for all read tasks to exit.
    pub async fn close(&self) -> Result<(), Error> {
        self.shutdown.cancel();

        let conns: Vec<_> = self.conns.lock().unwrap().values().cloned().collect();
        for conn in conns {
            let _ = conn.close().await;
        }

        self.tracker.close();
        self.tracker.wait().await;
        info!("server stopped");
        Ok(())
    }

    /// Look up a live connection by id.
    pub fn conn(&self, id: &str) -> Option<Arc<Conn>> {
        self.conns.lock().unwrap().get(id).cloned()
    }

    /// Ids of all live connections.
    pub fn conn_ids(&self) -> Vec<String> {
        self.conns.lock().unwrap().keys().cloned().collect()
    }

    /// Send a request through the connection with the given id.
    pub async fn send_request<P: Serialize>(
        &self,
        conn_id: &str,
        method: &str,
        params: Option<P>,
        cb: impl FnOnce(Result<Response, Error>) + Send + 'static,
    ) -> Result<String, Error> {
        let conn = self
            .conn(conn_id)
            .ok_or_else(|| Error::UnknownConn(conn_id.to_string()))?;
        conn.send_request(method, params, cb).await
    }

    /// Send a notification to every live connection. Per-connection
    /// failures are logged, not returned.
    pub async fn broadcast_notification<P: Serialize>(&self, method: &str, params: Option<P>) {
        let params = match params.map(|p| serde_json::to_value(&p)).transpose() {
            Ok(params) => params,
            Err(e) => {
                warn!(method = %method, error = %e, "unserializable broadcast params");
                return;
            }
        };
        let conns: Vec<_> = self.conns.lock().unwrap().values().cloned().collect();
        for conn in conns {
            if let Err(e) = conn.send_notification(method, params.clone()).await {
                warn!(conn = %conn.id(), method = %method, error = %e, "broadcast failed");
            }
        }
    }

    fn acceptance(&self) -> Acceptance {
        Acceptance {
            tls: self.tls.clone(),
            websocket: self.websocket,
            options: self.options.clone(),
            chains: self.chains.clone(),
            conn_handler: self.conn_handler.clone(),
            disconn_handler: self.disconn_handler.clone(),
            conns: self.conns.clone(),
        }
    }
}

/// Everything a per-connection task needs, detached from the server's
/// lifetime.
struct Acceptance {
    tls: Option<TlsAcceptor>,
    websocket: bool,
    options: ConnOptions,
    chains: Chains,
    conn_handler: Option<ConnHook>,
    disconn_handler: Option<DisconnHook>,
    conns: Registry,
}

async fn handle_conn(stream: TcpStream, peer: SocketAddr, ctx: Acceptance) {
    let deadline = SharedDeadline::new(ctx.options.read_deadline);
    let (source, sink, peer_certs) = match accept_transport(stream, &ctx, deadline.clone()).await {
        Ok(parts) => parts,
        Err(e) => {
            warn!(peer = %peer, error = %e, "handshake failed");
            return;
        }
    };

    let conn = Conn::new(sink, Some(peer), peer_certs, ctx.chains.clone(), deadline);

    if let Some(hook) = &ctx.conn_handler {
        if let Err(e) = hook(conn.clone()).await {
            warn!(conn = %conn.id(), peer = %peer, error = %e, "connection refused");
            let _ = conn.close().await;
            return;
        }
    }

    info!(conn = %conn.id(), peer = %peer, "client connected");
    ctx.conns
        .lock()
        .unwrap()
        .insert(conn.id().to_string(), conn.clone());

    run_conn(conn.clone(), source).await;

    ctx.conns.lock().unwrap().remove(conn.id());
    if let Some(hook) = &ctx.disconn_handler {
        hook(conn.clone());
    }
    info!(conn = %conn.id(), "client disconnected");
}

async fn accept_transport(
    stream: TcpStream,
    ctx: &Acceptance,
    deadline: SharedDeadline,
) -> Result<
    (
        Box<dyn FrameSource>,
        Box<dyn FrameSink>,
        Vec<CertificateDer<'static>>,
    ),
    Error,
> {
    match &ctx.tls {
        Some(acceptor) => {
            let tls_stream = acceptor.accept(stream).await.map_err(Error::Io)?;
            let peer_certs = tls_stream
                .get_ref()
                .1
                .peer_certificates()
                .map(|certs| certs.to_vec())
                .unwrap_or_default();
            if ctx.websocket {
                let ws = tokio_tungstenite::accept_async(tls_stream).await?;
                let (source, sink) = websocket_split(ws, &ctx.options, deadline);
                Ok((source, sink, peer_certs))
            } else {
                let (source, sink) = framed_split(tls_stream, &ctx.options, deadline);
                Ok((source, sink, peer_certs))
            }
        }
        None => {
            if ctx.websocket {
                let ws = tokio_tungstenite::accept_async(stream).await?;
                let (source, sink) = websocket_split(ws, &ctx.options, deadline);
                Ok((source, sink, Vec::new()))
            } else {
                let (source, sink) = framed_split(stream, &ctx.options, deadline);
                Ok((source, sink, Vec::new()))
            }
        }
    }
}
