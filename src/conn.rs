//! The per-peer connection engine.
//!
//! A connection owns a framed transport split into a read half (driven by a
//! single read task) and a write half (behind a mutex), a session, the
//! pending-response table, and its three middleware chains. Incoming frames
//! are decoded, classified, and dispatched synchronously on the read task,
//! so messages from one peer are always processed in receive order.
//!
//! Lifecycle: `Fresh → Running → Closing → Closed`. Close is idempotent and
//! delivers [`Error::Closed`] to every pending response callback exactly
//! once; the read task observes the shutdown token and exits at its next
//! read.

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use futures::FutureExt;
use rustls::pki_types::CertificateDer;
use serde::Serialize;
use serde_json::value::RawValue;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::error::{Error, RpcError};
use crate::message::{self, Envelope, Message, Notification, Request, Response};
use crate::middleware::{
    Chains, FrozenChains, NotCtx, NotMiddleware, ReqCtx, ReqMiddleware, ResCtx, ResMiddleware,
};
use crate::pending::{PendingResponses, ResponseCallback};
use crate::session::Session;
use crate::transport::{FrameSink, FrameSource, SharedDeadline};

const FRESH: u8 = 0;
const RUNNING: u8 = 1;
const CLOSING: u8 = 2;
const CLOSED: u8 = 3;

/// Per-connection configuration.
#[derive(Debug, Clone)]
pub struct ConnOptions {
    /// Width of the little-endian length prefix in bytes (1..=8).
    pub header_size: usize,
    /// Maximum accepted message size in bytes.
    pub max_msg_size: u64,
    /// Sliding per-message read deadline.
    pub read_deadline: Duration,
    /// Log every raw frame at debug level.
    pub debug: bool,
}

impl Default for ConnOptions {
    fn default() -> Self {
        Self {
            header_size: 4,
            max_msg_size: u32::MAX as u64,
            read_deadline: Duration::from_secs(300),
            debug: false,
        }
    }
}

impl ConnOptions {
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if !(1..=8).contains(&self.header_size) {
            return Err(Error::Config(format!(
                "header size must be between 1 and 8 bytes, got {}",
                self.header_size
            )));
        }
        Ok(())
    }
}

/// A live peer connection. Both sides of a connection may send requests,
/// notifications, and receive responses through it.
pub struct Conn {
    id: String,
    session: Session,
    pending: PendingResponses,
    sink: tokio::sync::Mutex<Box<dyn FrameSink>>,
    state: AtomicU8,
    shutdown: CancellationToken,
    chains: Mutex<Chains>,
    frozen: OnceLock<FrozenChains>,
    remote_addr: Option<SocketAddr>,
    peer_certs: Vec<CertificateDer<'static>>,
    read_deadline: SharedDeadline,
}

impl Conn {
    pub(crate) fn new(
        sink: Box<dyn FrameSink>,
        remote_addr: Option<SocketAddr>,
        peer_certs: Vec<CertificateDer<'static>>,
        chains: Chains,
        read_deadline: SharedDeadline,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4().simple().to_string(),
            session: Session::new(),
            pending: PendingResponses::new(),
            sink: tokio::sync::Mutex::new(sink),
            state: AtomicU8::new(FRESH),
            shutdown: CancellationToken::new(),
            chains: Mutex::new(chains),
            frozen: OnceLock::new(),
            remote_addr,
            peer_certs,
            read_deadline,
        })
    }

    /// Randomly generated unique connection id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Per-connection session; lives exactly as long as the connection.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Remote network address of the peer, when known.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// The peer's validated TLS certificate chain, leaf first. Empty when
    /// the peer presented no certificate or the transport is not TLS.
    pub fn peer_certificates(&self) -> &[CertificateDer<'static>] {
        &self.peer_certs
    }

    /// Adjust the sliding read deadline.
    pub fn set_read_deadline(&self, deadline: Duration) {
        self.read_deadline.set(deadline);
    }

    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) >= CLOSING
    }

    /// Append request middleware. Chains freeze once the engine runs;
    /// later registrations are ignored.
    pub fn req_middleware(&self, mw: impl ReqMiddleware + 'static) {
        if self.frozen.get().is_some() {
            warn!(conn = %self.id, "request middleware registered after start; ignoring");
            return;
        }
        self.chains.lock().unwrap().req.push(Arc::new(mw));
    }

    /// Append response middleware. See [`Conn::req_middleware`].
    pub fn res_middleware(&self, mw: impl ResMiddleware + 'static) {
        if self.frozen.get().is_some() {
            warn!(conn = %self.id, "response middleware registered after start; ignoring");
            return;
        }
        self.chains.lock().unwrap().res.push(Arc::new(mw));
    }

    /// Append notification middleware. See [`Conn::req_middleware`].
    pub fn not_middleware(&self, mw: impl NotMiddleware + 'static) {
        if self.frozen.get().is_some() {
            warn!(conn = %self.id, "notification middleware registered after start; ignoring");
            return;
        }
        self.chains.lock().unwrap().not.push(Arc::new(mw));
    }

    /// Send a request with an auto-generated id. `cb` fires exactly once:
    /// with the response, with [`Error::Timeout`] if a deadline was set, or
    /// with [`Error::Closed`] when the connection closes first. Returns the
    /// generated request id.
    pub async fn send_request<P: Serialize>(
        &self,
        method: &str,
        params: Option<P>,
        cb: impl FnOnce(Result<Response, Error>) + Send + 'static,
    ) -> Result<String, Error> {
        self.send_request_inner(method, encode_params(params)?, None, Box::new(cb))
            .await
    }

    /// Like [`Conn::send_request`], but the callback fails with
    /// [`Error::Timeout`] if no response arrives within `deadline`.
    pub async fn send_request_with_deadline<P: Serialize>(
        &self,
        method: &str,
        params: Option<P>,
        deadline: Duration,
        cb: impl FnOnce(Result<Response, Error>) + Send + 'static,
    ) -> Result<String, Error> {
        self.send_request_inner(method, encode_params(params)?, Some(deadline), Box::new(cb))
            .await
    }

    /// Send a request and await its response. A response carrying an error
    /// object is returned as [`Error::Rpc`].
    pub async fn call<P: Serialize>(
        &self,
        method: &str,
        params: Option<P>,
    ) -> Result<Response, Error> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send_request(method, params, move |result| {
            let _ = tx.send(result);
        })
        .await?;
        let response = rx.await.map_err(|_| Error::Closed)??;
        if let Some(err) = response.error {
            return Err(err.into());
        }
        Ok(response)
    }

    /// Send a notification: no id, no callback, no reply.
    pub async fn send_notification<P: Serialize>(
        &self,
        method: &str,
        params: Option<P>,
    ) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let bytes = message::encode_notification(method, encode_params(params)?)?;
        if let Err(e) = self.write_frame(&bytes).await {
            self.begin_close().await;
            return Err(e);
        }
        trace!(conn = %self.id, method = %method, "notification sent");
        Ok(())
    }

    /// Close the connection. Idempotent: the second call returns
    /// immediately. Pending response callbacks fire with
    /// [`Error::Closed`]; in-flight writes may be lost.
    pub async fn close(&self) -> Result<(), Error> {
        self.begin_close().await;
        Ok(())
    }

    async fn send_request_inner(
        &self,
        method: &str,
        params: Option<Box<RawValue>>,
        deadline: Option<Duration>,
        cb: ResponseCallback,
    ) -> Result<String, Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let id = Uuid::new_v4().to_string();
        let bytes = message::encode_request(&id, method, params)?;

        self.pending.register(id.clone(), cb)?;
        if let Err(e) = self.write_frame(&bytes).await {
            // Un-register so the callback is not fired for a request that
            // never went out; the caller learns of the failure instead.
            let removed = self.pending.remove(&id).is_some();
            self.begin_close().await;
            return Err(if removed { e } else { Error::Closed });
        }

        if let Some(deadline) = deadline {
            let pending = self.pending.clone();
            let timer_id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                if pending.fail(&timer_id, Error::Timeout) {
                    trace!(id = %timer_id, "pending response deadline expired");
                }
            });
        }

        trace!(conn = %self.id, id = %id, method = %method, "request sent");
        Ok(id)
    }

    async fn write_frame(&self, bytes: &[u8]) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let mut sink = self.sink.lock().await;
        sink.write_frame(bytes).await
    }

    /// First caller wins the transition out of Fresh/Running; everyone else
    /// returns immediately.
    pub(crate) async fn begin_close(&self) {
        loop {
            let state = self.state.load(Ordering::Acquire);
            if state >= CLOSING {
                return;
            }
            // A connection whose engine never ran goes straight to Closed.
            let target = if state == FRESH { CLOSED } else { CLOSING };
            if self
                .state
                .compare_exchange(state, target, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        self.shutdown.cancel();
        self.pending.cancel_all();
        let mut sink = self.sink.lock().await;
        let _ = sink.shutdown().await;
    }

    fn freeze_chains(&self) -> FrozenChains {
        self.frozen
            .get_or_init(|| FrozenChains::from(self.chains.lock().unwrap().clone()))
            .clone()
    }
}

/// Drive a connection's read loop until the peer goes away or the
/// connection closes. The caller's task becomes the read task; dispatch is
/// synchronous on it.
pub(crate) async fn run_conn(conn: Arc<Conn>, mut source: Box<dyn FrameSource>) {
    if conn
        .state
        .compare_exchange(FRESH, RUNNING, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return; // closed before the engine ever ran
    }
    let chains = conn.freeze_chains();

    loop {
        tokio::select! {
            biased;

            _ = conn.shutdown.cancelled() => break,

            read = source.read_frame() => {
                let frame = match read {
                    Ok(frame) => frame,
                    Err(Error::PeerClosed) => {
                        debug!(conn = %conn.id, "peer closed the connection");
                        break;
                    }
                    Err(e) => {
                        warn!(conn = %conn.id, error = %e, "read failed");
                        break;
                    }
                };

                // A panicking handler must not take the process down or
                // disturb other connections; it costs this connection only.
                let dispatched =
                    AssertUnwindSafe(dispatch(&conn, &chains, frame)).catch_unwind().await;
                match dispatched {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(conn = %conn.id, error = %e, "dispatch failed; closing connection");
                        break;
                    }
                    Err(_) => {
                        error!(conn = %conn.id, "handler panicked; closing connection");
                        break;
                    }
                }
            }
        }
    }

    conn.begin_close().await;
    conn.state.store(CLOSED, Ordering::Release);
}

async fn dispatch(conn: &Arc<Conn>, chains: &FrozenChains, frame: Vec<u8>) -> Result<(), Error> {
    let env = match Envelope::from_bytes(&frame) {
        Ok(env) => env,
        Err(e) => return answer_malformed(conn, &frame, e).await,
    };
    match Message::classify(env) {
        Ok(Message::Request(req)) => dispatch_request(conn, chains, req).await,
        Ok(Message::Response(res)) => dispatch_response(conn, chains, res).await,
        Ok(Message::Notification(not)) => dispatch_notification(conn, chains, not).await,
        Err(e) => answer_malformed(conn, &frame, e).await,
    }
}

async fn dispatch_request(
    conn: &Arc<Conn>,
    chains: &FrozenChains,
    req: Request,
) -> Result<(), Error> {
    let id = req.id.clone();
    trace!(conn = %conn.id, id = %id, method = %req.method, "handling request");

    let mut ctx = ReqCtx::new(Arc::clone(conn), req, chains.req.clone());
    if let Err(e) = ctx.next().await {
        debug!(conn = %conn.id, id = %id, error = %e, "request handler failed");
        if ctx.err.is_none() {
            ctx.err = Some(e.into_rpc_error());
        }
    }

    // A handler that stopped the chain without producing anything is
    // signalling a silent drop.
    if ctx.done && ctx.res.is_none() && ctx.err.is_none() {
        return Ok(());
    }

    let (result, error) = match ctx.err.take() {
        Some(err) => (None, Some(err)),
        None => {
            let value = ctx.res.take().unwrap_or(Value::Null);
            (Some(message::to_raw(&value)?), None)
        }
    };
    conn.write_frame(&message::encode_response(&id, result, error)?)
        .await
}

async fn dispatch_response(
    conn: &Arc<Conn>,
    chains: &FrozenChains,
    res: Response,
) -> Result<(), Error> {
    let Some(id) = res.id.clone() else {
        trace!(conn = %conn.id, "response without id; dropping");
        return Ok(());
    };
    trace!(conn = %conn.id, id = %id, "handling response");

    let mut ctx = ResCtx::new(Arc::clone(conn), id.clone(), res, chains.res.clone());
    if let Err(e) = ctx.next().await {
        debug!(conn = %conn.id, id = %id, error = %e, "response handler failed");
    }
    if ctx.done {
        return Ok(());
    }

    if !conn.pending.resolve(&id, ctx.into_response()) {
        trace!(conn = %conn.id, id = %id, "response for unknown request id; dropping");
    }
    Ok(())
}

async fn dispatch_notification(
    conn: &Arc<Conn>,
    chains: &FrozenChains,
    not: Notification,
) -> Result<(), Error> {
    trace!(conn = %conn.id, method = %not.method, "handling notification");

    let mut ctx = NotCtx::new(Arc::clone(conn), not, chains.not.clone());
    if let Err(e) = ctx.next().await {
        debug!(conn = %conn.id, error = %e, "notification handler failed");
    }
    // Notifications never get a wire reply, whatever the handlers did.
    Ok(())
}

/// Best effort on an undecodable message: answer with a JSON-RPC error when
/// an id can still be recovered, otherwise drop the frame and close.
async fn answer_malformed(conn: &Arc<Conn>, frame: &[u8], err: Error) -> Result<(), Error> {
    let id = serde_json::from_slice::<Value>(frame)
        .ok()
        .and_then(|v| v.get("id").and_then(|id| id.as_str().map(str::to_string)));

    match id {
        Some(id) => {
            warn!(conn = %conn.id, id = %id, error = %err, "malformed message; answering with error");
            let rpc = match &err {
                Error::Parse(_) => RpcError::parse_error(),
                _ => RpcError::invalid_request(),
            };
            conn.write_frame(&message::encode_response(&id, None, Some(rpc))?)
                .await
        }
        None => {
            warn!(conn = %conn.id, error = %err, "malformed message with no recoverable id");
            Err(err)
        }
    }
}

fn encode_params<P: Serialize>(params: Option<P>) -> Result<Option<Box<RawValue>>, Error> {
    params.map(|p| message::to_raw(&p)).transpose()
}
