//! Middleware contexts and the per-connection handler chains.
//!
//! Each connection runs three independent chains, one per message kind.
//! A handler receives a mutable context and decides whether the rest of the
//! chain runs by calling [`ReqCtx::next`] (or its Res/Not counterpart).
//! Returning without calling `next` ends the chain; setting `done` ends it
//! even when `next` is called. Code after `next().await` runs once the rest
//! of the chain has finished, so handlers can post-process.
//!
//! For requests the engine composes the wire reply from the context after
//! the chain completes: `err` produces an error response, otherwise `res`
//! (JSON `null` when unset) produces a success response — unless `done` is
//! set with neither slot touched, which suppresses the reply entirely.

mod cert_auth;
mod echo;
mod jwt;
mod router;

pub use cert_auth::{CertAuth, USERID_KEY};
pub use echo::Echo;
pub use jwt::JwtAuth;
pub use router::Router;

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::value::RawValue;
use serde_json::Value;

use crate::conn::Conn;
use crate::error::{Error, RpcError};
use crate::message::{Notification, Request, Response};
use crate::session::Session;

/// Handler for incoming requests.
#[async_trait]
pub trait ReqMiddleware: Send + Sync {
    async fn handle(&self, ctx: &mut ReqCtx) -> Result<(), Error>;
}

/// Handler for incoming responses.
#[async_trait]
pub trait ResMiddleware: Send + Sync {
    async fn handle(&self, ctx: &mut ResCtx) -> Result<(), Error>;
}

/// Handler for incoming notifications.
#[async_trait]
pub trait NotMiddleware: Send + Sync {
    async fn handle(&self, ctx: &mut NotCtx) -> Result<(), Error>;
}

/// The three middleware chains of a connection, in registration order.
#[derive(Default, Clone)]
pub(crate) struct Chains {
    pub(crate) req: Vec<Arc<dyn ReqMiddleware>>,
    pub(crate) res: Vec<Arc<dyn ResMiddleware>>,
    pub(crate) not: Vec<Arc<dyn NotMiddleware>>,
}

/// Immutable snapshot taken when the connection engine starts.
#[derive(Clone)]
pub(crate) struct FrozenChains {
    pub(crate) req: Arc<[Arc<dyn ReqMiddleware>]>,
    pub(crate) res: Arc<[Arc<dyn ResMiddleware>]>,
    pub(crate) not: Arc<[Arc<dyn NotMiddleware>]>,
}

impl From<Chains> for FrozenChains {
    fn from(chains: Chains) -> Self {
        Self {
            req: chains.req.into(),
            res: chains.res.into(),
            not: chains.not.into(),
        }
    }
}

/// Context handed to request middleware.
pub struct ReqCtx {
    /// The connection the request arrived on.
    pub conn: Arc<Conn>,
    id: String,
    method: String,
    params: Option<Box<RawValue>>,
    /// Result slot for the reply. Serialized as the `result` member.
    pub res: Option<Value>,
    /// Error slot for the reply. Wins over `res` when both are set.
    pub err: Option<RpcError>,
    /// Terminates the chain even when `next` is called. With neither `res`
    /// nor `err` set, also suppresses the wire reply.
    pub done: bool,
    index: usize,
    chain: Arc<[Arc<dyn ReqMiddleware>]>,
}

impl ReqCtx {
    pub(crate) fn new(conn: Arc<Conn>, req: Request, chain: Arc<[Arc<dyn ReqMiddleware>]>) -> Self {
        Self {
            conn,
            id: req.id,
            method: req.method,
            params: req.params,
            res: None,
            err: None,
            done: false,
            index: 0,
            chain,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Decode the request params into an application type.
    pub fn params<T: DeserializeOwned>(&self) -> Result<T, Error> {
        match &self.params {
            Some(raw) => serde_json::from_str(raw.get()).map_err(Error::Parse),
            None => Err(Error::InvalidRequest("request has no params".into())),
        }
    }

    /// The session of the underlying connection.
    pub fn session(&self) -> &Session {
        self.conn.session()
    }

    /// Set the result slot from any serializable value.
    pub fn set_result<T: Serialize>(&mut self, value: T) -> Result<(), Error> {
        self.res = Some(serde_json::to_value(value).map_err(Error::Parse)?);
        Ok(())
    }

    pub fn set_error(&mut self, err: RpcError) {
        self.err = Some(err);
    }

    /// Run the next handler in the chain. A no-op once `done` is set or the
    /// chain is exhausted.
    pub async fn next(&mut self) -> Result<(), Error> {
        if self.done {
            return Ok(());
        }
        let Some(mw) = self.chain.get(self.index) else {
            return Ok(());
        };
        let mw = Arc::clone(mw);
        self.index += 1;
        mw.handle(self).await
    }
}

/// Context handed to response middleware.
pub struct ResCtx {
    /// The connection the response arrived on.
    pub conn: Arc<Conn>,
    id: String,
    result: Option<Box<RawValue>>,
    error: Option<RpcError>,
    /// Terminates the chain and suppresses delivery to the pending-response
    /// callback.
    pub done: bool,
    index: usize,
    chain: Arc<[Arc<dyn ResMiddleware>]>,
}

impl ResCtx {
    pub(crate) fn new(
        conn: Arc<Conn>,
        id: String,
        res: Response,
        chain: Arc<[Arc<dyn ResMiddleware>]>,
    ) -> Self {
        Self {
            conn,
            id,
            result: res.result,
            error: res.error,
            done: false,
            index: 0,
            chain,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Decode the response result into an application type.
    pub fn result<T: DeserializeOwned>(&self) -> Result<T, Error> {
        match &self.result {
            Some(raw) => serde_json::from_str(raw.get()).map_err(Error::Parse),
            None => Err(Error::InvalidRequest("response has no result".into())),
        }
    }

    pub fn error(&self) -> Option<&RpcError> {
        self.error.as_ref()
    }

    pub fn session(&self) -> &Session {
        self.conn.session()
    }

    /// Run the next handler in the chain.
    pub async fn next(&mut self) -> Result<(), Error> {
        if self.done {
            return Ok(());
        }
        let Some(mw) = self.chain.get(self.index) else {
            return Ok(());
        };
        let mw = Arc::clone(mw);
        self.index += 1;
        mw.handle(self).await
    }

    pub(crate) fn into_response(self) -> Response {
        Response {
            id: Some(self.id),
            result: self.result,
            error: self.error,
        }
    }
}

/// Context handed to notification middleware. Notifications never produce a
/// wire reply, whatever the handlers do.
pub struct NotCtx {
    /// The connection the notification arrived on.
    pub conn: Arc<Conn>,
    method: String,
    params: Option<Box<RawValue>>,
    /// Terminates the chain.
    pub done: bool,
    index: usize,
    chain: Arc<[Arc<dyn NotMiddleware>]>,
}

impl NotCtx {
    pub(crate) fn new(
        conn: Arc<Conn>,
        not: Notification,
        chain: Arc<[Arc<dyn NotMiddleware>]>,
    ) -> Self {
        Self {
            conn,
            method: not.method,
            params: not.params,
            done: false,
            index: 0,
            chain,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Decode the notification params into an application type.
    pub fn params<T: DeserializeOwned>(&self) -> Result<T, Error> {
        match &self.params {
            Some(raw) => serde_json::from_str(raw.get()).map_err(Error::Parse),
            None => Err(Error::InvalidRequest("notification has no params".into())),
        }
    }

    pub fn session(&self) -> &Session {
        self.conn.session()
    }

    /// Run the next handler in the chain.
    pub async fn next(&mut self) -> Result<(), Error> {
        if self.done {
            return Ok(());
        }
        let Some(mw) = self.chain.get(self.index) else {
            return Ok(());
        };
        let mw = Arc::clone(mw);
        self.index += 1;
        mw.handle(self).await
    }
}
