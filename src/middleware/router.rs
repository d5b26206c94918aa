//! Method router middleware.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Error, RpcError};
use crate::middleware::{NotCtx, NotMiddleware, ReqCtx, ReqMiddleware};

/// Routes requests and notifications by method name.
///
/// A request whose method has no route is answered with `-32601 method not
/// found` and the chain stops. Unrouted notifications are logged and
/// dropped; they never produce a reply.
#[derive(Default)]
pub struct Router {
    request_routes: HashMap<String, Arc<dyn ReqMiddleware>>,
    notification_routes: HashMap<String, Arc<dyn NotMiddleware>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a request method.
    pub fn request_route(
        mut self,
        method: impl Into<String>,
        handler: impl ReqMiddleware + 'static,
    ) -> Self {
        self.request_routes.insert(method.into(), Arc::new(handler));
        self
    }

    /// Register a handler for a notification method.
    pub fn notification_route(
        mut self,
        method: impl Into<String>,
        handler: impl NotMiddleware + 'static,
    ) -> Self {
        self.notification_routes
            .insert(method.into(), Arc::new(handler));
        self
    }
}

#[async_trait]
impl ReqMiddleware for Router {
    async fn handle(&self, ctx: &mut ReqCtx) -> Result<(), Error> {
        match self.request_routes.get(ctx.method()) {
            Some(handler) => handler.handle(ctx).await,
            None => {
                debug!(method = %ctx.method(), "no route for request method");
                ctx.set_error(RpcError::method_not_found());
                ctx.done = true;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl NotMiddleware for Router {
    async fn handle(&self, ctx: &mut NotCtx) -> Result<(), Error> {
        match self.notification_routes.get(ctx.method()) {
            Some(handler) => handler.handle(ctx).await,
            None => {
                debug!(method = %ctx.method(), "no route for notification method");
                ctx.done = true;
                Ok(())
            }
        }
    }
}
