//! Echo middleware: answers every request with its own params.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Error;
use crate::middleware::{ReqCtx, ReqMiddleware};

/// Replies to any request with the request params as the result. Useful for
/// connectivity checks and as the smallest possible request handler.
#[derive(Debug, Clone, Copy, Default)]
pub struct Echo;

#[async_trait]
impl ReqMiddleware for Echo {
    async fn handle(&self, ctx: &mut ReqCtx) -> Result<(), Error> {
        let params = ctx.params::<Value>().unwrap_or(Value::Null);
        ctx.res = Some(params);
        ctx.next().await
    }
}
