//! JSON Web Token authentication middleware (HMAC).

use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::Error;
use crate::middleware::cert_auth::USERID_KEY;
use crate::middleware::{ReqCtx, ReqMiddleware};

/// Params of an authentication request carrying the token.
#[derive(Debug, Serialize, Deserialize)]
struct TokenParams {
    token: String,
}

/// JWT claims: the subject becomes the session `userid`.
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: i64,
}

/// Authenticates the first request of a connection with an HS256 JWT.
///
/// Expects request params of the form `{"token": "..."}`. On success the
/// token subject is stored in the session as `userid` and the chain
/// continues; every later request passes straight through. An invalid or
/// undecodable token closes the connection right away.
pub struct JwtAuth {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtAuth {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

#[async_trait]
impl ReqMiddleware for JwtAuth {
    async fn handle(&self, ctx: &mut ReqCtx) -> Result<(), Error> {
        if ctx.session().get(USERID_KEY).is_some() {
            return ctx.next().await;
        }

        let params: TokenParams = match ctx.params() {
            Ok(params) => params,
            Err(e) => {
                ctx.done = true;
                ctx.conn.close().await?;
                return Err(e);
            }
        };

        let token = match decode::<Claims>(&params.token, &self.decoding_key, &self.validation) {
            Ok(data) => data,
            Err(e) => {
                warn!(
                    conn = %ctx.conn.id(),
                    remote = ?ctx.conn.remote_addr(),
                    error = %e,
                    "invalid JWT authentication attempt"
                );
                ctx.done = true;
                ctx.conn.close().await?;
                return Ok(());
            }
        };

        info!(
            conn = %ctx.conn.id(),
            userid = %token.claims.sub,
            "JWT authenticated"
        );
        ctx.session().set(USERID_KEY, token.claims.sub);
        ctx.next().await
    }
}
