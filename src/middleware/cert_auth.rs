//! Client-certificate authentication middleware.

use async_trait::async_trait;
use tracing::{info, warn};
use x509_parser::prelude::*;

use crate::error::Error;
use crate::middleware::{NotCtx, NotMiddleware, ReqCtx, ReqMiddleware, ResCtx, ResMiddleware};

/// Key under which the authenticated identity is stored in the session.
pub const USERID_KEY: &str = "userid";

/// Authenticates the peer by its TLS client certificate.
///
/// The certificate chain, when presented, was already validated by the TLS
/// acceptor; this middleware only lifts the leaf certificate's subject
/// CommonName into the session as `userid`. A peer without a certificate is
/// disconnected before any message is processed further: the chain stops
/// with no reply and the connection closes.
///
/// Register the same instance on all three chains so unauthenticated
/// responses and notifications are dropped as well.
#[derive(Debug, Clone, Copy, Default)]
pub struct CertAuth;

impl CertAuth {
    fn authenticate(&self, ctx_conn: &crate::conn::Conn) -> bool {
        if ctx_conn.session().get(USERID_KEY).is_some() {
            return true;
        }

        let certs = ctx_conn.peer_certificates();
        let Some(leaf) = certs.first() else {
            warn!(
                conn = %ctx_conn.id(),
                remote = ?ctx_conn.remote_addr(),
                "client-certificate authentication attempt without a certificate"
            );
            return false;
        };

        match common_name(leaf.as_ref()) {
            Some(userid) => {
                info!(
                    conn = %ctx_conn.id(),
                    remote = ?ctx_conn.remote_addr(),
                    userid = %userid,
                    "client-certificate authenticated"
                );
                ctx_conn.session().set(USERID_KEY, userid);
                true
            }
            None => {
                warn!(conn = %ctx_conn.id(), "client certificate has no CommonName");
                false
            }
        }
    }
}

fn common_name(der: &[u8]) -> Option<String> {
    let (_, cert) = X509Certificate::from_der(der).ok()?;
    let name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);
    name
}

#[async_trait]
impl ReqMiddleware for CertAuth {
    async fn handle(&self, ctx: &mut ReqCtx) -> Result<(), Error> {
        if !self.authenticate(&ctx.conn) {
            ctx.done = true;
            ctx.conn.close().await?;
            return Ok(());
        }
        ctx.next().await
    }
}

#[async_trait]
impl ResMiddleware for CertAuth {
    async fn handle(&self, ctx: &mut ResCtx) -> Result<(), Error> {
        if ctx.session().get(USERID_KEY).is_none() {
            ctx.done = true;
            ctx.conn.close().await?;
            return Ok(());
        }
        ctx.next().await
    }
}

#[async_trait]
impl NotMiddleware for CertAuth {
    async fn handle(&self, ctx: &mut NotCtx) -> Result<(), Error> {
        if ctx.session().get(USERID_KEY).is_none() {
            ctx.done = true;
            ctx.conn.close().await?;
            return Ok(());
        }
        ctx.next().await
    }
}
