//! # riptide
//!
//! A bidirectional JSON-RPC 2.0 framework for long-lived peer-to-peer
//! services. Connections run over length-prefixed TLS streams or
//! WebSockets; both sides may initiate requests, and every connection runs
//! its messages through composable middleware chains.
//!
//! ## Architecture
//!
//! - [`Server`] accepts connections, fans out inherited middleware, and
//!   tracks live connections by id.
//! - [`Client`] dials a server and drives the identical connection engine.
//! - [`Conn`] is the per-peer engine: a single read task dispatches
//!   incoming messages in order, outbound requests are correlated to their
//!   response callbacks, and writes serialize through a connection mutex.
//! - [`middleware`] holds the typed contexts ([`ReqCtx`], [`ResCtx`],
//!   [`NotCtx`]) and the bundled collaborators (echo, router, certificate
//!   and JWT authentication).
//!
//! ## Example
//!
//! ```no_run
//! use riptide::{middleware::Echo, Client, ConnOptions, Server, TlsOptions};
//!
//! # async fn run() -> Result<(), riptide::Error> {
//! # let (cert, key, ca) = (vec![], vec![], vec![]);
//! let mut server = Server::bind("127.0.0.1:3001").await?;
//! server.use_tls(&cert, &key, Some(&ca))?;
//! server.req_middleware(Echo);
//! tokio::spawn(async move { server.start().await });
//!
//! let client = Client::dial(
//!     "127.0.0.1:3001",
//!     TlsOptions { ca: Some(ca), ..TlsOptions::default() },
//!     ConnOptions::default(),
//! )
//! .await?;
//! client.start()?;
//! let _response = client.call("echo", Some("hello")).await?;
//! # Ok(())
//! # }
//! ```

mod client;
mod conn;
pub mod error;
mod message;
pub mod middleware;
mod pending;
mod server;
mod session;
mod transport;

pub use client::{Client, TlsOptions};
pub use conn::{Conn, ConnOptions};
pub use error::{Error, RpcError};
pub use message::{Envelope, Message, Notification, Request, Response};
pub use middleware::{NotCtx, NotMiddleware, ReqCtx, ReqMiddleware, ResCtx, ResMiddleware};
pub use server::Server;
pub use session::Session;
