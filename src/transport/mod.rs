//! Transports: anything that can carry one envelope per frame.
//!
//! Both the length-prefixed byte-stream transport and the WebSocket
//! transport expose the same read/write-one-frame surface, split into a
//! source half owned by the connection's read task and a sink half guarded
//! by the connection's write mutex.

pub(crate) mod framed;
pub(crate) mod tls;
pub(crate) mod websocket;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Error;

/// Read half of a transport. Exactly one task reads from it.
#[async_trait]
pub(crate) trait FrameSource: Send {
    /// Read the next complete frame, honoring the sliding read deadline.
    async fn read_frame(&mut self) -> Result<Vec<u8>, Error>;
}

/// Write half of a transport. Serialized by the connection write mutex.
#[async_trait]
pub(crate) trait FrameSink: Send {
    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), Error>;
    async fn shutdown(&mut self) -> Result<(), Error>;
}

/// Read deadline shared between the connection handle and its reader, so
/// the deadline can be adjusted while the read loop runs.
#[derive(Clone, Debug)]
pub(crate) struct SharedDeadline(Arc<AtomicU64>);

impl SharedDeadline {
    pub(crate) fn new(deadline: Duration) -> Self {
        Self(Arc::new(AtomicU64::new(deadline.as_millis() as u64)))
    }

    pub(crate) fn get(&self) -> Duration {
        Duration::from_millis(self.0.load(Ordering::Relaxed))
    }

    pub(crate) fn set(&self, deadline: Duration) {
        self.0.store(deadline.as_millis() as u64, Ordering::Relaxed);
    }
}
