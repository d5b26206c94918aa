//! WebSocket transport: one binary message per envelope.
//!
//! The WebSocket frame delimits the message, so no length prefix is
//! involved. Text messages carrying the same JSON body are accepted on
//! read. Control frames are handled here and never reach the codec.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use crate::conn::ConnOptions;
use crate::error::Error;
use crate::transport::{FrameSink, FrameSource, SharedDeadline};

/// Split a WebSocket stream into framed source and sink halves.
pub(crate) fn websocket_split<S>(
    stream: WebSocketStream<S>,
    options: &ConnOptions,
    deadline: SharedDeadline,
) -> (Box<dyn FrameSource>, Box<dyn FrameSink>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, source) = stream.split();
    (
        Box::new(WsFrameSource {
            inner: source,
            max_msg_size: options.max_msg_size,
            deadline,
            debug: options.debug,
        }),
        Box::new(WsFrameSink {
            inner: sink,
            debug: options.debug,
        }),
    )
}

struct WsFrameSource<S> {
    inner: SplitStream<WebSocketStream<S>>,
    max_msg_size: u64,
    deadline: SharedDeadline,
    debug: bool,
}

impl<S> WsFrameSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read_frame_inner(&mut self) -> Result<Vec<u8>, Error> {
        loop {
            let frame = match self.inner.next().await {
                Some(Ok(WsMessage::Binary(data))) => data,
                Some(Ok(WsMessage::Text(text))) => text.into_bytes(),
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => {
                    // Pongs are queued by tungstenite itself.
                    continue;
                }
                Some(Ok(WsMessage::Close(_))) | None => return Err(Error::PeerClosed),
                Some(Err(e)) => return Err(Error::WebSocket(e)),
            };

            if frame.len() as u64 > self.max_msg_size {
                return Err(Error::FrameTooLarge {
                    size: frame.len() as u64,
                    max: self.max_msg_size,
                });
            }
            if self.debug {
                debug!(frame = %String::from_utf8_lossy(&frame), "incoming frame");
            }
            return Ok(frame);
        }
    }
}

#[async_trait]
impl<S> FrameSource for WsFrameSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read_frame(&mut self) -> Result<Vec<u8>, Error> {
        match tokio::time::timeout(self.deadline.get(), self.read_frame_inner()).await {
            Ok(result) => result,
            Err(_) => Err(Error::ReadTimeout),
        }
    }
}

struct WsFrameSink<S> {
    inner: SplitSink<WebSocketStream<S>, WsMessage>,
    debug: bool,
}

#[async_trait]
impl<S> FrameSink for WsFrameSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), Error> {
        if self.debug {
            debug!(frame = %String::from_utf8_lossy(frame), "outgoing frame");
        }
        self.inner
            .send(WsMessage::Binary(frame.to_vec()))
            .await
            .map_err(Error::WebSocket)
    }

    async fn shutdown(&mut self) -> Result<(), Error> {
        // Best effort: the peer may already be gone.
        let _ = self.inner.send(WsMessage::Close(None)).await;
        let _ = self.inner.close().await;
        Ok(())
    }
}
