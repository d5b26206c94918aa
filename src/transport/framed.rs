//! Length-prefixed framing over async byte streams.
//!
//! Each frame is a fixed-width little-endian length header followed by the
//! payload. Generic over the stream type, so the same framing runs over a
//! TLS stream, a plain TCP socket, or an in-memory duplex in tests.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::conn::ConnOptions;
use crate::error::Error;
use crate::transport::{FrameSink, FrameSource, SharedDeadline};

/// Split a byte stream into framed source and sink halves.
pub(crate) fn framed_split<S>(
    stream: S,
    options: &ConnOptions,
    deadline: SharedDeadline,
) -> (Box<dyn FrameSource>, Box<dyn FrameSink>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    (
        Box::new(FramedReader {
            inner: read_half,
            header_size: options.header_size,
            max_msg_size: options.max_msg_size,
            deadline,
            debug: options.debug,
        }),
        Box::new(FramedWriter {
            inner: write_half,
            header_size: options.header_size,
            debug: options.debug,
        }),
    )
}

struct FramedReader<R> {
    inner: R,
    header_size: usize,
    max_msg_size: u64,
    deadline: SharedDeadline,
    debug: bool,
}

impl<R> FramedReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn read_frame_inner(&mut self) -> Result<Vec<u8>, Error> {
        // Little-endian header in the low bytes; the rest stays zero.
        let mut header = [0u8; 8];
        self.inner
            .read_exact(&mut header[..self.header_size])
            .await
            .map_err(map_read_err)?;
        let len = u64::from_le_bytes(header);

        if len > self.max_msg_size {
            return Err(Error::FrameTooLarge {
                size: len,
                max: self.max_msg_size,
            });
        }

        // read_exact loops over partial reads until the frame is complete.
        let mut frame = vec![0u8; len as usize];
        self.inner
            .read_exact(&mut frame)
            .await
            .map_err(map_read_err)?;

        if self.debug {
            debug!(frame = %String::from_utf8_lossy(&frame), "incoming frame");
        }
        Ok(frame)
    }
}

#[async_trait]
impl<R> FrameSource for FramedReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn read_frame(&mut self) -> Result<Vec<u8>, Error> {
        // Sliding deadline: each frame has the full window to itself.
        match tokio::time::timeout(self.deadline.get(), self.read_frame_inner()).await {
            Ok(result) => result,
            Err(_) => Err(Error::ReadTimeout),
        }
    }
}

struct FramedWriter<W> {
    inner: W,
    header_size: usize,
    debug: bool,
}

#[async_trait]
impl<W> FrameSink for FramedWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), Error> {
        let len = frame.len() as u64;
        if self.header_size < 8 {
            let limit = (1u64 << (8 * self.header_size)) - 1;
            if len > limit {
                return Err(Error::FrameTooLarge {
                    size: len,
                    max: limit,
                });
            }
        }

        if self.debug {
            debug!(frame = %String::from_utf8_lossy(frame), "outgoing frame");
        }

        let header = len.to_le_bytes();
        self.inner
            .write_all(&header[..self.header_size])
            .await
            .map_err(map_write_err)?;
        self.inner.write_all(frame).await.map_err(map_write_err)?;
        self.inner.flush().await.map_err(map_write_err)?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), Error> {
        self.inner.shutdown().await.map_err(Error::Io)
    }
}

fn map_read_err(e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        Error::PeerClosed
    } else {
        Error::Io(e)
    }
}

fn map_write_err(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::WriteZero => Error::WriteShort,
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => Error::PeerClosed,
        _ => Error::Io(e),
    }
}
