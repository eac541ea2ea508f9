//! Single-use handles over the read side of a successful request.
//!
//! A [`Response`] owns the [`Connection`] that produced it. Each way of
//! consuming it takes `self` by value, so only one read mode can ever be used
//! per response:
//!
//! - [`Response::text`] / [`Response::bytes`]: one length-prefixed frame
//! - [`Response::read_to_end`]: unframed bytes until EOF (shell output)
//! - [`Response::stream`] / [`Response::stream_text`]: frames until the peer
//!   closes or the stream is cancelled
//! - [`Response::into_reader`]: the raw byte stream as an [`AsyncRead`]
//!
//! Dropping any of these closes the connection.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use tracing::{debug, trace};

use crate::connection::{AdbStream, Connection};
use crate::error::Result;

// ---------------------------------------------------------------------------
// CloseHandle
// ---------------------------------------------------------------------------

/// Closes a long-lived stream or reader from another task.
///
/// The pending read observes the close, the connection is dropped and the
/// consumer sees the end of the sequence (or EOF for a reader).
#[derive(Debug, Clone)]
pub struct CloseHandle {
    token: CancellationToken,
}

impl CloseHandle {
    /// Request the close.
    pub fn close(&self) {
        self.token.cancel();
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// The rest of a connection after the broker answered `OKAY`.
#[derive(Debug)]
pub struct Response {
    conn: Connection,
}

impl Response {
    pub(crate) fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// The connection backing this response.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Read one frame and decode it as UTF-8.
    pub async fn text(self) -> Result<String> {
        let data = self.bytes().await?;
        Ok(String::from_utf8(data)?)
    }

    /// Read one frame as raw bytes.
    pub async fn bytes(mut self) -> Result<Vec<u8>> {
        let frame = self.conn.read_frame().await;
        self.conn.close();
        frame
    }

    /// Read unframed bytes until the peer closes the connection.
    pub async fn read_to_end(mut self) -> Result<Vec<u8>> {
        let data = self.conn.read_to_end().await;
        self.conn.close();
        data
    }

    /// Turn the response into an endless sequence of frames.
    pub fn stream(self) -> FrameStream {
        FrameStream {
            conn: self.conn,
            token: CancellationToken::new(),
        }
    }

    /// Like [`stream`](Self::stream) but each frame is decoded as UTF-8.
    pub fn stream_text(self) -> TextFrameStream {
        TextFrameStream {
            frames: self.stream(),
        }
    }

    /// Hand over the raw byte stream for incremental reads.
    pub fn into_reader(self) -> ResponseReader {
        let token = CancellationToken::new();
        ResponseReader {
            inner: self.conn.into_stream(),
            cancelled: Box::pin(token.clone().cancelled_owned()),
            token,
        }
    }

    /// Close the connection without reading anything further.
    pub fn close(mut self) {
        self.conn.close();
    }
}

// ---------------------------------------------------------------------------
// FrameStream
// ---------------------------------------------------------------------------

/// Length-prefixed frames read until the connection ends.
///
/// A read failure or EOF ends the sequence rather than surfacing an error;
/// for a subscription, the peer hanging up is the normal way to finish.
#[derive(Debug)]
pub struct FrameStream {
    conn: Connection,
    token: CancellationToken,
}

impl FrameStream {
    /// Handle that ends this stream from another task.
    pub fn closer(&self) -> CloseHandle {
        CloseHandle {
            token: self.token.clone(),
        }
    }

    /// Returns `true` while further frames may arrive.
    pub fn is_open(&self) -> bool {
        self.conn.is_open() && !self.token.is_cancelled()
    }

    /// Wait for the next frame. `None` means the stream has ended.
    pub async fn next(&mut self) -> Option<Vec<u8>> {
        if !self.conn.is_open() {
            return None;
        }

        let token = &self.token;
        let conn = &mut self.conn;
        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("frame stream closed by caller");
                None
            }
            frame = conn.read_frame() => Some(frame),
        };

        match outcome {
            Some(Ok(frame)) => {
                trace!(frame_bytes = frame.len(), "stream frame");
                Some(frame)
            }
            Some(Err(err)) => {
                debug!(error = %err, "frame stream ended");
                self.conn.close();
                None
            }
            None => {
                self.conn.close();
                None
            }
        }
    }
}

/// UTF-8 view over a [`FrameStream`].
#[derive(Debug)]
pub struct TextFrameStream {
    frames: FrameStream,
}

impl TextFrameStream {
    /// Handle that ends this stream from another task.
    pub fn closer(&self) -> CloseHandle {
        self.frames.closer()
    }

    /// Returns `true` while further frames may arrive.
    pub fn is_open(&self) -> bool {
        self.frames.is_open()
    }

    /// Wait for the next frame. A frame that is not UTF-8 is yielded as an
    /// error without ending the stream.
    pub async fn next(&mut self) -> Option<Result<String>> {
        let frame = self.frames.next().await?;
        Some(String::from_utf8(frame).map_err(Into::into))
    }
}

// ---------------------------------------------------------------------------
// ResponseReader
// ---------------------------------------------------------------------------

/// Raw, unframed access to a connection's byte stream.
///
/// Reads return EOF once the peer closes, the reader is closed, or its
/// [`CloseHandle`] fires.
pub struct ResponseReader {
    inner: Option<Box<dyn AdbStream>>,
    token: CancellationToken,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl std::fmt::Debug for ResponseReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseReader")
            .field("open", &self.is_open())
            .finish()
    }
}

impl ResponseReader {
    /// Handle that closes this reader from another task.
    pub fn closer(&self) -> CloseHandle {
        CloseHandle {
            token: self.token.clone(),
        }
    }

    /// Returns `true` until the reader is closed.
    pub fn is_open(&self) -> bool {
        self.inner.is_some() && !self.token.is_cancelled()
    }

    /// Drop the underlying connection.
    pub fn close(&mut self) {
        self.token.cancel();
        self.inner.take();
    }
}

impl AsyncRead for ResponseReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.token.is_cancelled() || this.cancelled.as_mut().poll(cx).is_ready() {
            if this.inner.take().is_some() {
                debug!("response reader closed by caller");
            }
            return Poll::Ready(Ok(()));
        }

        match this.inner.as_mut() {
            Some(stream) => Pin::new(stream).poll_read(cx, buf),
            None => Poll::Ready(Ok(())),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
