//! A single duplex connection to the ADB server.
//!
//! This module provides [`Connection`], the low-level transport that frames
//! service requests, checks the broker's status token and, after a
//! `host:transport:<serial>` handshake, carries traffic straight to the device
//! daemon. It also speaks the binary sync message format used by push/pull.
//!
//! Connections are one-shot: every service call opens a fresh one and the
//! [`Response`] it produces owns and eventually closes it. Nothing is pooled,
//! because the transport handshake is connection-scoped and irreversible.
//!
//! # Example
//!
//! ```no_run
//! use std::net::SocketAddr;
//! use adbc_core::connection::Connection;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let addr: SocketAddr = "127.0.0.1:5037".parse()?;
//! let conn = Connection::connect(addr).await?;
//! let version = conn.request(&["host", "version"]).await?.text().await?;
//! println!("server version {version}");
//! # Ok(())
//! # }
//! ```

use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use tracing::{debug, debug_span, trace, Instrument};

use crate::error::{AdbError, Result};
use crate::protocol::{
    decode_length, encode_sync_message, join_command, pack, SyncTag, HEADER_LENGTH, OKAY,
};
use crate::response::Response;

// ---------------------------------------------------------------------------
// AdbStream trait
// ---------------------------------------------------------------------------

/// A bidirectional async byte stream that can carry ADB traffic.
///
/// [`TcpStream`] satisfies this, as do in-memory pipes such as
/// [`tokio::io::duplex`], which lets tests script a broker.
pub trait AdbStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AdbStream for T {}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// One exclusively owned connection to the broker.
///
/// Any I/O failure drops the underlying stream, so a broken connection can
/// never be read from again.
pub struct Connection {
    stream: Option<Box<dyn AdbStream>>,
    transport: Option<String>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("open", &self.stream.is_some())
            .field("transport", &self.transport)
            .finish()
    }
}

impl Connection {
    /// Open a TCP connection to the broker.
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        debug!(%addr, "connecting to adb server");
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: impl AdbStream + 'static) -> Self {
        Self {
            stream: Some(Box::new(stream)),
            transport: None,
        }
    }

    /// Returns `true` until the connection is closed or breaks.
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// The serial this connection was handed to, if a transport handshake
    /// has been performed.
    pub fn transport_serial(&self) -> Option<&str> {
        self.transport.as_deref()
    }

    /// Release the stream. Calling this more than once is harmless.
    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            trace!("connection closed");
        }
    }

    // -----------------------------------------------------------------------
    // Text command protocol
    // -----------------------------------------------------------------------

    /// Send a status-checked request and hand the rest of the stream to a
    /// [`Response`].
    ///
    /// Tokens are joined with `:`. A non-`OKAY` status consumes the rest of
    /// the stream as the error message and fails with
    /// [`AdbError::Protocol`].
    pub async fn request(mut self, tokens: &[&str]) -> Result<Response> {
        self.command(tokens).await?;
        Ok(Response::new(self))
    }

    /// Send a request without reading a status token.
    ///
    /// The caller interprets whatever the peer sends next.
    pub async fn request_without_check(mut self, tokens: &[&str]) -> Result<Response> {
        let command = join_command(tokens);
        let span = debug_span!("adb_request", command = %command, checked = false);
        self.send_command(&command).instrument(span).await?;
        Ok(Response::new(self))
    }

    /// Send a status-checked request and keep ownership of the connection.
    ///
    /// Used by protocols that continue on the same connection after the
    /// status token, such as the transport handshake and `sync:`.
    pub async fn command(&mut self, tokens: &[&str]) -> Result<()> {
        let command = join_command(tokens);
        let span = debug_span!("adb_request", command = %command, checked = true);
        async {
            self.send_command(&command).await?;
            self.check_status().await
        }
        .instrument(span)
        .await
    }

    /// Switch this connection to the device identified by `serial`.
    ///
    /// Every byte sent afterwards is routed to the device daemon. There is no
    /// way back for the remaining lifetime of the connection.
    pub async fn transport_mode(mut self, serial: &str) -> Result<Self> {
        self.command(&["host", "transport", serial]).await?;
        debug!(serial, "connection switched to transport mode");
        self.transport = Some(serial.to_string());
        Ok(self)
    }

    /// Write a binary sync message.
    ///
    /// `length` defaults to the payload length when `None`.
    pub async fn message(
        &mut self,
        tag: SyncTag,
        length: Option<u32>,
        payload: &[u8],
    ) -> Result<()> {
        let frame = encode_sync_message(tag, length, payload)?;
        trace!(%tag, frame_bytes = frame.len(), "writing sync message");
        self.write_all(&frame).await
    }

    async fn send_command(&mut self, command: &str) -> Result<()> {
        let frame = pack(command)?;
        debug!(command, "sending request");
        self.write_all(&frame).await
    }

    /// Read the 4-byte status token and fail unless it is `OKAY`.
    pub(crate) async fn check_status(&mut self) -> Result<()> {
        let status = self.read_array::<HEADER_LENGTH>().await?;
        if &status == OKAY {
            return Ok(());
        }

        let rest = self.read_to_end().await?;
        self.close();
        let status = String::from_utf8_lossy(&status).into_owned();
        let message = failure_message(&rest);
        debug!(%status, %message, "request refused");
        Err(AdbError::Protocol { status, message })
    }

    // -----------------------------------------------------------------------
    // Raw I/O
    // -----------------------------------------------------------------------

    fn stream_mut(&mut self) -> Result<&mut Box<dyn AdbStream>> {
        self.stream.as_mut().ok_or_else(|| {
            AdbError::Transport(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection is closed",
            ))
        })
    }

    /// Drop the stream after an I/O failure so it is never reused.
    fn broken(&mut self, err: io::Error) -> AdbError {
        self.stream.take();
        AdbError::Transport(err)
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let stream = self.stream_mut()?;
        let result = async {
            stream.write_all(data).await?;
            stream.flush().await
        }
        .await;
        result.map_err(|e| self.broken(e))
    }

    /// Fill `buf` completely, looping over short reads.
    pub(crate) async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let stream = self.stream_mut()?;
        let result = stream.read_exact(buf).await;
        result.map(|_| ()).map_err(|e| self.broken(e))
    }

    pub(crate) async fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.read_exact(&mut buf).await?;
        Ok(buf)
    }

    pub(crate) async fn read_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf).await?;
        Ok(buf)
    }

    pub(crate) async fn read_u32_le(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array::<4>().await?))
    }

    /// Read everything until the peer closes its side.
    pub(crate) async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let stream = self.stream_mut()?;
        let mut buf = Vec::new();
        let result = stream.read_to_end(&mut buf).await;
        match result {
            Ok(n) => {
                trace!(bytes = n, "read to end of stream");
                Ok(buf)
            }
            Err(e) => Err(self.broken(e)),
        }
    }

    /// Read one hex-length-prefixed frame.
    pub(crate) async fn read_frame(&mut self) -> Result<Vec<u8>> {
        let header = self.read_array::<HEADER_LENGTH>().await?;
        let len = decode_length(&header)?;
        trace!(payload_bytes = len, "reading frame");
        self.read_vec(len).await
    }

    pub(crate) fn into_stream(mut self) -> Option<Box<dyn AdbStream>> {
        self.stream.take()
    }
}

/// Turn the bytes that follow a failure status into a message.
///
/// The broker usually prefixes the text with its own hex length; that prefix
/// is stripped only when it matches the remaining byte count exactly.
fn failure_message(rest: &[u8]) -> String {
    if rest.len() >= HEADER_LENGTH {
        let mut header = [0u8; HEADER_LENGTH];
        header.copy_from_slice(&rest[..HEADER_LENGTH]);
        if decode_length(&header).ok() == Some(rest.len() - HEADER_LENGTH) {
            return String::from_utf8_lossy(&rest[HEADER_LENGTH..]).into_owned();
        }
    }
    String::from_utf8_lossy(rest).into_owned()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
