//! Error taxonomy shared by every layer of the client.

use std::string::FromUtf8Error;

use thiserror::Error;

use crate::protocol::CodecError;

/// Errors surfaced by connections, services and device sessions.
///
/// Broker-supplied text is preserved verbatim wherever the broker sent some.
#[derive(Error, Debug)]
pub enum AdbError {
    /// The socket failed (refused, reset, closed mid-read). Fatal for the
    /// connection it happened on.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The broker answered a request with a non-`OKAY` status.
    #[error("protocol error: {status}: {message}")]
    Protocol {
        /// The 4-byte status token, usually `FAIL`.
        status: String,
        /// Everything the broker sent after the status token.
        message: String,
    },

    /// The requested serial is not in the device list.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// A default device was requested but no device is attached.
    #[error("no devices attached")]
    NoDevices,

    /// The sync sub-protocol was violated or the device refused a transfer.
    #[error("sync error: {0}")]
    Sync(String),

    /// A local precondition failed before any network traffic.
    #[error("validation error: {0}")]
    Validation(String),

    /// A frame could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Text that was expected to be UTF-8 was not.
    #[error("invalid UTF-8 in response: {0}")]
    Decode(#[from] FromUtf8Error),

    /// A device command completed but its output did not report success.
    #[error("{command} failed: {output}")]
    UnexpectedOutput {
        /// The service that was invoked.
        command: String,
        /// The raw output the daemon returned.
        output: String,
    },

    /// A polling helper gave up.
    #[error("timed out: {0}")]
    Timeout(String),
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, AdbError>;

impl AdbError {
    /// Returns `true` for failures of the underlying socket.
    pub fn is_transport(&self) -> bool {
        matches!(self, AdbError::Transport(_))
    }
}
