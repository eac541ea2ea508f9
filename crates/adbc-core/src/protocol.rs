//! Wire codec for the ADB host protocol and the file sync sub-protocol.
//!
//! Two unrelated framings travel over the same kind of socket and must not be
//! confused:
//!
//! # Text command frames
//!
//! ```text
//! [Length: 4 ASCII hex digits, uppercase] [Command: UTF-8 bytes]
//! ```
//!
//! Used for every service request (`host:version`, `shell:ls`, ...) and for
//! the length-prefixed payloads the broker sends back after `OKAY`.
//!
//! # Sync messages
//!
//! ```text
//! [Tag: 4 ASCII bytes] [Length: u32 LE] [Payload: variable]
//! ```
//!
//! Used only after a `sync:` request. The `DONE` message that ends a push
//! carries the file modification time in the length slot instead of a length.
//!
//! # Example
//!
//! ```
//! use adbc_core::protocol::{decode_length, pack};
//!
//! let wire = pack("host:version").unwrap();
//! let len = decode_length(wire[..4].try_into().unwrap()).unwrap();
//! assert_eq!(&wire[4..4 + len], b"host:version");
//! ```

use std::fmt;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Size of the hex length header and of every status token.
pub const HEADER_LENGTH: usize = 4;

/// Largest payload a text frame can describe.
pub const MAX_FRAME_LENGTH: usize = 0xFFFF;

/// Largest chunk sent in a single sync `DATA` message.
pub const SYNC_DATA_MAX: usize = 64 * 1024;

/// Size of a sync message header (tag + u32 length).
pub const SYNC_HEADER_LENGTH: usize = 8;

/// Status token returned by the broker when a request succeeds.
pub const OKAY: &[u8; 4] = b"OKAY";

/// Status token returned by the broker when a request fails.
pub const FAIL: &[u8; 4] = b"FAIL";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while encoding or decoding wire frames.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    /// The value does not fit into a 4-digit hex length header.
    #[error("length {0} exceeds the 0xFFFF text frame limit")]
    LengthOverflow(usize),

    /// The payload does not fit into a u32 sync length field.
    #[error("sync payload of {0} bytes exceeds the u32 length field")]
    SyncPayloadTooLarge(usize),

    /// The 4-byte length header is not valid hexadecimal.
    #[error("invalid length header: {0:?}")]
    InvalidHeader(String),

    /// The 4-byte sync tag is not one the protocol defines.
    #[error("unknown sync tag: {0:?}")]
    UnknownTag(String),
}

// ---------------------------------------------------------------------------
// Text command framing
// ---------------------------------------------------------------------------

/// Encode a frame length as four uppercase, zero-padded hex digits.
pub fn encode_length(length: usize) -> Result<[u8; 4], CodecError> {
    if length > MAX_FRAME_LENGTH {
        return Err(CodecError::LengthOverflow(length));
    }
    let text = format!("{length:04X}");
    let mut out = [0u8; 4];
    out.copy_from_slice(text.as_bytes());
    Ok(out)
}

/// Decode a 4-byte hex length header.
pub fn decode_length(header: &[u8; 4]) -> Result<usize, CodecError> {
    let text = std::str::from_utf8(header)
        .map_err(|_| CodecError::InvalidHeader(String::from_utf8_lossy(header).into_owned()))?;
    // from_str_radix tolerates a leading '+', the wire format does not.
    if !text.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(CodecError::InvalidHeader(text.to_string()));
    }
    usize::from_str_radix(text, 16).map_err(|_| CodecError::InvalidHeader(text.to_string()))
}

/// Frame a command line: hex length header followed by the UTF-8 bytes.
///
/// The length is the byte length of the UTF-8 encoding.
pub fn pack(text: &str) -> Result<Vec<u8>, CodecError> {
    let header = encode_length(text.len())?;
    let mut buf = Vec::with_capacity(HEADER_LENGTH + text.len());
    buf.extend_from_slice(&header);
    buf.extend_from_slice(text.as_bytes());
    Ok(buf)
}

/// Join service tokens into a command line (`host`, `version` -> `host:version`).
pub fn join_command(tokens: &[&str]) -> String {
    tokens.join(":")
}

// ---------------------------------------------------------------------------
// Sync tags
// ---------------------------------------------------------------------------

/// Four-byte identifiers used by the sync sub-protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTag {
    /// Final success status of a push.
    Okay,
    /// Failure, followed by a length-prefixed message.
    Fail,
    /// Request (and reply) for file attributes.
    Stat,
    /// Directory listing request.
    List,
    /// Directory listing entry.
    Dent,
    /// Start of a pull; payload is the device path.
    Recv,
    /// Start of a push; payload is `<path>,<mode>`.
    Send,
    /// One chunk of file content.
    Data,
    /// End of transfer. In a push the length slot holds the mtime.
    Done,
    /// Leave sync mode.
    Quit,
}

impl SyncTag {
    /// The on-the-wire bytes for this tag.
    pub fn as_bytes(self) -> &'static [u8; 4] {
        match self {
            SyncTag::Okay => b"OKAY",
            SyncTag::Fail => b"FAIL",
            SyncTag::Stat => b"STAT",
            SyncTag::List => b"LIST",
            SyncTag::Dent => b"DENT",
            SyncTag::Recv => b"RECV",
            SyncTag::Send => b"SEND",
            SyncTag::Data => b"DATA",
            SyncTag::Done => b"DONE",
            SyncTag::Quit => b"QUIT",
        }
    }

    /// Try to interpret 4 raw bytes as a sync tag.
    pub fn from_bytes(bytes: &[u8; 4]) -> Result<Self, CodecError> {
        match bytes {
            b"OKAY" => Ok(SyncTag::Okay),
            b"FAIL" => Ok(SyncTag::Fail),
            b"STAT" => Ok(SyncTag::Stat),
            b"LIST" => Ok(SyncTag::List),
            b"DENT" => Ok(SyncTag::Dent),
            b"RECV" => Ok(SyncTag::Recv),
            b"SEND" => Ok(SyncTag::Send),
            b"DATA" => Ok(SyncTag::Data),
            b"DONE" => Ok(SyncTag::Done),
            b"QUIT" => Ok(SyncTag::Quit),
            other => Err(CodecError::UnknownTag(
                String::from_utf8_lossy(other).into_owned(),
            )),
        }
    }
}

impl fmt::Display for SyncTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Tags are ASCII by construction.
        f.write_str(std::str::from_utf8(self.as_bytes()).unwrap_or("????"))
    }
}

// ---------------------------------------------------------------------------
// Sync message framing
// ---------------------------------------------------------------------------

/// Encode a sync header: tag followed by a little-endian u32.
pub fn encode_sync_header(tag: SyncTag, length: u32) -> [u8; SYNC_HEADER_LENGTH] {
    let mut out = [0u8; SYNC_HEADER_LENGTH];
    out[..4].copy_from_slice(tag.as_bytes());
    out[4..].copy_from_slice(&length.to_le_bytes());
    out
}

/// Decode a sync header into its tag and u32 field.
pub fn decode_sync_header(header: &[u8; SYNC_HEADER_LENGTH]) -> Result<(SyncTag, u32), CodecError> {
    let mut tag = [0u8; 4];
    tag.copy_from_slice(&header[..4]);
    let mut len = [0u8; 4];
    len.copy_from_slice(&header[4..]);
    Ok((SyncTag::from_bytes(&tag)?, u32::from_le_bytes(len)))
}

/// Encode a complete sync message.
///
/// `length` defaults to the payload length. Passing an explicit value is how
/// `DONE` carries its timestamp.
pub fn encode_sync_message(
    tag: SyncTag,
    length: Option<u32>,
    payload: &[u8],
) -> Result<Vec<u8>, CodecError> {
    let length = match length {
        Some(value) => value,
        None => u32::try_from(payload.len())
            .map_err(|_| CodecError::SyncPayloadTooLarge(payload.len()))?,
    };
    let mut buf = Vec::with_capacity(SYNC_HEADER_LENGTH + payload.len());
    buf.extend_from_slice(&encode_sync_header(tag, length));
    buf.extend_from_slice(payload);
    Ok(buf)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
