//! The file sync sub-protocol behind push, pull and stat.
//!
//! After a status-checked `sync:` request the connection stops speaking text
//! frames and switches to binary sync messages (see [`crate::protocol`]).
//! A [`SyncSession`] drives one transfer over one connection:
//!
//! ```text
//! SyncRequested -> Sending (push) | Receiving (pull) -> Done | Failed
//! ```
//!
//! Push:
//!
//! ```text
//! SEND "<dst>,<mode>"  DATA <chunk> ... DATA <chunk>  DONE <mtime>  <- OKAY | FAIL <msg>
//! ```
//!
//! Pull:
//!
//! ```text
//! RECV "<src>"  <- DATA <chunk> ... DONE <4 bytes> | FAIL <msg>
//! ```
//!
//! A failed pull removes the partially written destination file.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use tracing::{debug, debug_span, trace, warn, Instrument};

use crate::connection::Connection;
use crate::error::{AdbError, Result};
use crate::protocol::{SyncTag, SYNC_DATA_MAX};

// ---------------------------------------------------------------------------
// Constants and types
// ---------------------------------------------------------------------------

/// Default permission bits for pushed files.
pub const DEFAULT_MODE: u32 = 0o644;

/// Regular-file bit, always set on the mode sent with `SEND`.
pub const S_IFREG: u32 = 0o100000;

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;

/// Progress callback for push: `(source, total_bytes, bytes_sent)`.
pub type ProgressCallback = dyn Fn(&Path, u64, u64) + Send + Sync;

/// Where a sync session currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    SyncRequested,
    Sending,
    Receiving,
    Done,
    Failed,
}

/// File attributes returned by `STAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub mode: u32,
    pub size: u32,
    pub mtime: u32,
}

impl FileStat {
    /// The daemon answers an all-zero record for missing paths.
    pub fn exists(&self) -> bool {
        self.mode != 0 || self.size != 0 || self.mtime != 0
    }

    pub fn is_file(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }
}

/// Check that `src` is an existing regular file, before any network I/O.
pub async fn validate_source(src: &Path) -> Result<std::fs::Metadata> {
    match tokio::fs::metadata(src).await {
        Ok(meta) if meta.is_file() => Ok(meta),
        Ok(_) => Err(AdbError::Validation(format!(
            "{} is not a regular file",
            src.display()
        ))),
        Err(err) => Err(AdbError::Validation(format!(
            "{} does not exist: {err}",
            src.display()
        ))),
    }
}

/// Seconds since the epoch as carried by DONE. Times before the epoch are 0,
/// times past the 32-bit range saturate.
fn unix_seconds(time: SystemTime) -> u32 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// SyncSession
// ---------------------------------------------------------------------------

/// One push, pull or stat over a dedicated connection.
#[derive(Debug)]
pub struct SyncSession {
    conn: Connection,
    state: SyncState,
    offset: u64,
}

impl SyncSession {
    /// Put `conn` into sync mode with a status-checked `sync:` request.
    pub async fn open(mut conn: Connection) -> Result<Self> {
        conn.command(&["sync:"]).await?;
        Ok(Self {
            conn,
            state: SyncState::SyncRequested,
            offset: 0,
        })
    }

    /// Current state of the session.
    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Bytes transferred so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn transition(&mut self, next: SyncState) {
        trace!(from = ?self.state, to = ?next, "sync state");
        self.state = next;
    }

    /// Send the local file `src` to `dst` on the device.
    ///
    /// Returns the number of bytes sent, which always equals the local file
    /// size. Any failure aborts the whole transfer.
    pub async fn push(
        mut self,
        src: &Path,
        dst: &str,
        mode: u32,
        progress: Option<&ProgressCallback>,
    ) -> Result<u64> {
        let span = debug_span!("sync_push", src = %src.display(), dst);
        let result = self.send_file(src, dst, mode, progress).instrument(span).await;
        self.finish(&result);
        result
    }

    async fn send_file(
        &mut self,
        src: &Path,
        dst: &str,
        mode: u32,
        progress: Option<&ProgressCallback>,
    ) -> Result<u64> {
        let meta = validate_source(src).await?;
        let total = meta.len();
        let mtime = meta.modified().map(unix_seconds).unwrap_or(0);

        let header = format!("{dst},{}", mode | S_IFREG);
        self.conn.message(SyncTag::Send, None, header.as_bytes()).await?;
        self.transition(SyncState::Sending);

        let mut file = File::open(src).await.map_err(|e| local_error(src, e))?;
        let mut chunk = vec![0u8; SYNC_DATA_MAX];
        loop {
            let n = file.read(&mut chunk).await.map_err(|e| local_error(src, e))?;
            if n == 0 {
                break;
            }
            self.conn.message(SyncTag::Data, None, &chunk[..n]).await?;
            self.offset += n as u64;
            if let Some(cb) = progress {
                cb(src, total, self.offset);
            }
        }

        if self.offset != total {
            return Err(AdbError::Sync(format!(
                "{} changed size during push: expected {total} bytes, read {}",
                src.display(),
                self.offset
            )));
        }

        self.conn.message(SyncTag::Done, Some(mtime), &[]).await?;

        let tag = self.read_tag().await?;
        match tag {
            SyncTag::Okay => {
                debug!(bytes = self.offset, "push complete");
                Ok(self.offset)
            }
            SyncTag::Fail => Err(AdbError::Sync(self.read_failure().await?)),
            other => Err(AdbError::Sync(format!(
                "unexpected {other} after DONE"
            ))),
        }
    }

    /// Fetch `src` from the device into the local file `dst`.
    ///
    /// Returns the number of bytes written. If the transfer fails after
    /// `dst` was created, `dst` is removed. A `dst` that cannot be created is
    /// left untouched.
    pub async fn pull(mut self, src: &str, dst: &Path) -> Result<u64> {
        let span = debug_span!("sync_pull", src, dst = %dst.display());
        let mut file = match File::create(dst).await {
            Ok(file) => file,
            Err(err) => {
                let result = Err(local_error(dst, err));
                self.finish(&result);
                return result;
            }
        };

        let result = async {
            let received = self.receive_file(src, dst, &mut file).await;
            let flushed = file.flush().await.map_err(|e| local_error(dst, e));
            let bytes = received?;
            flushed?;
            Ok::<u64, AdbError>(bytes)
        }
        .instrument(span)
        .await;

        if result.is_err() {
            if let Err(err) = tokio::fs::remove_file(dst).await {
                warn!(path = %dst.display(), error = %err, "failed to remove partial pull");
            }
        }
        self.finish(&result);
        result
    }

    async fn receive_file(&mut self, src: &str, dst: &Path, file: &mut File) -> Result<u64> {
        self.conn.message(SyncTag::Recv, None, src.as_bytes()).await?;
        self.transition(SyncState::Receiving);

        loop {
            match self.read_tag().await? {
                SyncTag::Data => {
                    let len = self.read_length("DATA chunk").await?;
                    let data = self.read_payload(len).await?;
                    file.write_all(&data).await.map_err(|e| local_error(dst, e))?;
                    self.offset += len as u64;
                    trace!(chunk = len, total = self.offset, "pull chunk");
                }
                SyncTag::Done => {
                    self.read_u32().await?;
                    debug!(bytes = self.offset, "pull complete");
                    return Ok(self.offset);
                }
                SyncTag::Fail => return Err(AdbError::Sync(self.read_failure().await?)),
                other => {
                    return Err(AdbError::Sync(format!("unexpected {other} during pull")));
                }
            }
        }
    }

    /// Query the attributes of a device path.
    pub async fn stat(mut self, path: &str) -> Result<FileStat> {
        let result = self.query_stat(path).await;
        self.finish(&result);
        result
    }

    async fn query_stat(&mut self, path: &str) -> Result<FileStat> {
        self.conn.message(SyncTag::Stat, None, path.as_bytes()).await?;
        match self.read_tag().await? {
            SyncTag::Stat => {}
            SyncTag::Fail => return Err(AdbError::Sync(self.read_failure().await?)),
            other => return Err(AdbError::Sync(format!("unexpected {other} reply to STAT"))),
        }
        let mode = self.read_u32().await?;
        let size = self.read_u32().await?;
        let mtime = self.read_u32().await?;
        Ok(FileStat { mode, size, mtime })
    }

    fn finish<T>(&mut self, result: &Result<T>) {
        let next = if result.is_ok() {
            SyncState::Done
        } else {
            SyncState::Failed
        };
        self.transition(next);
        self.conn.close();
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    async fn read_tag(&mut self) -> Result<SyncTag> {
        let raw = self.conn.read_array::<4>().await.map_err(truncated)?;
        SyncTag::from_bytes(&raw).map_err(|e| AdbError::Sync(e.to_string()))
    }

    async fn read_u32(&mut self) -> Result<u32> {
        self.conn.read_u32_le().await.map_err(truncated)
    }

    async fn read_payload(&mut self, len: usize) -> Result<Vec<u8>> {
        self.conn.read_vec(len).await.map_err(truncated)
    }

    /// Read a sync length field, refusing anything above one chunk before
    /// allocating for it.
    async fn read_length(&mut self, what: &str) -> Result<usize> {
        let len = self.read_u32().await? as usize;
        if len > SYNC_DATA_MAX {
            return Err(AdbError::Sync(format!(
                "{what} of {len} bytes exceeds {SYNC_DATA_MAX}"
            )));
        }
        Ok(len)
    }

    async fn read_failure(&mut self) -> Result<String> {
        let len = self.read_length("FAIL message").await?;
        let message = self.read_payload(len).await?;
        Ok(String::from_utf8_lossy(&message).into_owned())
    }
}

/// A connection that ends in the middle of a sync message violates the
/// protocol; other transport failures stay transport errors.
fn truncated(err: AdbError) -> AdbError {
    match err {
        AdbError::Transport(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
            AdbError::Sync("connection closed in the middle of a sync message".into())
        }
        other => other,
    }
}

fn local_error(path: &Path, err: std::io::Error) -> AdbError {
    AdbError::Sync(format!("local file {}: {err}", path.display()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
