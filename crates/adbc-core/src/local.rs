//! Local services: commands executed by the device daemon.
//!
//! Implementors hand out connections that have already completed the
//! transport handshake, so every request here is addressed to one device.
//! Each call opens its own connection; there is no persistent device session.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use tracing::{debug, warn};

use crate::error::{AdbError, Result};
use crate::response::{Response, ResponseReader};
use crate::service::Service;
use crate::sync::{validate_source, FileStat, ProgressCallback, SyncSession};

/// A device-to-host socket mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReverseRule {
    /// Transport kind reported by the daemon (e.g. `UsbFfs`).
    pub kind: String,
    /// Socket on the device.
    pub local: String,
    /// Socket on the host.
    pub remote: String,
}

/// Parse `reverse:list-forward` output (`<kind> <local> <remote>` per line).
pub fn parse_reverse_list(text: &str) -> Vec<ReverseRule> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.as_slice() {
                [kind, local, remote] => Some(ReverseRule {
                    kind: kind.to_string(),
                    local: local.to_string(),
                    remote: remote.to_string(),
                }),
                _ => {
                    warn!(line, "skipping malformed reverse rule");
                    None
                }
            }
        })
        .collect()
}

/// Build the text of a shell command from a program and its arguments.
pub fn shell_command_line(cmd: &str, args: &[&str]) -> String {
    let mut line = String::from(cmd);
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// Run a daemon service whose unframed output must mention one of `success`.
async fn run_checked<S: Service + ?Sized>(
    service: &S,
    tokens: &[&str],
    success: &[&str],
) -> Result<String> {
    let raw = service.request(tokens).await?.read_to_end().await?;
    let output = String::from_utf8(raw)?.trim().to_string();
    let lowered = output.to_lowercase();
    if success.iter().any(|marker| lowered.contains(marker)) {
        Ok(output)
    } else {
        Err(AdbError::UnexpectedOutput {
            command: tokens.join(":"),
            output,
        })
    }
}

/// Reverse services answer twice: once when the daemon opens the service and
/// once for the command itself.
async fn reverse_request<S: Service + ?Sized>(service: &S, tokens: &[&str]) -> Result<Response> {
    let mut conn = service.create_connection().await?;
    conn.command(tokens).await?;
    conn.check_status().await?;
    Ok(Response::new(conn))
}

/// Commands served by the daemon on one device.
#[async_trait]
pub trait LocalService: Service {
    /// Run a shell command to completion and return its output with trailing
    /// whitespace removed.
    ///
    /// The command must terminate; use [`shell_reader`](Self::shell_reader)
    /// for endless output such as `logcat`.
    async fn shell(&self, cmd: &str, args: &[&str]) -> Result<String> {
        let raw = self.shell_raw(cmd, args).await?;
        let text = String::from_utf8(raw)?;
        Ok(text.trim_end().to_string())
    }

    /// Run a shell command to completion and return its raw output.
    async fn shell_raw(&self, cmd: &str, args: &[&str]) -> Result<Vec<u8>> {
        let line = shell_command_line(cmd, args);
        self.request(&["shell", &line]).await?.read_to_end().await
    }

    /// Start a shell command and return a reader over its live output.
    ///
    /// The caller owns the reader; closing or dropping it ends the command's
    /// connection.
    async fn shell_reader(&self, cmd: &str, args: &[&str]) -> Result<ResponseReader> {
        let line = shell_command_line(cmd, args);
        Ok(self.request(&["shell", &line]).await?.into_reader())
    }

    /// Restart the daemon listening on TCP `port` (`adb tcpip`).
    async fn tcpip(&self, port: u16) -> Result<String> {
        let port = port.to_string();
        run_checked(self, &["tcpip", &port], &["restarting in tcp mode port"]).await
    }

    /// Restart the daemon with root permissions.
    async fn root(&self) -> Result<String> {
        run_checked(
            self,
            &["root", ""],
            &["restarting adbd as root", "already running as root"],
        )
        .await
    }

    /// Restart the daemon without root permissions.
    async fn unroot(&self) -> Result<String> {
        run_checked(
            self,
            &["unroot", ""],
            &["restarting adbd as non root", "not running as root"],
        )
        .await
    }

    /// Reboot, optionally into `bootloader`, `recovery`, `sideload` or
    /// `sideload-auto-reboot`.
    async fn reboot(&self, option: Option<&str>) -> Result<()> {
        let option = option.unwrap_or("");
        debug!(option, "rebooting device");
        self.request(&["reboot", option]).await?.close();
        Ok(())
    }

    /// Remount `/system` read-write.
    async fn remount(&self) -> Result<String> {
        run_checked(self, &["remount", ""], &["remount succeeded"]).await
    }

    /// Every reverse mapping of this device.
    async fn reverse_list(&self) -> Result<Vec<ReverseRule>> {
        let text = reverse_request(self, &["reverse", "list-forward"])
            .await?
            .text()
            .await?;
        Ok(parse_reverse_list(&text))
    }

    /// Map device socket `local` to host socket `remote`.
    async fn reverse(&self, remote: &str, local: &str, norebind: bool) -> Result<()> {
        let spec = format!("{local};{remote}");
        let resp = if norebind {
            reverse_request(self, &["reverse", "forward", "norebind", &spec]).await?
        } else {
            reverse_request(self, &["reverse", "forward", &spec]).await?
        };
        resp.close();
        Ok(())
    }

    /// Remove the reverse mapping bound to device socket `local`.
    async fn reverse_remove(&self, local: &str) -> Result<()> {
        reverse_request(self, &["reverse", "killforward", local])
            .await?
            .close();
        Ok(())
    }

    /// Remove every reverse mapping of this device.
    async fn reverse_remove_all(&self) -> Result<()> {
        reverse_request(self, &["reverse", "killforward-all"])
            .await?
            .close();
        Ok(())
    }

    /// Copy the local file `src` to `dst` on the device.
    ///
    /// `src` is checked before any connection is opened. Returns the number
    /// of bytes sent.
    async fn push(
        &self,
        src: &Path,
        dst: &str,
        mode: u32,
        progress: Option<&ProgressCallback>,
    ) -> Result<u64> {
        validate_source(src).await?;
        let conn = self.create_connection().await?;
        SyncSession::open(conn)
            .await?
            .push(src, dst, mode, progress)
            .await
    }

    /// Copy `src` on the device to the local file `dst`.
    ///
    /// A failed pull leaves no file at `dst`.
    async fn pull(&self, src: &str, dst: &Path) -> Result<u64> {
        let conn = self.create_connection().await?;
        SyncSession::open(conn).await?.pull(src, dst).await
    }

    /// Attributes of a path on the device.
    async fn stat(&self, path: &str) -> Result<FileStat> {
        let conn = self.create_connection().await?;
        SyncSession::open(conn).await?.stat(path).await
    }
}
