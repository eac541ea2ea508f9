//! Capability traits for code that builds on top of a device.
//!
//! Telemetry and automation helpers (battery, CPU, log tailing, screen
//! capture, ...) only need to run shell commands and move files. They depend
//! on these traits rather than on [`Device`](crate::device::Device), so they
//! can be driven by any [`LocalService`] implementor or by a test double.
//!
//! Both traits are implemented for every [`LocalService`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use adbc_core::capability::ShellCapability;
//!
//! async fn battery_level(shell: Arc<dyn ShellCapability>) -> adbc_core::Result<Option<u32>> {
//!     let dump = shell.run("dumpsys battery").await?;
//!     Ok(dump
//!         .lines()
//!         .find_map(|l| l.trim().strip_prefix("level: "))
//!         .and_then(|v| v.parse().ok()))
//! }
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use tracing::debug;

use crate::error::{AdbError, Result};
use crate::local::LocalService;
use crate::response::ResponseReader;
use crate::sync::ProgressCallback;

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

/// Parse `getprop` output (`[key]: [value]` per line).
pub fn parse_properties(text: &str) -> HashMap<String, String> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim_end_matches('\r');
            let inner = line.strip_prefix('[')?.strip_suffix(']')?;
            let (key, value) = inner.split_once("]: [")?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Find the main process of `package` in `ps -ef` output.
///
/// Prefers the process whose command is exactly the package name over its
/// `package:service` siblings.
pub fn parse_pid(ps_output: &str, package: &str) -> Option<u32> {
    let service_prefix = format!("{package}:");
    let mut candidates: Vec<(&str, u32)> = ps_output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let pid = fields.get(1)?.parse().ok()?;
            let cmd = *fields.get(7)?;
            (cmd == package || cmd.starts_with(&service_prefix)).then_some((cmd, pid))
        })
        .collect();
    candidates.sort();
    candidates.first().map(|(_, pid)| *pid)
}

// ---------------------------------------------------------------------------
// ShellCapability
// ---------------------------------------------------------------------------

/// Run commands on a device shell.
#[async_trait]
pub trait ShellCapability: Send + Sync {
    /// Run `cmd` to completion and return its text output.
    async fn run(&self, cmd: &str) -> Result<String>;

    /// Run `cmd` to completion and return its raw output.
    async fn run_raw(&self, cmd: &str) -> Result<Vec<u8>>;

    /// Start `cmd` and return a reader over its live output.
    async fn open_reader(&self, cmd: &str) -> Result<ResponseReader>;

    /// All system properties.
    async fn properties(&self) -> Result<HashMap<String, String>> {
        let text = self.run("getprop").await?;
        Ok(parse_properties(&text))
    }

    /// One system property; `None` when it is unset.
    async fn property(&self, name: &str) -> Result<Option<String>> {
        let value = self.run(&format!("getprop {name}")).await?;
        Ok((!value.is_empty()).then_some(value))
    }

    /// Whether `path` exists on the device.
    async fn file_exists(&self, path: &str) -> Result<bool> {
        let out = self.run(&format!("ls {path}")).await?;
        Ok(!out.contains("No such file or directory"))
    }

    /// Pid of the main process of `package`, if it is running.
    async fn pid_of(&self, package: &str) -> Result<Option<u32>> {
        let out = self.run(&format!("ps -ef | grep {package}")).await?;
        Ok(parse_pid(&out, package))
    }

    /// Poll until the shell answers, trying `attempts` times `interval` apart.
    async fn wait_boot_complete(&self, attempts: u32, interval: Duration) -> Result<()> {
        for attempt in 1..=attempts {
            match self.run("echo hello").await {
                Ok(out) if out == "hello" => return Ok(()),
                Ok(out) => debug!(attempt, %out, "device shell not ready"),
                Err(err) => debug!(attempt, error = %err, "device shell unreachable"),
            }
            tokio::time::sleep(interval).await;
        }
        Err(AdbError::Timeout(format!(
            "device did not finish booting after {attempts} attempts"
        )))
    }
}

#[async_trait]
impl<T: LocalService + ?Sized> ShellCapability for T {
    async fn run(&self, cmd: &str) -> Result<String> {
        self.shell(cmd, &[]).await
    }

    async fn run_raw(&self, cmd: &str) -> Result<Vec<u8>> {
        self.shell_raw(cmd, &[]).await
    }

    async fn open_reader(&self, cmd: &str) -> Result<ResponseReader> {
        self.shell_reader(cmd, &[]).await
    }
}

// ---------------------------------------------------------------------------
// FileTransferCapability
// ---------------------------------------------------------------------------

/// Move files between host and device.
#[async_trait]
pub trait FileTransferCapability: Send + Sync {
    async fn push_file(
        &self,
        src: &Path,
        dst: &str,
        mode: u32,
        progress: Option<&ProgressCallback>,
    ) -> Result<u64>;

    async fn pull_file(&self, src: &str, dst: &Path) -> Result<u64>;
}

#[async_trait]
impl<T: LocalService + ?Sized> FileTransferCapability for T {
    async fn push_file(
        &self,
        src: &Path,
        dst: &str,
        mode: u32,
        progress: Option<&ProgressCallback>,
    ) -> Result<u64> {
        self.push(src, dst, mode, progress).await
    }

    async fn pull_file(&self, src: &str, dst: &Path) -> Result<u64> {
        self.pull(src, dst).await
    }
}
