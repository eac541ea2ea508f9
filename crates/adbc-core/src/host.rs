//! Host services: commands answered by the ADB server itself.
//!
//! These need no target device, or name it explicitly with a
//! `host-serial:<serial>:` prefix. Each call opens one connection, sends one
//! request and closes the connection once the answer is decoded.
//!
//! # Example
//!
//! ```no_run
//! use adbc_core::client::AdbClient;
//! use adbc_core::host::{DeviceState, HostService};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = AdbClient::default();
//! println!("server version {}", client.version().await?);
//!
//! for info in client.devices(&DeviceState::Device).await? {
//!     println!("{} is {}", info.serial, info.state);
//! }
//!
//! let mut tracker = client.devices_track().await?;
//! while let Some(change) = tracker.next().await {
//!     println!("{} -> {}", change.serial, change.state);
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use tracing::{debug, warn};

use crate::error::{AdbError, Result};
use crate::response::{CloseHandle, TextFrameStream};
use crate::service::Service;

// ---------------------------------------------------------------------------
// Device state
// ---------------------------------------------------------------------------

/// Connection state of a device as reported by the server.
///
/// Unknown states are kept verbatim in [`DeviceState::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DeviceState {
    /// Online and authorized.
    #[default]
    Device,
    Offline,
    Unauthorized,
    Authorizing,
    Connecting,
    Bootloader,
    Recovery,
    Sideload,
    Host,
    /// Any state this crate does not name.
    Other(String),
}

impl DeviceState {
    /// The wire spelling of the state.
    pub fn as_str(&self) -> &str {
        match self {
            DeviceState::Device => "device",
            DeviceState::Offline => "offline",
            DeviceState::Unauthorized => "unauthorized",
            DeviceState::Authorizing => "authorizing",
            DeviceState::Connecting => "connecting",
            DeviceState::Bootloader => "bootloader",
            DeviceState::Recovery => "recovery",
            DeviceState::Sideload => "sideload",
            DeviceState::Host => "host",
            DeviceState::Other(s) => s,
        }
    }
}

impl From<&str> for DeviceState {
    fn from(s: &str) -> Self {
        match s {
            "device" => DeviceState::Device,
            "offline" => DeviceState::Offline,
            "unauthorized" => DeviceState::Unauthorized,
            "authorizing" => DeviceState::Authorizing,
            "connecting" => DeviceState::Connecting,
            "bootloader" => DeviceState::Bootloader,
            "recovery" => DeviceState::Recovery,
            "sideload" => DeviceState::Sideload,
            "host" => DeviceState::Host,
            other => DeviceState::Other(other.to_string()),
        }
    }
}

impl From<String> for DeviceState {
    fn from(s: String) -> Self {
        DeviceState::from(s.as_str())
    }
}

impl From<DeviceState> for String {
    fn from(state: DeviceState) -> Self {
        state.as_str().to_string()
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Value records
// ---------------------------------------------------------------------------

/// One row of the device list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub serial: String,
    pub state: DeviceState,
}

/// A state change reported by `host:track-devices`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatusNotification {
    pub serial: String,
    pub state: DeviceState,
}

/// A host-to-device port forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardRule {
    pub serial: String,
    pub local: String,
    pub remote: String,
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse `host:devices-l` output, keeping rows in the given state.
pub fn parse_device_list(text: &str, state: &DeviceState) -> Vec<DeviceInfo> {
    text.lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let serial = fields.next()?;
            let row_state = fields.next()?;
            Some(DeviceInfo {
                serial: serial.to_string(),
                state: DeviceState::from(row_state),
            })
        })
        .filter(|info| &info.state == state)
        .collect()
}

/// Parse `host:list-forward` output.
pub fn parse_forward_list(text: &str) -> Vec<ForwardRule> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.as_slice() {
                [serial, local, remote] => Some(ForwardRule {
                    serial: serial.to_string(),
                    local: local.to_string(),
                    remote: remote.to_string(),
                }),
                _ => {
                    warn!(line, "skipping malformed forward rule");
                    None
                }
            }
        })
        .collect()
}

/// Parse one `serial<ws>state` notification line.
fn parse_notification(line: &str) -> Option<DeviceStatusNotification> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    match fields.as_slice() {
        [serial, state] => Some(DeviceStatusNotification {
            serial: serial.to_string(),
            state: DeviceState::from(*state),
        }),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// DeviceTracker
// ---------------------------------------------------------------------------

/// Live feed of device state changes.
///
/// Never ends on its own while the server keeps the connection open; close
/// it through [`closer`](Self::closer) or by dropping it.
#[derive(Debug)]
pub struct DeviceTracker {
    frames: TextFrameStream,
    pending: VecDeque<DeviceStatusNotification>,
}

impl DeviceTracker {
    pub(crate) fn new(frames: TextFrameStream) -> Self {
        Self {
            frames,
            pending: VecDeque::new(),
        }
    }

    /// Handle that stops the tracker from another task.
    pub fn closer(&self) -> CloseHandle {
        self.frames.closer()
    }

    /// Returns `true` while the subscription connection is open.
    pub fn is_open(&self) -> bool {
        self.frames.is_open()
    }

    /// Wait for the next notification. `None` once the subscription ends.
    ///
    /// A frame listing several devices yields one notification per line, in
    /// order.
    pub async fn next(&mut self) -> Option<DeviceStatusNotification> {
        loop {
            if let Some(notification) = self.pending.pop_front() {
                return Some(notification);
            }

            let frame = match self.frames.next().await? {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(error = %err, "skipping undecodable track-devices frame");
                    continue;
                }
            };

            for line in frame.lines().filter(|l| !l.trim().is_empty()) {
                match parse_notification(line) {
                    Some(notification) => self.pending.push_back(notification),
                    None => warn!(line, "skipping malformed track-devices line"),
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// HostService
// ---------------------------------------------------------------------------

/// Commands served by the ADB server rather than a device.
#[async_trait]
pub trait HostService: Service {
    /// The server's internal protocol version.
    async fn version(&self) -> Result<u32> {
        let text = self.request(&["host", "version"]).await?.text().await?;
        match u32::from_str_radix(text.trim(), 16) {
            Ok(version) => Ok(version),
            Err(_) => Err(AdbError::UnexpectedOutput {
                command: "host:version".into(),
                output: text,
            }),
        }
    }

    /// Ask the server to exit.
    async fn kill(&self) -> Result<()> {
        self.request(&["host", "kill"]).await?.close();
        Ok(())
    }

    /// Devices currently in `state`.
    async fn devices(&self, state: &DeviceState) -> Result<Vec<DeviceInfo>> {
        let text = self.request(&["host", "devices-l"]).await?.text().await?;
        let devices = parse_device_list(&text, state);
        debug!(count = devices.len(), %state, "listed devices");
        Ok(devices)
    }

    /// Subscribe to device state changes.
    async fn devices_track(&self) -> Result<DeviceTracker> {
        let resp = self.request(&["host", "track-devices"]).await?;
        Ok(DeviceTracker::new(resp.stream_text()))
    }

    /// Connect to a device over TCP/IP (`adb connect`).
    ///
    /// Returns `true` when the server reports the device as connected.
    async fn remote_connect(&self, host: &str, port: u16) -> Result<bool> {
        let port = port.to_string();
        let text = self
            .request(&["host", "connect", host, &port])
            .await?
            .text()
            .await?;
        debug!(host, %port, %text, "remote connect");
        Ok(text.contains("connected"))
    }

    /// Disconnect a TCP/IP device. Returns the server's message verbatim.
    async fn remote_disconnect(&self, host: &str, port: u16) -> Result<String> {
        let port = port.to_string();
        self.request(&["host", "disconnect", host, &port])
            .await?
            .text()
            .await
    }

    /// Every forward known to the server, across all devices.
    async fn forward_list(&self) -> Result<Vec<ForwardRule>> {
        let text = self.request(&["host", "list-forward"]).await?.text().await?;
        Ok(parse_forward_list(&text))
    }

    /// Forward `local` on the host to `remote` on the device.
    ///
    /// With `norebind`, an existing binding for `local` makes the server
    /// refuse and the error carries its message.
    async fn forward(&self, serial: &str, local: &str, remote: &str, norebind: bool) -> Result<()> {
        let spec = format!("{local};{remote}");
        let resp = if norebind {
            self.request(&["host-serial", serial, "forward", "norebind", &spec])
                .await?
        } else {
            self.request(&["host-serial", serial, "forward", &spec]).await?
        };
        resp.close();
        Ok(())
    }

    /// Remove the forward bound to `local`.
    async fn forward_remove(&self, serial: &str, local: &str) -> Result<()> {
        self.request(&["host-serial", serial, "killforward", local])
            .await?
            .close();
        Ok(())
    }

    /// Remove every forward of one device, or of all devices when `serial`
    /// is `None`.
    async fn forward_remove_all(&self, serial: Option<&str>) -> Result<()> {
        let resp = match serial {
            Some(serial) => {
                self.request(&["host-serial", serial, "killforward-all"])
                    .await?
            }
            None => self.request(&["host", "killforward-all"]).await?,
        };
        resp.close();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
