//! # adbc-core
//!
//! Async client for the Android Debug Bridge (ADB) server.
//!
//! The crate talks to a running `adb` server over TCP and exposes its host
//! services (device listing, port forwarding, TCP/IP connect) and the
//! per-device local services (shell, root, reverse forwarding, file push and
//! pull over the sync sub-protocol).
//!
//! ## Modules
//!
//! - [`protocol`] - Length-prefixed text framing and the binary sync message format
//! - [`connection`] - One duplex connection: requests, status checks, transport handshake
//! - [`response`] - Single-use views over a successful request (frame, text, stream, reader)
//! - [`service`] - The [`Service`](service::Service) trait every endpoint builds on
//! - [`host`] - Server-level commands and the device tracker
//! - [`local`] - Device-level commands
//! - [`sync`] - Push, pull and stat sessions
//! - [`client`] - [`AdbClient`], the entry point
//! - [`device`] - [`Device`], a serial bound to a client
//! - [`capability`] - Narrow traits for helpers that only need a shell or file transfer
//! - [`error`] - The shared [`AdbError`] type
//!
//! ## Requirements
//!
//! An ADB server must be listening (normally on `127.0.0.1:5037`, started by
//! `adb start-server`). The server address must be a literal IP.
//!
//! ## Example
//!
//! ```no_run
//! use std::path::Path;
//! use adbc_core::{AdbClient, DeviceState, HostService, LocalService, DEFAULT_MODE};
//!
//! # async fn example() -> Result<(), adbc_core::AdbError> {
//! let client = AdbClient::default();
//! for info in client.devices(&DeviceState::Device).await? {
//!     println!("{} {}", info.serial, info.state);
//! }
//!
//! let device = client.device(None).await?;
//! device
//!     .push(Path::new("build/app.apk"), "/data/local/tmp/app.apk", DEFAULT_MODE, None)
//!     .await?;
//! let out = device.shell("pm", &["install", "/data/local/tmp/app.apk"]).await?;
//! println!("{out}");
//! # Ok(())
//! # }
//! ```

pub mod capability;
pub mod client;
pub mod connection;
pub mod device;
pub mod error;
pub mod host;
pub mod local;
pub mod protocol;
pub mod response;
pub mod service;
pub mod sync;

pub use capability::{FileTransferCapability, ShellCapability};
pub use client::{AdbClient, ClientConfig};
pub use connection::Connection;
pub use device::Device;
pub use error::{AdbError, Result};
pub use host::{DeviceInfo, DeviceState, DeviceStatusNotification, DeviceTracker, ForwardRule, HostService};
pub use local::{LocalService, ReverseRule};
pub use response::{CloseHandle, Response, ResponseReader};
pub use service::Service;
pub use sync::{FileStat, ProgressCallback, DEFAULT_MODE};
