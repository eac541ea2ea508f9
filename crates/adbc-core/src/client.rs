//! Entry point: a handle to one ADB server.
//!
//! [`AdbClient`] holds the server address, opens a new [`Connection`] per
//! request and implements [`HostService`]. Device-scoped work goes through
//! the [`Device`] handles it returns.
//!
//! # Example
//!
//! ```no_run
//! use adbc_core::client::AdbClient;
//! use adbc_core::local::LocalService;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = AdbClient::new("127.0.0.1", 5037)?;
//! let device = client.device(None).await?;
//! let model = device.shell("getprop", &["ro.product.model"]).await?;
//! println!("{} is a {model}", device.serial());
//! # Ok(())
//! # }
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use tracing::debug;

use crate::connection::Connection;
use crate::device::Device;
use crate::error::{AdbError, Result};
use crate::host::{DeviceState, HostService};
use crate::service::Service;

/// Loopback address the ADB server listens on by default.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Port the ADB server listens on by default.
pub const DEFAULT_PORT: u16 = 5037;

// ---------------------------------------------------------------------------
// ClientConfig
// ---------------------------------------------------------------------------

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

/// Where to find the ADB server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Literal IP address of the server. Hostnames are not accepted.
    #[serde(default = "default_host")]
    pub host: String,
    /// TCP port of the server.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Resolve the configured address.
    ///
    /// `localhost` is refused: name resolution on some platforms tries IPv6
    /// first and stalls every connection, so a literal loopback IP is
    /// required.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        if self.host.eq_ignore_ascii_case("localhost") {
            return Err(AdbError::Validation(
                "use 127.0.0.1 instead of localhost: resolving the name adds latency to every connection"
                    .into(),
            ));
        }
        let ip: IpAddr = self.host.parse().map_err(|_| {
            AdbError::Validation(format!("host must be a literal IP address, got {:?}", self.host))
        })?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

// ---------------------------------------------------------------------------
// AdbClient
// ---------------------------------------------------------------------------

/// Handle to an ADB server. Cheap to clone; holds no connection.
#[derive(Debug, Clone)]
pub struct AdbClient {
    addr: SocketAddr,
}

impl Default for AdbClient {
    fn default() -> Self {
        Self {
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PORT),
        }
    }
}

impl AdbClient {
    /// Client for the server at `host:port`. `host` must be a literal IP.
    pub fn new(host: &str, port: u16) -> Result<Self> {
        Self::from_config(&ClientConfig::new(host, port))
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        Ok(Self {
            addr: config.socket_addr()?,
        })
    }

    /// Client for an already resolved address.
    pub fn from_addr(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// Address of the server.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The first online device, or the online device with `serial`.
    pub async fn device(&self, serial: Option<&str>) -> Result<Device> {
        let devices = self.devices(&DeviceState::Device).await?;
        let info = match serial {
            None => devices.into_iter().next().ok_or(AdbError::NoDevices)?,
            Some(serial) => devices
                .into_iter()
                .find(|info| info.serial == serial)
                .ok_or_else(|| AdbError::DeviceNotFound(serial.to_string()))?,
        };
        debug!(serial = %info.serial, "selected device");
        Ok(Device::new(self.clone(), info.serial))
    }

    /// A connection already switched to the device with `serial`.
    pub async fn transport(&self, serial: &str) -> Result<Connection> {
        self.create_connection().await?.transport_mode(serial).await
    }
}

#[async_trait]
impl Service for AdbClient {
    async fn create_connection(&self) -> Result<Connection> {
        Connection::connect(self.addr).await
    }
}

impl HostService for AdbClient {}
