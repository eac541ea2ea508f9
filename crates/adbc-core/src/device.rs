//! Device sessions: one serial, a fresh handshake per call.
//!
//! A [`Device`] carries no connection of its own. Each operation asks the
//! [`AdbClient`] for a new connection and switches it to this device with
//! `host:transport:<serial>` before sending the local service request.

use async_trait::async_trait;

use crate::client::AdbClient;
use crate::connection::Connection;
use crate::error::Result;
use crate::host::{ForwardRule, HostService};
use crate::local::LocalService;
use crate::service::Service;

/// Handle to one device attached to an ADB server.
#[derive(Debug, Clone)]
pub struct Device {
    client: AdbClient,
    serial: String,
}

impl Device {
    /// Handle for `serial` without checking that it is attached.
    pub fn new(client: AdbClient, serial: impl Into<String>) -> Self {
        Self {
            client,
            serial: serial.into(),
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// The client this device was obtained from.
    pub fn client(&self) -> &AdbClient {
        &self.client
    }

    /// Forwards that belong to this device.
    pub async fn forward_list(&self) -> Result<Vec<ForwardRule>> {
        let rules = self.client.forward_list().await?;
        Ok(rules
            .into_iter()
            .filter(|rule| rule.serial == self.serial)
            .collect())
    }

    /// Forward host socket `local` to device socket `remote`.
    pub async fn forward(&self, local: &str, remote: &str, norebind: bool) -> Result<()> {
        self.client
            .forward(&self.serial, local, remote, norebind)
            .await
    }

    /// Remove the forward bound to host socket `local`.
    pub async fn forward_remove(&self, local: &str) -> Result<()> {
        self.client.forward_remove(&self.serial, local).await
    }

    /// Remove every forward of this device, leaving other devices' forwards.
    pub async fn forward_remove_all(&self) -> Result<()> {
        self.client.forward_remove_all(Some(&self.serial)).await
    }
}

#[async_trait]
impl Service for Device {
    async fn create_connection(&self) -> Result<Connection> {
        self.client.transport(&self.serial).await
    }
}

impl LocalService for Device {}
