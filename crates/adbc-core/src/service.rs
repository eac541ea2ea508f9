//! The connection-minting seam shared by host and local services.
//!
//! A [`Service`] knows how to open a fresh [`Connection`]; the service traits
//! built on it ([`HostService`](crate::host::HostService) and
//! [`LocalService`](crate::local::LocalService)) only describe which commands
//! to send. [`AdbClient`](crate::client::AdbClient) opens plain broker
//! connections, while [`Device`](crate::device::Device) additionally performs
//! the transport handshake on each one.

use async_trait::async_trait;

use crate::connection::Connection;
use crate::error::Result;
use crate::response::Response;

/// Something that can open a new connection for each request.
///
/// Every request gets its own connection; the returned [`Response`] owns it.
#[async_trait]
pub trait Service: Send + Sync {
    /// Open a connection ready to accept a service request.
    async fn create_connection(&self) -> Result<Connection>;

    /// Open a connection and send a status-checked request.
    async fn request(&self, tokens: &[&str]) -> Result<Response> {
        let conn = self.create_connection().await?;
        conn.request(tokens).await
    }

    /// Open a connection and send a request without a status check.
    async fn request_without_check(&self, tokens: &[&str]) -> Result<Response> {
        let conn = self.create_connection().await?;
        conn.request_without_check(tokens).await
    }
}
