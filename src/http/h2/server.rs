//! Server side of an HTTP/2 RPC transport
//!
//! The server validates the client preface, accepts streams opened by the
//! client and hands each one out through [`ServerTransport::accept`] once
//! its request headers are complete.

use super::call::CallHandle;
use super::config::{Role, TransportConfig, TransportConfigBuilder};
use super::error::ErrorCode;
use super::settings::SettingsBuilder;
use super::transport::TransportShared;
use crate::http::endpoint::Endpoint;
use crate::http::status::Status;
use crate::http::Result;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Server transport over one accepted endpoint
///
/// Dropping the transport closes the connection.
pub struct ServerTransport {
    shared: Arc<TransportShared>,
    incoming: mpsc::UnboundedReceiver<CallHandle>,
}

impl ServerTransport {
    /// Start a server transport with default configuration.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new<E: Endpoint>(endpoint: E) -> Result<Self> {
        ServerTransportBuilder::new().build(endpoint)
    }

    /// Next call opened by the client; None once the connection is closed
    pub async fn accept(&mut self) -> Option<CallHandle> {
        self.incoming.recv().await
    }

    /// Round-trip a PING to the client
    pub async fn ping(&self) -> Result<()> {
        self.shared.ping().await
    }

    /// Send GOAWAY and wait for the exchange to finish.
    ///
    /// A graceful GOAWAY with NO_ERROR first announces the maximum stream
    /// id, waits one PING round trip and then sends the final GOAWAY with
    /// the last stream actually accepted.
    pub async fn request_goaway(&self, error_code: ErrorCode, debug_data: Bytes, immediate: bool) {
        self.shared
            .request_goaway(error_code, debug_data, immediate)
            .await
    }

    pub fn close(&self) {
        self.shared.close()
    }

    pub async fn closed(&self) {
        self.shared.closed().await
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn close_status(&self) -> Option<Status> {
        self.shared.close_status()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer_addr()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr()
    }

    pub fn update_settings(&self, settings: SettingsBuilder) -> Result<()> {
        self.shared.update_settings(settings)
    }

    pub fn active_streams(&self) -> usize {
        self.shared.active_streams()
    }

    pub fn send_security_frame(&self, payload: Bytes) -> Result<()> {
        self.shared.send_security_frame(payload)
    }

    pub fn config(&self) -> &TransportConfig {
        self.shared.config()
    }
}

impl std::fmt::Debug for ServerTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerTransport")
            .field("role", &self.shared.role())
            .field("peer_addr", &self.peer_addr())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for ServerTransport {
    fn drop(&mut self) {
        self.shared.close();
    }
}

/// Builder for [`ServerTransport`]
///
/// # Examples
///
/// ```no_run
/// use h2rpc::http::h2::ServerTransportBuilder;
/// use h2rpc::http::{Metadata, Status};
/// use tokio::net::TcpListener;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let listener = TcpListener::bind("127.0.0.1:50051").await?;
/// let (stream, _) = listener.accept().await?;
/// let mut transport = ServerTransportBuilder::new()
///     .max_concurrent_streams(32)
///     .build(stream)?;
///
/// while let Some(call) = transport.accept().await {
///     call.enqueue_initial_metadata(Metadata::new())?;
///     call.send_status(&Status::ok(), Metadata::new())?;
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ServerTransportBuilder {
    config: TransportConfigBuilder,
}

impl ServerTransportBuilder {
    pub fn new() -> Self {
        ServerTransportBuilder {
            config: TransportConfigBuilder::new(Role::Server),
        }
    }

    pub fn initial_window_size(mut self, size: u32) -> Self {
        self.config = self.config.initial_window_size(size);
        self
    }

    pub fn connection_window_size(mut self, size: u32) -> Self {
        self.config = self.config.connection_window_size(size);
        self
    }

    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.config = self.config.max_frame_size(size);
        self
    }

    /// Streams beyond this are refused with REFUSED_STREAM
    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.config = self.config.max_concurrent_streams(max);
        self
    }

    pub fn max_header_list_size(mut self, soft: u32, hard: u32) -> Self {
        self.config = self.config.max_header_list_size(soft, hard);
        self
    }

    pub fn header_table_size(mut self, size: u32) -> Self {
        self.config = self.config.header_table_size(size);
        self
    }

    pub fn allow_true_binary_metadata(mut self, allow: bool) -> Self {
        self.config = self.config.allow_true_binary_metadata(allow);
        self
    }

    pub fn allow_security_frame(mut self, allow: bool) -> Self {
        self.config = self.config.allow_security_frame(allow);
        self
    }

    pub fn preferred_receive_crypto_message_size(mut self, size: u32) -> Self {
        self.config = self.config.preferred_receive_crypto_message_size(size);
        self
    }

    pub fn stream_queue_max_tokens(mut self, tokens: usize) -> Self {
        self.config = self.config.stream_queue_max_tokens(tokens);
        self
    }

    pub fn write_budget_per_cycle(mut self, bytes: usize) -> Self {
        self.config = self.config.write_budget_per_cycle(bytes);
        self
    }

    pub fn keepalive_time(mut self, time: Option<Duration>) -> Self {
        self.config = self.config.keepalive_time(time);
        self
    }

    pub fn keepalive_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.keepalive_timeout(timeout);
        self
    }

    pub fn keepalive_permit_without_calls(mut self, permit: bool) -> Self {
        self.config = self.config.keepalive_permit_without_calls(permit);
        self
    }

    pub fn ping_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.ping_timeout(timeout);
        self
    }

    pub fn settings_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.settings_timeout(timeout);
        self
    }

    pub fn flow_control_lazy_threshold(mut self, threshold: f64) -> Self {
        self.config = self.config.flow_control_lazy_threshold(threshold);
        self
    }

    /// Minimum spacing of client pings and strikes allowed before GOAWAY
    pub fn ping_abuse(mut self, min_interval: Duration, max_strikes: u32) -> Self {
        self.config = self.config.ping_abuse(min_interval, max_strikes);
        self
    }

    pub fn security_frame_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(Bytes) + Send + Sync + 'static,
    {
        self.config = self.config.security_frame_handler(handler);
        self
    }

    /// Validate the configuration and start the transport tasks
    pub fn build<E: Endpoint>(self, endpoint: E) -> Result<ServerTransport> {
        let config = self.config.build()?;
        let (shared, incoming) = TransportShared::start(Role::Server, config, endpoint);
        Ok(ServerTransport { shared, incoming })
    }
}

impl Default for ServerTransportBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_bad_preface_closes() {
        let (endpoint, mut peer) = tokio::io::duplex(64 * 1024);
        let mut transport = ServerTransport::new(endpoint).unwrap();
        peer.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
        transport.closed().await;
        assert!(transport.accept().await.is_none());
        let status = transport.close_status().unwrap();
        assert!(!status.is_ok());
    }
}
