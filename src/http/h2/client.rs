//! Client side of an HTTP/2 RPC transport
//!
//! A [`ClientTransport`] multiplexes calls over one endpoint. Calls are
//! opened with [`ClientTransport::start_call`]; the stream id is assigned
//! when the call's first header block is written, so ids always go out in
//! increasing order.

use super::call::CallHandle;
use super::config::{Role, TransportConfig, TransportConfigBuilder};
use super::error::ErrorCode;
use super::settings::SettingsBuilder;
use super::transport::TransportShared;
use crate::http::endpoint::Endpoint;
use crate::http::metadata::Metadata;
use crate::http::status::Status;
use crate::http::Result;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Client transport over one endpoint
///
/// Dropping the transport closes the connection.
pub struct ClientTransport {
    shared: Arc<TransportShared>,
}

impl ClientTransport {
    /// Start a client transport with default configuration.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new<E: Endpoint>(endpoint: E) -> Result<Self> {
        ClientTransportBuilder::new().build(endpoint)
    }

    fn from_config<E: Endpoint>(config: TransportConfig, endpoint: E) -> Self {
        let (shared, _incoming) = TransportShared::start(Role::Client, config, endpoint);
        ClientTransport { shared }
    }

    /// Open a call with its request headers
    pub fn start_call(&self, metadata: Metadata) -> Result<CallHandle> {
        self.shared.start_call(metadata)
    }

    /// Round-trip a PING to the server
    pub async fn ping(&self) -> Result<()> {
        self.shared.ping().await
    }

    /// Send GOAWAY; a client always sends it immediately
    pub async fn request_goaway(&self, error_code: ErrorCode, debug_data: Bytes, immediate: bool) {
        self.shared
            .request_goaway(error_code, debug_data, immediate)
            .await
    }

    /// Fail all calls and close the connection
    pub fn close(&self) {
        self.shared.close()
    }

    /// Wait until the connection is closed
    pub async fn closed(&self) {
        self.shared.closed().await
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Why the connection closed, once it has
    pub fn close_status(&self) -> Option<Status> {
        self.shared.close_status()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer_addr()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr()
    }

    /// Announce new local settings to the server
    pub fn update_settings(&self, settings: SettingsBuilder) -> Result<()> {
        self.shared.update_settings(settings)
    }

    /// Number of calls holding a stream id
    pub fn active_streams(&self) -> usize {
        self.shared.active_streams()
    }

    /// Queue a security frame; both sides must have advertised support
    pub fn send_security_frame(&self, payload: Bytes) -> Result<()> {
        self.shared.send_security_frame(payload)
    }

    pub fn config(&self) -> &TransportConfig {
        self.shared.config()
    }
}

impl std::fmt::Debug for ClientTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientTransport")
            .field("peer_addr", &self.peer_addr())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for ClientTransport {
    fn drop(&mut self) {
        self.shared.close();
    }
}

/// Builder for [`ClientTransport`]
///
/// # Examples
///
/// ```no_run
/// use h2rpc::http::h2::ClientTransportBuilder;
/// use h2rpc::http::Metadata;
/// use tokio::net::TcpStream;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let stream = TcpStream::connect("127.0.0.1:50051").await?;
/// let transport = ClientTransportBuilder::new()
///     .initial_window_size(1 << 20)
///     .build(stream)?;
///
/// let mut request = Metadata::new();
/// request.insert(":path", "/echo.Echo/Say");
/// let call = transport.start_call(request)?;
/// call.enqueue_half_close()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ClientTransportBuilder {
    config: TransportConfigBuilder,
}

impl ClientTransportBuilder {
    pub fn new() -> Self {
        ClientTransportBuilder {
            config: TransportConfigBuilder::new(Role::Client),
        }
    }

    /// Local SETTINGS_INITIAL_WINDOW_SIZE
    pub fn initial_window_size(mut self, size: u32) -> Self {
        self.config = self.config.initial_window_size(size);
        self
    }

    /// Transport receive window target
    pub fn connection_window_size(mut self, size: u32) -> Self {
        self.config = self.config.connection_window_size(size);
        self
    }

    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.config = self.config.max_frame_size(size);
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

    /// Keepalive interval; None disables keepalive
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

    /// Keep new calls pending at the server's stream limit instead of failing them
    pub fn queue_streams_at_max_concurrent(mut self, queue: bool) -> Self {
        self.config = self.config.queue_streams_at_max_concurrent(queue);
        self
    }

    /// Callback for security frames received from the server
    pub fn security_frame_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(Bytes) + Send + Sync + 'static,
    {
        self.config = self.config.security_frame_handler(handler);
        self
    }

    /// Validate the configuration and start the transport tasks
    pub fn build<E: Endpoint>(self, endpoint: E) -> Result<ClientTransport> {
        let config = self.config.build()?;
        Ok(ClientTransport::from_config(config, endpoint))
    }
}

impl Default for ClientTransportBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Error;

    #[test]
    fn test_builder_rejects_invalid_config() {
        let (endpoint, _peer) = tokio::io::duplex(1024);
        let result = ClientTransportBuilder::new().max_frame_size(1).build(endpoint);
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_close_fails_new_calls() {
        let (endpoint, _peer) = tokio::io::duplex(64 * 1024);
        let transport = ClientTransport::new(endpoint).unwrap();
        transport.close();
        transport.closed().await;
        assert!(transport.is_closed());
        assert!(matches!(
            transport.start_call(Metadata::new()),
            Err(Error::TransportClosed)
        ));
    }
}
