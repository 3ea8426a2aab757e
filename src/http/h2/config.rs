//! Transport configuration
//!
//! Everything that tunes one connection lives in [`TransportConfig`]: local
//! SETTINGS values, queue and write budgets, keepalive and timeouts, and
//! optional behaviors such as security frames.

use super::settings::{settings_ack_timeout, Settings, MAX_MAX_FRAME_SIZE};
use super::{DEFAULT_HEADER_TABLE_SIZE, DEFAULT_MAX_FRAME_SIZE};
use crate::http::{Error, Result};
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const KIB: u32 = 1024;
const MIB: u32 = 1024 * 1024;

/// Callback receiving the payload of each security frame
pub type SecurityFrameHandler = Arc<dyn Fn(Bytes) + Send + Sync>;

/// Which side of the connection a transport is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn is_client(self) -> bool {
        self == Role::Client
    }
}

/// Per-connection configuration
#[derive(Clone)]
pub struct TransportConfig {
    pub initial_window_size: u32,
    pub connection_window_size: u32,
    pub max_frame_size: u32,
    pub max_concurrent_streams: u32,
    pub max_header_list_size_soft: u32,
    pub max_header_list_size_hard: u32,
    pub header_table_size: u32,
    pub allow_true_binary_metadata: bool,
    pub allow_security_frame: bool,
    pub preferred_receive_crypto_message_size: Option<u32>,
    pub stream_queue_max_tokens: usize,
    pub write_budget_per_cycle: usize,
    pub keepalive_time: Option<Duration>,
    pub keepalive_timeout: Duration,
    pub keepalive_permit_without_calls: bool,
    pub ping_timeout: Duration,
    pub settings_timeout: Option<Duration>,
    pub flow_control_lazy_threshold: f64,
    pub queue_streams_at_max_concurrent: bool,
    pub ping_abuse_min_interval: Duration,
    pub ping_abuse_max_strikes: u32,
    pub security_frame_handler: Option<SecurityFrameHandler>,
}

impl TransportConfig {
    /// Defaults for one side of the connection
    pub fn defaults(role: Role) -> Self {
        TransportConfig {
            initial_window_size: 4 * MIB,
            connection_window_size: 16 * MIB,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_concurrent_streams: 100,
            max_header_list_size_soft: 8 * KIB,
            max_header_list_size_hard: 16 * KIB,
            header_table_size: DEFAULT_HEADER_TABLE_SIZE,
            allow_true_binary_metadata: false,
            allow_security_frame: false,
            preferred_receive_crypto_message_size: None,
            stream_queue_max_tokens: 4 * MIB as usize,
            write_budget_per_cycle: 512 * KIB as usize,
            keepalive_time: match role {
                Role::Client => None,
                Role::Server => Some(Duration::from_secs(2 * 60 * 60)),
            },
            keepalive_timeout: Duration::from_secs(20),
            keepalive_permit_without_calls: false,
            ping_timeout: Duration::from_secs(60),
            settings_timeout: None,
            flow_control_lazy_threshold: 0.5,
            queue_streams_at_max_concurrent: false,
            ping_abuse_min_interval: Duration::from_secs(5 * 60),
            ping_abuse_max_strikes: 2,
            security_frame_handler: None,
        }
    }

    /// How long a local SETTINGS frame may stay unacknowledged
    pub fn effective_settings_timeout(&self) -> Duration {
        self.settings_timeout
            .unwrap_or_else(|| settings_ack_timeout(self.keepalive_timeout))
    }

    /// Local SETTINGS announced to the peer
    pub fn local_settings(&self, role: Role) -> Settings {
        Settings {
            header_table_size: Some(self.header_table_size),
            enable_push: Some(false),
            max_concurrent_streams: match role {
                Role::Server => Some(self.max_concurrent_streams),
                Role::Client => None,
            },
            initial_window_size: Some(self.initial_window_size),
            max_frame_size: Some(self.max_frame_size),
            max_header_list_size: Some(self.max_header_list_size_hard),
            allow_true_binary_metadata: Some(self.allow_true_binary_metadata),
            preferred_receive_crypto_message_size: self.preferred_receive_crypto_message_size,
            allow_security_frame: Some(self.allow_security_frame),
        }
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.initial_window_size > 0x7FFF_FFFF {
            return Err(Error::InvalidConfig(format!(
                "initial_window_size {} exceeds 2^31-1",
                self.initial_window_size
            )));
        }
        if self.connection_window_size > 0x7FFF_FFFF {
            return Err(Error::InvalidConfig(format!(
                "connection_window_size {} exceeds 2^31-1",
                self.connection_window_size
            )));
        }
        if !(DEFAULT_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&self.max_frame_size) {
            return Err(Error::InvalidConfig(format!(
                "max_frame_size {} outside 16384-16777215",
                self.max_frame_size
            )));
        }
        if self.max_header_list_size_soft > self.max_header_list_size_hard {
            return Err(Error::InvalidConfig(
                "max_header_list_size_soft exceeds the hard limit".to_string(),
            ));
        }
        if !(self.flow_control_lazy_threshold > 0.0 && self.flow_control_lazy_threshold <= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "flow_control_lazy_threshold {} outside (0, 1]",
                self.flow_control_lazy_threshold
            )));
        }
        if self.write_budget_per_cycle == 0 || self.stream_queue_max_tokens == 0 {
            return Err(Error::InvalidConfig(
                "write budget and queue tokens must be non-zero".to_string(),
            ));
        }
        if self.keepalive_time == Some(Duration::ZERO) {
            return Err(Error::InvalidConfig("keepalive_time must be non-zero".to_string()));
        }
        Ok(())
    }
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportConfig")
            .field("initial_window_size", &self.initial_window_size)
            .field("connection_window_size", &self.connection_window_size)
            .field("max_frame_size", &self.max_frame_size)
            .field("max_concurrent_streams", &self.max_concurrent_streams)
            .field("max_header_list_size_soft", &self.max_header_list_size_soft)
            .field("max_header_list_size_hard", &self.max_header_list_size_hard)
            .field("header_table_size", &self.header_table_size)
            .field("allow_true_binary_metadata", &self.allow_true_binary_metadata)
            .field("allow_security_frame", &self.allow_security_frame)
            .field(
                "preferred_receive_crypto_message_size",
                &self.preferred_receive_crypto_message_size,
            )
            .field("stream_queue_max_tokens", &self.stream_queue_max_tokens)
            .field("write_budget_per_cycle", &self.write_budget_per_cycle)
            .field("keepalive_time", &self.keepalive_time)
            .field("keepalive_timeout", &self.keepalive_timeout)
            .field(
                "keepalive_permit_without_calls",
                &self.keepalive_permit_without_calls,
            )
            .field("ping_timeout", &self.ping_timeout)
            .field("settings_timeout", &self.settings_timeout)
            .field("flow_control_lazy_threshold", &self.flow_control_lazy_threshold)
            .field(
                "queue_streams_at_max_concurrent",
                &self.queue_streams_at_max_concurrent,
            )
            .field("ping_abuse_min_interval", &self.ping_abuse_min_interval)
            .field("ping_abuse_max_strikes", &self.ping_abuse_max_strikes)
            .field(
                "security_frame_handler",
                &self.security_frame_handler.as_ref().map(|_| "<fn>"),
            )
            .finish()
    }
}

/// Builder for [`TransportConfig`]
#[derive(Debug, Clone)]
pub struct TransportConfigBuilder {
    config: TransportConfig,
}

impl TransportConfigBuilder {
    /// Start from the defaults of `role`
    pub fn new(role: Role) -> Self {
        TransportConfigBuilder {
            config: TransportConfig::defaults(role),
        }
    }

    pub fn initial_window_size(mut self, size: u32) -> Self {
        self.config.initial_window_size = size;
        self
    }

    pub fn connection_window_size(mut self, size: u32) -> Self {
        self.config.connection_window_size = size;
        self
    }

    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.config.max_frame_size = size;
        self
    }

    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.config.max_concurrent_streams = max;
        self
    }

    /// Soft and hard limits on a received header block
    pub fn max_header_list_size(mut self, soft: u32, hard: u32) -> Self {
        self.config.max_header_list_size_soft = soft;
        self.config.max_header_list_size_hard = hard;
        self
    }

    pub fn header_table_size(mut self, size: u32) -> Self {
        self.config.header_table_size = size;
        self
    }

    pub fn allow_true_binary_metadata(mut self, allow: bool) -> Self {
        self.config.allow_true_binary_metadata = allow;
        self
    }

    pub fn allow_security_frame(mut self, allow: bool) -> Self {
        self.config.allow_security_frame = allow;
        self
    }

    pub fn preferred_receive_crypto_message_size(mut self, size: u32) -> Self {
        self.config.preferred_receive_crypto_message_size = Some(size);
        self
    }

    pub fn stream_queue_max_tokens(mut self, tokens: usize) -> Self {
        self.config.stream_queue_max_tokens = tokens;
        self
    }

    pub fn write_budget_per_cycle(mut self, bytes: usize) -> Self {
        self.config.write_budget_per_cycle = bytes;
        self
    }

    /// Keepalive interval; None disables keepalive
    pub fn keepalive_time(mut self, time: Option<Duration>) -> Self {
        self.config.keepalive_time = time;
        self
    }

    pub fn keepalive_timeout(mut self, timeout: Duration) -> Self {
        self.config.keepalive_timeout = timeout;
        self
    }

    pub fn keepalive_permit_without_calls(mut self, permit: bool) -> Self {
        self.config.keepalive_permit_without_calls = permit;
        self
    }

    pub fn ping_timeout(mut self, timeout: Duration) -> Self {
        self.config.ping_timeout = timeout;
        self
    }

    pub fn settings_timeout(mut self, timeout: Duration) -> Self {
        self.config.settings_timeout = Some(timeout);
        self
    }

    pub fn flow_control_lazy_threshold(mut self, threshold: f64) -> Self {
        self.config.flow_control_lazy_threshold = threshold;
        self
    }

    pub fn queue_streams_at_max_concurrent(mut self, queue: bool) -> Self {
        self.config.queue_streams_at_max_concurrent = queue;
        self
    }

    pub fn ping_abuse(mut self, min_interval: Duration, max_strikes: u32) -> Self {
        self.config.ping_abuse_min_interval = min_interval;
        self.config.ping_abuse_max_strikes = max_strikes;
        self
    }

    pub fn security_frame_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(Bytes) + Send + Sync + 'static,
    {
        self.config.security_frame_handler = Some(Arc::new(handler));
        self
    }

    /// Validate and build
    pub fn build(self) -> Result<TransportConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let client = TransportConfig::defaults(Role::Client);
        assert_eq!(client.initial_window_size, 4 * MIB);
        assert_eq!(client.write_budget_per_cycle, 512 * 1024);
        assert_eq!(client.keepalive_time, None);
        assert_eq!(client.effective_settings_timeout(), Duration::from_secs(60));
        assert!(client.validate().is_ok());

        let server = TransportConfig::defaults(Role::Server);
        assert_eq!(server.keepalive_time, Some(Duration::from_secs(7200)));
    }

    #[test]
    fn test_settings_timeout_follows_keepalive_timeout() {
        let config = TransportConfigBuilder::new(Role::Client)
            .keepalive_timeout(Duration::from_secs(40))
            .build()
            .unwrap();
        assert_eq!(config.effective_settings_timeout(), Duration::from_secs(80));

        let config = TransportConfigBuilder::new(Role::Client)
            .settings_timeout(Duration::from_secs(3))
            .build()
            .unwrap();
        assert_eq!(config.effective_settings_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn test_local_settings_by_role() {
        let config = TransportConfig::defaults(Role::Server);
        let server = config.local_settings(Role::Server);
        assert_eq!(server.max_concurrent_streams, Some(100));
        assert_eq!(server.enable_push, Some(false));
        assert_eq!(server.max_header_list_size, Some(16 * 1024));

        let client = config.local_settings(Role::Client);
        assert_eq!(client.max_concurrent_streams, None);
    }

    #[test]
    fn test_validation() {
        assert!(TransportConfigBuilder::new(Role::Client)
            .max_frame_size(1000)
            .build()
            .is_err());
        assert!(TransportConfigBuilder::new(Role::Client)
            .max_header_list_size(100, 10)
            .build()
            .is_err());
        assert!(TransportConfigBuilder::new(Role::Client)
            .flow_control_lazy_threshold(0.0)
            .build()
            .is_err());
        assert!(TransportConfigBuilder::new(Role::Client)
            .initial_window_size(0x8000_0000)
            .build()
            .is_err());
    }

    #[test]
    fn test_debug_hides_handler() {
        let config = TransportConfigBuilder::new(Role::Client)
            .security_frame_handler(|_| {})
            .build()
            .unwrap();
        assert!(format!("{:?}", config).contains("<fn>"));
    }
}
