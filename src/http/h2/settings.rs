//! HTTP/2 settings management
//!
//! This module implements SETTINGS parameters (RFC 9113 Section 6.5), the
//! RPC extension parameters, and the bookkeeping of local and peer values.
//!
//! Peer values take effect as soon as their frame is parsed. Local values
//! take wire effect once serialized; at most one local SETTINGS frame is
//! unacknowledged at a time, and its ACK is guarded by a timeout owned by the
//! transport.

use super::error::{ErrorCode, H2Error, Result};
use super::frames::SettingsFrame;
use super::{DEFAULT_HEADER_TABLE_SIZE, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE};
use std::fmt;
use std::time::Duration;

/// Largest legal SETTINGS_MAX_FRAME_SIZE (2^24 - 1)
pub const MAX_MAX_FRAME_SIZE: u32 = 16_777_215;

/// HTTP/2 settings parameters (RFC 9113 Section 6.5.2 plus extensions)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SettingsParameter {
    /// SETTINGS_HEADER_TABLE_SIZE (0x1)
    HeaderTableSize = 0x1,

    /// SETTINGS_ENABLE_PUSH (0x2)
    EnablePush = 0x2,

    /// SETTINGS_MAX_CONCURRENT_STREAMS (0x3)
    MaxConcurrentStreams = 0x3,

    /// SETTINGS_INITIAL_WINDOW_SIZE (0x4)
    InitialWindowSize = 0x4,

    /// SETTINGS_MAX_FRAME_SIZE (0x5)
    MaxFrameSize = 0x5,

    /// SETTINGS_MAX_HEADER_LIST_SIZE (0x6)
    MaxHeaderListSize = 0x6,

    /// Peer accepts raw binary metadata values without base64 (0xfe03)
    AllowTrueBinaryMetadata = 0xfe03,

    /// Preferred size of received crypto frames (0xfe04)
    PreferredReceiveCryptoMessageSize = 0xfe04,

    /// Peer accepts the vendor security frame (0xfe05)
    AllowSecurityFrame = 0xfe05,
}

impl SettingsParameter {
    /// Convert to u16
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Create from u16
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x1 => Some(SettingsParameter::HeaderTableSize),
            0x2 => Some(SettingsParameter::EnablePush),
            0x3 => Some(SettingsParameter::MaxConcurrentStreams),
            0x4 => Some(SettingsParameter::InitialWindowSize),
            0x5 => Some(SettingsParameter::MaxFrameSize),
            0x6 => Some(SettingsParameter::MaxHeaderListSize),
            0xfe03 => Some(SettingsParameter::AllowTrueBinaryMetadata),
            0xfe04 => Some(SettingsParameter::PreferredReceiveCryptoMessageSize),
            0xfe05 => Some(SettingsParameter::AllowSecurityFrame),
            _ => None,
        }
    }

    /// Get parameter name
    pub fn name(&self) -> &'static str {
        match self {
            SettingsParameter::HeaderTableSize => "HEADER_TABLE_SIZE",
            SettingsParameter::EnablePush => "ENABLE_PUSH",
            SettingsParameter::MaxConcurrentStreams => "MAX_CONCURRENT_STREAMS",
            SettingsParameter::InitialWindowSize => "INITIAL_WINDOW_SIZE",
            SettingsParameter::MaxFrameSize => "MAX_FRAME_SIZE",
            SettingsParameter::MaxHeaderListSize => "MAX_HEADER_LIST_SIZE",
            SettingsParameter::AllowTrueBinaryMetadata => "GRPC_ALLOW_TRUE_BINARY_METADATA",
            SettingsParameter::PreferredReceiveCryptoMessageSize => {
                "GRPC_PREFERRED_RECEIVE_CRYPTO_FRAME_SIZE"
            }
            SettingsParameter::AllowSecurityFrame => "GRPC_ALLOW_SECURITY_FRAME",
        }
    }
}

impl fmt::Display for SettingsParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u16())
    }
}

/// HTTP/2 settings
///
/// Every field is optional so the same type describes a full snapshot, a
/// partial update, or the contents of one SETTINGS frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    /// Header table size (default: 4096)
    pub header_table_size: Option<u32>,

    /// Enable server push (default: true)
    pub enable_push: Option<bool>,

    /// Maximum concurrent streams (default: unlimited)
    pub max_concurrent_streams: Option<u32>,

    /// Initial window size (default: 65535)
    pub initial_window_size: Option<u32>,

    /// Maximum frame size (default: 16384, range: 16384-16777215)
    pub max_frame_size: Option<u32>,

    /// Maximum header list size (default: unlimited)
    pub max_header_list_size: Option<u32>,

    /// Accept raw binary metadata (default: false)
    pub allow_true_binary_metadata: Option<bool>,

    /// Preferred receive crypto frame size (default: unset)
    pub preferred_receive_crypto_message_size: Option<u32>,

    /// Accept the vendor security frame (default: false)
    pub allow_security_frame: Option<bool>,
}

impl Settings {
    /// Create empty settings
    pub fn new() -> Self {
        Settings::default()
    }

    /// Create a snapshot holding the protocol defaults
    pub fn default_settings() -> Self {
        Settings {
            header_table_size: Some(DEFAULT_HEADER_TABLE_SIZE),
            enable_push: Some(true),
            max_concurrent_streams: None,
            initial_window_size: Some(DEFAULT_INITIAL_WINDOW_SIZE),
            max_frame_size: Some(DEFAULT_MAX_FRAME_SIZE),
            max_header_list_size: None,
            allow_true_binary_metadata: Some(false),
            preferred_receive_crypto_message_size: None,
            allow_security_frame: Some(false),
        }
    }

    /// Get header table size (with default)
    pub fn get_header_table_size(&self) -> u32 {
        self.header_table_size.unwrap_or(DEFAULT_HEADER_TABLE_SIZE)
    }

    /// Get enable push (with default)
    pub fn get_enable_push(&self) -> bool {
        self.enable_push.unwrap_or(true)
    }

    /// Get max concurrent streams (None = unlimited)
    pub fn get_max_concurrent_streams(&self) -> Option<u32> {
        self.max_concurrent_streams
    }

    /// Get initial window size (with default)
    pub fn get_initial_window_size(&self) -> u32 {
        self.initial_window_size.unwrap_or(DEFAULT_INITIAL_WINDOW_SIZE)
    }

    /// Get max frame size (with default)
    pub fn get_max_frame_size(&self) -> u32 {
        self.max_frame_size.unwrap_or(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Get max header list size (None = unlimited)
    pub fn get_max_header_list_size(&self) -> Option<u32> {
        self.max_header_list_size
    }

    /// Get allow true binary metadata (with default)
    pub fn get_allow_true_binary_metadata(&self) -> bool {
        self.allow_true_binary_metadata.unwrap_or(false)
    }

    /// Get preferred receive crypto message size (None = unset)
    pub fn get_preferred_receive_crypto_message_size(&self) -> Option<u32> {
        self.preferred_receive_crypto_message_size
    }

    /// Get allow security frame (with default)
    pub fn get_allow_security_frame(&self) -> bool {
        self.allow_security_frame.unwrap_or(false)
    }

    /// Check whether no parameter is set
    pub fn is_empty(&self) -> bool {
        *self == Settings::new()
    }

    /// Validate settings values
    pub fn validate(&self) -> Result<()> {
        if let Some(initial_window_size) = self.initial_window_size {
            if initial_window_size > 0x7FFFFFFF {
                return Err(H2Error::connection(
                    ErrorCode::FlowControlError,
                    format!(
                        "initial window size {} exceeds maximum (2^31-1)",
                        initial_window_size
                    ),
                ));
            }
        }

        if let Some(max_frame_size) = self.max_frame_size {
            if !(DEFAULT_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&max_frame_size) {
                return Err(H2Error::protocol(format!(
                    "max frame size {} outside valid range (16384-16777215)",
                    max_frame_size
                )));
            }
        }

        Ok(())
    }

    /// Decode the parameters of a received SETTINGS frame.
    ///
    /// Unknown identifiers are ignored; a later value for the same
    /// identifier overrides an earlier one.
    pub fn from_params(params: &[(u16, u32)]) -> Result<Settings> {
        let mut settings = Settings::new();
        for &(id, value) in params {
            let Some(parameter) = SettingsParameter::from_u16(id) else {
                continue;
            };
            match parameter {
                SettingsParameter::HeaderTableSize => settings.header_table_size = Some(value),
                SettingsParameter::EnablePush => {
                    if value > 1 {
                        return Err(H2Error::protocol(format!("ENABLE_PUSH value {}", value)));
                    }
                    settings.enable_push = Some(value == 1);
                }
                SettingsParameter::MaxConcurrentStreams => {
                    settings.max_concurrent_streams = Some(value)
                }
                SettingsParameter::InitialWindowSize => settings.initial_window_size = Some(value),
                SettingsParameter::MaxFrameSize => settings.max_frame_size = Some(value),
                SettingsParameter::MaxHeaderListSize => settings.max_header_list_size = Some(value),
                SettingsParameter::AllowTrueBinaryMetadata => {
                    settings.allow_true_binary_metadata = Some(value != 0)
                }
                SettingsParameter::PreferredReceiveCryptoMessageSize => {
                    settings.preferred_receive_crypto_message_size = Some(value)
                }
                SettingsParameter::AllowSecurityFrame => {
                    settings.allow_security_frame = Some(value != 0)
                }
            }
        }
        settings.validate()?;
        Ok(settings)
    }

    /// Encode the set parameters in identifier order
    pub fn to_params(&self) -> Vec<(u16, u32)> {
        let mut params = Vec::new();
        let mut push = |parameter: SettingsParameter, value: Option<u32>| {
            if let Some(value) = value {
                params.push((parameter.as_u16(), value));
            }
        };
        push(SettingsParameter::HeaderTableSize, self.header_table_size);
        push(SettingsParameter::EnablePush, self.enable_push.map(u32::from));
        push(SettingsParameter::MaxConcurrentStreams, self.max_concurrent_streams);
        push(SettingsParameter::InitialWindowSize, self.initial_window_size);
        push(SettingsParameter::MaxFrameSize, self.max_frame_size);
        push(SettingsParameter::MaxHeaderListSize, self.max_header_list_size);
        push(
            SettingsParameter::AllowTrueBinaryMetadata,
            self.allow_true_binary_metadata.map(u32::from),
        );
        push(
            SettingsParameter::PreferredReceiveCryptoMessageSize,
            self.preferred_receive_crypto_message_size,
        );
        push(
            SettingsParameter::AllowSecurityFrame,
            self.allow_security_frame.map(u32::from),
        );
        params
    }

    /// Merge settings from another Settings object
    /// (values in `other` override values in `self`)
    pub fn merge(&mut self, other: &Settings) {
        if other.header_table_size.is_some() {
            self.header_table_size = other.header_table_size;
        }
        if other.enable_push.is_some() {
            self.enable_push = other.enable_push;
        }
        if other.max_concurrent_streams.is_some() {
            self.max_concurrent_streams = other.max_concurrent_streams;
        }
        if other.initial_window_size.is_some() {
            self.initial_window_size = other.initial_window_size;
        }
        if other.max_frame_size.is_some() {
            self.max_frame_size = other.max_frame_size;
        }
        if other.max_header_list_size.is_some() {
            self.max_header_list_size = other.max_header_list_size;
        }
        if other.allow_true_binary_metadata.is_some() {
            self.allow_true_binary_metadata = other.allow_true_binary_metadata;
        }
        if other.preferred_receive_crypto_message_size.is_some() {
            self.preferred_receive_crypto_message_size = other.preferred_receive_crypto_message_size;
        }
        if other.allow_security_frame.is_some() {
            self.allow_security_frame = other.allow_security_frame;
        }
    }

    /// Parameters set in `self` whose value differs from `base`
    pub fn diff(&self, base: &Settings) -> Settings {
        fn changed<T: PartialEq + Copy>(value: Option<T>, base: Option<T>) -> Option<T> {
            match value {
                Some(v) if Some(v) != base => Some(v),
                _ => None,
            }
        }
        Settings {
            header_table_size: changed(self.header_table_size, base.header_table_size),
            enable_push: changed(self.enable_push, base.enable_push),
            max_concurrent_streams: changed(self.max_concurrent_streams, base.max_concurrent_streams),
            initial_window_size: changed(self.initial_window_size, base.initial_window_size),
            max_frame_size: changed(self.max_frame_size, base.max_frame_size),
            max_header_list_size: changed(self.max_header_list_size, base.max_header_list_size),
            allow_true_binary_metadata: changed(
                self.allow_true_binary_metadata,
                base.allow_true_binary_metadata,
            ),
            preferred_receive_crypto_message_size: changed(
                self.preferred_receive_crypto_message_size,
                base.preferred_receive_crypto_message_size,
            ),
            allow_security_frame: changed(self.allow_security_frame, base.allow_security_frame),
        }
    }
}

/// Builder for HTTP/2 settings
#[derive(Debug, Clone, Default)]
pub struct SettingsBuilder {
    settings: Settings,
}

impl SettingsBuilder {
    /// Create a new settings builder
    pub fn new() -> Self {
        SettingsBuilder {
            settings: Settings::new(),
        }
    }

    /// Set header table size
    pub fn header_table_size(mut self, size: u32) -> Self {
        self.settings.header_table_size = Some(size);
        self
    }

    /// Set enable push
    pub fn enable_push(mut self, enable: bool) -> Self {
        self.settings.enable_push = Some(enable);
        self
    }

    /// Set max concurrent streams
    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.settings.max_concurrent_streams = Some(max);
        self
    }

    /// Set initial window size
    pub fn initial_window_size(mut self, size: u32) -> Self {
        self.settings.initial_window_size = Some(size);
        self
    }

    /// Set max frame size
    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.settings.max_frame_size = Some(size);
        self
    }

    /// Set max header list size
    pub fn max_header_list_size(mut self, size: u32) -> Self {
        self.settings.max_header_list_size = Some(size);
        self
    }

    /// Set allow true binary metadata
    pub fn allow_true_binary_metadata(mut self, allow: bool) -> Self {
        self.settings.allow_true_binary_metadata = Some(allow);
        self
    }

    /// Set preferred receive crypto message size
    pub fn preferred_receive_crypto_message_size(mut self, size: u32) -> Self {
        self.settings.preferred_receive_crypto_message_size = Some(size);
        self
    }

    /// Set allow security frame
    pub fn allow_security_frame(mut self, allow: bool) -> Self {
        self.settings.allow_security_frame = Some(allow);
        self
    }

    /// Build the settings
    pub fn build(self) -> Result<Settings> {
        self.settings.validate()?;
        Ok(self.settings)
    }
}

/// How long to wait for a SETTINGS ACK: max(2 x keepalive timeout, 1 minute)
pub fn settings_ack_timeout(keepalive_timeout: Duration) -> Duration {
    std::cmp::max(keepalive_timeout.saturating_mul(2), Duration::from_secs(60))
}

/// Local and peer settings of one connection
#[derive(Debug)]
pub struct SettingsManager {
    /// Desired local values
    local: Settings,
    /// Local values as of the last serialized SETTINGS frame
    sent: Settings,
    /// Local values the peer has acknowledged
    acked: Settings,
    /// Peer values, defaults merged with every frame received
    peer: Settings,
    initial_sent: bool,
    update_in_flight: bool,
    acks_owed: usize,
}

impl SettingsManager {
    /// Create a manager whose local snapshot is `local` over the defaults
    pub fn new(local: &Settings) -> Self {
        let mut desired = Settings::default_settings();
        desired.merge(local);
        SettingsManager {
            local: desired,
            sent: Settings::default_settings(),
            acked: Settings::default_settings(),
            peer: Settings::default_settings(),
            initial_sent: false,
            update_in_flight: false,
            acks_owed: 0,
        }
    }

    /// Desired local settings
    pub fn local(&self) -> &Settings {
        &self.local
    }

    /// Local settings acknowledged by the peer
    pub fn acked(&self) -> &Settings {
        &self.acked
    }

    /// Peer settings currently in effect
    pub fn peer(&self) -> &Settings {
        &self.peer
    }

    /// Change local settings; they go out with the next write cycle
    pub fn update_local(&mut self, changes: &Settings) {
        self.local.merge(changes);
    }

    /// Whether a local SETTINGS frame awaits its ACK
    pub fn is_update_in_flight(&self) -> bool {
        self.update_in_flight
    }

    /// Receive window to give new streams.
    ///
    /// Until the peer acknowledges a smaller value it may still use the
    /// larger one.
    pub fn local_initial_window_size(&self) -> u32 {
        std::cmp::max(
            self.sent.get_initial_window_size(),
            self.acked.get_initial_window_size(),
        )
    }

    /// Largest frame the peer may send us
    pub fn local_max_frame_size(&self) -> u32 {
        std::cmp::max(self.sent.get_max_frame_size(), self.acked.get_max_frame_size())
    }

    /// Whether both sides agreed to exchange security frames
    pub fn security_frame_negotiated(&self) -> bool {
        self.local.get_allow_security_frame() && self.peer.get_allow_security_frame()
    }

    /// Build the next local SETTINGS frame, if one is due.
    ///
    /// The first frame of a connection is always sent, even when empty.
    /// Returns the frame and the local snapshot that was current before it.
    pub fn maybe_send_update(&mut self) -> Option<(SettingsFrame, Settings)> {
        if self.update_in_flight {
            return None;
        }
        let changes = self.local.diff(&self.sent);
        if self.initial_sent && changes.is_empty() {
            return None;
        }
        self.initial_sent = true;
        self.update_in_flight = true;
        let previous = std::mem::replace(&mut self.sent, self.local.clone());
        Some((SettingsFrame::new(changes.to_params()), previous))
    }

    /// Record a SETTINGS ACK from the peer.
    ///
    /// Returns the previously acknowledged snapshot, or None when no update
    /// was in flight.
    pub fn on_settings_ack(&mut self) -> Option<Settings> {
        if !self.update_in_flight {
            return None;
        }
        self.update_in_flight = false;
        Some(std::mem::replace(&mut self.acked, self.sent.clone()))
    }

    /// Apply a received (non-ACK) SETTINGS frame and owe an ACK for it.
    ///
    /// Returns the parameters that were present in the frame.
    pub fn apply_peer(&mut self, frame: &SettingsFrame) -> Result<Settings> {
        let changes = Settings::from_params(&frame.params)?;
        self.peer.merge(&changes);
        self.acks_owed += 1;
        Ok(changes)
    }

    /// Number of SETTINGS ACKs to write, resetting the count
    pub fn take_acks_owed(&mut self) -> usize {
        std::mem::take(&mut self.acks_owed)
    }
}
