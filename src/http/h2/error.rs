//! HTTP/2 error types
//!
//! This module defines the error codes of RFC 9113 Section 7 and the typed
//! status returned by every frame handler. A handler failure is scoped to a
//! single stream, fatal to the whole connection, or an engine invariant
//! violation.

use std::fmt;

/// HTTP/2 error codes as defined in RFC 9113 Section 7
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    /// Graceful shutdown
    NoError = 0x0,
    /// Protocol error detected
    ProtocolError = 0x1,
    /// Implementation fault
    InternalError = 0x2,
    /// Flow-control limits exceeded
    FlowControlError = 0x3,
    /// Settings not acknowledged
    SettingsTimeout = 0x4,
    /// Frame received for closed stream
    StreamClosed = 0x5,
    /// Frame size incorrect
    FrameSizeError = 0x6,
    /// Stream not processed
    RefusedStream = 0x7,
    /// Stream cancelled
    Cancel = 0x8,
    /// Compression state not updated
    CompressionError = 0x9,
    /// TCP connection error for CONNECT method
    ConnectError = 0xa,
    /// Processing capacity exceeded
    EnhanceYourCalm = 0xb,
    /// Negotiated TLS parameters not acceptable
    InadequateSecurity = 0xc,
    /// Use HTTP/1.1 for the request
    Http11Required = 0xd,
}

impl ErrorCode {
    /// Convert error code to u32
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Create error code from u32
    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            0x0 => Some(ErrorCode::NoError),
            0x1 => Some(ErrorCode::ProtocolError),
            0x2 => Some(ErrorCode::InternalError),
            0x3 => Some(ErrorCode::FlowControlError),
            0x4 => Some(ErrorCode::SettingsTimeout),
            0x5 => Some(ErrorCode::StreamClosed),
            0x6 => Some(ErrorCode::FrameSizeError),
            0x7 => Some(ErrorCode::RefusedStream),
            0x8 => Some(ErrorCode::Cancel),
            0x9 => Some(ErrorCode::CompressionError),
            0xa => Some(ErrorCode::ConnectError),
            0xb => Some(ErrorCode::EnhanceYourCalm),
            0xc => Some(ErrorCode::InadequateSecurity),
            0xd => Some(ErrorCode::Http11Required),
            _ => None,
        }
    }

    /// Decode an error code received on the wire.
    ///
    /// Unknown codes must not trigger special behavior (RFC 9113 Section 7)
    /// and are treated as INTERNAL_ERROR.
    pub fn from_wire(code: u32) -> Self {
        Self::from_u32(code).unwrap_or(ErrorCode::InternalError)
    }

    /// Get error name
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCode::NoError => "NO_ERROR",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::FlowControlError => "FLOW_CONTROL_ERROR",
            ErrorCode::SettingsTimeout => "SETTINGS_TIMEOUT",
            ErrorCode::StreamClosed => "STREAM_CLOSED",
            ErrorCode::FrameSizeError => "FRAME_SIZE_ERROR",
            ErrorCode::RefusedStream => "REFUSED_STREAM",
            ErrorCode::Cancel => "CANCEL",
            ErrorCode::CompressionError => "COMPRESSION_ERROR",
            ErrorCode::ConnectError => "CONNECT_ERROR",
            ErrorCode::EnhanceYourCalm => "ENHANCE_YOUR_CALM",
            ErrorCode::InadequateSecurity => "INADEQUATE_SECURITY",
            ErrorCode::Http11Required => "HTTP_1_1_REQUIRED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u32())
    }
}

/// Failure of a frame handler or engine component
///
/// The central error handler in the transport turns a stream error into a
/// stream close (with RST_STREAM) and anything else into a connection close.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum H2Error {
    /// A single stream must be aborted; the connection keeps going
    #[error("stream {stream_id} error {code}: {message}")]
    Stream {
        stream_id: u32,
        code: ErrorCode,
        message: String,
    },

    /// The whole connection must be torn down
    #[error("connection error {code}: {message}")]
    Connection { code: ErrorCode, message: String },

    /// Engine invariant violated; not caused by the peer
    #[error("internal error: {0}")]
    Internal(String),
}

impl H2Error {
    /// Stream-scoped error
    pub fn stream(stream_id: u32, code: ErrorCode, message: impl Into<String>) -> Self {
        H2Error::Stream {
            stream_id,
            code,
            message: message.into(),
        }
    }

    /// Connection-scoped error
    pub fn connection(code: ErrorCode, message: impl Into<String>) -> Self {
        H2Error::Connection {
            code,
            message: message.into(),
        }
    }

    /// Connection-scoped PROTOCOL_ERROR
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::connection(ErrorCode::ProtocolError, message)
    }

    /// Engine invariant violation
    pub fn internal(message: impl Into<String>) -> Self {
        H2Error::Internal(message.into())
    }

    /// The HTTP/2 error code carried on the wire for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            H2Error::Stream { code, .. } | H2Error::Connection { code, .. } => *code,
            H2Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Human readable detail
    pub fn message(&self) -> &str {
        match self {
            H2Error::Stream { message, .. } | H2Error::Connection { message, .. } => message,
            H2Error::Internal(message) => message,
        }
    }

    /// Whether handling this error tears down the connection
    pub fn is_connection_error(&self) -> bool {
        !matches!(self, H2Error::Stream { .. })
    }

    /// Stream the error is scoped to, if any
    pub fn stream_id(&self) -> Option<u32> {
        match self {
            H2Error::Stream { stream_id, .. } => Some(*stream_id),
            _ => None,
        }
    }
}

/// Result type for HTTP/2 operations
pub type Result<T> = std::result::Result<T, H2Error>;
