//! RPC terminal status
//!
//! Every call ends with a [`Status`]. Streams reset by either side map their
//! HTTP/2 error code to a status code; trailers carry the status explicitly
//! in `grpc-status` / `grpc-message`.

use super::h2::error::{ErrorCode, H2Error};
use super::metadata::Metadata;
use std::fmt;

/// Metadata key carrying the numeric status code
pub const GRPC_STATUS: &str = "grpc-status";

/// Metadata key carrying the status message
pub const GRPC_MESSAGE: &str = "grpc-message";

/// RPC status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum StatusCode {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl StatusCode {
    /// Convert to i32
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Create from i32
    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            0 => Some(StatusCode::Ok),
            1 => Some(StatusCode::Cancelled),
            2 => Some(StatusCode::Unknown),
            3 => Some(StatusCode::InvalidArgument),
            4 => Some(StatusCode::DeadlineExceeded),
            5 => Some(StatusCode::NotFound),
            6 => Some(StatusCode::AlreadyExists),
            7 => Some(StatusCode::PermissionDenied),
            8 => Some(StatusCode::ResourceExhausted),
            9 => Some(StatusCode::FailedPrecondition),
            10 => Some(StatusCode::Aborted),
            11 => Some(StatusCode::OutOfRange),
            12 => Some(StatusCode::Unimplemented),
            13 => Some(StatusCode::Internal),
            14 => Some(StatusCode::Unavailable),
            15 => Some(StatusCode::DataLoss),
            16 => Some(StatusCode::Unauthenticated),
            _ => None,
        }
    }

    /// Status for a stream reset with the given HTTP/2 error code
    pub fn from_h2_error_code(code: ErrorCode) -> Self {
        match code {
            ErrorCode::Cancel => StatusCode::Cancelled,
            ErrorCode::EnhanceYourCalm | ErrorCode::FlowControlError => {
                StatusCode::ResourceExhausted
            }
            ErrorCode::InadequateSecurity => StatusCode::PermissionDenied,
            ErrorCode::RefusedStream => StatusCode::Unavailable,
            _ => StatusCode::Internal,
        }
    }

    /// Get code name
    pub fn name(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::Cancelled => "CANCELLED",
            StatusCode::Unknown => "UNKNOWN",
            StatusCode::InvalidArgument => "INVALID_ARGUMENT",
            StatusCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            StatusCode::NotFound => "NOT_FOUND",
            StatusCode::AlreadyExists => "ALREADY_EXISTS",
            StatusCode::PermissionDenied => "PERMISSION_DENIED",
            StatusCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            StatusCode::FailedPrecondition => "FAILED_PRECONDITION",
            StatusCode::Aborted => "ABORTED",
            StatusCode::OutOfRange => "OUT_OF_RANGE",
            StatusCode::Unimplemented => "UNIMPLEMENTED",
            StatusCode::Internal => "INTERNAL",
            StatusCode::Unavailable => "UNAVAILABLE",
            StatusCode::DataLoss => "DATA_LOSS",
            StatusCode::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Terminal status of a call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    code: StatusCode,
    message: String,
}

impl Status {
    /// Create a status
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Status {
            code,
            message: message.into(),
        }
    }

    pub fn ok() -> Self {
        Status::new(StatusCode::Ok, "")
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Status::new(StatusCode::Cancelled, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Status::new(StatusCode::Unavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Status::new(StatusCode::Internal, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Status::new(StatusCode::ResourceExhausted, message)
    }

    /// Status for a stream reset with `code`
    pub fn from_h2_error_code(code: ErrorCode, message: impl Into<String>) -> Self {
        Status::new(StatusCode::from_h2_error_code(code), message)
    }

    /// Status for a handler error scoped to one stream
    pub fn from_h2_error(err: &H2Error) -> Self {
        Status::from_h2_error_code(err.code(), err.message())
    }

    /// Read the status carried in trailing metadata.
    ///
    /// A missing or unparsable `grpc-status` is `Unknown`.
    pub fn from_trailers(trailers: &Metadata) -> Self {
        let code = trailers
            .get_str(GRPC_STATUS)
            .and_then(|s| s.trim().parse::<i32>().ok())
            .and_then(StatusCode::from_i32);
        let message = trailers.get_str(GRPC_MESSAGE).unwrap_or_default();
        match code {
            Some(code) => Status::new(code, message),
            None => Status::new(StatusCode::Unknown, "missing grpc-status in trailers"),
        }
    }

    /// Write this status into trailing metadata
    pub fn to_trailers(&self, trailers: &mut Metadata) {
        trailers.insert(GRPC_STATUS, self.code.as_i32().to_string());
        if !self.message.is_empty() {
            trailers.insert(GRPC_MESSAGE, self.message.clone());
        }
    }

    pub fn code(&self) -> StatusCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}
