//! Transport layer of h2rpc
//!
//! This module holds what the HTTP/2 engine shares with the RPC layer above
//! it: call metadata, terminal statuses, the byte endpoint abstraction, and
//! the crate-level error type.
//!
//! # Architecture
//!
//! - [`endpoint`] abstracts the byte stream (TCP, TLS established elsewhere,
//!   or an in-memory duplex pipe)
//! - [`h2`] runs the HTTP/2 connection over that endpoint
//! - [`metadata`] and [`status`] describe what a call carries and how it ends
//!
//! # Examples
//!
//! ```no_run
//! use h2rpc::http::h2::ClientTransportBuilder;
//! use h2rpc::http::Metadata;
//! use std::time::Duration;
//! use tokio::net::TcpStream;
//!
//! # async fn example() -> h2rpc::http::Result<()> {
//! let stream = TcpStream::connect("127.0.0.1:50051").await?;
//! let transport = ClientTransportBuilder::new()
//!     .keepalive_time(Some(Duration::from_secs(30)))
//!     .build(stream)?;
//! transport.ping().await?;
//!
//! let mut headers = Metadata::new();
//! headers.insert(":method", "POST");
//! headers.insert(":path", "/helloworld.Greeter/SayHello");
//! let _call = transport.start_call(headers)?;
//! # Ok(())
//! # }
//! ```

pub mod endpoint;
pub mod h2;
pub mod metadata;
pub mod status;

pub use endpoint::{Endpoint, EndpointReader, EndpointWriter};
pub use metadata::Metadata;
pub use status::{Status, StatusCode};

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, Error>;

/// Transport operation errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP/2 error: {0}")]
    H2(#[from] h2::H2Error),

    #[error("Transport closed")]
    TransportClosed,

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}
