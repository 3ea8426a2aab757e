//! HTTP/2 transport for RPC calls
//!
//! This module implements the connection engine of an RPC framework on top
//! of HTTP/2: frame codec, flow control, header and message framing, stream
//! state, the per-stream outbound queue and scheduler, SETTINGS, PING,
//! keepalive and GOAWAY handling, and the client and server transports that
//! drive them over an [`Endpoint`](crate::http::endpoint::Endpoint).
//!
//! # Architecture
//!
//! Each transport runs a read loop and a write loop as tokio tasks. The
//! read loop parses frames and dispatches them under the connection lock;
//! the write loop collects control frames and stream data into one buffer
//! per cycle and writes it out. Calls talk to the transport through a
//! [`CallHandle`]: outbound data goes into the stream's
//! [`StreamDataQueue`](stream_data_queue::StreamDataQueue), inbound data
//! comes back as [`StreamEvent`]s.
//!
//! ## Features
//!
//! - **Frame handling**: DATA, HEADERS, CONTINUATION, RST_STREAM, SETTINGS,
//!   PING, GOAWAY, WINDOW_UPDATE and the security extension frame
//! - **Flow control**: transport and stream windows with lazy updates
//! - **Message framing**: 5-byte length-prefixed messages across DATA frames
//! - **GOAWAY**: graceful two-phase shutdown and immediate error shutdown
//! - **Keepalive**: idle pings, ping timeouts and server-side ping abuse limits
//!
//! # Examples
//!
//! ```no_run
//! use h2rpc::http::h2::{ClientTransport, ServerTransport, StreamEvent};
//! use h2rpc::http::h2::message::Message;
//! use h2rpc::http::{Metadata, Status};
//! use bytes::Bytes;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (client_io, server_io) = tokio::io::duplex(64 * 1024);
//! let client = ClientTransport::new(client_io)?;
//! let mut server = ServerTransport::new(server_io)?;
//!
//! let mut call = client.start_call(Metadata::new())?;
//! call.enqueue_message(Message::new(Bytes::from_static(b"ping"))).await?;
//! call.enqueue_half_close()?;
//!
//! let mut incoming = server.accept().await.ok_or("no call")?;
//! while let Some(event) = incoming.next_event().await {
//!     if event == StreamEvent::HalfClosed {
//!         break;
//!     }
//! }
//! incoming.enqueue_initial_metadata(Metadata::new())?;
//! incoming.send_status(&Status::ok(), Metadata::new())?;
//!
//! while let Some(event) = call.next_event().await {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

pub mod call;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod flow_control;
pub mod frames;
pub mod goaway;
pub mod header_assembler;
pub mod header_codec;
pub mod keepalive;
pub mod message;
pub mod ping;
pub mod server;
pub mod settings;
pub mod stream;
pub mod stream_data_queue;
mod transport;
pub mod writable_streams;

pub use call::{CallHandle, StreamEvent};
pub use client::{ClientTransport, ClientTransportBuilder};
pub use config::{Role, TransportConfig, TransportConfigBuilder};
pub use error::{ErrorCode, H2Error, Result};
pub use frames::{Frame, FrameType, FrameFlags, DataFrame, HeadersFrame, SettingsFrame};
pub use message::Message;
pub use server::{ServerTransport, ServerTransportBuilder};
pub use settings::{Settings, SettingsBuilder};
pub use stream::{StreamId, StreamState};

/// HTTP/2 connection preface that must be sent by clients
///
/// From RFC 9113 Section 3.4:
/// "PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n"
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Default initial window size (65535 bytes)
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65535;

/// Default maximum frame size (16384 bytes)
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16384;

/// Default header table size (4096 bytes)
pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4096;

/// Maximum stream ID value (2^31 - 1)
pub const MAX_STREAM_ID: u32 = 0x7FFFFFFF;

/// Stream ID 0 (connection-level)
pub const CONNECTION_STREAM_ID: u32 = 0;
