//! h2rpc - HTTP/2 transport for RPC frameworks
//!
//! This crate implements the connection engine that carries RPC calls over
//! HTTP/2: framing, flow control, stream multiplexing, keepalive and
//! graceful shutdown. It runs on tokio and works over any ordered byte
//! stream; TLS and name resolution are left to the caller.

pub mod http;
