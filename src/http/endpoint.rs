//! Abstract byte endpoint
//!
//! The transport runs over anything that provides an ordered byte stream:
//! a TCP connection, a TLS session established elsewhere, or an in-memory
//! duplex pipe in tests. The endpoint is split into a reader half owned by
//! the read loop and a writer half owned by the write loop.

use bytes::{Bytes, BytesMut};
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;

/// Ordered byte stream the transport runs on
pub trait Endpoint: AsyncRead + AsyncWrite + Send + Unpin + 'static {
    /// Address of the remote side, if known
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Address of the local side, if known
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

impl Endpoint for TcpStream {
    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        TcpStream::local_addr(self).ok()
    }
}

impl Endpoint for DuplexStream {}

/// Read half with an internal buffer
pub struct EndpointReader<R> {
    inner: R,
    buffer: BytesMut,
}

impl<R: AsyncRead + Unpin> EndpointReader<R> {
    /// Wrap a reader
    pub fn new(inner: R) -> Self {
        EndpointReader {
            inner,
            buffer: BytesMut::with_capacity(16 * 1024),
        }
    }

    /// Read exactly `n` bytes.
    ///
    /// Returns `UnexpectedEof` if the peer closes first.
    pub async fn read(&mut self, n: usize) -> io::Result<Bytes> {
        while self.buffer.len() < n {
            self.buffer.reserve(n - self.buffer.len());
            if self.inner.read_buf(&mut self.buffer).await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "endpoint closed",
                ));
            }
        }
        Ok(self.buffer.split_to(n).freeze())
    }

    /// Fill `out` completely
    pub async fn read_slice(&mut self, out: &mut [u8]) -> io::Result<()> {
        let bytes = self.read(out.len()).await?;
        out.copy_from_slice(&bytes);
        Ok(())
    }
}

/// Write half
pub struct EndpointWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> EndpointWriter<W> {
    /// Wrap a writer
    pub fn new(inner: W) -> Self {
        EndpointWriter { inner }
    }

    /// Write all of `buf` and flush
    pub async fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        self.inner.write_all(buf).await?;
        self.inner.flush().await
    }

    /// Shut down the write direction
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}
