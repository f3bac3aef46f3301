//! TCP transport layer for EtherNet/IP communication.
//!
//! This module provides [`TcpTransport`], which moves encapsulation frames
//! over a TCP stream. It knows about the 24-byte header only as far as it
//! needs the `length` field to cut frames out of the byte stream; command
//! semantics live in [`Session`](crate::Session).
//!
//! # Constants
//!
//! - [`DEFAULT_ENIP_PORT`] - EtherNet/IP explicit messaging port (44818)
//! - [`DEFAULT_TIMEOUT`] - Default request timeout (5 seconds)
//! - [`MAX_ENCAPSULATION_LENGTH`] - Largest `length` a frame may declare
//!
//! Receiving is cancel-safe: bytes read before a timeout fires stay buffered
//! and are consumed by the next [`TcpTransport::recv`].

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::header::{EncapsulationHeader, ENCAPSULATION_HEADER_SIZE};

/// Default EtherNet/IP TCP port.
pub const DEFAULT_ENIP_PORT: u16 = 44818;

/// Default timeout for connecting and for each request.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum data length a single encapsulation frame may carry.
pub const MAX_ENCAPSULATION_LENGTH: usize = 65_511;

const READ_CHUNK: usize = 4096;

/// TCP transport for EtherNet/IP frames.
pub struct TcpTransport {
    stream: TcpStream,
    remote_addr: SocketAddr,
    buffer: Vec<u8>,
}

impl TcpTransport {
    /// Wraps a connected stream.
    pub fn new(stream: TcpStream, remote_addr: SocketAddr) -> Self {
        // Requests are small and latency-bound.
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay on {} failed: {}", remote_addr, e);
        }
        Self {
            stream,
            remote_addr,
            buffer: Vec::with_capacity(READ_CHUNK),
        }
    }

    /// Connects to `addr`. The caller bounds this with its own timeout.
    pub async fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::new(stream, addr))
    }

    /// Writes a complete frame.
    pub async fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        self.stream.write_all(frame).await?;
        self.stream.flush().await
    }

    /// Reads the next complete frame.
    ///
    /// # Errors
    ///
    /// - `UnexpectedEof` if the peer closed the connection
    /// - `InvalidData` if the frame declares a length above
    ///   [`MAX_ENCAPSULATION_LENGTH`]
    /// - any other I/O error from the socket
    pub async fn recv(&mut self) -> io::Result<(EncapsulationHeader, Vec<u8>)> {
        loop {
            if let Some(frame) = self.take_frame()? {
                return Ok(frame);
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by controller",
                ));
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    fn take_frame(&mut self) -> io::Result<Option<(EncapsulationHeader, Vec<u8>)>> {
        if self.buffer.len() < ENCAPSULATION_HEADER_SIZE {
            return Ok(None);
        }
        let header = EncapsulationHeader::from_bytes(&self.buffer)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let length = usize::from(header.length);
        if length > MAX_ENCAPSULATION_LENGTH {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame length {length} exceeds {MAX_ENCAPSULATION_LENGTH}"),
            ));
        }
        let total = ENCAPSULATION_HEADER_SIZE + length;
        if self.buffer.len() < total {
            return Ok(None);
        }
        let data = self.buffer[ENCAPSULATION_HEADER_SIZE..total].to_vec();
        self.buffer.drain(..total);
        Ok(Some((header, data)))
    }

    /// Shuts down the write half. Errors are returned for logging only.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }

    /// Returns the remote controller address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("remote_addr", &self.remote_addr)
            .field("local_addr", &self.stream.local_addr().ok())
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{frame, COMMAND_NOP, COMMAND_SEND_RR_DATA};
    use tokio::net::TcpListener;

    async fn pair() -> (TcpTransport, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpTransport::connect(addr), listener.accept());
        (client.unwrap(), server.unwrap().0)
    }

    #[test]
    fn test_default_constants() {
        assert_eq!(DEFAULT_ENIP_PORT, 44818);
        assert_eq!(DEFAULT_TIMEOUT, Duration::from_secs(5));
        assert_eq!(MAX_ENCAPSULATION_LENGTH + ENCAPSULATION_HEADER_SIZE, 65_535);
    }

    #[tokio::test]
    async fn test_connect_enables_nodelay() {
        let (transport, _server) = pair().await;
        assert!(transport.stream.nodelay().unwrap());
    }

    #[tokio::test]
    async fn test_recv_reassembles_split_frames() {
        let (mut transport, mut server) = pair().await;

        let first = frame(COMMAND_SEND_RR_DATA, 1, 7, &[1, 2, 3, 4, 5]);
        let second = frame(COMMAND_NOP, 1, 8, &[]);
        let mut bytes = first.clone();
        bytes.extend_from_slice(&second);

        server.write_all(&bytes[..10]).await.unwrap();
        server.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        server.write_all(&bytes[10..]).await.unwrap();

        let (header, data) = transport.recv().await.unwrap();
        assert_eq!(header.sender_context, 7);
        assert_eq!(data, [1, 2, 3, 4, 5]);

        let (header, data) = transport.recv().await.unwrap();
        assert_eq!(header.command, COMMAND_NOP);
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn test_recv_eof() {
        let (mut transport, server) = pair().await;
        drop(server);
        let err = transport.recv().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_recv_oversized_frame() {
        let (mut transport, mut server) = pair().await;
        let mut header = EncapsulationHeader::new(COMMAND_SEND_RR_DATA, 1, 0, 1);
        header.length = u16::MAX;
        server.write_all(&header.to_bytes()).await.unwrap();

        let err = transport.recv().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_transport_debug() {
        let (transport, _server) = pair().await;
        let debug_str = format!("{:?}", transport);
        assert!(debug_str.contains("TcpTransport"));
        assert!(debug_str.contains("127.0.0.1"));
    }
}
