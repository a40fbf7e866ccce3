//! The transport capability consumed by the protocol core.
//!
//! Sessions only require a bidirectional byte stream. TCP, KCP and
//! WebSocket byte channels all provide one; the core stays agnostic to the
//! carrier and to its framing.

use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpStream;

/// A bidirectional byte stream a session can run over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {
    /// The remote address, when the carrier has one.
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// A boxed transport, as held by a session.
pub type BoxTransport = Box<dyn Transport>;

impl Transport for TcpStream {
    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }
}

/// In-memory pipe halves work as transports, which keeps tests and
/// in-process backends free of real sockets.
impl Transport for DuplexStream {}
