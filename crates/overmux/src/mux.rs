//! Multiplexer capability consumed by the transport.
//!
//! The transport never speaks a mux wire protocol itself. It is handed an
//! underlying connection ([`RawConn`]) and a [`Multiplexer`] that turns that
//! connection into a session handle able to open and accept logical streams.

use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};

use overmux_core::NetProtocol;

use crate::error::MuxError;

/// The single raw connection a session is multiplexed over.
pub trait RawConn: Send + 'static {
    fn local_addr(&self) -> io::Result<SocketAddr>;

    fn peer_addr(&self) -> io::Result<SocketAddr>;

    /// Network protocol used when translating the socket addresses into
    /// overlay form.
    fn net_protocol(&self) -> NetProtocol {
        NetProtocol::Tcp
    }
}

impl RawConn for tokio::net::TcpStream {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Self::local_addr(self)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Self::peer_addr(self)
    }
}

/// One bidirectional logical stream carried by a session.
pub trait LogicalStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> LogicalStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxStream = Box<dyn LogicalStream>;

/// Which side of the underlying connection a session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Server => "server",
        }
    }
}

/// A live multiplexer session. Owns the underlying connection once built.
#[async_trait::async_trait]
pub trait MuxHandle: Send + Sync + 'static {
    async fn open(&self) -> Result<BoxStream, MuxError>;

    async fn accept(&self) -> Result<BoxStream, MuxError>;

    /// Release the session. Blocked `accept` calls must return
    /// [`MuxError::SessionClosed`].
    async fn close(&self) -> Result<(), MuxError>;
}

/// Builds client or server sessions over an underlying connection.
pub trait Multiplexer: Send + Sync + 'static {
    type Conn: RawConn;

    fn client(&self, conn: Self::Conn) -> Box<dyn MuxHandle>;

    fn server(&self, conn: Self::Conn) -> Box<dyn MuxHandle>;

    fn session(&self, role: Role, conn: Self::Conn) -> Box<dyn MuxHandle> {
        match role {
            Role::Client => self.client(conn),
            Role::Server => self.server(conn),
        }
    }
}
