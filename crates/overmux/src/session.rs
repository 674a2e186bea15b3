//! Multiplexer sessions.
//!
//! A session binds one underlying connection to one multiplexer handle and
//! hands out [`MuxConn`]s for the logical streams opened or accepted on it.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};

use tracing::{debug, info, warn};

use overmux_core::Addr;

use crate::conn::MuxConn;
use crate::error::{MuxError, Result, TransportError};
use crate::mux::{Multiplexer, MuxHandle, RawConn, Role};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a [`MuxSession`]. Construction leaves it `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Closing,
    Closed,
}

impl SessionState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Active,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// One multiplexed underlying connection.
pub struct MuxSession {
    id: u64,
    role: Role,
    addr: Addr,
    local_addr: Addr,
    remote_addr: Addr,
    handle: Box<dyn MuxHandle>,
    open_streams: AtomicUsize,
    state: AtomicU8,
}

impl MuxSession {
    /// Build a session serving `addr` over `conn`.
    ///
    /// Stream addresses are composed up front so that a connection whose
    /// addresses cannot be translated is rejected before any stream exists.
    pub(crate) fn new<M: Multiplexer>(
        mux: &M,
        role: Role,
        addr: Addr,
        conn: M::Conn,
    ) -> Result<Self> {
        let (local_addr, remote_addr) = compose_addrs(&addr, &conn)?;
        let handle = mux.session(role, conn);
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);

        debug!(
            session = id,
            role = role.as_str(),
            addr = %addr,
            local = %local_addr,
            remote = %remote_addr,
            "Mux session created"
        );

        Ok(Self {
            id,
            role,
            addr,
            local_addr,
            remote_addr,
            handle,
            open_streams: AtomicUsize::new(0),
            state: AtomicU8::new(SessionState::Active as u8),
        })
    }

    pub const fn id(&self) -> u64 {
        self.id
    }

    pub const fn role(&self) -> Role {
        self.role
    }

    /// The overlay address this session serves.
    pub const fn addr(&self) -> &Addr {
        &self.addr
    }

    pub const fn local_addr(&self) -> &Addr {
        &self.local_addr
    }

    pub const fn remote_addr(&self) -> &Addr {
        &self.remote_addr
    }

    /// Live [`MuxConn`]s derived from this session.
    pub fn open_streams(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Open a logical stream (client role).
    pub async fn open_stream(self: &Arc<Self>) -> std::result::Result<MuxConn, MuxError> {
        if !self.is_active() {
            return Err(MuxError::SessionClosed);
        }
        let stream = self.handle.open().await?;
        self.open_streams.fetch_add(1, Ordering::SeqCst);
        Ok(MuxConn::new(stream, Arc::clone(self)))
    }

    /// Accept the next logical stream opened by the peer (server role).
    pub async fn accept_stream(self: &Arc<Self>) -> std::result::Result<MuxConn, MuxError> {
        if !self.is_active() {
            return Err(MuxError::SessionClosed);
        }
        let stream = self.handle.accept().await?;
        self.open_streams.fetch_add(1, Ordering::SeqCst);
        Ok(MuxConn::new(stream, Arc::clone(self)))
    }

    /// Close the multiplexer handle. Only the first call does anything.
    pub async fn close(&self) -> std::result::Result<(), MuxError> {
        if self
            .state
            .compare_exchange(
                SessionState::Active as u8,
                SessionState::Closing as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Ok(());
        }
        let result = self.handle.close().await;
        self.state
            .store(SessionState::Closed as u8, Ordering::SeqCst);
        info!(
            session = self.id,
            role = self.role.as_str(),
            addr = %self.addr,
            open_streams = self.open_streams(),
            "Mux session closed"
        );
        result
    }

    /// [`close`](Self::close), logging instead of returning the error.
    pub(crate) async fn close_logged(&self) {
        if let Err(e) = self.close().await {
            warn!(session = self.id, addr = %self.addr, error = %e, "Close session error");
        }
    }

    pub(crate) fn release_stream(&self) {
        self.open_streams.fetch_sub(1, Ordering::SeqCst);
    }
}

impl fmt::Debug for MuxSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxSession")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("addr", &self.addr.to_string())
            .field("state", &self.state())
            .field("open_streams", &self.open_streams())
            .finish_non_exhaustive()
    }
}

/// Local and remote stream addresses for a session over `conn`.
///
/// Both are the connection's socket address in overlay form followed by
/// the residual suffix of `target`, so they differ only in the prefix.
pub(crate) fn compose_addrs<C: RawConn>(target: &Addr, conn: &C) -> Result<(Addr, Addr)> {
    let (_, _, residual) = target
        .resolve_net_addr()
        .map_err(|e| TransportError::resolution(target, e))?;
    let local = conn
        .local_addr()
        .map_err(|e| TransportError::resolution(target, format!("local address: {e}")))?;
    let remote = conn
        .peer_addr()
        .map_err(|e| TransportError::resolution(target, format!("remote address: {e}")))?;
    let protocol = conn.net_protocol();

    Ok((
        Addr::from_socket_addr(local, protocol).join(&residual),
        Addr::from_socket_addr(remote, protocol).join(&residual),
    ))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io;
    use std::net::SocketAddr;

    use overmux_core::NetProtocol;

    use super::*;
    use crate::memory::{MemoryMultiplexer, link};

    struct Unbound;

    impl RawConn for Unbound {
        fn local_addr(&self) -> io::Result<SocketAddr> {
            Err(io::ErrorKind::NotConnected.into())
        }

        fn peer_addr(&self) -> io::Result<SocketAddr> {
            Ok("10.0.0.9:9".parse().unwrap())
        }
    }

    fn target() -> Addr {
        "/ip/127.0.0.1/udp/1812/kcp/mux".parse().unwrap()
    }

    #[test]
    fn composed_addrs_share_residual_suffix() {
        let (conn, _peer) = link(
            "127.0.0.1:40000".parse().unwrap(),
            "127.0.0.1:1812".parse().unwrap(),
            NetProtocol::Udp,
        );

        let (local, remote) = compose_addrs(&target(), &conn).unwrap();
        assert_eq!(local.to_string(), "/ip/127.0.0.1/udp/40000/kcp/mux");
        assert_eq!(remote.to_string(), "/ip/127.0.0.1/udp/1812/kcp/mux");

        let (_, _, local_suffix) = local.resolve_net_addr().unwrap();
        let (_, _, remote_suffix) = remote.resolve_net_addr().unwrap();
        assert_eq!(local_suffix, remote_suffix);
    }

    #[test]
    fn composition_fails_as_a_whole() {
        let err = compose_addrs(&target(), &Unbound).unwrap_err();
        assert!(matches!(err, TransportError::AddressResolutionFailed { .. }));

        let unresolvable: Addr = "/kcp/mux".parse().unwrap();
        let (conn, _peer) = link(
            "127.0.0.1:1".parse().unwrap(),
            "127.0.0.1:2".parse().unwrap(),
            NetProtocol::Tcp,
        );
        let err = compose_addrs(&unresolvable, &conn).unwrap_err();
        assert!(matches!(err, TransportError::AddressResolutionFailed { .. }));
    }

    #[tokio::test]
    async fn counter_tracks_live_streams_and_close_is_idempotent() {
        let (a, b) = link(
            "127.0.0.1:40000".parse().unwrap(),
            "127.0.0.1:1812".parse().unwrap(),
            NetProtocol::Udp,
        );
        let mux = MemoryMultiplexer::default();
        let client = Arc::new(MuxSession::new(&mux, Role::Client, target(), a).unwrap());
        let server = Arc::new(MuxSession::new(&mux, Role::Server, target(), b).unwrap());

        let mut first = client.open_stream().await.unwrap();
        let second = client.open_stream().await.unwrap();
        let accepted = server.accept_stream().await.unwrap();
        assert_eq!(client.open_streams(), 2);
        assert_eq!(server.open_streams(), 1);

        first.close().await.unwrap();
        first.close().await.unwrap();
        assert_eq!(client.open_streams(), 1);

        drop(second);
        drop(accepted);
        assert_eq!(client.open_streams(), 0);
        assert_eq!(server.open_streams(), 0);
        assert!(client.is_active());

        client.close().await.unwrap();
        client.close().await.unwrap();
        assert_eq!(client.state(), SessionState::Closed);
        assert!(matches!(
            client.open_stream().await.err().unwrap(),
            MuxError::SessionClosed
        ));
    }
}
