//! In-process multiplexer over a linked pair of memory connections.
//!
//! Each logical stream is a [`tokio::io::duplex`] pipe; opening a stream on
//! one end hands the far half to the other end's accept queue. Useful for
//! loopback transports and for exercising the registry without sockets.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::io::DuplexStream;
use tokio::sync::{Mutex, mpsc, watch};

use overmux_core::NetProtocol;

use crate::error::MuxError;
use crate::mux::{BoxStream, Multiplexer, MuxHandle, RawConn};

const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

/// Counters shared by both ends of a memory link.
#[derive(Debug, Clone, Default)]
pub struct LinkStats {
    opened: Arc<AtomicUsize>,
}

impl LinkStats {
    /// Logical streams opened across the link, from either end.
    pub fn streams_opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

/// One end of an in-memory underlying connection.
pub struct MemoryConn {
    local: SocketAddr,
    peer: SocketAddr,
    protocol: NetProtocol,
    outbound: mpsc::UnboundedSender<DuplexStream>,
    inbound: mpsc::UnboundedReceiver<DuplexStream>,
    stats: LinkStats,
}

impl MemoryConn {
    pub fn stats(&self) -> LinkStats {
        self.stats.clone()
    }
}

impl RawConn for MemoryConn {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.peer)
    }

    fn net_protocol(&self) -> NetProtocol {
        self.protocol
    }
}

/// Create a connected pair: the first end is bound at `a` and talks to `b`.
pub fn link(a: SocketAddr, b: SocketAddr, protocol: NetProtocol) -> (MemoryConn, MemoryConn) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    let stats = LinkStats::default();

    let a_end = MemoryConn {
        local: a,
        peer: b,
        protocol,
        outbound: a_tx,
        inbound: a_rx,
        stats: stats.clone(),
    };
    let b_end = MemoryConn {
        local: b,
        peer: a,
        protocol,
        outbound: b_tx,
        inbound: b_rx,
        stats,
    };
    (a_end, b_end)
}

/// Multiplexer for [`MemoryConn`]. Client and server sessions behave the same.
#[derive(Debug, Clone)]
pub struct MemoryMultiplexer {
    pipe_capacity: usize,
}

impl MemoryMultiplexer {
    pub const fn new(pipe_capacity: usize) -> Self {
        Self { pipe_capacity }
    }

    fn handle(&self, conn: MemoryConn) -> Box<dyn MuxHandle> {
        let (closed, _) = watch::channel(false);
        Box::new(MemoryHandle {
            outbound: StdMutex::new(Some(conn.outbound)),
            inbound: Mutex::new(conn.inbound),
            closed,
            pipe_capacity: self.pipe_capacity,
            stats: conn.stats,
        })
    }
}

impl Default for MemoryMultiplexer {
    fn default() -> Self {
        Self::new(DEFAULT_PIPE_CAPACITY)
    }
}

impl Multiplexer for MemoryMultiplexer {
    type Conn = MemoryConn;

    fn client(&self, conn: MemoryConn) -> Box<dyn MuxHandle> {
        self.handle(conn)
    }

    fn server(&self, conn: MemoryConn) -> Box<dyn MuxHandle> {
        self.handle(conn)
    }
}

struct MemoryHandle {
    outbound: StdMutex<Option<mpsc::UnboundedSender<DuplexStream>>>,
    inbound: Mutex<mpsc::UnboundedReceiver<DuplexStream>>,
    closed: watch::Sender<bool>,
    pipe_capacity: usize,
    stats: LinkStats,
}

#[async_trait::async_trait]
impl MuxHandle for MemoryHandle {
    async fn open(&self) -> Result<BoxStream, MuxError> {
        if *self.closed.borrow() {
            return Err(MuxError::SessionClosed);
        }
        let outbound = self
            .outbound
            .lock()
            .map_err(|_| MuxError::SessionClosed)?
            .clone()
            .ok_or(MuxError::SessionClosed)?;

        let (local, remote) = tokio::io::duplex(self.pipe_capacity);
        outbound.send(remote).map_err(|_| MuxError::PeerEnded)?;
        self.stats.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(local))
    }

    async fn accept(&self) -> Result<BoxStream, MuxError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(MuxError::SessionClosed);
        }
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            stream = inbound.recv() => match stream {
                Some(stream) => Ok(Box::new(stream) as BoxStream),
                None => Err(MuxError::PeerEnded),
            },
            _ = closed.wait_for(|closed| *closed) => Err(MuxError::SessionClosed),
        }
    }

    async fn close(&self) -> Result<(), MuxError> {
        self.closed.send_replace(true);
        let sender = self
            .outbound
            .lock()
            .map_err(|_| MuxError::SessionClosed)?
            .take();
        drop(sender);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn pair() -> (MemoryConn, MemoryConn) {
        link(
            "127.0.0.1:5000".parse().unwrap(),
            "127.0.0.1:6000".parse().unwrap(),
            NetProtocol::Tcp,
        )
    }

    #[tokio::test]
    async fn opened_stream_reaches_peer_accept() {
        let (a, b) = pair();
        let stats = a.stats();
        let mux = MemoryMultiplexer::default();
        let client = mux.client(a);
        let server = mux.server(b);

        let mut out = client.open().await.unwrap();
        out.write_all(b"ping").await.unwrap();

        let mut inbound = server.accept().await.unwrap();
        let mut buf = [0u8; 4];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(stats.streams_opened(), 1);
    }

    #[tokio::test]
    async fn close_wakes_blocked_accept() {
        let (a, _b) = pair();
        let handle: Arc<dyn MuxHandle> = Arc::from(MemoryMultiplexer::default().server(a));

        let waiter = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move { handle.accept().await })
        };
        tokio::task::yield_now().await;
        handle.close().await.unwrap();

        let err = waiter.await.unwrap().err().unwrap();
        assert!(matches!(err, MuxError::SessionClosed));
        assert!(matches!(
            handle.open().await.err().unwrap(),
            MuxError::SessionClosed
        ));
    }

    #[tokio::test]
    async fn peer_close_ends_accept_cleanly() {
        let (a, b) = pair();
        let mux = MemoryMultiplexer::default();
        let client = mux.client(a);
        let server = mux.server(b);

        client.close().await.unwrap();
        let err = server.accept().await.err().unwrap();
        assert!(err.is_session_end());
    }
}
