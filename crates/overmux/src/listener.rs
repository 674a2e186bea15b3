//! Listeners, their accept queues, and the per-session forwarding loop.

use std::sync::Arc;

use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tracing::{debug, info, warn};

use overmux_core::Addr;

use crate::conn::MuxConn;
use crate::error::{Result, TransportError};
use crate::session::MuxSession;
use crate::transport::Registry;

pub(crate) type AcceptEntry = Result<MuxConn>;

/// FIFO of inbound connections (or forwarding errors) for one local address.
pub(crate) struct AcceptQueue {
    addr: Addr,
    tx: mpsc::UnboundedSender<AcceptEntry>,
    closed: watch::Sender<bool>,
}

impl AcceptQueue {
    pub(crate) fn new(addr: Addr) -> (Arc<Self>, mpsc::UnboundedReceiver<AcceptEntry>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        (Arc::new(Self { addr, tx, closed }), rx)
    }

    pub(crate) const fn addr(&self) -> &Addr {
        &self.addr
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub(crate) fn close(&self) {
        self.closed.send_replace(true);
    }

    /// Resolves once the queue has been closed.
    pub(crate) async fn closed(&self) {
        let mut closed = self.closed.subscribe();
        // The sender lives in `self`, so this only returns once closed.
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Enqueue an entry, handing it back if the queue is closed.
    pub(crate) fn push(&self, entry: AcceptEntry) -> std::result::Result<(), AcceptEntry> {
        if self.is_closed() {
            return Err(entry);
        }
        self.tx.send(entry).map_err(|e| e.0)
    }
}

/// Accepts logical streams forwarded from inbound sessions on one address.
pub struct MuxListener {
    addr: Addr,
    queue: Arc<AcceptQueue>,
    entries: Mutex<mpsc::UnboundedReceiver<AcceptEntry>>,
    registry: Arc<RwLock<Registry>>,
}

impl MuxListener {
    pub(crate) fn new(
        queue: Arc<AcceptQueue>,
        entries: mpsc::UnboundedReceiver<AcceptEntry>,
        registry: Arc<RwLock<Registry>>,
    ) -> Self {
        Self {
            addr: queue.addr().clone(),
            queue,
            entries: Mutex::new(entries),
            registry,
        }
    }

    pub const fn addr(&self) -> &Addr {
        &self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    /// Wait for the next forwarded connection.
    ///
    /// Returns a queued forwarding error once per failed session, and
    /// [`TransportError::ListenerClosed`] after [`close`](Self::close).
    pub async fn accept(&self) -> Result<MuxConn> {
        let mut closed = self.queue.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(self.closed_error());
        }
        let mut entries = self.entries.lock().await;
        tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => Err(self.closed_error()),
            entry = entries.recv() => entry.unwrap_or_else(|| Err(self.closed_error())),
        }
    }

    /// Unregister from the transport, fail pending and future accepts, and
    /// drop entries that were never accepted.
    pub async fn close(&self) {
        let key = self.addr.to_string();
        {
            let mut registry = self.registry.write().await;
            let is_current = registry
                .queues
                .get(&key)
                .is_some_and(|current| Arc::ptr_eq(current, &self.queue));
            if is_current {
                registry.queues.remove(&key);
            }
        }
        if !self.queue.is_closed() {
            self.queue.close();
            info!(addr = %self.addr, "Listener closed");
        }

        // Queued connections would otherwise pin their sessions until drop.
        let mut entries = self.entries.lock().await;
        entries.close();
        let mut dropped = 0usize;
        while entries.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(addr = %self.addr, dropped, "Dropped queued entries on close");
        }
    }

    fn closed_error(&self) -> TransportError {
        TransportError::ListenerClosed {
            addr: self.addr.to_string(),
        }
    }
}

impl Drop for MuxListener {
    fn drop(&mut self) {
        // The registry entry is replaced by the next listen() on this address.
        self.queue.close();
    }
}

impl std::fmt::Debug for MuxListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxListener")
            .field("addr", &self.addr.to_string())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Drain further logical streams of an inbound session into `queue`.
///
/// Ends when the listener closes, when the session ends cleanly, or after
/// delivering a single accept error.
pub(crate) async fn forward_streams(session: Arc<MuxSession>, queue: Arc<AcceptQueue>) {
    debug!(session = session.id(), addr = %queue.addr(), "Forwarding loop started");

    loop {
        let accepted = tokio::select! {
            biased;
            () = queue.closed() => {
                debug!(session = session.id(), "Listener closed, forwarding loop exits");
                return;
            }
            accepted = session.accept_stream() => accepted,
        };

        match accepted {
            Ok(conn) => {
                if queue.push(Ok(conn)).is_err() {
                    debug!(session = session.id(), "Listener closed, dropping accepted stream");
                    return;
                }
            }
            Err(e) if e.is_session_end() => {
                debug!(session = session.id(), reason = %e, "Session ended, forwarding loop exits");
                session.close_logged().await;
                return;
            }
            Err(e) => {
                warn!(session = session.id(), addr = %session.addr(), error = %e, "Accept failed, forwarding loop exits");
                let failure = TransportError::StreamAcceptFailed {
                    addr: session.addr().to_string(),
                    source: e,
                };
                if queue.push(Err(failure)).is_err() {
                    debug!(session = session.id(), "Listener closed before accept error delivery");
                }
                session.close_logged().await;
                return;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn addr() -> Addr {
        "/ip/127.0.0.1/tcp/7000/mux".parse().unwrap()
    }

    #[tokio::test]
    async fn push_after_close_hands_entry_back() {
        let (queue, _rx) = AcceptQueue::new(addr());
        assert!(
            queue
                .push(Err(TransportError::SessionNotFound { addr: "x".into() }))
                .is_ok()
        );

        queue.close();
        let rejected = queue.push(Err(TransportError::SessionNotFound { addr: "y".into() }));
        assert!(rejected.is_err());
    }

    #[tokio::test]
    async fn close_wakes_blocked_accept() {
        let (queue, rx) = AcceptQueue::new(addr());
        let registry = Arc::new(RwLock::new(Registry::default()));
        let listener = Arc::new(MuxListener::new(queue, rx, registry));

        let waiter = {
            let listener = Arc::clone(&listener);
            tokio::spawn(async move { listener.accept().await })
        };
        tokio::task::yield_now().await;
        listener.close().await;

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, TransportError::ListenerClosed { .. }));
        assert!(matches!(
            listener.accept().await.unwrap_err(),
            TransportError::ListenerClosed { .. }
        ));
    }

    #[tokio::test]
    async fn close_releases_unaccepted_connections() {
        use overmux_core::NetProtocol;

        use crate::memory::{MemoryMultiplexer, link};
        use crate::mux::Role;

        let (a, b) = link(
            "127.0.0.1:40000".parse().unwrap(),
            "127.0.0.1:7000".parse().unwrap(),
            NetProtocol::Tcp,
        );
        let mux = MemoryMultiplexer::default();
        let client = Arc::new(MuxSession::new(&mux, Role::Client, addr(), a).unwrap());
        let server = Arc::new(MuxSession::new(&mux, Role::Server, addr(), b).unwrap());

        let (queue, rx) = AcceptQueue::new(addr());
        let registry = Arc::new(RwLock::new(Registry::default()));
        let listener = MuxListener::new(Arc::clone(&queue), rx, registry);

        let _out = client.open_stream().await.unwrap();
        assert!(queue.push(Ok(server.accept_stream().await.unwrap())).is_ok());
        assert_eq!(server.open_streams(), 1);

        listener.close().await;
        assert_eq!(server.open_streams(), 0);
        assert_eq!(Arc::strong_count(&server), 1);
    }

    #[tokio::test]
    async fn queued_entries_arrive_in_order() {
        let (queue, rx) = AcceptQueue::new(addr());
        let registry = Arc::new(RwLock::new(Registry::default()));
        let listener = MuxListener::new(Arc::clone(&queue), rx, registry);

        for n in 0..3 {
            assert!(
                queue
                    .push(Err(TransportError::SessionNotFound {
                        addr: n.to_string()
                    }))
                    .is_ok()
            );
        }
        for n in 0..3 {
            match listener.accept().await.unwrap_err() {
                TransportError::SessionNotFound { addr } => assert_eq!(addr, n.to_string()),
                other => panic!("unexpected entry: {other}"),
            }
        }
    }
}
