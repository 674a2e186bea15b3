//! The mux transport: registry of client sessions and listener queues.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use overmux_core::Addr;
use overmux_core::config::TransportConfig;

use crate::conn::MuxConn;
use crate::error::{MuxError, Result, TransportError};
use crate::listener::{AcceptQueue, MuxListener, forward_streams};
use crate::mux::{Multiplexer, Role};
use crate::session::MuxSession;

/// Protocol name the transport registers under.
pub const PROTOCOL: &str = "mux";

/// Shared maps, guarded together by one reader-writer lock.
#[derive(Default)]
pub(crate) struct Registry {
    /// Outbound address -> client session.
    pub(crate) sessions: HashMap<String, Arc<MuxSession>>,
    /// Local address -> listener queue.
    pub(crate) queues: HashMap<String, Arc<AcceptQueue>>,
}

/// Snapshot of registry occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Registered client sessions.
    pub sessions: usize,
    /// Registered listener queues.
    pub queues: usize,
    /// Live streams across registered client sessions.
    pub open_streams: usize,
}

/// Multiplexes many logical streams over single underlying connections.
///
/// Cloning is cheap; clones share the same registry.
pub struct MuxTransport<M: Multiplexer> {
    mux: Arc<M>,
    config: TransportConfig,
    registry: Arc<RwLock<Registry>>,
}

impl<M: Multiplexer> Clone for MuxTransport<M> {
    fn clone(&self) -> Self {
        Self {
            mux: Arc::clone(&self.mux),
            config: self.config.clone(),
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<M: Multiplexer> MuxTransport<M> {
    pub fn new(mux: M, config: TransportConfig) -> Self {
        Self {
            mux: Arc::new(mux),
            config,
            registry: Arc::new(RwLock::new(Registry::default())),
        }
    }

    pub fn with_defaults(mux: M) -> Self {
        Self::new(mux, TransportConfig::default())
    }

    pub const fn protocol(&self) -> &'static str {
        PROTOCOL
    }

    pub const fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Register an accept queue for `addr`.
    pub async fn listen(&self, addr: &Addr) -> Result<MuxListener> {
        let key = addr.to_string();
        let (queue, entries) = AcceptQueue::new(addr.clone());

        {
            let mut registry = self.registry.write().await;
            if let Some(existing) = registry.queues.get(&key)
                && !existing.is_closed()
            {
                return Err(TransportError::AddressInUse { addr: key });
            }
            registry.queues.insert(key, Arc::clone(&queue));
        }

        info!(addr = %addr, "Listener registered");
        Ok(MuxListener::new(queue, entries, Arc::clone(&self.registry)))
    }

    /// Open another stream on the client session bootstrapped for `addr`.
    ///
    /// Never dials the lower transport: without a prior
    /// [`client_connect`](Self::client_connect) this fails with
    /// [`TransportError::SessionNotFound`].
    pub async fn dial(&self, addr: &Addr) -> Result<MuxConn> {
        let key = addr.to_string();
        let session = self
            .registry
            .read()
            .await
            .sessions
            .get(&key)
            .cloned()
            .ok_or_else(|| TransportError::SessionNotFound { addr: key.clone() })?;

        match self.open_with_deadline(&session).await {
            Ok(conn) => {
                debug!(addr = %addr, session = session.id(), "Stream opened");
                Ok(conn)
            }
            Err(e) => {
                warn!(addr = %addr, session = session.id(), error = %e, "Open stream failed");
                if e.is_session_end() {
                    self.evict_session(&key, &session).await;
                }
                Err(TransportError::StreamOpenFailed {
                    addr: key,
                    source: e,
                })
            }
        }
    }

    /// Bootstrap (or replace) the client session for `addr` over `conn`
    /// and open its first stream.
    ///
    /// A failed first open is reported, but the new session stays
    /// registered for later [`dial`](Self::dial) calls.
    pub async fn client_connect(&self, addr: &Addr, conn: M::Conn) -> Result<MuxConn> {
        let key = addr.to_string();
        let session = Arc::new(MuxSession::new(
            self.mux.as_ref(),
            Role::Client,
            addr.clone(),
            conn,
        )?);

        let previous = self
            .registry
            .write()
            .await
            .sessions
            .insert(key.clone(), Arc::clone(&session));
        if let Some(previous) = previous {
            info!(
                addr = %addr,
                previous = previous.id(),
                session = session.id(),
                "Superseding client session"
            );
            previous.close_logged().await;
        }

        info!(
            addr = %addr,
            session = session.id(),
            local = %session.local_addr(),
            remote = %session.remote_addr(),
            "Client session established"
        );

        self.open_with_deadline(&session).await.map_err(|e| {
            warn!(addr = %addr, session = session.id(), error = %e, "First stream open failed");
            TransportError::StreamOpenFailed {
                addr: key,
                source: e,
            }
        })
    }

    /// Serve an inbound underlying connection: accept its first stream and,
    /// when a listener is registered for `addr`, forward the rest to it.
    pub async fn server_accept(&self, addr: &Addr, conn: M::Conn) -> Result<MuxConn> {
        let key = addr.to_string();
        let session = Arc::new(MuxSession::new(
            self.mux.as_ref(),
            Role::Server,
            addr.clone(),
            conn,
        )?);

        let accepted = match self.config.accept_timeout() {
            Some(limit) => timeout(limit, session.accept_stream())
                .await
                .unwrap_or_else(|_| Err(MuxError::TimedOut)),
            None => session.accept_stream().await,
        };
        let first = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                warn!(addr = %addr, session = session.id(), error = %e, "First stream accept failed");
                session.close_logged().await;
                return Err(TransportError::StreamAcceptFailed {
                    addr: key,
                    source: e,
                });
            }
        };

        let queue = self.registry.read().await.queues.get(&key).cloned();
        match queue {
            Some(queue) if !queue.is_closed() => {
                tokio::spawn(forward_streams(Arc::clone(&session), queue));
            }
            _ => debug!(addr = %addr, session = session.id(), "No listener, serving first stream only"),
        }

        Ok(first)
    }

    /// Remove and close the listener queue for `addr`, then run the lower
    /// layer's close regardless.
    pub async fn close<F>(&self, addr: &Addr, next: F) -> Result<()>
    where
        F: Future<Output = io::Result<()>>,
    {
        let key = addr.to_string();
        let removed = self.registry.write().await.queues.remove(&key);
        if let Some(queue) = removed {
            queue.close();
            info!(addr = %addr, "Listener queue closed");
        }

        next.await
            .map_err(|source| TransportError::LowerClose { addr: key, source })
    }

    /// Close every client session and listener queue.
    pub async fn shutdown(&self) {
        let (sessions, queues) = {
            let mut registry = self.registry.write().await;
            (
                registry.sessions.drain().map(|(_, s)| s).collect::<Vec<_>>(),
                registry.queues.drain().map(|(_, q)| q).collect::<Vec<_>>(),
            )
        };

        info!(
            sessions = sessions.len(),
            queues = queues.len(),
            "Shutting down mux transport"
        );
        for queue in queues {
            queue.close();
        }
        for session in sessions {
            session.close_logged().await;
        }
    }

    pub async fn stats(&self) -> TransportStats {
        let registry = self.registry.read().await;
        TransportStats {
            sessions: registry.sessions.len(),
            queues: registry.queues.len(),
            open_streams: registry.sessions.values().map(|s| s.open_streams()).sum(),
        }
    }

    /// Client session registered for `addr`, if any.
    pub async fn session(&self, addr: &Addr) -> Option<Arc<MuxSession>> {
        self.registry
            .read()
            .await
            .sessions
            .get(&addr.to_string())
            .cloned()
    }

    async fn open_with_deadline(
        &self,
        session: &Arc<MuxSession>,
    ) -> std::result::Result<MuxConn, MuxError> {
        timeout(self.config.open_timeout(), session.open_stream())
            .await
            .unwrap_or_else(|_| Err(MuxError::TimedOut))
    }

    /// Drop a dead client session, unless it was already superseded.
    async fn evict_session(&self, key: &str, session: &Arc<MuxSession>) {
        let evicted = {
            let mut registry = self.registry.write().await;
            let is_current = registry
                .sessions
                .get(key)
                .is_some_and(|current| Arc::ptr_eq(current, session));
            if is_current {
                registry.sessions.remove(key)
            } else {
                None
            }
        };
        if let Some(session) = evicted {
            info!(addr = %key, session = session.id(), "Evicting closed client session");
            session.close_logged().await;
        }
    }
}

impl<M: Multiplexer> fmt::Display for MuxTransport<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(PROTOCOL)
    }
}
