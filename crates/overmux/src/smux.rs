//! [`Multiplexer`] backed by `async_smux`.
//!
//! Every session spawns the smux worker on the current tokio runtime. The
//! worker is aborted when the session closes or its handle is dropped, which
//! releases the underlying connection once the last stream is gone.

use std::marker::PhantomData;
use std::num::NonZeroUsize;

use async_smux::{MuxAcceptor, MuxBuilder, MuxConnector};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use overmux_core::config::SmuxConfig;

use crate::error::MuxError;
use crate::mux::{BoxStream, Multiplexer, MuxHandle, RawConn, Role};

/// Smux sessions over any stream-shaped underlying connection `C`.
pub struct SmuxMultiplexer<C> {
    max_tx_queue: NonZeroUsize,
    max_rx_queue: NonZeroUsize,
    _conn: PhantomData<fn(C)>,
}

impl<C> SmuxMultiplexer<C> {
    pub fn new(config: &SmuxConfig) -> Self {
        Self {
            max_tx_queue: NonZeroUsize::new(config.max_tx_queue).unwrap_or(NonZeroUsize::MIN),
            max_rx_queue: NonZeroUsize::new(config.max_rx_queue).unwrap_or(NonZeroUsize::MIN),
            _conn: PhantomData,
        }
    }
}

impl<C> Default for SmuxMultiplexer<C> {
    fn default() -> Self {
        Self::new(&SmuxConfig::default())
    }
}

impl<C> SmuxMultiplexer<C>
where
    C: RawConn + AsyncRead + AsyncWrite + Unpin,
{
    fn build(&self, role: Role, conn: C) -> Box<dyn MuxHandle> {
        let (connector, acceptor, worker) = match role {
            Role::Client => {
                let mut builder = MuxBuilder::client();
                builder.with_max_tx_queue(self.max_tx_queue);
                builder.with_max_rx_queue(self.max_rx_queue);
                builder.with_connection(conn).build()
            }
            Role::Server => {
                let mut builder = MuxBuilder::server();
                builder.with_max_tx_queue(self.max_tx_queue);
                builder.with_max_rx_queue(self.max_rx_queue);
                builder.with_connection(conn).build()
            }
        };

        let worker = tokio::spawn(async move {
            match worker.await {
                Ok(()) => debug!(role = role.as_str(), "Smux worker finished"),
                Err(e) => warn!(role = role.as_str(), error = ?e, "Smux worker error"),
            }
        });

        let (closed, _) = watch::channel(false);
        Box::new(SmuxHandle {
            connector,
            acceptor: Mutex::new(acceptor),
            worker,
            closed,
        })
    }
}

impl<C> Multiplexer for SmuxMultiplexer<C>
where
    C: RawConn + AsyncRead + AsyncWrite + Unpin,
{
    type Conn = C;

    fn client(&self, conn: C) -> Box<dyn MuxHandle> {
        self.build(Role::Client, conn)
    }

    fn server(&self, conn: C) -> Box<dyn MuxHandle> {
        self.build(Role::Server, conn)
    }
}

struct SmuxHandle<C>
where
    C: RawConn + AsyncRead + AsyncWrite + Unpin,
{
    connector: MuxConnector<C>,
    acceptor: Mutex<MuxAcceptor<C>>,
    worker: JoinHandle<()>,
    closed: watch::Sender<bool>,
}

impl<C> SmuxHandle<C>
where
    C: RawConn + AsyncRead + AsyncWrite + Unpin,
{
    fn is_closed(&self) -> bool {
        *self.closed.borrow() || self.worker.is_finished()
    }
}

impl<C> Drop for SmuxHandle<C>
where
    C: RawConn + AsyncRead + AsyncWrite + Unpin,
{
    fn drop(&mut self) {
        self.worker.abort();
    }
}

/// Closed mux state is a session end; anything else is a protocol fault.
fn classify(err: async_smux::error::MuxError) -> MuxError {
    match err {
        async_smux::error::MuxError::ConnectionClosed => MuxError::SessionClosed,
        other => MuxError::Protocol(other.to_string()),
    }
}

#[async_trait::async_trait]
impl<C> MuxHandle for SmuxHandle<C>
where
    C: RawConn + AsyncRead + AsyncWrite + Unpin,
{
    async fn open(&self) -> Result<BoxStream, MuxError> {
        if self.is_closed() {
            return Err(MuxError::SessionClosed);
        }
        let stream = self.connector.connect().map_err(classify)?;
        Ok(Box::new(stream))
    }

    async fn accept(&self) -> Result<BoxStream, MuxError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(MuxError::SessionClosed);
        }
        let mut acceptor = self.acceptor.lock().await;
        tokio::select! {
            stream = acceptor.accept() => match stream {
                Some(stream) => Ok(Box::new(stream) as BoxStream),
                None => Err(MuxError::PeerEnded),
            },
            _ = closed.wait_for(|closed| *closed) => Err(MuxError::SessionClosed),
        }
    }

    async fn close(&self) -> Result<(), MuxError> {
        if self.closed.send_replace(true) {
            return Ok(());
        }
        // Marks the mux closed and shuts down the connection's write half.
        let result = self.connector.clone().close().await;
        self.worker.abort();
        match result {
            Ok(()) | Err(async_smux::error::MuxError::ConnectionClosed) => Ok(()),
            Err(e) => Err(classify(e)),
        }
    }
}
