//! Addressed connections: one logical stream plus its overlay addresses.

use std::fmt;
use std::io::{self, IoSlice};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use overmux_core::Addr;

use crate::mux::BoxStream;
use crate::session::MuxSession;

/// A logical stream handed out by [`MuxTransport`](crate::MuxTransport).
///
/// Closing (or dropping) the connection releases its slot in the parent
/// session's open-stream counter exactly once.
pub struct MuxConn {
    stream: BoxStream,
    session: Arc<MuxSession>,
    local_addr: Addr,
    remote_addr: Addr,
    released: bool,
}

impl MuxConn {
    pub(crate) fn new(stream: BoxStream, session: Arc<MuxSession>) -> Self {
        Self {
            stream,
            local_addr: session.local_addr().clone(),
            remote_addr: session.remote_addr().clone(),
            session,
            released: false,
        }
    }

    pub const fn local_addr(&self) -> &Addr {
        &self.local_addr
    }

    pub const fn remote_addr(&self) -> &Addr {
        &self.remote_addr
    }

    /// Target address of the session this stream belongs to.
    pub fn session_addr(&self) -> &Addr {
        self.session.addr()
    }

    pub fn session_id(&self) -> u64 {
        self.session.id()
    }

    /// Shut down the write side and release the session slot.
    pub async fn close(&mut self) -> io::Result<()> {
        if self.released {
            return Ok(());
        }
        let result = self.stream.shutdown().await;
        self.release();
        result
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.session.release_stream();
        }
    }
}

impl Drop for MuxConn {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for MuxConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxConn")
            .field("session", &self.session.id())
            .field("local_addr", &self.local_addr.to_string())
            .field("remote_addr", &self.remote_addr.to_string())
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for MuxConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for MuxConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
