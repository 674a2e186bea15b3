//! Error types for the mux transport.

use std::{fmt, io};

use overmux_core::Addr;

/// Result type alias using [`TransportError`].
pub type Result<T> = std::result::Result<T, TransportError>;

/// Failures reported by a multiplexer session handle.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// The session was closed locally or its worker is gone.
    #[error("mux session closed")]
    SessionClosed,

    /// The peer ended the session cleanly.
    #[error("peer ended the mux session")]
    PeerEnded,

    #[error("mux operation timed out")]
    TimedOut,

    #[error("mux I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("mux protocol error: {0}")]
    Protocol(String),
}

impl MuxError {
    /// Whether this error is the expected end of a session rather than a
    /// fault. Session-end errors end a forwarding loop silently.
    pub fn is_session_end(&self) -> bool {
        match self {
            Self::SessionClosed | Self::PeerEnded => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
            ),
            Self::TimedOut | Self::Protocol(_) => false,
        }
    }
}

/// Errors surfaced by [`MuxTransport`](crate::MuxTransport) and
/// [`MuxListener`](crate::MuxListener).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("address already in use: {addr}")]
    AddressInUse { addr: String },

    #[error("no mux session for {addr}; client_connect must run first")]
    SessionNotFound { addr: String },

    #[error("mux session {addr} open stream error: {source}")]
    StreamOpenFailed {
        addr: String,
        #[source]
        source: MuxError,
    },

    #[error("mux session {addr} accept error: {source}")]
    StreamAcceptFailed {
        addr: String,
        #[source]
        source: MuxError,
    },

    #[error("failed to compose addresses for {addr}: {reason}")]
    AddressResolutionFailed { addr: String, reason: String },

    #[error("listener on {addr} is closed")]
    ListenerClosed { addr: String },

    #[error("lower layer close for {addr} failed: {source}")]
    LowerClose {
        addr: String,
        #[source]
        source: io::Error,
    },
}

impl TransportError {
    pub(crate) fn resolution(addr: &Addr, reason: impl fmt::Display) -> Self {
        Self::AddressResolutionFailed {
            addr: addr.to_string(),
            reason: reason.to_string(),
        }
    }
}
