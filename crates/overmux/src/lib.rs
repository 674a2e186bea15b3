//! `overmux` - session-multiplexing transport for overlay networks.
//!
//! One underlying connection between two overlay endpoints carries many
//! independent logical streams:
//! - [`MuxTransport`] keeps the registry of client sessions (by target
//!   address) and listener queues (by local address)
//! - [`MuxSession`] binds one underlying connection to a multiplexer handle
//! - [`MuxConn`] is one logical stream with its composed overlay addresses
//! - [`MuxListener`] receives streams forwarded from inbound sessions
//!
//! The multiplexer itself is pluggable through [`Multiplexer`]; an
//! in-process implementation lives in [`memory`] and an `async_smux`
//! adapter in `smux` (cargo feature `smux`).

mod conn;
mod error;
mod listener;
pub mod memory;
pub mod mux;
mod session;
#[cfg(feature = "smux")]
pub mod smux;
mod transport;

pub use conn::MuxConn;
pub use error::{MuxError, Result, TransportError};
pub use listener::MuxListener;
pub use mux::{BoxStream, LogicalStream, Multiplexer, MuxHandle, RawConn, Role};
pub use session::{MuxSession, SessionState};
pub use transport::{MuxTransport, PROTOCOL, TransportStats};
