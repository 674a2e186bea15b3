//! `overmux` Core Library
//!
//! Shared functionality for `overmux` components:
//! - Overlay addresses and network-address translation
//! - Configuration resolution and hierarchy
//! - Tracing initialisation for binaries
//! - Common error types

pub mod addr;
pub mod config;
pub mod error;
pub mod tracing_init;

pub use addr::{Addr, AddrError, Component, NetProtocol};
pub use config::Config;
pub use error::{Error, Result};
