//! Hierarchical overlay addresses.
//!
//! An overlay address is a path of protocol components, lowest layer first:
//! `/ip/127.0.0.1/udp/1812/kcp/mux`. The leading `ip`/`udp` pair is the
//! network-resolvable prefix; everything after it is the residual suffix
//! handled by the layers stacked above the network transport.
//!
//! This is the small subset of overlay addressing the mux transport needs.
//! Name resolution (`dns`) and protocol registries live elsewhere.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use thiserror::Error;

/// Protocols whose component carries exactly one value segment.
const VALUED_PROTOCOLS: &[&str] = &["ip", "ip4", "ip6", "dns", "tcp", "udp"];

/// Errors produced while parsing or resolving an [`Addr`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddrError {
    #[error("address must start with '/': {0:?}")]
    MissingLeadingSlash(String),

    #[error("empty component in address {0:?}")]
    EmptyComponent(String),

    #[error("protocol {protocol} requires a value")]
    MissingValue { protocol: String },

    #[error("address {addr} has no network-resolvable prefix")]
    NotResolvable { addr: String },

    #[error("invalid ip value {value:?} in {addr}")]
    InvalidIp { addr: String, value: String },

    #[error("invalid port value {value:?} in {addr}")]
    InvalidPort { addr: String, value: String },
}

/// Network transport protocol of a resolved socket address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetProtocol {
    Tcp,
    Udp,
}

impl NetProtocol {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }

    fn from_protocol(protocol: &str) -> Option<Self> {
        match protocol {
            "tcp" => Some(Self::Tcp),
            "udp" => Some(Self::Udp),
            _ => None,
        }
    }
}

impl fmt::Display for NetProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `/protocol[/value]` segment of an overlay address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Component {
    protocol: String,
    value: Option<String>,
}

impl Component {
    pub fn new(protocol: impl Into<String>, value: Option<String>) -> Self {
        Self {
            protocol: protocol.into(),
            value,
        }
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.protocol)?;
        if let Some(value) = &self.value {
            write!(f, "/{value}")?;
        }
        Ok(())
    }
}

/// Immutable overlay address.
///
/// The string form is stable and is what registries key on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Addr {
    components: Vec<Component>,
}

impl Addr {
    pub fn from_components(components: Vec<Component>) -> Self {
        Self { components }
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Protocol of the outermost (last) component.
    pub fn protocol(&self) -> Option<&str> {
        self.components.last().map(Component::protocol)
    }

    /// Build the overlay form of a socket address, e.g. `/ip/10.0.0.1/tcp/80`.
    pub fn from_socket_addr(addr: SocketAddr, protocol: NetProtocol) -> Self {
        let ip_protocol = match addr.ip() {
            IpAddr::V4(_) => "ip",
            IpAddr::V6(_) => "ip6",
        };
        Self {
            components: vec![
                Component::new(ip_protocol, Some(addr.ip().to_string())),
                Component::new(protocol.as_str(), Some(addr.port().to_string())),
            ],
        }
    }

    /// Split into the network-resolvable prefix and the residual suffix.
    ///
    /// The prefix must be an ip component followed by a tcp or udp port.
    pub fn resolve_net_addr(&self) -> Result<(SocketAddr, NetProtocol, Self), AddrError> {
        let not_resolvable = || AddrError::NotResolvable {
            addr: self.to_string(),
        };
        let [ip, port, rest @ ..] = self.components.as_slice() else {
            return Err(not_resolvable());
        };
        if !matches!(ip.protocol(), "ip" | "ip4" | "ip6") {
            return Err(not_resolvable());
        }
        let protocol = NetProtocol::from_protocol(port.protocol()).ok_or_else(not_resolvable)?;

        let ip_value = ip.value().unwrap_or_default();
        let ip_addr = IpAddr::from_str(ip_value).map_err(|_| AddrError::InvalidIp {
            addr: self.to_string(),
            value: ip_value.to_string(),
        })?;
        let family_matches = match ip.protocol() {
            "ip4" => ip_addr.is_ipv4(),
            "ip6" => ip_addr.is_ipv6(),
            _ => true,
        };
        if !family_matches {
            return Err(AddrError::InvalidIp {
                addr: self.to_string(),
                value: ip_value.to_string(),
            });
        }

        let port_value = port.value().unwrap_or_default();
        let port_number = port_value.parse::<u16>().map_err(|_| AddrError::InvalidPort {
            addr: self.to_string(),
            value: port_value.to_string(),
        })?;

        Ok((
            SocketAddr::new(ip_addr, port_number),
            protocol,
            Self::from_components(rest.to_vec()),
        ))
    }

    /// Concatenate `suffix` after this address.
    #[must_use]
    pub fn join(&self, suffix: &Self) -> Self {
        let mut components = Vec::with_capacity(self.components.len() + suffix.components.len());
        components.extend_from_slice(&self.components);
        components.extend_from_slice(&suffix.components);
        Self { components }
    }
}

impl FromStr for Addr {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some(body) = s.strip_prefix('/') else {
            return Err(AddrError::MissingLeadingSlash(s.to_string()));
        };
        if body.is_empty() {
            return Ok(Self::default());
        }

        let mut components = Vec::new();
        let mut segments = body.split('/');
        while let Some(protocol) = segments.next() {
            if protocol.is_empty() {
                return Err(AddrError::EmptyComponent(s.to_string()));
            }
            let value = if VALUED_PROTOCOLS.contains(&protocol) {
                match segments.next() {
                    Some(value) if !value.is_empty() => Some(value.to_string()),
                    _ => {
                        return Err(AddrError::MissingValue {
                            protocol: protocol.to_string(),
                        });
                    }
                }
            } else {
                None
            };
            components.push(Component::new(protocol, value));
        }

        Ok(Self { components })
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.components.is_empty() {
            return f.write_str("/");
        }
        for component in &self.components {
            write!(f, "{component}")?;
        }
        Ok(())
    }
}
