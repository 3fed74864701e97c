//! TCP endpoint parsing and source-address canonicalization.
//!
//! Destinations and bind addresses are `host[:port]` pairs; client sources
//! are reduced to a 16-byte key so IPv4 and IPv6 peers never collide in the
//! block table.

use std::fmt;
use std::net::IpAddr;

use thiserror::Error;

/// Default port for the MySQL client protocol.
pub const DEFAULT_MYSQL_PORT: u16 = 3306;

/// Errors from endpoint and destination-list parsing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    /// The port text has non-digit characters or is longer than five digits.
    #[error("invalid TCP port: invalid characters or too long")]
    PortSyntax,

    /// The port parsed but is outside 1..=65535.
    #[error("invalid TCP port: impossible port number")]
    PortRange,

    /// A destination entry did not resolve to a usable `host:port`.
    #[error("Destination address '{0}' is invalid")]
    InvalidDestination(String),

    /// The bind endpoint appeared in the destination list.
    #[error("Bind Address can not be part of destinations")]
    BindInDestinations,

    /// The destination list was empty after parsing.
    #[error("No destinations available")]
    NoDestinations,
}

/// A `host:port` pair. A port of zero marks an invalid or unresolved
/// endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpEndpoint {
    pub host: String,
    pub port: u16,
}

impl TcpEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Whether the endpoint names a host and a non-zero port.
    pub fn is_valid(&self) -> bool {
        !self.host.is_empty() && self.port != 0
    }

    /// `host:port` form accepted by address resolution, bracketing IPv6
    /// literals.
    pub(crate) fn lookup_str(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for TcpEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.lookup_str())
    }
}

/// Parse a TCP port from its textual form.
pub fn parse_tcp_port(text: &str) -> Result<u16, AddressError> {
    if text.is_empty() || text.len() > 5 || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AddressError::PortSyntax);
    }
    match text.parse::<u32>() {
        Ok(port) if (1..=65535).contains(&port) => Ok(port as u16),
        _ => Err(AddressError::PortRange),
    }
}

/// Split `host[:port]` into its parts. The port is zero when absent.
///
/// IPv6 literals may be bracketed (`[::1]:3306`); an unbracketed string
/// with more than one colon is taken as a bare IPv6 address without port.
pub fn split_addr_port(text: &str) -> Result<(String, u16), AddressError> {
    let text = text.trim();
    if let Some(rest) = text.strip_prefix('[') {
        let Some((host, tail)) = rest.split_once(']') else {
            return Err(AddressError::InvalidDestination(text.to_string()));
        };
        let port = match tail.strip_prefix(':') {
            Some(port_text) => parse_tcp_port(port_text)?,
            None if tail.is_empty() => 0,
            None => return Err(AddressError::InvalidDestination(text.to_string())),
        };
        return Ok((host.to_string(), port));
    }

    if text.matches(':').count() > 1 {
        // Bare IPv6 literal without brackets; no port position exists.
        return Ok((text.to_string(), 0));
    }

    match text.split_once(':') {
        Some((host, port_text)) => Ok((host.to_string(), parse_tcp_port(port_text)?)),
        None => Ok((text.to_string(), 0)),
    }
}

/// Parse a comma-separated destination list.
///
/// Entries default to port 3306 when none is given. The bind endpoint must
/// not appear in the result and the result must be non-empty.
pub fn parse_csv(csv: &str, bind: &TcpEndpoint) -> Result<Vec<TcpEndpoint>, AddressError> {
    let mut endpoints = Vec::new();
    for part in csv.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (host, mut port) = split_addr_port(part)
            .map_err(|_| AddressError::InvalidDestination(part.to_string()))?;
        if port == 0 {
            port = DEFAULT_MYSQL_PORT;
        }
        let endpoint = TcpEndpoint::new(host, port);
        if !endpoint.is_valid() {
            return Err(AddressError::InvalidDestination(endpoint.to_string()));
        }
        endpoints.push(endpoint);
    }

    if endpoints.iter().any(|e| e == bind) {
        return Err(AddressError::BindInDestinations);
    }
    if endpoints.is_empty() {
        return Err(AddressError::NoDestinations);
    }
    Ok(endpoints)
}

/// Canonical 16-byte form of a client address.
///
/// IPv4 sources use the IPv4-mapped IPv6 layout, so an IPv4 peer and an
/// IPv6 peer can never share a key. Ordered by byte sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceKey([u8; 16]);

impl SourceKey {
    pub fn octets(&self) -> [u8; 16] {
        self.0
    }
}

impl From<IpAddr> for SourceKey {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Self(v4.to_ipv6_mapped().octets()),
            IpAddr::V6(v6) => Self(v6.octets()),
        }
    }
}

impl From<[u8; 16]> for SourceKey {
    fn from(octets: [u8; 16]) -> Self {
        Self(octets)
    }
}
