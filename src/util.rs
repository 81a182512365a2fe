/// Utility helpers shared by the registry and the HTTP surface.
///
/// This module contains:
/// - The `ServerId` key type and its parsing rules
/// - Helpers deriving a host from forwarded-address sources
///
/// IMPORTANT:
/// - No registry state lives here.
/// - Everything in this module is pure and deterministic.
///

use std::fmt;
use std::net::{IpAddr, Ipv6Addr};
use std::str::FromStr;

use serde::{Serialize, Serializer};
use thiserror::Error;

/// Port assumed when a server identifier carries none.
pub const DEFAULT_PORT: u16 = 80;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ServerIdError {
    #[error("server identifier is empty")]
    EmptyHost,

    #[error("invalid port '{0}'")]
    InvalidPort(String),

    #[error("malformed server identifier '{0}'")]
    Malformed(String),
}

/// Unique key of a tracked metrics server.
///
/// Canonical form is always `host:port`:
/// - "node-1"        -> "node-1:80"
/// - "node-1:80"     -> "node-1:80"
/// - "10.0.0.5:9100" -> "10.0.0.5:9100"
/// - "[::1]:9100"    -> "[::1]:9100"
///
/// Two spellings of the same host/port therefore compare equal and
/// land on the same registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerId {
    host: String,
    port: u16,
}

impl ServerId {
    /// Parses `host` or `host:port`.
    pub fn parse(raw: &str) -> Result<Self, ServerIdError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ServerIdError::EmptyHost);
        }

        // Bracketed IPv6 literal, optionally followed by ":port"
        if raw.starts_with('[') {
            let end = raw
                .find(']')
                .ok_or_else(|| ServerIdError::Malformed(raw.to_string()))?;
            let (host, rest) = raw.split_at(end + 1);
            let port = match rest {
                "" => DEFAULT_PORT,
                _ => match rest.strip_prefix(':') {
                    Some(p) => parse_port(p)?,
                    None => return Err(ServerIdError::Malformed(raw.to_string())),
                },
            };
            return Self::new(host, port);
        }

        match raw.split_once(':') {
            None => Self::new(raw, DEFAULT_PORT),
            Some((host, port)) => {
                // An unbracketed IPv6 literal cannot be split unambiguously
                if port.contains(':') {
                    return Err(ServerIdError::Malformed(raw.to_string()));
                }
                Self::new(host, parse_port(port)?)
            }
        }
    }

    /// Combines a host derived from the caller's address with an explicit port.
    pub fn from_host_and_port(host: &str, port: &str) -> Result<Self, ServerIdError> {
        Self::new(host.trim(), parse_port(port)?)
    }

    fn new(host: &str, port: u16) -> Result<Self, ServerIdError> {
        if host.is_empty() || host == "[]" {
            return Err(ServerIdError::EmptyHost);
        }
        if !is_valid_host(host) {
            return Err(ServerIdError::Malformed(host.to_string()));
        }
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Scrape target of this server.
    pub fn metrics_url(&self) -> String {
        format!("http://{}:{}/metrics", self.host, self.port)
    }
}

/// Hostname / IPv4 characters only, or a bracketed IPv6 literal.
///
/// Anything else (`/`, `?`, `#`, `@`, `,`, whitespace, ...) would change
/// the scrape URL beyond `http://{host}:{port}/metrics`.
fn is_valid_host(host: &str) -> bool {
    match host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        Some(v6) => v6.parse::<Ipv6Addr>().is_ok(),
        None => host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')),
    }
}

fn parse_port(raw: &str) -> Result<u16, ServerIdError> {
    match raw.trim().parse::<u16>() {
        Ok(0) | Err(_) => Err(ServerIdError::InvalidPort(raw.to_string())),
        Ok(port) => Ok(port),
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ServerId {
    type Err = ServerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// Serialized as its canonical string so id lists render as plain JSON arrays
impl Serialize for ServerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Extracts the caller address from a forwarded-address header value.
///
/// The last comma-separated entry is taken (the hop closest to this
/// proxy), then, since hops may also be chained colon-delimited, only
/// its last colon segment is kept:
/// - "10.0.0.5"                  -> "10.0.0.5"
/// - "::ffff:10.0.0.5"           -> "10.0.0.5"
/// - "192.168.1.1:10.0.0.5"      -> "10.0.0.5"
/// - "203.0.113.9, 10.0.0.5"     -> "10.0.0.5"
///
/// Returns `None` for blank values.
pub fn last_forwarded_hop(value: &str) -> Option<&str> {
    value
        .rsplit(',')
        .next()?
        .rsplit(':')
        .next()
        .map(str::trim)
        .filter(|hop| !hop.is_empty())
}

/// Renders a TCP peer address as a host usable inside a `ServerId`.
///
/// IPv4-mapped IPv6 peers are reduced to plain IPv4; genuine IPv6
/// peers are bracketed.
pub fn peer_host(ip: IpAddr) -> String {
    match ip.to_canonical() {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => format!("[{v6}]"),
    }
}
