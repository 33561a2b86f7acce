use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::de::{self, Deserialize, Deserializer};

use crate::error::RebindError;

/// A host:port pair that understands IPv4/IPv6 literals, CNAME-target
/// hostnames, and internal/external IP mappings. The internal IP is what
/// the process binds; the external IP is what gets advertised over DNS.
/// They coincide unless an operator bind-map rewrote the external side.
#[derive(Clone, Debug)]
pub struct Address {
    pub host: String,
    pub port: u16,
    pub internal_ip: Option<IpAddr>,
    pub external_ip: Option<IpAddr>,
}

/// Map key for an Address. Identity is (internal, external, port); the
/// textual host never participates, so two spellings of the same IP pair
/// collapse onto one pool slot or listener.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AddressKey {
    internal: Option<IpAddr>,
    external: Option<IpAddr>,
    port: u16,
}

enum SplitError {
    MissingPort,
    Malformed(&'static str),
}

/// Splits `raw` into host and port on the final colon, honoring
/// bracketed IPv6 literals. A bare unbracketed IPv6 address is rejected
/// rather than being misread as host:port.
fn split_host_port(raw: &str) -> Result<(&str, &str), SplitError> {
    if let Some(rest) = raw.strip_prefix('[') {
        let Some(end) = rest.find(']') else {
            return Err(SplitError::Malformed("missing ']' in address"));
        };
        let host = &rest[..end];
        let tail = &rest[end + 1..];
        if tail.is_empty() {
            return Err(SplitError::MissingPort);
        }
        let Some(port) = tail.strip_prefix(':') else {
            return Err(SplitError::Malformed("unexpected characters after ']'"));
        };
        return Ok((host, port));
    }
    match raw.rfind(':') {
        None => Err(SplitError::MissingPort),
        Some(idx) => {
            let host = &raw[..idx];
            if host.contains(':') {
                return Err(SplitError::Malformed("too many colons in address"));
            }
            Ok((host, &raw[idx + 1..]))
        }
    }
}

impl Address {
    /// Parses a raw `host:port` string. A missing port defaults to 80;
    /// any other malformation is an error. If the host portion is a
    /// literal IP both the internal and external IPs are set to it,
    /// otherwise the host is kept as a name (a CNAME target candidate).
    pub fn parse(raw: &str) -> Result<Self, RebindError> {
        let err = |reason: &str| RebindError::AddressParse {
            addr: raw.to_string(),
            reason: reason.to_string(),
        };
        let (host, port) = match split_host_port(raw) {
            Ok(pair) => pair,
            Err(SplitError::MissingPort) => {
                let retry = format!("{raw}:80");
                return Self::parse(&retry).map_err(|_| err("missing port in address"));
            }
            Err(SplitError::Malformed(reason)) => return Err(err(reason)),
        };
        let port: u16 = port.parse().map_err(|_| err("invalid port"))?;
        let ip = host.parse::<IpAddr>().ok();
        Ok(Self {
            host: host.to_string(),
            port,
            internal_ip: ip,
            external_ip: ip,
        })
    }

    /// True iff the address carries a textual host and no literal IP.
    pub fn is_name(&self) -> bool {
        !self.host.is_empty() && self.internal_ip.is_none()
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self.internal_ip, Some(IpAddr::V6(_)))
    }

    pub fn internal_socket(&self) -> Option<SocketAddr> {
        self.internal_ip.map(|ip| SocketAddr::new(ip, self.port))
    }

    pub fn external_socket(&self) -> Option<SocketAddr> {
        self.external_ip.map(|ip| SocketAddr::new(ip, self.port))
    }

    /// Bind-side formatting, bracketed for IPv6.
    pub fn internal_addr(&self) -> String {
        match self.internal_socket() {
            Some(sock) => sock.to_string(),
            None => format!("{}:{}", self.host, self.port),
        }
    }

    /// Advertised-side formatting, bracketed for IPv6.
    pub fn external_addr(&self) -> String {
        match self.external_socket() {
            Some(sock) => sock.to_string(),
            None => format!("{}:{}", self.host, self.port),
        }
    }

    pub fn key(&self) -> AddressKey {
        AddressKey {
            internal: self.internal_ip,
            external: self.external_ip,
            port: self.port,
        }
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.port == other.port
            && self.internal_ip == other.internal_ip
            && self.external_ip == other.external_ip
    }
}

impl Eq for Address {}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.internal_ip.is_none() {
            write!(f, "{}:{}", self.host, self.port)
        } else {
            write!(f, "{}", self.external_addr())
        }
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Address::parse(&raw).map_err(de::Error::custom)
    }
}
