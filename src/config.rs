use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};

use crate::error::{Result, TiiError};

/// Environment variable holding the `host:port` endpoint.
pub const ADDR_ENV: &str = "TIIADDR";
/// Endpoint used when `TIIADDR` is not set.
pub const DEFAULT_ADDR: &str = "localhost:7115";

const MAX_ADDR_LEN: usize = 4096;

/// Host and port of the tunnel endpoint, as given by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: String,
}

impl Endpoint {
    /// Parse a `host:port` string. Leading blanks are skipped and the split
    /// happens on the first `:`.
    pub fn parse(value: &str) -> Result<Self> {
        if value.len() >= MAX_ADDR_LEN {
            return Err(TiiError::Config(format!(
                "address is longer than {} bytes",
                MAX_ADDR_LEN - 1
            )));
        }

        let trimmed = value.trim_start_matches([' ', '\t']);
        let (host, port) = trimmed
            .split_once(':')
            .ok_or_else(|| TiiError::Config(format!("missing ':' in address \"{}\"", value)))?;

        Ok(Endpoint {
            host: host.to_string(),
            port: port.to_string(),
        })
    }

    /// Read the endpoint from `TIIADDR`, falling back to the default.
    pub fn from_env() -> Result<Self> {
        match std::env::var(ADDR_ENV) {
            Ok(value) => Self::parse(&value),
            Err(std::env::VarError::NotPresent) => Self::parse(DEFAULT_ADDR),
            Err(e) => Err(TiiError::Config(format!("{}: {}", ADDR_ENV, e))),
        }
    }

    /// An empty host or one starting with `*` means "any local address".
    pub fn is_wildcard(&self) -> bool {
        self.host.is_empty() || self.host.starts_with('*')
    }

    /// The port as a number. Service names are not looked up.
    pub fn port_number(&self) -> Result<u16> {
        self.port
            .trim()
            .parse::<u16>()
            .map_err(|_| TiiError::Config(format!("invalid port \"{}\"", self.port)))
    }

    /// Resolve to the IPv4 candidates for this endpoint, in resolver order.
    pub fn resolve(&self) -> Result<Vec<SocketAddrV4>> {
        let port = self.port_number()?;

        if self.is_wildcard() {
            return Ok(vec![SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)]);
        }

        let candidates: Vec<SocketAddrV4> = (self.host.as_str(), port)
            .to_socket_addrs()
            .map_err(|e| TiiError::Config(format!("cannot resolve {}: {}", self, e)))?
            .filter_map(|addr| match addr {
                SocketAddr::V4(v4) => Some(v4),
                SocketAddr::V6(_) => None,
            })
            .collect();

        if candidates.is_empty() {
            return Err(TiiError::Config(format!("no IPv4 address for {}", self)));
        }
        Ok(candidates)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
