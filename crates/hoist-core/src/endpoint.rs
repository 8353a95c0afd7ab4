//! Cluster member identity.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Port a node listens on when an address omits one.
pub const DEFAULT_PORT: u16 = 6379;

/// Identity of a cluster member. Immutable; equality is by `(host, port)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses `host[:port]`, filling in `default_port` when the port is
    /// omitted. Bracketed IPv6 literals (`[::1]:6379`, `[::1]`) are accepted.
    pub fn parse(addr: &str, default_port: u16) -> Result<Self, String> {
        let addr = addr.trim();
        if addr.is_empty() {
            return Err("empty address".into());
        }

        if let Some(rest) = addr.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| format!("unterminated IPv6 literal in '{addr}'"))?;
            let port = match tail.strip_prefix(':') {
                Some(p) => parse_port(p)?,
                None if tail.is_empty() => default_port,
                None => return Err(format!("unexpected '{tail}' after IPv6 literal")),
            };
            return Ok(Self::new(host, port));
        }

        match addr.rsplit_once(':') {
            // a bare IPv6 literal has several colons and no port
            Some((host, _)) if host.contains(':') => Ok(Self::new(addr, default_port)),
            Some((host, port)) if !host.is_empty() => Ok(Self::new(host, parse_port(port)?)),
            Some(_) => Err(format!("missing host in '{addr}'")),
            None => Ok(Self::new(addr, default_port)),
        }
    }
}

fn parse_port(s: &str) -> Result<u16, String> {
    s.parse().map_err(|_| format!("invalid port '{s}'"))
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
