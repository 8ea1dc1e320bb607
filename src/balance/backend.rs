//! Backend specifications: where traffic may be sent.

use std::fmt;
use std::net::IpAddr;

use thiserror::Error;

/// A configured traffic destination: a literal endpoint, a host name to
/// resolve, or an SRV name to expand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSpec {
    pub target: Target,
    /// Destination port. Unused for SRV targets, whose records carry their
    /// own ports.
    pub port: u16,
}

/// The resolvable part of a backend spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Literal IP address; no resolution needed.
    Addr(IpAddr),
    /// Host name resolved through A/AAAA lookups.
    Host(String),
    /// SRV name expanded into (target, port) pairs.
    Srv(String),
}

#[derive(Debug, Error)]
pub enum ParseBackendError {
    #[error("parse backend {0:?}: invalid port")]
    InvalidPort(String),
}

impl BackendSpec {
    /// Parses the configuration form of a backend.
    ///
    /// `srv <name>` selects SRV expansion. Otherwise the value is a
    /// `host[:port]` pair (IPv6 literals with a port use brackets); when the
    /// port is absent, `implicit_port` is used.
    pub fn parse(s: &str, implicit_port: u16) -> Result<Self, ParseBackendError> {
        const SRV_PREFIX: &str = "srv";
        if let Some(rest) = s.strip_prefix(SRV_PREFIX) {
            if rest.starts_with(char::is_whitespace) {
                return Ok(Self {
                    target: Target::Srv(rest.trim_start().to_string()),
                    port: 0,
                });
            }
        }

        let (host, port) = match split_host_port(s) {
            Some((host, port_str)) => {
                let port = match port_str.parse::<u16>() {
                    Ok(p) if p > 0 => p,
                    _ => return Err(ParseBackendError::InvalidPort(s.to_string())),
                };
                (host, port)
            }
            None => (s, implicit_port),
        };
        let target = match host.parse::<IpAddr>() {
            Ok(addr) => Target::Addr(addr),
            Err(_) => Target::Host(host.to_string()),
        };
        Ok(Self { target, port })
    }
}

/// Splits `host:port` / `[host]:port` forms. Returns `None` when no port is
/// present, including for bare IPv6 literals like `::1`.
fn split_host_port(s: &str) -> Option<(&str, &str)> {
    if let Some(rest) = s.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        let port = after.strip_prefix(':')?;
        return Some((host, port));
    }
    let (host, port) = s.rsplit_once(':')?;
    if host.contains(':') {
        // More than one colon without brackets: an IPv6 literal, not a
        // host:port pair.
        return None;
    }
    Some((host, port))
}

impl fmt::Display for BackendSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Target::Srv(name) => write!(f, "srv {}", name),
            Target::Addr(IpAddr::V6(addr)) => write!(f, "[{}]:{}", addr, self.port),
            Target::Addr(IpAddr::V4(addr)) => write!(f, "{}:{}", addr, self.port),
            Target::Host(host) if host.contains(':') => {
                write!(f, "[{}]:{}", host, self.port)
            }
            Target::Host(host) => write!(f, "{}:{}", host, self.port),
        }
    }
}
