//! Runtime configuration.
//!
//! Configuration comes from one or more INI files plus command-line
//! overrides. The root section names the overlay node; each `tcp N` /
//! `http N` section configures one virtual listener with its backends.

mod source;

pub use source::{ConfigSource, ConfigValue};

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tracing::warn;

use crate::balance::backend::BackendSpec;

/// Fully resolved runtime configuration.
#[derive(Debug, Default)]
pub struct Configuration {
    /// Node name advertised to the overlay. Required at runtime.
    pub hostname: String,
    /// Optional overlay authentication key.
    pub auth_key: String,
    /// Directory for persistent overlay state; absence means the node is
    /// ephemeral and logs out on shutdown.
    pub state_dir: Option<PathBuf>,
    /// Listener configuration per port.
    pub ports: BTreeMap<u16, PortConfig>,
}

/// One virtual listener: either a transparent TCP splicer or an HTTP
/// reverse proxy, never both.
#[derive(Debug, Clone)]
pub enum PortConfig {
    Tcp(TcpPortConfig),
    Http(HttpPortConfig),
}

#[derive(Debug, Clone, Default)]
pub struct TcpPortConfig {
    pub backends: Vec<BackendSpec>,
}

#[derive(Debug, Clone, Default)]
pub struct HttpPortConfig {
    pub backends: Vec<BackendSpec>,
    /// Advertise HTTPS to backends via X-Forwarded-Proto.
    pub tls: bool,
    /// Inject overlay identity headers.
    pub whois: bool,
    /// Preserve an inbound X-Forwarded-For chain instead of discarding it.
    pub trust_xff: bool,
}

impl Configuration {
    /// Fills unset fields from the configuration source. Fields already set
    /// (from command-line flags) keep their values.
    pub fn fill(&mut self, source: &ConfigSource) -> Result<()> {
        if self.hostname.is_empty() {
            if let Some(v) = source.get(None, "hostname") {
                self.hostname = v.to_string();
            }
        }
        if self.auth_key.is_empty() {
            if let Some(v) = source.get(None, "auth-key") {
                self.auth_key = v.to_string();
            }
        }
        if self.state_dir.is_none() {
            if let Some(v) = source.value(None, "state-directory") {
                self.state_dir = Some(ConfigSource::resolve_path(&v));
            }
        }

        for section in source.sections() {
            if let Some(port_str) = section.strip_prefix("tcp ") {
                let Some(port) = parse_port(port_str, &section)? else {
                    continue;
                };
                let mut tc = TcpPortConfig::default();
                for spec in source.find_all(Some(section.as_str()), "backend") {
                    let backend = BackendSpec::parse(&spec, port)
                        .with_context(|| format!("read config: tcp {}", port))?;
                    tc.backends.push(backend);
                }
                self.insert_port(port, PortConfig::Tcp(tc))?;
            } else if let Some(port_str) = section.strip_prefix("http ") {
                let Some(port) = parse_port(port_str, &section)? else {
                    continue;
                };
                let mut hc = HttpPortConfig::default();
                if let Some(s) = source.get(Some(section.as_str()), "tls") {
                    if !s.is_empty() {
                        hc.tls = parse_bool(s)
                            .with_context(|| format!("read config: http {}: tls", port))?;
                    }
                }
                if let Some(s) = source.get(Some(section.as_str()), "whois") {
                    if !s.is_empty() {
                        hc.whois = parse_bool(s)
                            .with_context(|| format!("read config: http {}: whois", port))?;
                    }
                }
                if let Some(s) = source.get(Some(section.as_str()), "trust-x-forwarded-for") {
                    if !s.is_empty() {
                        hc.trust_xff = parse_bool(s).with_context(|| {
                            format!("read config: http {}: trust-x-forwarded-for", port)
                        })?;
                    }
                }
                for spec in source.find_all(Some(section.as_str()), "backend") {
                    let backend = BackendSpec::parse(&spec, port)
                        .with_context(|| format!("read config: http {}", port))?;
                    hc.backends.push(backend);
                }
                self.insert_port(port, PortConfig::Http(hc))?;
            } else {
                warn!("Unknown config section {:?}", section);
            }
        }
        Ok(())
    }

    fn insert_port(&mut self, port: u16, pc: PortConfig) -> Result<()> {
        if self.ports.contains_key(&port) {
            bail!("read config: conflicting definition of port {}", port);
        }
        self.ports.insert(port, pc);
        Ok(())
    }
}

/// Parses the port number from a section name. An unparseable port warns
/// and skips the section (`Ok(None)`); port 0 is a hard error.
fn parse_port(port_str: &str, section: &str) -> Result<Option<u16>> {
    let Ok(port) = port_str.parse::<u16>() else {
        warn!("Unknown config section {:?}", section);
        return Ok(None);
    };
    if port == 0 {
        bail!("read config: cannot configure port 0");
    }
    Ok(Some(port))
}

/// Boolean syntax accepted in configuration values.
fn parse_bool(s: &str) -> Result<bool> {
    match s {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        _ => bail!("invalid boolean {:?}", s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::backend::Target;

    fn fill_str(content: &str) -> Result<Configuration> {
        let source = ConfigSource::load_str(content, "/etc/tailbalance/lb.ini").unwrap();
        let mut cfg = Configuration::default();
        cfg.fill(&source)?;
        Ok(cfg)
    }

    #[test]
    fn fills_root_section() {
        let cfg = fill_str(
            "hostname = lb\nauth-key = tskey-abc\nstate-directory = state\n",
        )
        .unwrap();
        assert_eq!(cfg.hostname, "lb");
        assert_eq!(cfg.auth_key, "tskey-abc");
        assert_eq!(
            cfg.state_dir,
            Some(PathBuf::from("/etc/tailbalance/state"))
        );
    }

    #[test]
    fn flags_take_precedence() {
        let source = ConfigSource::load_str("hostname = from-file\n", "/etc/lb.ini").unwrap();
        let mut cfg = Configuration {
            hostname: "from-flag".to_string(),
            ..Default::default()
        };
        cfg.fill(&source).unwrap();
        assert_eq!(cfg.hostname, "from-flag");
    }

    #[test]
    fn binds_tcp_sections() {
        let cfg = fill_str(
            "hostname = lb\n\
             [tcp 80]\n\
             backend = 10.0.0.1\n\
             backend = 10.0.0.2:8080\n",
        )
        .unwrap();
        let PortConfig::Tcp(tc) = &cfg.ports[&80] else {
            panic!("port 80 is not TCP");
        };
        assert_eq!(tc.backends.len(), 2);
        assert_eq!(tc.backends[0].port, 80, "implicit port should be the section port");
        assert_eq!(tc.backends[1].port, 8080);
    }

    #[test]
    fn binds_http_sections() {
        let cfg = fill_str(
            "[http 443]\n\
             tls = true\n\
             whois = 1\n\
             trust-x-forwarded-for = f\n\
             backend = web.internal:8080\n\
             backend = srv _web._tcp.internal\n",
        )
        .unwrap();
        let PortConfig::Http(hc) = &cfg.ports[&443] else {
            panic!("port 443 is not HTTP");
        };
        assert!(hc.tls);
        assert!(hc.whois);
        assert!(!hc.trust_xff);
        assert_eq!(hc.backends.len(), 2);
        assert!(matches!(&hc.backends[1].target, Target::Srv(name) if name == "_web._tcp.internal"));
    }

    #[test]
    fn rejects_conflicting_port() {
        let err = fill_str(
            "[tcp 80]\nbackend = 10.0.0.1\n[http 80]\nbackend = 10.0.0.2\n",
        )
        .unwrap_err();
        assert!(
            err.to_string().contains("conflicting definition of port 80"),
            "unexpected error: {err:#}"
        );
    }

    #[test]
    fn rejects_port_zero() {
        let err = fill_str("[tcp 0]\nbackend = 10.0.0.1\n").unwrap_err();
        assert!(
            err.to_string().contains("cannot configure port 0"),
            "unexpected error: {err:#}"
        );
    }

    #[test]
    fn skips_unknown_sections() {
        let cfg = fill_str(
            "[tcp eighty]\nbackend = 10.0.0.1\n[frobnicator]\nkey = value\n",
        )
        .unwrap();
        assert!(cfg.ports.is_empty());
    }

    #[test]
    fn rejects_bad_booleans() {
        let err = fill_str("[http 443]\nwhois = yes\n").unwrap_err();
        assert!(
            err.to_string().contains("whois"),
            "unexpected error: {err:#}"
        );
    }
}
