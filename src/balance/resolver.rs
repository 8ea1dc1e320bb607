//! Name resolution behind a trait so tests can fake DNS.

use std::net::IpAddr;

use anyhow::Result;
use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;

/// One SRV record. Priority and weight are carried for completeness; the
/// engine treats all records equally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvRecord {
    pub target: String,
    pub port: u16,
    pub priority: u16,
    pub weight: u16,
}

/// The lookups the load balancer needs.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// A/AAAA lookup for a host name.
    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>>;

    /// SRV lookup. Returns the canonical name and the records.
    async fn lookup_srv(&self, name: &str) -> Result<(String, Vec<SrvRecord>)>;
}

/// Production resolver over the system DNS configuration.
pub struct SystemResolver {
    inner: TokioAsyncResolver,
}

impl SystemResolver {
    pub fn from_system_conf() -> Result<Self> {
        Ok(Self {
            inner: TokioAsyncResolver::tokio_from_system_conf()?,
        })
    }
}

#[async_trait]
impl Resolver for SystemResolver {
    async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>> {
        let lookup = self.inner.lookup_ip(host).await?;
        Ok(lookup.iter().collect())
    }

    async fn lookup_srv(&self, name: &str) -> Result<(String, Vec<SrvRecord>)> {
        let lookup = self.inner.srv_lookup(name).await?;
        let records = lookup
            .iter()
            .map(|srv| SrvRecord {
                target: srv.target().to_utf8(),
                port: srv.port(),
                priority: srv.priority(),
                weight: srv.weight(),
            })
            .collect();
        Ok((lookup.as_lookup().query().name().to_utf8(), records))
    }
}

/// Collapses IPv4-mapped IPv6 addresses to plain IPv4 so endpoints compare
/// and dial consistently no matter which lookup family produced them.
pub fn canonical_ip(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => addr,
        },
        IpAddr::V4(_) => addr,
    }
}
