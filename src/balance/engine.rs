//! The load-balancer engine: a live queue of endpoints kept fresh by
//! re-resolving the configured backends.
//!
//! `pick` hands out the endpoint at the front of the queue and rotates it to
//! the back, so consecutive picks cycle round-robin. Before picking, a
//! single-flight `refresh` re-resolves every backend and reconciles the
//! queue with the result: endpoints that no longer resolve are dropped,
//! surviving endpoints keep their rotation position, and new endpoints join
//! at the tail.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::balance::backend::{BackendSpec, Target};
use crate::balance::resolver::{canonical_ip, Resolver};
use crate::deque::Deque;

/// Upper bound on resolver calls in flight during one refresh.
const MAX_RESOLVE_CONCURRENCY: usize = 10;

pub struct LoadBalancer {
    resolver: Arc<dyn Resolver>,
    backends: Vec<BackendSpec>,
    /// Single-flight permit: at most one refresh runs at a time.
    refresh_sem: Semaphore,
    queue: Mutex<Deque<SocketAddr>>,
}

#[derive(Debug, Error)]
pub enum PickError {
    #[error("pick address: no backend available")]
    NoBackendAvailable,
    #[error("pick address: {0}")]
    Refresh(#[from] RefreshError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RefreshError {
    /// The deadline passed before the refresh could begin.
    #[error("refresh backends: start: deadline exceeded")]
    Cancelled,
    /// The deadline passed while lookups were still in flight.
    #[error("refresh backends: deadline exceeded")]
    DeadlineExceeded,
}

impl LoadBalancer {
    pub fn new(resolver: Arc<dyn Resolver>, backends: Vec<BackendSpec>) -> Self {
        Self {
            resolver,
            backends,
            refresh_sem: Semaphore::new(1),
            queue: Mutex::new(Deque::new()),
        }
    }

    /// Chooses one of the available backends, or fails if none are.
    ///
    /// A refresh is attempted first, bounded by `deadline`. A refresh that
    /// could not run in time only surfaces as an error when the queue is
    /// also empty; otherwise the current queue is used as-is.
    pub async fn pick(&self, deadline: Instant) -> Result<SocketAddr, PickError> {
        let refresh_err = self.refresh(deadline).await.err();

        let mut queue = self.queue.lock().expect("endpoint queue poisoned");
        match queue.front().copied() {
            Some(addr) => {
                queue.rotate(1);
                Ok(addr)
            }
            None => match refresh_err {
                Some(err) => Err(PickError::Refresh(err)),
                None => Err(PickError::NoBackendAvailable),
            },
        }
    }

    /// Re-resolves every configured backend and reconciles the queue with
    /// the fresh endpoint set.
    ///
    /// Only deadline expiry is an error; individual lookup failures are
    /// logged and their backends sit out this refresh.
    pub async fn refresh(&self, deadline: Instant) -> Result<(), RefreshError> {
        let _permit = match tokio::time::timeout_at(deadline, self.refresh_sem.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) | Err(_) => return Err(RefreshError::Cancelled),
        };

        let mut fresh = match tokio::time::timeout_at(deadline, self.resolve_backends()).await {
            Ok(set) => set,
            Err(_) => {
                debug!("Load balance refresh abort: deadline exceeded");
                return Err(RefreshError::DeadlineExceeded);
            }
        };

        let mut queue = self.queue.lock().expect("endpoint queue poisoned");
        queue.retain(|addr| fresh.contains(addr));
        for addr in queue.iter() {
            fresh.remove(addr);
        }
        for addr in fresh {
            queue.push_back(addr);
        }
        Ok(())
    }

    /// Fans out resolution of all backends with bounded concurrency and
    /// collects the produced endpoints into a set.
    async fn resolve_backends(&self) -> HashSet<SocketAddr> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        // Tears down in-flight lookups if this future is dropped mid-drain.
        let _guard = cancel.clone().drop_guard();
        let ctx = ResolveContext {
            resolver: Arc::clone(&self.resolver),
            out: tx,
            limit: Arc::new(Semaphore::new(MAX_RESOLVE_CONCURRENCY)),
            cancel,
        };

        for backend in &self.backends {
            match &backend.target {
                Target::Addr(ip) => {
                    let _ = ctx
                        .out
                        .send(SocketAddr::new(canonical_ip(*ip), backend.port));
                }
                Target::Host(host) => ctx.spawn_host(host.clone(), backend.port),
                Target::Srv(name) => ctx.spawn_srv(name.clone()),
            }
        }
        // Drop our own sender; the drain ends once every lookup task has
        // finished and released its clone.
        drop(ctx);

        let mut set = HashSet::new();
        while let Some(addr) = rx.recv().await {
            set.insert(addr);
        }
        set
    }
}

/// Everything a lookup task needs, cloneable into spawned children.
#[derive(Clone)]
struct ResolveContext {
    resolver: Arc<dyn Resolver>,
    out: mpsc::UnboundedSender<SocketAddr>,
    limit: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl ResolveContext {
    fn spawn_host(&self, host: String, port: u16) {
        let ctx = self.clone();
        tokio::spawn(async move {
            let permit = tokio::select! {
                _ = ctx.cancel.cancelled() => return,
                permit = ctx.limit.clone().acquire_owned() => permit,
            };
            let Ok(_permit) = permit else { return };
            ctx.resolve_host(&host, port).await;
        });
    }

    fn spawn_srv(&self, name: String) {
        let ctx = self.clone();
        tokio::spawn(async move {
            let permit = tokio::select! {
                _ = ctx.cancel.cancelled() => return,
                permit = ctx.limit.clone().acquire_owned() => permit,
            };
            let Ok(_permit) = permit else { return };
            ctx.expand_srv(&name).await;
        });
    }

    /// Expands an SRV name and resolves each record's target.
    async fn expand_srv(&self, name: &str) {
        let lookup = tokio::select! {
            _ = self.cancel.cancelled() => return,
            res = self.resolver.lookup_srv(name) => res,
        };
        let records = match lookup {
            Ok((_cname, records)) => records,
            Err(err) => {
                warn!("{:#}", err);
                return;
            }
        };
        if records.is_empty() {
            warn!("No SRV records found for {}", name);
            return;
        }
        if tracing::enabled!(tracing::Level::DEBUG) {
            let expansion = records
                .iter()
                .map(|r| format!("{}:{}", r.target, r.port))
                .collect::<Vec<_>>()
                .join(" ");
            debug!("Resolved SRV {} -> {}", name, expansion);
        }

        let Some((last, rest)) = records.split_last() else {
            return;
        };
        for record in rest {
            self.spawn_host(record.target.clone(), record.port);
        }
        // The last record reuses this task's concurrency slot instead of
        // queueing for a new one, so a batch of SRV expansions saturating
        // the limit cannot starve its own children.
        self.resolve_host(&last.target, last.port).await;
    }

    /// Resolves one host name and emits an endpoint per address.
    async fn resolve_host(&self, host: &str, port: u16) {
        let lookup = tokio::select! {
            _ = self.cancel.cancelled() => return,
            res = self.resolver.lookup_ip(host) => res,
        };
        let addrs = match lookup {
            Ok(addrs) => addrs,
            Err(err) => {
                warn!("{:#}", err);
                return;
            }
        };
        let addrs: Vec<_> = addrs.into_iter().map(canonical_ip).collect();
        if tracing::enabled!(tracing::Level::DEBUG) {
            let expansion = addrs
                .iter()
                .map(|a| a.to_string())
                .collect::<Vec<_>>()
                .join(" ");
            debug!("Resolved A/AAAA {} -> {}", host, expansion);
        }
        for addr in addrs {
            if self.out.send(SocketAddr::new(addr, port)).is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::net::IpAddr;
    use std::time::Duration;

    use crate::balance::resolver::SrvRecord;

    #[derive(Default)]
    struct FakeResolver {
        a: HashMap<String, Vec<IpAddr>>,
        srv: HashMap<String, Vec<SrvRecord>>,
    }

    #[async_trait]
    impl Resolver for FakeResolver {
        async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>> {
            Ok(self.a.get(host).cloned().unwrap_or_default())
        }

        async fn lookup_srv(&self, name: &str) -> Result<(String, Vec<SrvRecord>)> {
            Ok((
                name.to_string(),
                self.srv.get(name).cloned().unwrap_or_default(),
            ))
        }
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn ep(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn spec(s: &str) -> BackendSpec {
        BackendSpec::parse(s, 80).unwrap()
    }

    #[tokio::test]
    async fn single_literal_endpoint() {
        let lb = LoadBalancer::new(
            Arc::new(FakeResolver::default()),
            vec![spec("127.0.0.1:80")],
        );
        for _ in 0..3 {
            assert_eq!(lb.pick(deadline()).await.unwrap(), ep("127.0.0.1:80"));
        }
    }

    #[tokio::test]
    async fn multiple_literal_endpoints() {
        let lb = LoadBalancer::new(
            Arc::new(FakeResolver::default()),
            vec![
                spec("127.0.0.1:80"),
                spec("127.0.0.1:81"),
                spec("127.0.0.1:82"),
            ],
        );
        let mut got = HashSet::new();
        for _ in 0..3 {
            got.insert(lb.pick(deadline()).await.unwrap());
        }
        let want: HashSet<_> = [ep("127.0.0.1:80"), ep("127.0.0.1:81"), ep("127.0.0.1:82")]
            .into_iter()
            .collect();
        assert_eq!(got, want);
    }

    #[tokio::test]
    async fn picks_cycle_in_stable_order() {
        let lb = LoadBalancer::new(
            Arc::new(FakeResolver::default()),
            vec![
                spec("127.0.0.1:80"),
                spec("127.0.0.1:81"),
                spec("127.0.0.1:82"),
            ],
        );
        let mut first_cycle = Vec::new();
        for _ in 0..3 {
            first_cycle.push(lb.pick(deadline()).await.unwrap());
        }
        let unique: HashSet<_> = first_cycle.iter().collect();
        assert_eq!(unique.len(), 3, "first cycle repeated an endpoint");
        let mut second_cycle = Vec::new();
        for _ in 0..3 {
            second_cycle.push(lb.pick(deadline()).await.unwrap());
        }
        assert_eq!(first_cycle, second_cycle);
    }

    #[tokio::test]
    async fn hostname_expansion() {
        let resolver = FakeResolver {
            a: HashMap::from([(
                "example.com".to_string(),
                vec![ip("192.0.2.1"), ip("192.0.2.2")],
            )]),
            ..Default::default()
        };
        let lb = LoadBalancer::new(Arc::new(resolver), vec![spec("example.com")]);
        let mut got = HashSet::new();
        for _ in 0..2 {
            got.insert(lb.pick(deadline()).await.unwrap());
        }
        let want: HashSet<_> = [ep("192.0.2.1:80"), ep("192.0.2.2:80")]
            .into_iter()
            .collect();
        assert_eq!(got, want);
    }

    #[tokio::test]
    async fn srv_expansion() {
        let resolver = FakeResolver {
            a: HashMap::from([(
                "example.com.".to_string(),
                vec![ip("192.0.2.1"), ip("192.0.2.2")],
            )]),
            srv: HashMap::from([(
                "_http._tcp.example.com".to_string(),
                vec![
                    SrvRecord {
                        target: "example.com.".to_string(),
                        port: 80,
                        priority: 10,
                        weight: 0,
                    },
                    SrvRecord {
                        target: "example.com.".to_string(),
                        port: 8080,
                        priority: 20,
                        weight: 0,
                    },
                ],
            )]),
        };
        let lb = LoadBalancer::new(
            Arc::new(resolver),
            vec![spec("srv _http._tcp.example.com")],
        );
        let mut got = HashSet::new();
        for _ in 0..4 {
            got.insert(lb.pick(deadline()).await.unwrap());
        }
        let want: HashSet<_> = [
            ep("192.0.2.1:80"),
            ep("192.0.2.2:80"),
            ep("192.0.2.1:8080"),
            ep("192.0.2.2:8080"),
        ]
        .into_iter()
        .collect();
        assert_eq!(got, want);
    }

    #[tokio::test]
    async fn v4_mapped_addresses_are_canonicalised() {
        let resolver = FakeResolver {
            a: HashMap::from([(
                "example.com".to_string(),
                vec![ip("::ffff:192.0.2.9")],
            )]),
            ..Default::default()
        };
        let lb = LoadBalancer::new(Arc::new(resolver), vec![spec("example.com")]);
        assert_eq!(lb.pick(deadline()).await.unwrap(), ep("192.0.2.9:80"));
    }

    #[tokio::test]
    async fn no_backends_means_no_pick() {
        let lb = LoadBalancer::new(Arc::new(FakeResolver::default()), Vec::new());
        match lb.pick(deadline()).await {
            Err(PickError::NoBackendAvailable) => {}
            other => panic!("pick = {:?}; want NoBackendAvailable", other),
        }
    }

    #[tokio::test]
    async fn failed_lookups_are_skipped() {
        struct HalfBroken;

        #[async_trait]
        impl Resolver for HalfBroken {
            async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>> {
                if host == "good.example.com" {
                    Ok(vec!["192.0.2.4".parse().unwrap()])
                } else {
                    Err(anyhow!("lookup {}: no such host", host))
                }
            }

            async fn lookup_srv(&self, name: &str) -> Result<(String, Vec<SrvRecord>)> {
                Err(anyhow!("lookup {}: no such host", name))
            }
        }

        let lb = LoadBalancer::new(
            Arc::new(HalfBroken),
            vec![
                spec("good.example.com"),
                spec("bad.example.com"),
                spec("srv _http._tcp.example.com"),
            ],
        );
        for _ in 0..2 {
            assert_eq!(lb.pick(deadline()).await.unwrap(), ep("192.0.2.4:80"));
        }
    }

    /// A resolver whose answer set can be swapped between refreshes.
    struct SwappableResolver {
        a: Mutex<HashMap<String, Vec<IpAddr>>>,
    }

    #[async_trait]
    impl Resolver for SwappableResolver {
        async fn lookup_ip(&self, host: &str) -> Result<Vec<IpAddr>> {
            Ok(self
                .a
                .lock()
                .unwrap()
                .get(host)
                .cloned()
                .unwrap_or_default())
        }

        async fn lookup_srv(&self, name: &str) -> Result<(String, Vec<SrvRecord>)> {
            Ok((name.to_string(), Vec::new()))
        }
    }

    #[tokio::test]
    async fn refresh_preserves_rotation_of_survivors() {
        let resolver = Arc::new(SwappableResolver {
            a: Mutex::new(HashMap::from([(
                "example.com".to_string(),
                vec![ip("192.0.2.1"), ip("192.0.2.2"), ip("192.0.2.3")],
            )])),
        });
        let lb = LoadBalancer::new(resolver.clone(), vec![spec("example.com")]);

        // One full cycle pins down the queue order.
        let mut order = Vec::new();
        for _ in 0..3 {
            order.push(lb.pick(deadline()).await.unwrap());
        }

        // Drop the endpoint now at the front of the queue (= order[0],
        // rotated back around) and add a new one.
        let dropped = order[0];
        let added = ip("192.0.2.7");
        {
            let mut a = resolver.a.lock().unwrap();
            let addrs = a.get_mut("example.com").unwrap();
            addrs.retain(|addr| *addr != dropped.ip());
            addrs.push(added);
        }
        lb.refresh(deadline()).await.unwrap();

        // Survivors keep their relative order; the new endpoint lands at
        // the tail.
        let want = vec![
            order[1],
            order[2],
            SocketAddr::new(added, 80),
        ];
        let mut got = Vec::new();
        for _ in 0..3 {
            got.push(lb.pick(deadline()).await.unwrap());
        }
        assert_eq!(got, want);
    }

    #[tokio::test]
    async fn total_resolution_failure_clears_queue() {
        let resolver = Arc::new(SwappableResolver {
            a: Mutex::new(HashMap::from([(
                "example.com".to_string(),
                vec![ip("192.0.2.1")],
            )])),
        });
        let lb = LoadBalancer::new(resolver.clone(), vec![spec("example.com")]);
        assert!(lb.pick(deadline()).await.is_ok());

        resolver.a.lock().unwrap().clear();
        match lb.pick(deadline()).await {
            Err(PickError::NoBackendAvailable) => {}
            other => panic!("pick = {:?}; want NoBackendAvailable", other),
        }
    }

    /// A resolver that blocks until released, for exercising the
    /// single-flight path.
    struct BlockingResolver {
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl Resolver for BlockingResolver {
        async fn lookup_ip(&self, _host: &str) -> Result<Vec<IpAddr>> {
            self.release.notified().await;
            Ok(vec!["192.0.2.1".parse().unwrap()])
        }

        async fn lookup_srv(&self, name: &str) -> Result<(String, Vec<SrvRecord>)> {
            Ok((name.to_string(), Vec::new()))
        }
    }

    #[tokio::test]
    async fn pick_times_out_waiting_for_inflight_refresh() {
        let resolver = Arc::new(BlockingResolver {
            release: tokio::sync::Notify::new(),
        });
        let lb = Arc::new(LoadBalancer::new(
            resolver.clone(),
            vec![spec("example.com")],
        ));

        let slow = {
            let lb = Arc::clone(&lb);
            tokio::spawn(async move { lb.refresh(Instant::now() + Duration::from_secs(60)).await })
        };
        // Give the slow refresh time to take the single-flight permit.
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The queue is still empty, so a pick that cannot start a refresh
        // before its deadline reports the refresh failure.
        match lb.pick(Instant::now() + Duration::from_millis(50)).await {
            Err(PickError::Refresh(RefreshError::Cancelled)) => {}
            other => panic!("pick = {:?}; want refresh cancellation", other),
        }

        resolver.release.notify_waiters();
        slow.await.unwrap().unwrap();
        assert!(lb.pick(deadline()).await.is_ok());
    }
}
