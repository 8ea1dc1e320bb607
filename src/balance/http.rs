//! HTTP front-end: reverse proxy with overlay identity headers.
//!
//! Each request picks a backend, is forwarded with its Host preserved and
//! the `X-Forwarded-*` trio set, and optionally carries the caller's overlay
//! identity. Inbound identity headers are always stripped so callers cannot
//! forge them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, HOST};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use crate::balance::engine::LoadBalancer;
use crate::balance::resolver::canonical_ip;

/// Header prefix reserved for trusted overlay identity information.
const IDENTITY_HEADER_PREFIX: &str = "tailscale-";

/// How long a request may wait for a backend pick.
const PICK_TIMEOUT: Duration = Duration::from_secs(30);

/// The identity of an overlay peer, as reported by the mesh daemon.
#[derive(Debug, Clone, Default)]
pub struct UserProfile {
    pub login_name: String,
    pub display_name: String,
    pub profile_pic_url: String,
}

/// Resolves an overlay peer address to the user behind it.
#[async_trait]
pub trait IdentityLookup: Send + Sync {
    async fn whois(&self, remote: SocketAddr) -> Result<UserProfile>;
}

/// A reverse-proxying HTTP listener backed by the load-balancer engine.
pub struct HttpProxy {
    lb: Arc<LoadBalancer>,
    /// Present when identity headers should be injected.
    identity: Option<Arc<dyn IdentityLookup>>,
    trust_xff: bool,
    tls: bool,
    client: reqwest::Client,
}

impl HttpProxy {
    pub fn new(
        lb: Arc<LoadBalancer>,
        identity: Option<Arc<dyn IdentityLookup>>,
        trust_xff: bool,
        tls: bool,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("build forwarding client")?;
        Ok(Self {
            lb,
            identity,
            trust_xff,
            tls,
            client,
        })
    }

    /// Serves connections from the listener until cancellation, then drains
    /// in-flight requests.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        let local = listener.local_addr().ok();
        let handlers = TaskTracker::new();
        loop {
            let (conn, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        debug!("Accept on {:?} returned error (stopping listener): {}", local, err);
                        break;
                    }
                },
            };
            let peer = SocketAddr::new(canonical_ip(peer.ip()), peer.port());
            debug!("Accepted HTTP connection from {} on {:?}", peer, local);
            let proxy = Arc::clone(&self);
            let cancel = cancel.clone();
            handlers.spawn(async move {
                let io = TokioIo::new(conn);
                let service = service_fn(move |req| {
                    let proxy = Arc::clone(&proxy);
                    async move { proxy.handle(req, peer).await }
                });
                let serving = http1::Builder::new().serve_connection(io, service);
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    result = serving => {
                        if let Err(err) = result {
                            debug!("Connection error from {}: {}", peer, err);
                        }
                    }
                }
            });
        }
        drop(listener);
        handlers.close();
        handlers.wait().await;
    }

    async fn handle(
        &self,
        req: Request<Incoming>,
        peer: SocketAddr,
    ) -> Result<Response<Full<Bytes>>, hyper::Error> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        // Start the identity lookup in parallel with the backend pick.
        let whois_task = self.identity.clone().map(|client| {
            tokio::spawn(async move { client.whois(peer).await })
        });

        let backend_addr = match self.lb.pick(Instant::now() + PICK_TIMEOUT).await {
            Ok(addr) => addr,
            Err(err) => {
                error!("Finding backend for {} {}: {}", method, path, err);
                return Ok(error_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Could not find suitable backend for request.",
                ));
            }
        };
        debug!("Picked backend {} for {} {}", backend_addr, method, path);

        let whois = match whois_task {
            Some(task) => match task.await {
                Ok(Ok(profile)) => Some(profile),
                Ok(Err(err)) => {
                    error!("Overlay whois for {}: {:#}", peer, err);
                    None
                }
                Err(err) => {
                    error!("Overlay whois for {}: {}", peer, err);
                    None
                }
            },
            None => None,
        };

        match self.forward(req, peer, backend_addr, whois).await {
            Ok(response) => Ok(response),
            Err(err) => {
                warn!("Proxy error for {} {}: {:#}", method, path, err);
                Ok(error_response(StatusCode::BAD_GATEWAY, "Bad gateway."))
            }
        }
    }

    /// Forwards the request to the picked backend and relays the response.
    async fn forward(
        &self,
        req: Request<Incoming>,
        peer: SocketAddr,
        backend_addr: SocketAddr,
        whois: Option<UserProfile>,
    ) -> Result<Response<Full<Bytes>>> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/");
        let url = format!("http://{}{}", backend_addr, path_and_query);

        let inbound_host = req
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| req.uri().authority().map(|a| a.to_string()));

        let mut headers = HeaderMap::new();
        let mut prior_xff = Vec::new();
        for (name, value) in req.headers() {
            if name == "x-forwarded-for" {
                if let Ok(s) = value.to_str() {
                    prior_xff.push(s.to_string());
                }
                continue;
            }
            if skip_when_forwarding(name) {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }

        if let Some(host) = &inbound_host {
            if let Ok(v) = HeaderValue::from_str(host) {
                headers.insert(HOST, v.clone());
                headers.insert("x-forwarded-host", v);
            }
        }
        let mut xff = if self.trust_xff { prior_xff } else { Vec::new() };
        xff.push(peer.ip().to_string());
        if let Ok(v) = HeaderValue::from_str(&xff.join(", ")) {
            headers.insert("x-forwarded-for", v);
        }
        headers.insert(
            "x-forwarded-proto",
            HeaderValue::from_static(if self.tls { "https" } else { "http" }),
        );

        if let Some(profile) = whois {
            set_identity_header(&mut headers, "tailscale-user-login", &profile.login_name);
            set_identity_header(&mut headers, "tailscale-user-name", &profile.display_name);
            set_identity_header(
                &mut headers,
                "tailscale-user-profile-pic",
                &profile.profile_pic_url,
            );
        }

        let method = req.method().clone();
        let body = req
            .into_body()
            .collect()
            .await
            .context("read request body")?
            .to_bytes();

        let mut outbound = self.client.request(method, &url).headers(headers);
        if !body.is_empty() {
            outbound = outbound.body(body);
        }
        let upstream = outbound.send().await.context("forward to backend")?;

        let mut response = Response::builder().status(upstream.status());
        for (name, value) in upstream.headers() {
            if skip_when_forwarding(name) {
                continue;
            }
            response = response.header(name, value);
        }
        let body = upstream
            .bytes()
            .await
            .context("read backend response body")?;
        response
            .body(Full::new(body))
            .context("assemble response")
    }
}

/// Headers that must not be copied verbatim between the two legs of the
/// proxy: hop-by-hop headers, framing headers the clients recompute, the
/// forwarding trio (rebuilt per request), and the reserved identity prefix.
fn skip_when_forwarding(name: &HeaderName) -> bool {
    const HOP_BY_HOP: &[&str] = &[
        "connection",
        "proxy-connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
        "content-length",
        "host",
        "x-forwarded-host",
        "x-forwarded-proto",
    ];
    let name = name.as_str();
    HOP_BY_HOP.contains(&name) || name.starts_with(IDENTITY_HEADER_PREFIX)
}

/// Sets one identity header, transport-encoding non-ASCII values. Empty
/// values are silently dropped.
fn set_identity_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if value.is_empty() {
        return;
    }
    if let Ok(v) = HeaderValue::from_str(&q_encode(value)) {
        headers.insert(name, v);
    }
}

/// RFC 2047 Q-encoding for header values. Values consisting entirely of
/// printable ASCII pass through unchanged.
fn q_encode(value: &str) -> String {
    let printable_ascii = value.bytes().all(|b| (b' '..=b'~').contains(&b));
    if printable_ascii {
        return value.to_string();
    }
    let mut out = String::from("=?utf-8?q?");
    for b in value.bytes() {
        match b {
            b' ' => out.push('_'),
            b'=' | b'?' | b'_' => push_hex(&mut out, b),
            b'!'..=b'~' => out.push(b as char),
            _ => push_hex(&mut out, b),
        }
    }
    out.push_str("?=");
    out
}

fn push_hex(out: &mut String, b: u8) {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    out.push('=');
    out.push(HEX[usize::from(b >> 4)] as char);
    out.push(HEX[usize::from(b & 0xf)] as char);
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(format!("{}\n", message))));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
