//! Minimal client for the mesh daemon's local API.
//!
//! The daemon serves a private HTTP API on a Unix socket; a TCP endpoint is
//! supported for tests. Only the handful of endpoints the balancer consumes
//! are wrapped: status, whois, logout, and auth-key submission.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::HOST;
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio::net::{TcpStream, UnixStream};
use tokio_util::either::Either;
use tracing::trace;

use crate::balance::http::{IdentityLookup, UserProfile};

/// Default location of the daemon's API socket on Linux.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/tailscale/tailscaled.sock";

/// Dummy authority used in request URIs; the daemon routes on path only.
const LOCAL_API_HOST: &str = "local-tailscaled.sock";

/// Where to reach the daemon's local API.
#[derive(Debug, Clone)]
pub enum LocalApiEndpoint {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

pub struct LocalApiClient {
    endpoint: LocalApiEndpoint,
}

impl LocalApiClient {
    pub fn new(endpoint: LocalApiEndpoint) -> Self {
        Self { endpoint }
    }

    /// Client for the platform-default socket path.
    pub fn default_unix() -> Self {
        Self::new(LocalApiEndpoint::Unix(PathBuf::from(DEFAULT_SOCKET_PATH)))
    }

    /// Current daemon status.
    pub async fn status(&self) -> Result<NodeStatus> {
        let body = self
            .call(Method::GET, "/localapi/v0/status", Bytes::new())
            .await?;
        serde_json::from_slice(&body).context("decode status response")
    }

    /// Resolves the overlay peer behind `remote` to its user.
    pub async fn whois_addr(&self, remote: SocketAddr) -> Result<WhoIsResponse> {
        let path = format!("/localapi/v0/whois?addr={}", remote);
        let body = self.call(Method::GET, &path, Bytes::new()).await?;
        serde_json::from_slice(&body).context("decode whois response")
    }

    /// Logs the node out of the overlay.
    pub async fn logout(&self) -> Result<()> {
        self.call(Method::POST, "/localapi/v0/logout", Bytes::new())
            .await?;
        Ok(())
    }

    /// Asks the daemon to bring the node up with the given auth key.
    pub async fn start_with_auth_key(&self, auth_key: &str) -> Result<()> {
        let body = serde_json::to_vec(&serde_json::json!({ "AuthKey": auth_key }))
            .context("encode start options")?;
        self.call(Method::POST, "/localapi/v0/start", Bytes::from(body))
            .await?;
        Ok(())
    }

    async fn call(&self, method: Method, path_query: &str, body: Bytes) -> Result<Bytes> {
        trace!("Local API {} {}", method, path_query);
        let stream = match &self.endpoint {
            LocalApiEndpoint::Unix(path) => Either::Left(
                UnixStream::connect(path)
                    .await
                    .with_context(|| format!("connect to mesh daemon at {}", path.display()))?,
            ),
            LocalApiEndpoint::Tcp(addr) => Either::Right(
                TcpStream::connect(addr)
                    .await
                    .with_context(|| format!("connect to mesh daemon at {}", addr))?,
            ),
        };
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .context("local API handshake")?;
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let request = Request::builder()
            .method(method)
            .uri(path_query)
            .header(HOST, LOCAL_API_HOST)
            .body(Full::new(body))
            .context("build local API request")?;
        let response = sender
            .send_request(request)
            .await
            .context("local API request")?;
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .context("read local API response")?
            .to_bytes();
        if !status.is_success() {
            bail!(
                "local API {}: {}: {}",
                path_query,
                status,
                String::from_utf8_lossy(&body).trim()
            );
        }
        Ok(body)
    }
}

#[async_trait]
impl IdentityLookup for LocalApiClient {
    async fn whois(&self, remote: SocketAddr) -> Result<UserProfile> {
        let response = self.whois_addr(remote).await?;
        let profile = response.user_profile;
        Ok(UserProfile {
            login_name: profile.login_name,
            display_name: profile.display_name,
            profile_pic_url: profile.profile_pic_url,
        })
    }
}

/// Subset of the daemon's status payload the balancer reads.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeStatus {
    #[serde(rename = "BackendState", default)]
    pub backend_state: String,
    #[serde(rename = "AuthURL", default)]
    pub auth_url: String,
    #[serde(rename = "TailscaleIPs", default)]
    pub addresses: Vec<std::net::IpAddr>,
    #[serde(rename = "Self", default)]
    pub self_node: Option<PeerStatus>,
}

impl NodeStatus {
    pub fn needs_login(&self) -> bool {
        self.backend_state == "NeedsLogin"
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PeerStatus {
    #[serde(rename = "HostName", default)]
    pub host_name: String,
}

/// Whois payload: the user profile behind an overlay address.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WhoIsResponse {
    #[serde(rename = "UserProfile", default)]
    pub user_profile: WhoIsUserProfile,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WhoIsUserProfile {
    #[serde(rename = "LoginName", default)]
    pub login_name: String,
    #[serde(rename = "DisplayName", default)]
    pub display_name: String,
    #[serde(rename = "ProfilePicURL", default)]
    pub profile_pic_url: String,
}
