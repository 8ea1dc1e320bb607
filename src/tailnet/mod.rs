//! Overlay-node integration.
//!
//! The balancer runs beside the host's mesh daemon rather than embedding an
//! overlay runtime: virtual listeners are ordinary dual-stack TCP listeners
//! (the daemon owns interface scoping and firewalling), and identity,
//! status, and session lifetime go through the daemon's local API.

mod local_api;

pub use local_api::{
    LocalApiClient, LocalApiEndpoint, NodeStatus, WhoIsResponse, DEFAULT_SOCKET_PATH,
};

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long the shutdown logout may take before it is abandoned.
const LOGOUT_TIMEOUT: Duration = Duration::from_secs(10);

/// This host's presence on the overlay.
pub struct Node {
    hostname: String,
    auth_key: Option<String>,
    /// Ephemeral nodes log out on close so they do not linger.
    ephemeral: bool,
    api: Arc<LocalApiClient>,
}

impl Node {
    pub fn new(hostname: String, auth_key: Option<String>, ephemeral: bool) -> Self {
        Self::with_endpoint(
            hostname,
            auth_key,
            ephemeral,
            LocalApiEndpoint::Unix(DEFAULT_SOCKET_PATH.into()),
        )
    }

    pub fn with_endpoint(
        hostname: String,
        auth_key: Option<String>,
        ephemeral: bool,
        endpoint: LocalApiEndpoint,
    ) -> Self {
        Self {
            hostname,
            auth_key,
            ephemeral,
            api: Arc::new(LocalApiClient::new(endpoint)),
        }
    }

    /// Verifies the daemon is reachable, submits the auth key if the node
    /// still needs to log in, and starts a background task that reports the
    /// auth URL or the assigned overlay addresses.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        let status = self
            .api
            .status()
            .await
            .context("query mesh daemon (is it running?)")?;
        if let Some(self_node) = &status.self_node {
            if !self_node.host_name.is_empty() && self_node.host_name != self.hostname {
                warn!(
                    "Overlay node name is {:?} but the configuration wants {:?}",
                    self_node.host_name, self.hostname
                );
            }
        }
        if status.needs_login() {
            if let Some(key) = &self.auth_key {
                info!("Submitting auth key to the mesh daemon");
                if let Err(err) = self.api.start_with_auth_key(key).await {
                    warn!("Auth key submission failed: {:#}", err);
                }
            }
        }

        let api = Arc::clone(&self.api);
        let cancel = cancel.clone();
        tokio::spawn(log_startup_info(api, cancel));
        Ok(())
    }

    /// Opens the virtual listener for one port. Binds dual-stack where the
    /// platform allows it.
    pub async fn listen(&self, port: u16) -> Result<TcpListener> {
        let v6 = SocketAddr::from((Ipv6Addr::UNSPECIFIED, port));
        match TcpListener::bind(v6).await {
            Ok(listener) => Ok(listener),
            Err(_) => {
                let v4 = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
                TcpListener::bind(v4)
                    .await
                    .with_context(|| format!("listen on port {}", port))
            }
        }
    }

    /// Identity client for this node's daemon.
    pub fn local_client(&self) -> Arc<LocalApiClient> {
        Arc::clone(&self.api)
    }

    /// Shuts the node down. Ephemeral nodes log out, bounded in time, so a
    /// hung daemon cannot wedge process exit.
    pub async fn close(&self) {
        if !self.ephemeral {
            return;
        }
        debug!("Logging out...");
        match tokio::time::timeout(LOGOUT_TIMEOUT, self.api.logout()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!("Failed to log out: {:#}", err),
            Err(_) => error!("Failed to log out: timed out"),
        }
    }
}

/// Polls daemon status every couple of seconds until the node has overlay
/// addresses, surfacing the login URL while authentication is pending.
async fn log_startup_info(api: Arc<LocalApiClient>, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(Duration::from_secs(2));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut prev_auth_url = String::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Stopping startup info poll");
                return;
            }
            _ = tick.tick() => {}
        }
        let status = match api.status().await {
            Ok(status) => status,
            Err(err) => {
                error!("Unable to query overlay status (will retry): {:#}", err);
                continue;
            }
        };
        if status.needs_login() {
            if !status.auth_url.is_empty() && status.auth_url != prev_auth_url {
                info!(
                    "To start this load balancer, set auth-key in the configuration or go to: {}",
                    status.auth_url
                );
                prev_auth_url = status.auth_url;
            }
        } else if !status.addresses.is_empty() {
            let addrs = status
                .addresses
                .iter()
                .map(|a| a.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            info!("Listening on overlay addresses: {}", addrs);
            return;
        } else {
            debug!(
                "Backend state = {:?} and has no addresses",
                status.backend_state
            );
        }
    }
}
