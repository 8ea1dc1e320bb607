//! tailbalance - reverse load balancer for mesh-VPN overlay networks
//!
//! Joins the overlay as a node named by the configuration, opens one
//! virtual listener per configured port, and forwards traffic to a
//! round-robin set of backends kept fresh by DNS re-resolution.
//!
//! # Usage
//!
//! ```bash
//! tailbalance [--hostname NAME] [--state-directory PATH] [--debug] CONFIG [CONFIG...]
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use tailbalance::balance::{
    self, HttpProxy, IdentityLookup, LoadBalancer, Resolver, SystemResolver,
};
use tailbalance::config::{ConfigSource, Configuration, PortConfig};
use tailbalance::{logging, signals, tailnet};

const EXIT_USAGE: u8 = 64;

/// Reverse load balancer for mesh-VPN overlay networks
#[derive(Parser, Debug)]
#[command(name = "tailbalance", version, about, long_about = None)]
struct Cli {
    /// Host name to advertise to the overlay
    #[arg(long, value_name = "NAME")]
    hostname: Option<String>,

    /// Directory to store persistent overlay state in
    #[arg(long, value_name = "PATH")]
    state_directory: Option<PathBuf>,

    /// Show debugging output
    #[arg(long)]
    debug: bool,

    /// Show all debugging output, including the overlay runtime
    #[arg(long)]
    debug_tailscale: bool,

    /// Configuration files; later files take precedence
    #[arg(value_name = "CONFIG", required = true)]
    config: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = match err.kind() {
                clap::error::ErrorKind::DisplayVersion => 0,
                _ => EXIT_USAGE,
            };
            let _ = err.print();
            return ExitCode::from(code);
        }
    };
    logging::init(cli.debug, cli.debug_tailscale);

    let mut cfg = Configuration {
        hostname: cli.hostname.unwrap_or_default(),
        state_dir: cli.state_directory,
        ..Default::default()
    };
    let source = match ConfigSource::load(&cli.config) {
        Ok(source) => source,
        Err(err) => {
            error!("{:#}", err);
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = cfg.fill(&source) {
        error!("{:#}", err);
        return ExitCode::FAILURE;
    }

    let cancel = match signals::shutdown_token() {
        Ok(token) => token,
        Err(err) => {
            error!("{:#}", err);
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = run(cfg, cancel).await {
        error!("{:#}", err);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run(cfg: Configuration, cancel: CancellationToken) -> Result<()> {
    if cfg.hostname.is_empty() {
        bail!("hostname not set in configuration");
    }

    let auth_key = (!cfg.auth_key.is_empty()).then(|| cfg.auth_key.clone());
    let node = tailnet::Node::new(cfg.hostname.clone(), auth_key, cfg.state_dir.is_none());
    node.start(&cancel).await?;
    info!("Host {} connected to the overlay", cfg.hostname);

    let resolver: Arc<dyn Resolver> =
        Arc::new(SystemResolver::from_system_conf().context("initialise DNS resolver")?);

    let listeners = TaskTracker::new();
    for (port, pc) in &cfg.ports {
        let listener = node.listen(*port).await?;
        match pc {
            PortConfig::Tcp(tc) => {
                info!("Listening for TCP port {}", port);
                let lb = Arc::new(LoadBalancer::new(
                    Arc::clone(&resolver),
                    tc.backends.clone(),
                ));
                listeners.spawn(balance::tcp::serve(listener, lb, cancel.clone()));
            }
            PortConfig::Http(hc) => {
                info!("Listening for HTTP port {}", port);
                let lb = Arc::new(LoadBalancer::new(
                    Arc::clone(&resolver),
                    hc.backends.clone(),
                ));
                let identity = hc
                    .whois
                    .then(|| node.local_client() as Arc<dyn IdentityLookup>);
                let proxy = Arc::new(HttpProxy::new(lb, identity, hc.trust_xff, hc.tls)?);
                listeners.spawn(proxy.serve(listener, cancel.clone()));
            }
        }
    }

    cancel.cancelled().await;
    debug!("Shutting down...");
    listeners.close();
    debug!("Waiting for handlers to stop...");
    listeners.wait().await;
    node.close().await;
    Ok(())
}
