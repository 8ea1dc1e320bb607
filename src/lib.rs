//! tailbalance library crate
//!
//! A reverse load balancer that lives on a mesh-VPN overlay: virtual
//! listeners on the overlay node forward TCP connections and HTTP requests
//! to a round-robin queue of backends kept fresh by DNS re-resolution.
//!
//! # Modules
//!
//! - [`balance`] - Engine, backend specs, resolver, TCP and HTTP front-ends
//! - [`config`] - INI configuration binding
//! - [`deque`] - Ring-buffer queue behind the round-robin rotation
//! - [`tailnet`] - Overlay node lifecycle and local API client
//! - [`logging`] - tracing subscriber setup
//! - [`signals`] - graceful-shutdown wiring

pub mod balance;
pub mod config;
pub mod deque;
pub mod logging;
pub mod signals;
pub mod tailnet;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
