//! Load balancing: the endpoint engine and its protocol front-ends.

pub mod backend;
pub mod engine;
pub mod http;
pub mod resolver;
pub mod tcp;

pub use backend::{BackendSpec, Target};
pub use engine::{LoadBalancer, PickError, RefreshError};
pub use http::{HttpProxy, IdentityLookup, UserProfile};
pub use resolver::{Resolver, SrvRecord, SystemResolver};
