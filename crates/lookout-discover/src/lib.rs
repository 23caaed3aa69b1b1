//! lookout-discover: ONVIF camera discovery and reachability for the
//! Lookout gateway.
//!
//! Finds cameras with WS-Discovery (multicast and unicast subnet sweeps),
//! merges them into the device inventory by identity token, and keeps
//! each device's reachability tier current with periodic health checks.

pub mod config;
pub mod discovery;
pub mod error;
pub mod netscan;
pub mod onvif;
pub mod prober;
pub mod reconcile;
pub mod scheduler;
pub mod wsdiscovery;

pub use config::{DiscoverConfig, DiscoveryMode};
pub use error::{DiscoverError, Result};
