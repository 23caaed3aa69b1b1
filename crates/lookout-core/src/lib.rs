//! lookout-core: Shared types and error handling for the Lookout camera gateway.
//!
//! This crate provides the foundational types used across all Lookout components:
//! - Device records as held by the inventory
//! - Reachability tiers and operating states
//! - Discovery records produced by a discovery pass
//! - Event types published by the scheduler

pub mod error;
pub mod events;
pub mod types;

pub use error::LookoutError;
pub use types::{
    AuthMode, Device, DeviceMetadata, DiscoveredRecord, IdentityToken, OperatingState,
    ReachabilityStatus, ReachabilityTier,
};
