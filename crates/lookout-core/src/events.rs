//! Event types published by the health-check and discovery loops.
//!
//! Events fan out over a `tokio::sync::broadcast` channel owned by the
//! scheduler; subscribers that lag simply miss events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{IdentityToken, ReachabilityTier};

/// Unique identifier for an event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

/// An event emitted by one of the Lookout loops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookoutEvent {
    pub id: EventId,
    pub timestamp: DateTime<Utc>,
    pub source: EventSource,
    pub payload: EventPayload,
}

impl LookoutEvent {
    pub fn new(source: EventSource, payload: EventPayload) -> Self {
        Self {
            id: EventId::new(),
            timestamp: Utc::now(),
            source,
            payload,
        }
    }
}

/// Which loop emitted the event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    HealthCheck,
    Discovery,
}

/// The event payload, tagged by type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event_type")]
pub enum EventPayload {
    // ── Discovery events ──────────────────────────────────────
    /// A previously unknown device was added to the inventory.
    DeviceDiscovered {
        name: String,
        identity: IdentityToken,
        address: String,
        port: u16,
    },
    /// A known device was found at a new address, or came back up.
    DeviceRelocated {
        name: String,
        identity: IdentityToken,
        address: String,
        port: u16,
    },

    // ── Health events ─────────────────────────────────────────
    /// A device's reachability tier differs from the previous pass.
    TierChanged {
        name: String,
        previous: ReachabilityTier,
        current: ReachabilityTier,
    },

    // ── Pass lifecycle events ─────────────────────────────────
    HealthCheckCompleted {
        pass_id: Uuid,
        checked: u32,
        reachable: u32,
        unreachable: u32,
        write_failures: u32,
        duration_ms: u64,
    },
    DiscoveryCompleted {
        pass_id: Uuid,
        found: u32,
        created: u32,
        updated: u32,
        rejected: u32,
        duration_ms: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serialization_roundtrip() {
        let event = LookoutEvent::new(
            EventSource::HealthCheck,
            EventPayload::TierChanged {
                name: "lobby-cam".to_string(),
                previous: ReachabilityTier::Reachable,
                current: ReachabilityTier::UpWithAuth,
            },
        );

        let json = serde_json::to_string(&event).unwrap();
        let deserialized: LookoutEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event.id, deserialized.id);
        assert_eq!(event.payload, deserialized.payload);
    }

    #[test]
    fn event_payload_tags() {
        let payload = EventPayload::DeviceDiscovered {
            name: "cam".to_string(),
            identity: "urn:uuid:1".parse().unwrap(),
            address: "10.0.0.2".to_string(),
            port: 80,
        };

        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"event_type\":\"DeviceDiscovered\""));
        assert!(json.contains("\"identity\":\"urn:uuid:1\""));
    }
}
