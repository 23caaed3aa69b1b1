//! Core domain types for the Lookout device inventory.
//!
//! A [`Device`] is owned by the inventory collaborator. The prober and the
//! reconciliation engine only read devices and request updates to them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LookoutError;

// ── Identity ──────────────────────────────────────────────────────

/// Stable, protocol-assigned reference for a physical device.
///
/// For WS-Discovery this is the `EndpointReference` address (usually
/// `urn:uuid:...`). It survives address changes and is the only key used
/// to match discovered endpoints against the inventory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct IdentityToken(String);

impl IdentityToken {
    /// Build a token from a raw reference, rejecting blank values.
    pub fn new(raw: impl Into<String>) -> Result<Self, LookoutError> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(LookoutError::EmptyIdentity);
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for IdentityToken {
    type Err = LookoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

// ── Device ────────────────────────────────────────────────────────

/// A camera or other network device known to the inventory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Device {
    /// Unique inventory name.
    pub name: String,
    /// Stable endpoint reference. Devices registered by hand may lack one.
    pub identity: Option<IdentityToken>,
    pub address: String,
    pub port: u16,
    pub auth_mode: AuthMode,
    /// Key under which this device's credentials live in the secret store.
    pub secret_ref: String,
    pub tier: ReachabilityTier,
    pub operating_state: OperatingState,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_connected: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: DeviceMetadata,
    pub description: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
}

impl Device {
    /// A freshly registered device: unprobed, unreachable, operating state up.
    pub fn new(name: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            identity: None,
            address: address.into(),
            port,
            auth_mode: AuthMode::default(),
            secret_ref: String::new(),
            tier: ReachabilityTier::Unreachable,
            operating_state: OperatingState::Up,
            last_seen: None,
            last_connected: None,
            metadata: DeviceMetadata::default(),
            description: None,
            labels: Vec::new(),
        }
    }

    pub fn with_identity(mut self, identity: IdentityToken) -> Self {
        self.identity = Some(identity);
        self
    }

    /// `host:port` when the device has a usable network address.
    pub fn endpoint(&self) -> Option<String> {
        let host = self.address.trim();
        if host.is_empty() || self.port == 0 {
            return None;
        }
        Some(format!("{host}:{}", self.port))
    }

    /// Apply the outcome of one health check.
    ///
    /// The tier is replaced wholesale. Timestamps only move forward on a
    /// positive outcome.
    pub fn apply_reachability(&mut self, status: &ReachabilityStatus) {
        self.tier = status.tier;
        if status.tier.is_reachable() {
            self.last_seen = Some(status.checked_at);
            self.last_connected = Some(status.checked_at);
        }
    }
}

/// Descriptive metadata resolved from the device itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceMetadata {
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub firmware_version: Option<String>,
    pub serial_number: Option<String>,
    pub hardware_id: Option<String>,
}

impl DeviceMetadata {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

// ── Discovery ─────────────────────────────────────────────────────

/// One endpoint found by a discovery pass, not yet merged into inventory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoveredRecord {
    /// Proposed inventory name if this record turns out to be new.
    pub name: String,
    /// Records without an identity are rejected by reconciliation.
    pub identity: Option<IdentityToken>,
    pub address: String,
    pub port: u16,
    /// Service URL the device advertised.
    pub xaddr: Option<String>,
    /// Secret reference that authenticated against the device during
    /// discovery, if one did.
    pub secret_ref: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub metadata: DeviceMetadata,
    pub description: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
}

impl DiscoveredRecord {
    pub fn new(identity: Option<IdentityToken>, address: impl Into<String>, port: u16) -> Self {
        let name = identity
            .as_ref()
            .map(|t| t.to_string())
            .unwrap_or_default();
        Self {
            name,
            identity,
            address: address.into(),
            port,
            xaddr: None,
            secret_ref: None,
            scopes: Vec::new(),
            metadata: DeviceMetadata::default(),
            description: None,
            labels: Vec::new(),
        }
    }
}

// ── Reachability ──────────────────────────────────────────────────

/// Discrete reachability classification, ordered by strength of evidence.
///
/// `Ord` follows strength: `UpWithAuth` is the greatest value and
/// `Unreachable` the least.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub enum ReachabilityTier {
    #[default]
    Unreachable,
    Reachable,
    UpWithoutAuth,
    UpWithAuth,
}

impl ReachabilityTier {
    /// Every tier, strongest first.
    pub const DESCENDING: [ReachabilityTier; 4] = [
        ReachabilityTier::UpWithAuth,
        ReachabilityTier::UpWithoutAuth,
        ReachabilityTier::Reachable,
        ReachabilityTier::Unreachable,
    ];

    pub fn is_reachable(self) -> bool {
        self != ReachabilityTier::Unreachable
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::UpWithAuth => "UpWithAuth",
            Self::UpWithoutAuth => "UpWithoutAuth",
            Self::Reachable => "Reachable",
            Self::Unreachable => "Unreachable",
        }
    }
}

impl fmt::Display for ReachabilityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReachabilityTier {
    type Err = LookoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::DESCENDING
            .into_iter()
            .find(|tier| tier.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| LookoutError::InvalidTier(s.to_string()))
    }
}

/// Result of one health check, as written back to the inventory.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReachabilityStatus {
    pub tier: ReachabilityTier,
    pub checked_at: DateTime<Utc>,
}

// ── Enums ─────────────────────────────────────────────────────────

/// How the application-level protocol authenticates against a device.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    None,
    #[default]
    UsernameToken,
    Digest,
    Both,
}

impl AuthMode {
    pub fn requires_credentials(self) -> bool {
        self != AuthMode::None
    }
}

impl FromStr for AuthMode {
    type Err = LookoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "usernametoken" => Ok(Self::UsernameToken),
            "digest" => Ok(Self::Digest),
            "both" => Ok(Self::Both),
            _ => Err(LookoutError::InvalidAuthMode(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum OperatingState {
    #[default]
    Up,
    Down,
}

impl FromStr for OperatingState {
    type Err = LookoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "up" => Ok(Self::Up),
            "down" => Ok(Self::Down),
            _ => Err(LookoutError::InvalidOperatingState(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_ordering_follows_strength() {
        assert!(ReachabilityTier::UpWithAuth > ReachabilityTier::UpWithoutAuth);
        assert!(ReachabilityTier::UpWithoutAuth > ReachabilityTier::Reachable);
        assert!(ReachabilityTier::Reachable > ReachabilityTier::Unreachable);

        let mut sorted = ReachabilityTier::DESCENDING.to_vec();
        sorted.sort();
        sorted.reverse();
        assert_eq!(sorted, ReachabilityTier::DESCENDING.to_vec());
    }

    #[test]
    fn tier_parses_case_insensitively() {
        assert_eq!(
            "upwithoutauth".parse::<ReachabilityTier>().unwrap(),
            ReachabilityTier::UpWithoutAuth
        );
        assert_eq!(
            "bogus".parse::<ReachabilityTier>(),
            Err(LookoutError::InvalidTier("bogus".to_string()))
        );
    }

    #[test]
    fn identity_rejects_blank() {
        assert_eq!(IdentityToken::new("   "), Err(LookoutError::EmptyIdentity));
        let token = IdentityToken::new(" urn:uuid:1234 ").unwrap();
        assert_eq!(token.as_str(), "urn:uuid:1234");
    }

    #[test]
    fn endpoint_requires_address_and_port() {
        assert_eq!(Device::new("cam", "", 80).endpoint(), None);
        assert_eq!(Device::new("cam", "10.0.0.5", 0).endpoint(), None);
        assert_eq!(
            Device::new("cam", "10.0.0.5", 8080).endpoint().as_deref(),
            Some("10.0.0.5:8080")
        );
    }

    #[test]
    fn unreachable_status_keeps_last_seen() {
        let mut device = Device::new("cam", "10.0.0.5", 80);
        let seen = Utc::now();
        device.apply_reachability(&ReachabilityStatus {
            tier: ReachabilityTier::Reachable,
            checked_at: seen,
        });
        assert_eq!(device.last_seen, Some(seen));

        device.apply_reachability(&ReachabilityStatus {
            tier: ReachabilityTier::Unreachable,
            checked_at: Utc::now(),
        });
        assert_eq!(device.tier, ReachabilityTier::Unreachable);
        assert_eq!(device.last_seen, Some(seen));
    }

    #[test]
    fn device_serialization_roundtrip() {
        let device = Device::new("front-door", "192.168.1.20", 80)
            .with_identity(IdentityToken::new("urn:uuid:abc").unwrap());
        let json = serde_json::to_string(&device).unwrap();
        assert!(json.contains("\"identity\":\"urn:uuid:abc\""));
        assert!(json.contains("\"operating_state\":\"Up\""));
        let back: Device = serde_json::from_str(&json).unwrap();
        assert_eq!(back, device);
    }
}
