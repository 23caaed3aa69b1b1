//! Reconciliation: merge a discovery batch into the inventory.
//!
//! [`reconcile`] is a pure function from (batch, inventory snapshot) to a
//! plan of creations and updates. [`apply`] performs the plan against an
//! [`Inventory`]. Identity tokens are the only matching key; addresses
//! change under DHCP and are never used to match.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use lookout_core::{
    AuthMode, Device, DiscoveredRecord, IdentityToken, OperatingState, ReachabilityTier,
};
use lookout_store::Inventory;

/// A known device seen again at a different endpoint, or while down.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceUpdate {
    pub name: String,
    pub identity: IdentityToken,
    pub previous_address: String,
    pub previous_port: u16,
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub received: u32,
    pub new: u32,
    pub updated: u32,
    pub unchanged: u32,
    pub duplicates: u32,
    /// Records without an identity token.
    pub rejected: u32,
}

/// The plan produced by [`reconcile`].
#[derive(Debug, Clone, Default)]
pub struct ReconcileOutcome {
    pub new_records: Vec<DiscoveredRecord>,
    pub updates: Vec<DeviceUpdate>,
    pub summary: ReconcileSummary,
}

impl ReconcileOutcome {
    pub fn is_noop(&self) -> bool {
        self.new_records.is_empty() && self.updates.is_empty()
    }
}

/// Settings applied to devices created from discovery.
#[derive(Debug, Clone)]
pub struct ProvisionDefaults {
    pub auth_mode: AuthMode,
    pub secret_ref: String,
}

/// Writes performed by [`apply`].
#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    pub created: Vec<Device>,
    pub updated: Vec<Device>,
    pub write_failures: u32,
}

/// Compute the inventory changes implied by `batch`.
///
/// First sighting of a token wins: later records in the batch carrying a
/// token that was already handled are dropped, whether it matched the
/// inventory or was new.
pub fn reconcile(batch: Vec<DiscoveredRecord>, inventory: &[Device]) -> ReconcileOutcome {
    let mut known: HashMap<&IdentityToken, &Device> = HashMap::new();
    for device in inventory {
        match &device.identity {
            Some(token) => {
                known.insert(token, device);
            }
            None => tracing::warn!(
                device = %device.name,
                "Device has no identity token, it cannot be matched by discovery"
            ),
        }
    }

    let mut outcome = ReconcileOutcome::default();
    let mut handled: HashSet<IdentityToken> = HashSet::new();

    for record in batch {
        outcome.summary.received += 1;

        let Some(token) = record.identity.clone() else {
            tracing::warn!(
                address = %record.address,
                port = record.port,
                "Discovered device has no identity token, ignoring"
            );
            outcome.summary.rejected += 1;
            continue;
        };

        if !handled.insert(token.clone()) {
            tracing::debug!(identity = %token, "Device already handled in this batch");
            outcome.summary.duplicates += 1;
            continue;
        }

        let Some(existing) = known.get(&token) else {
            outcome.summary.new += 1;
            outcome.new_records.push(record);
            continue;
        };

        let same_endpoint = existing.address == record.address && existing.port == record.port;
        if same_endpoint && existing.operating_state == OperatingState::Up {
            tracing::debug!(
                device = %existing.name,
                address = %record.address,
                "Re-discovered existing device at the same network address, nothing to do"
            );
            outcome.summary.unchanged += 1;
            continue;
        }

        if !same_endpoint {
            tracing::info!(
                device = %existing.name,
                old = %format!("{}:{}", existing.address, existing.port),
                new = %format!("{}:{}", record.address, record.port),
                "Existing device has been discovered with a different network address"
            );
        }
        outcome.summary.updated += 1;
        outcome.updates.push(DeviceUpdate {
            name: existing.name.clone(),
            identity: token,
            previous_address: existing.address.clone(),
            previous_port: existing.port,
            address: record.address,
            port: record.port,
        });
    }

    outcome
}

/// Write `outcome` to `inventory`. Each failed write is logged and counted;
/// the rest of the batch still goes through.
pub async fn apply(
    outcome: &ReconcileOutcome,
    inventory: &dyn Inventory,
    defaults: &ProvisionDefaults,
) -> ApplyReport {
    let mut report = ApplyReport::default();

    for update in &outcome.updates {
        // Re-read so a tier written by a concurrent health check survives.
        let mut device = match inventory.get_device(&update.name).await {
            Ok(device) => device,
            Err(e) => {
                tracing::error!(device = %update.name, error = %e, "Could not load device for update");
                report.write_failures += 1;
                continue;
            }
        };
        device.address = update.address.clone();
        device.port = update.port;
        device.operating_state = OperatingState::Up;

        match inventory.update_device(device.clone()).await {
            Ok(()) => report.updated.push(device),
            Err(e) => {
                tracing::error!(
                    device = %update.name,
                    error = %e,
                    "There was an error updating the network address for an existing device"
                );
                report.write_failures += 1;
            }
        }
    }

    for record in &outcome.new_records {
        let device = provision(record, defaults);
        match inventory.create_device(device.clone()).await {
            Ok(()) => {
                tracing::info!(
                    device = %device.name,
                    address = %device.address,
                    port = device.port,
                    "Added discovered device"
                );
                report.created.push(device);
            }
            Err(e) => {
                tracing::warn!(device = %device.name, error = %e, "Could not add discovered device");
                report.write_failures += 1;
            }
        }
    }

    report
}

/// Build the inventory record for a newly discovered device.
pub fn provision(record: &DiscoveredRecord, defaults: &ProvisionDefaults) -> Device {
    let name = match (&record.name, &record.identity) {
        (name, _) if !name.trim().is_empty() => name.clone(),
        (_, Some(token)) => token.to_string(),
        (_, None) => format!("{}:{}", record.address, record.port),
    };
    let mut device = Device::new(name, &record.address, record.port);
    device.identity = record.identity.clone();
    device.auth_mode = defaults.auth_mode;
    device.secret_ref = record
        .secret_ref
        .clone()
        .unwrap_or_else(|| defaults.secret_ref.clone());
    device.tier = ReachabilityTier::Unreachable;
    device.operating_state = OperatingState::Up;
    device.metadata = record.metadata.clone();
    device.description = record.description.clone();
    device.labels = record.labels.clone();
    device
}

#[cfg(test)]
mod tests {
    use super::*;
    use lookout_store::MemoryInventory;

    fn token(raw: &str) -> IdentityToken {
        raw.parse().unwrap()
    }

    fn record(tok: Option<&str>, address: &str, port: u16) -> DiscoveredRecord {
        DiscoveredRecord::new(tok.map(token), address, port)
    }

    fn known(name: &str, tok: &str, address: &str, port: u16) -> Device {
        Device::new(name, address, port).with_identity(token(tok))
    }

    fn defaults() -> ProvisionDefaults {
        ProvisionDefaults {
            auth_mode: AuthMode::UsernameToken,
            secret_ref: "credentials001".to_string(),
        }
    }

    #[test]
    fn test_duplicate_token_across_methods_yields_one_record() {
        // Same camera answered both the multicast and the unicast probe.
        let batch = vec![
            record(Some("urn:uuid:X"), "10.0.0.7", 80),
            record(Some("urn:uuid:X"), "10.0.0.7", 80),
        ];
        let outcome = reconcile(batch, &[]);
        assert_eq!(outcome.new_records.len(), 1);
        assert!(outcome.updates.is_empty());
        assert_eq!(outcome.summary.duplicates, 1);
    }

    #[test]
    fn test_address_change_yields_single_update() {
        let mut inventory = known("cam-y", "urn:uuid:Y", "10.0.0.5", 80);
        inventory.operating_state = OperatingState::Down;

        let outcome = reconcile(vec![record(Some("urn:uuid:Y"), "10.0.0.9", 80)], &[inventory]);
        assert!(outcome.new_records.is_empty());
        assert_eq!(
            outcome.updates,
            vec![DeviceUpdate {
                name: "cam-y".to_string(),
                identity: token("urn:uuid:Y"),
                previous_address: "10.0.0.5".to_string(),
                previous_port: 80,
                address: "10.0.0.9".to_string(),
                port: 80,
            }]
        );
    }

    #[test]
    fn test_down_device_at_same_address_is_brought_up() {
        let mut inventory = known("cam-y", "urn:uuid:Y", "10.0.0.5", 80);
        inventory.operating_state = OperatingState::Down;
        let outcome = reconcile(vec![record(Some("urn:uuid:Y"), "10.0.0.5", 80)], &[inventory]);
        assert_eq!(outcome.updates.len(), 1);
        assert_eq!(outcome.summary.unchanged, 0);
    }

    #[test]
    fn test_known_token_then_duplicate_is_dropped() {
        let inventory = [known("cam-y", "urn:uuid:Y", "10.0.0.5", 80)];
        let batch = vec![
            record(Some("urn:uuid:Y"), "10.0.0.9", 80),
            record(Some("urn:uuid:Y"), "10.0.0.10", 80),
        ];
        let outcome = reconcile(batch, &inventory);
        assert_eq!(outcome.updates.len(), 1);
        assert_eq!(outcome.updates[0].address, "10.0.0.9");
        assert_eq!(outcome.summary.duplicates, 1);
    }

    #[test]
    fn test_tokenless_inventory_device_is_never_matched() {
        let inventory = [Device::new("manual", "10.0.0.5", 80)];
        let outcome = reconcile(vec![record(Some("urn:uuid:Z"), "10.0.0.5", 80)], &inventory);
        assert_eq!(outcome.new_records.len(), 1);
        assert!(outcome.updates.is_empty());
    }

    #[tokio::test]
    async fn test_tokenless_records_cause_no_mutations() {
        let inv = MemoryInventory::with_devices([known("cam-y", "urn:uuid:Y", "10.0.0.5", 80)]);
        let before = inv.list_devices().await.unwrap();

        let batch = vec![record(None, "10.0.0.5", 80), record(None, "10.0.0.6", 80)];
        let outcome = reconcile(batch, &before);
        assert!(outcome.is_noop());
        assert_eq!(outcome.summary.rejected, 2);

        let report = apply(&outcome, &inv, &defaults()).await;
        assert!(report.created.is_empty() && report.updated.is_empty());
        assert_eq!(inv.list_devices().await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_apply_then_reconcile_is_idempotent() {
        let inv = MemoryInventory::with_devices([known("cam-y", "urn:uuid:Y", "10.0.0.5", 80)]);
        let batch = vec![
            record(Some("urn:uuid:Y"), "10.0.0.9", 8080),
            record(Some("urn:uuid:new"), "10.0.0.20", 80),
        ];

        let first = reconcile(batch.clone(), &inv.list_devices().await.unwrap());
        let report = apply(&first, &inv, &defaults()).await;
        assert_eq!(report.created.len(), 1);
        assert_eq!(report.updated.len(), 1);
        assert_eq!(report.write_failures, 0);

        let second = reconcile(batch, &inv.list_devices().await.unwrap());
        assert!(second.is_noop());
        assert_eq!(second.summary.unchanged, 2);
    }

    #[tokio::test]
    async fn test_apply_keeps_concurrent_tier_and_sets_defaults() {
        let inv = MemoryInventory::with_devices([known("cam-y", "urn:uuid:Y", "10.0.0.5", 80)]);
        let outcome = reconcile(
            vec![
                record(Some("urn:uuid:Y"), "10.0.0.9", 80),
                record(Some("urn:uuid:new"), "10.0.0.20", 80),
            ],
            &inv.list_devices().await.unwrap(),
        );

        // A health check lands between reconcile and apply.
        inv.record_reachability(
            "cam-y",
            lookout_core::ReachabilityStatus {
                tier: ReachabilityTier::UpWithAuth,
                checked_at: chrono::Utc::now(),
            },
        )
        .await
        .unwrap();

        apply(&outcome, &inv, &defaults()).await;

        let moved = inv.get_device("cam-y").await.unwrap();
        assert_eq!(moved.address, "10.0.0.9");
        assert_eq!(moved.tier, ReachabilityTier::UpWithAuth);

        let created = inv.get_device("urn:uuid:new").await.unwrap();
        assert_eq!(created.secret_ref, "credentials001");
        assert_eq!(created.auth_mode, AuthMode::UsernameToken);
        assert_eq!(created.tier, ReachabilityTier::Unreachable);
        assert_eq!(created.operating_state, OperatingState::Up);
    }

    #[tokio::test]
    async fn test_apply_counts_failed_writes_and_continues() {
        let inv = MemoryInventory::with_devices([known("taken", "urn:uuid:A", "10.0.0.5", 80)]);
        let mut clash = record(Some("urn:uuid:B"), "10.0.0.6", 80);
        clash.name = "taken".to_string();
        let outcome = reconcile(
            vec![clash, record(Some("urn:uuid:C"), "10.0.0.7", 80)],
            &inv.list_devices().await.unwrap(),
        );

        let report = apply(&outcome, &inv, &defaults()).await;
        assert_eq!(report.write_failures, 1);
        assert_eq!(report.created.len(), 1);
        assert_eq!(report.created[0].name, "urn:uuid:C");
    }
}
