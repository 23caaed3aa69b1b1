//! In-memory inventory with per-device locking.
//!
//! The outer map lock is held to look up a device handle, or for the
//! whole of a create. Every read-modify-write then happens under that
//! device's own mutex.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use lookout_core::{Device, IdentityToken, OperatingState, ReachabilityStatus, ReachabilityTier};

use crate::inventory::{Inventory, InventoryError};

type DeviceHandle = Arc<Mutex<Device>>;

/// Thread-safe in-memory device inventory.
///
/// Clone is cheap (inner Arc) and clones share the same devices.
#[derive(Clone, Default)]
pub struct MemoryInventory {
    devices: Arc<RwLock<HashMap<String, DeviceHandle>>>,
}

impl MemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an inventory pre-populated with statically registered devices.
    /// Later entries with a duplicate name replace earlier ones.
    pub fn with_devices(devices: impl IntoIterator<Item = Device>) -> Self {
        let map = devices
            .into_iter()
            .map(|d| (d.name.clone(), Arc::new(Mutex::new(d))))
            .collect();
        Self {
            devices: Arc::new(RwLock::new(map)),
        }
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }

    /// Acquire the critical section for one device.
    ///
    /// Holding the guard blocks other writers of this device only.
    /// Mutations made through the guard are visible to later readers.
    pub async fn lock_device(&self, name: &str) -> Result<OwnedMutexGuard<Device>, InventoryError> {
        let handle = self.handle(name).await?;
        Ok(handle.lock_owned().await)
    }

    async fn handle(&self, name: &str) -> Result<DeviceHandle, InventoryError> {
        self.devices
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| InventoryError::NotFound(name.to_string()))
    }

    async fn handles(&self) -> Vec<DeviceHandle> {
        self.devices.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl Inventory for MemoryInventory {
    async fn list_devices(&self) -> Result<Vec<Device>, InventoryError> {
        let mut devices = Vec::new();
        for handle in self.handles().await {
            devices.push(handle.lock().await.clone());
        }
        devices.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(devices)
    }

    async fn get_device(&self, name: &str) -> Result<Device, InventoryError> {
        let handle = self.handle(name).await?;
        let device = handle.lock().await.clone();
        Ok(device)
    }

    async fn find_by_identity(
        &self,
        identity: &IdentityToken,
    ) -> Result<Option<Device>, InventoryError> {
        for handle in self.handles().await {
            let device = handle.lock().await;
            if device.identity.as_ref() == Some(identity) {
                return Ok(Some(device.clone()));
            }
        }
        Ok(None)
    }

    async fn create_device(&self, device: Device) -> Result<(), InventoryError> {
        // The identity scan and the insert happen under one write guard.
        let mut devices = self.devices.write().await;
        if devices.contains_key(&device.name) {
            return Err(InventoryError::AlreadyExists(device.name));
        }
        if let Some(identity) = &device.identity {
            for handle in devices.values() {
                let existing = handle.lock().await;
                if existing.identity.as_ref() == Some(identity) {
                    return Err(InventoryError::IdentityConflict {
                        identity: identity.to_string(),
                        existing: existing.name.clone(),
                    });
                }
            }
        }
        tracing::debug!(device = %device.name, "Device added to inventory");
        devices.insert(device.name.clone(), Arc::new(Mutex::new(device)));
        Ok(())
    }

    async fn update_device(&self, device: Device) -> Result<(), InventoryError> {
        let handle = self.handle(&device.name).await?;
        *handle.lock().await = device;
        Ok(())
    }

    async fn update_operating_state(
        &self,
        name: &str,
        state: OperatingState,
    ) -> Result<(), InventoryError> {
        let handle = self.handle(name).await?;
        handle.lock().await.operating_state = state;
        Ok(())
    }

    async fn record_reachability(
        &self,
        name: &str,
        status: ReachabilityStatus,
    ) -> Result<ReachabilityTier, InventoryError> {
        let handle = self.handle(name).await?;
        let mut device = handle.lock().await;
        let previous = device.tier;
        device.apply_reachability(&status);
        Ok(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn camera(name: &str, token: &str) -> Device {
        Device::new(name, "10.0.0.10", 80).with_identity(token.parse().unwrap())
    }

    #[tokio::test]
    async fn create_rejects_duplicate_name_and_identity() {
        let inv = MemoryInventory::new();
        inv.create_device(camera("a", "urn:uuid:1")).await.unwrap();

        let dup_name = inv.create_device(camera("a", "urn:uuid:2")).await;
        assert!(matches!(dup_name, Err(InventoryError::AlreadyExists(_))));

        let dup_identity = inv.create_device(camera("b", "urn:uuid:1")).await;
        assert!(matches!(
            dup_identity,
            Err(InventoryError::IdentityConflict { existing, .. }) if existing == "a"
        ));
        assert_eq!(inv.len().await, 1);
    }

    #[tokio::test]
    async fn update_unknown_device_is_not_found() {
        let inv = MemoryInventory::new();
        let err = inv.update_device(camera("ghost", "urn:uuid:9")).await;
        assert!(matches!(err, Err(InventoryError::NotFound(n)) if n == "ghost"));
    }

    #[tokio::test]
    async fn record_reachability_returns_previous_tier() {
        let inv = MemoryInventory::with_devices([camera("a", "urn:uuid:1")]);
        let now = Utc::now();
        let previous = inv
            .record_reachability(
                "a",
                ReachabilityStatus {
                    tier: ReachabilityTier::UpWithAuth,
                    checked_at: now,
                },
            )
            .await
            .unwrap();
        assert_eq!(previous, ReachabilityTier::Unreachable);

        let stored = inv.get_device("a").await.unwrap();
        assert_eq!(stored.tier, ReachabilityTier::UpWithAuth);
        assert_eq!(stored.last_seen, Some(now));
    }

    #[tokio::test]
    async fn find_by_identity_ignores_devices_without_token() {
        let inv = MemoryInventory::with_devices([
            Device::new("manual", "10.0.0.3", 80),
            camera("auto", "urn:uuid:7"),
        ]);
        let token: IdentityToken = "urn:uuid:7".parse().unwrap();
        let found = inv.find_by_identity(&token).await.unwrap().unwrap();
        assert_eq!(found.name, "auto");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creates_with_same_identity_admit_one() {
        for _ in 0..50 {
            let inv = MemoryInventory::new();
            let tasks: Vec<_> = (0..4)
                .map(|i| {
                    let inv = inv.clone();
                    tokio::spawn(async move {
                        inv.create_device(camera(&format!("cam-{i}"), "urn:uuid:same")).await
                    })
                })
                .collect();

            let mut admitted = 0;
            for task in tasks {
                if task.await.unwrap().is_ok() {
                    admitted += 1;
                }
            }
            assert_eq!(admitted, 1);
            assert_eq!(inv.len().await, 1);
        }
    }
}
