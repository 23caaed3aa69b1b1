//! The inventory collaborator contract.

use async_trait::async_trait;

use lookout_core::{Device, IdentityToken, OperatingState, ReachabilityStatus, ReachabilityTier};

/// Errors from inventory operations.
///
/// Callers treat every variant as non-fatal: a failed write is logged and
/// the surrounding pass moves on to the next device.
#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Device already exists: {0}")]
    AlreadyExists(String),

    #[error("Identity {identity} is already registered to device {existing}")]
    IdentityConflict { identity: String, existing: String },

    #[error("Inventory backend error: {0}")]
    Backend(String),
}

/// CRUD access to the device inventory.
///
/// Implementations must allow concurrent reads and must serialize writes
/// at least per device. The core does not add a global lock on top.
#[async_trait]
pub trait Inventory: Send + Sync {
    /// Snapshot of every registered device.
    async fn list_devices(&self) -> Result<Vec<Device>, InventoryError>;

    /// Fetch one device by its inventory name.
    async fn get_device(&self, name: &str) -> Result<Device, InventoryError>;

    /// Find the device registered under a stable identity token.
    async fn find_by_identity(
        &self,
        identity: &IdentityToken,
    ) -> Result<Option<Device>, InventoryError>;

    async fn create_device(&self, device: Device) -> Result<(), InventoryError>;

    /// Replace a stored device record, matched by name.
    async fn update_device(&self, device: Device) -> Result<(), InventoryError>;

    async fn update_operating_state(
        &self,
        name: &str,
        state: OperatingState,
    ) -> Result<(), InventoryError>;

    /// Write one health-check outcome and return the tier it replaced.
    ///
    /// The default is a plain read-modify-write; backends that can update
    /// the tier in place should override it so a concurrent address update
    /// from reconciliation is not clobbered.
    async fn record_reachability(
        &self,
        name: &str,
        status: ReachabilityStatus,
    ) -> Result<ReachabilityTier, InventoryError> {
        let mut device = self.get_device(name).await?;
        let previous = device.tier;
        device.apply_reachability(&status);
        self.update_device(device).await?;
        Ok(previous)
    }
}
