//! Lookout Store: the collaborator boundaries the gateway core talks to.
//!
//! The core never owns device records or secrets. It reads and requests
//! updates through the [`Inventory`] and [`SecretStore`] traits. The
//! in-memory implementations here serialize writes per device, so
//! unrelated devices never contend on a shared lock.

pub mod inventory;
pub mod memory;
pub mod secrets;

pub use inventory::{Inventory, InventoryError};
pub use memory::MemoryInventory;
pub use secrets::{
    get_credentials_with_retry, Credentials, SecretError, SecretStore, StaticSecretStore,
};
