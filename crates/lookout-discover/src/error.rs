//! Error types for the lookout-discover crate.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DiscoverError {
    /// Refused, timed out or unreachable. Never fatal: demotes a tier or
    /// yields an empty scan result.
    #[error("Transport error: {0}")]
    Transport(#[source] std::io::Error),

    #[error("Malformed discovery payload: {0}")]
    ProtocolParse(String),

    #[error("Discovered endpoint at {address} carries no identity token")]
    MissingIdentity { address: String },

    #[error("Unexpected response from {endpoint}: {reason}")]
    UnexpectedResponse { endpoint: String, reason: String },

    /// The test does not apply to this device, e.g. an authenticated call
    /// against a device configured without credentials.
    #[error("Not applicable: {0}")]
    NotApplicable(String),

    #[error("Inventory error: {0}")]
    Inventory(#[from] lookout_store::InventoryError),

    #[error("Credential error: {0}")]
    Secret(#[from] lookout_store::SecretError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DiscoverError>;
