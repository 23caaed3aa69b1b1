use thiserror::Error;

/// Errors raised while interpreting shared Lookout values.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum LookoutError {
    #[error("Unknown reachability tier: {0}")]
    InvalidTier(String),

    #[error("Unknown auth mode: {0}")]
    InvalidAuthMode(String),

    #[error("Unknown operating state: {0}")]
    InvalidOperatingState(String),

    #[error("Identity token must not be empty")]
    EmptyIdentity,
}
