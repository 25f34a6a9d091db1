//! Error types for quota enforcement.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for quotamesh operations.
#[derive(Error, Debug)]
pub enum QuotaError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A bandwidth or bucket configuration that cannot be built
    #[error("Invalid bandwidth: {0}")]
    InvalidBandwidth(String),

    /// A profile entry that could not be compiled
    #[error("Malformed profile '{name}': {reason}")]
    MalformedProfile { name: String, reason: String },

    /// Entries of a profile batch that were not applied, with the reason
    #[error("Rejected profiles: {}", describe_rejected(.0))]
    ProfilesRejected(Vec<(String, String)>),

    /// No enabled profile with this name
    #[error("Unknown quota: {0}")]
    UnknownQuota(String),

    /// The client identity could not be determined
    #[error("Key resolution failed: {0}")]
    KeyResolution(String),

    /// Shared store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl QuotaError {
    /// Whether this error most likely points at a configuration mistake
    /// rather than a transient outage.
    pub fn is_misconfiguration(&self) -> bool {
        matches!(
            self,
            QuotaError::UnknownQuota(_)
                | QuotaError::KeyResolution(_)
                | QuotaError::MalformedProfile { .. }
                | QuotaError::ProfilesRejected(_)
                | QuotaError::InvalidBandwidth(_)
                | QuotaError::Config(_)
        )
    }

    /// Whether this error comes from the shared store.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, QuotaError::Store(_))
    }
}

fn describe_rejected(rejected: &[(String, String)]) -> String {
    rejected
        .iter()
        .map(|(name, reason)| format!("{} ({})", name, reason))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type alias for quotamesh operations.
pub type Result<T> = std::result::Result<T, QuotaError>;
