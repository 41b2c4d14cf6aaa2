//! Domain error model.

use thiserror::Error;

use crate::id::{LicenseKeyId, SkuId};

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures plus the two
/// outcomes the allocator can produce under load (`InsufficientInventory`,
/// `ConcurrencyConflict`). Infrastructure concerns belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input). Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A license key string already exists for the SKU (exact, case-sensitive).
    #[error("duplicate license key: {0}")]
    DuplicateKey(String),

    /// The license key is reserved or assigned and cannot be edited/deleted.
    #[error("license key in use: {0}")]
    LicenseInUse(LicenseKeyId),

    /// The SKU still has reserved/assigned keys and cannot be deleted.
    #[error("sku in use: {0}")]
    SkuInUse(SkuId),

    /// A requested record was not found.
    #[error("not found")]
    NotFound,

    /// The SKU's pool cannot cover the requested quantity. Expected business
    /// outcome, not a system fault; the order ledger turns it into `Failed`.
    #[error("insufficient inventory for sku {0}")]
    InsufficientInventory(SkuId),

    /// Transient optimistic-concurrency failure. Retried internally by the
    /// allocator a bounded number of times before surfacing.
    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// The order state machine rejected an event. Programming/integration
    /// error; the order is left unchanged.
    #[error("invalid state transition: {from} cannot accept {event}")]
    InvalidStateTransition {
        from: &'static str,
        event: &'static str,
    },

    /// The fulfillment gateway rejected an outbound signal.
    #[error("gateway error: {0}")]
    Gateway(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::ConcurrencyConflict(msg.into())
    }

    pub fn gateway(msg: impl Into<String>) -> Self {
        Self::Gateway(msg.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }

    /// True for errors the caller may retry (after backing off or reloading).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict(_))
    }
}
