//! Error taxonomy for the sync core.
//!
//! Every fallible operation in the crate returns `Result<_, SyncError>`.
//! The variants map onto how a caller must react: `Transient` failures
//! leave work queued for the next reconnection, `Rejected` and the ledger
//! guards surface immediately, and `Storage` failures abort the
//! triggering operation because the local cache is the only durable
//! witness to an offline sale.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// The remote store was unreachable at call time (connect failure,
    /// timeout). The triggering mutation stays in the outbox.
    #[error("remote store unreachable: {0}")]
    Transient(String),

    /// The remote store rejected the operation (validation, conflict).
    /// Not retried; surfaced to the caller.
    #[error("remote store rejected operation: {0}")]
    Rejected(String),

    /// A durable local write failed. Must never be silently swallowed.
    #[error("local storage failure: {0}")]
    Storage(String),

    /// The requested payment-status transition is not in the state machine.
    #[error("invalid payment transition: {from} -> {to}")]
    InvalidTransition { from: &'static str, to: &'static str },

    /// Cash tender below the final total.
    #[error("amount tendered {tendered:.2} is less than total {total:.2}")]
    InsufficientTender { tendered: f64, total: f64 },

    /// Voiding requires an authoritative (remote) id and a named actor.
    #[error("cannot void record: {0}")]
    VoidRejected(&'static str),

    #[error("record not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    /// Malformed payload or record that cannot be normalized.
    #[error("invalid record: {0}")]
    Invalid(String),
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        SyncError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Invalid(e.to_string())
    }
}

impl SyncError {
    /// True when retrying after reconnection can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transient(_))
    }
}
