//! Error types for the fleet rollout reconciliation engine.
//!
//! The engine distinguishes store-level failures (transient, retried by the next
//! reconciler tick) from policy/data-shape failures (fatal for one fleet's tick, but
//! never for the process). See [`StoreError`] and [`ReconcileError`].

#![deny(clippy::unwrap_used, clippy::expect_used)]
#![warn(missing_docs, rust_2018_idioms)]

/// Errors surfaced by the store/dispatch boundary (§6 of the design).
///
/// All variants here are treated as transient by the reconciler: the current tick
/// aborts the affected fleet and logs, relying on the next tick to retry.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The named fleet does not exist in the store.
    #[error("fleet not found: org={org_id} fleet={fleet_name}")]
    FleetNotFound {
        /// Organization identifier.
        org_id: String,
        /// Fleet name.
        fleet_name: String,
    },

    /// The underlying store was unreachable or returned a transport-level failure.
    #[error("store unreachable: {0}")]
    Unreachable(String),

    /// A concurrent writer updated the same resource between read and write.
    #[error("concurrent update conflict on {0}")]
    Conflict(String),

    /// The event dispatch surface rejected or failed to accept an emitted event.
    #[error("event dispatch failed: {0}")]
    DispatchFailed(String),
}

/// Errors returned by the two reconcilers.
///
/// Mirrors the taxonomy in the design's error-handling section: transient store
/// errors, policy violations (fatal for the current fleet-tick only), and data-shape
/// errors (fatal until the fleet spec changes).
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// A store call failed; the tick aborts this fleet and relies on the next tick.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A policy invariant was violated (e.g. batch pointer overflow, malformed
    /// percentage limit). Fatal for this fleet's tick; state is left unchanged.
    #[error("policy violation: {0}")]
    PolicyViolation(String),

    /// A stored value did not have the expected shape (e.g. completion-report JSON
    /// failed to parse, an unknown device-selection variant was encountered).
    #[error("data shape error: {0}")]
    DataShape(String),
}

impl From<serde_json::Error> for ReconcileError {
    fn from(e: serde_json::Error) -> Self {
        ReconcileError::DataShape(e.to_string())
    }
}

/// A specialized `Result` type for reconciler operations.
pub type ReconcileResult<T> = std::result::Result<T, ReconcileError>;

/// A specialized `Result` type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
