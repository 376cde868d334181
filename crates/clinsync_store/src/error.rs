//! Error types for the store.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The pending-edit barrier gave up waiting for an open write batch.
    #[error(
        "timed out waiting for pending edits below tick {boundary} ({open} still open after {waited_ms}ms)"
    )]
    PendingEditTimeout {
        /// The tick boundary being waited on.
        boundary: u64,
        /// Number of batches still open when the wait gave up.
        open: usize,
        /// How long the barrier waited.
        waited_ms: u64,
    },
}
