//! Error types for the sync engine.

use crate::session::SessionId;
use clinsync_store::StoreError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
///
/// None of these are retried internally: the caller is expected to retry
/// by starting a new session. Engine-level failures are additionally
/// recorded on the session row, because the polling client may be a
/// different process than the one that triggered the failure.
#[derive(Error, Debug)]
pub enum SyncError {
    /// No session with the given id exists.
    #[error("sync session '{0}' not found")]
    SessionNotFound(SessionId),

    /// The session is in the terminal errored state.
    ///
    /// The message carries the session's accumulated error text, prefixed
    /// with the session id for log correlation.
    #[error("{message}")]
    SessionErrored {
        /// The errored session.
        session_id: SessionId,
        /// Accumulated error text, session-id prefixed.
        message: String,
    },

    /// The session has already completed.
    #[error("sync session '{0}' is already completed")]
    SessionCompleted(SessionId),

    /// A snapshot is already being captured for this session.
    #[error("snapshot for session '{0}' is already being processed")]
    SnapshotProcessing(SessionId),

    /// The deployment requires the lookup cache but it has never been
    /// built.
    #[error("sync lookup table has not been built yet, cannot start a sync session")]
    LookupNotBuilt,

    /// An incoming change targeted a model that forbids incoming writes.
    #[error("security violation: model '{record_type}' does not allow incoming changes (record '{record_id}')")]
    SecurityViolation {
        /// The offending model.
        record_type: String,
        /// The offending record id.
        record_id: String,
    },

    /// An incoming change named a record type no model declares.
    #[error("unknown record type '{0}' in incoming changes")]
    UnknownRecordType(String),

    /// A tick was already claimed by a different device.
    #[error("device tick {tick} already recorded for device '{existing}', refusing '{device}'")]
    DeviceTickConflict {
        /// The contested tick.
        tick: u64,
        /// The device already holding the tick.
        existing: String,
        /// The device that tried to claim it.
        device: String,
    },

    /// The engine configuration is invalid.
    #[error("invalid engine configuration: {0}")]
    InvalidConfig(String),

    /// Store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
