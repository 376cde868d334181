//! Sync session state.

use crate::error::{SyncError, SyncResult};
use crate::marked::PatientPartition;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::{Instant, SystemTime};
use uuid::Uuid;

/// Unique session token.
pub type SessionId = Uuid;

/// Options a device supplies when starting a session.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// The connecting device, recorded for operator triage.
    pub device_id: Option<String>,
    /// Facilities the device replicates.
    pub facility_ids: Vec<String>,
    /// The tick horizon the device last saw (0 on initial sync).
    pub since: Option<u64>,
    /// True for mobile devices, which skip historical lab requests.
    pub is_mobile: bool,
    /// Free-form debug info attached to the session row.
    pub debug_info: BTreeMap<String, serde_json::Value>,
}

/// A sync session row.
///
/// Lifecycle: *preparing → ready → (pushing) → pull-served → completed*,
/// or *errored* (terminal, reachable from any state). `started_at_tick`
/// doubles as the readiness signal: it is written only after all
/// preparation succeeded, as the last observable side effect.
#[derive(Debug, Clone)]
pub struct SyncSession {
    /// The session token.
    pub id: SessionId,
    /// Options supplied at start.
    pub options: SessionOptions,
    /// Wall-clock start time.
    pub start_time: SystemTime,
    /// Last time the client connected; drives the idle timeout.
    pub last_connection: Instant,
    /// Set once preparation succeeded; readiness signal.
    pub started_at_tick: Option<u64>,
    /// Set exactly once, by `end_session`.
    pub completed_at: Option<SystemTime>,
    /// Append-only error log; any entry makes the session terminal.
    pub errors: Vec<String>,
    /// Structured debug info for operator inspection.
    pub debug_info: BTreeMap<String, serde_json::Value>,
    /// Lower bound of the outgoing capture interval.
    pub pull_since: Option<u64>,
    /// Finalized tick horizon reported to the client.
    pub pull_until: Option<u64>,
    /// True while a snapshot capture is running for this session.
    pub snapshot_processing: bool,
    /// Set when outgoing capture finished.
    pub snapshot_completed_at: Option<SystemTime>,
    /// Set when incoming changes were fully persisted.
    pub persist_completed_at: Option<SystemTime>,
    /// The marked-for-sync partition computed during preparation.
    pub partition: Option<PatientPartition>,
}

impl SyncSession {
    fn new(id: SessionId, options: SessionOptions) -> Self {
        let debug_info = options.debug_info.clone();
        Self {
            id,
            options,
            start_time: SystemTime::now(),
            last_connection: Instant::now(),
            started_at_tick: None,
            completed_at: None,
            errors: Vec::new(),
            debug_info,
            pull_since: None,
            pull_until: None,
            snapshot_processing: false,
            snapshot_completed_at: None,
            persist_completed_at: None,
            partition: None,
        }
    }

    /// Returns true if any error has been recorded.
    pub fn is_errored(&self) -> bool {
        !self.errors.is_empty()
    }

    /// The session's accumulated error text, session-id prefixed so
    /// operators can correlate logs.
    pub fn error_message(&self) -> String {
        format!(
            "sync session '{}' encountered an error: {}",
            self.id,
            self.errors.join("; ")
        )
    }

    /// The terminal error for this session, if errored.
    pub fn errored(&self) -> Option<SyncError> {
        if self.is_errored() {
            Some(SyncError::SessionErrored {
                session_id: self.id,
                message: self.error_message(),
            })
        } else {
            None
        }
    }
}

/// The set of live sessions.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<BTreeMap<SessionId, SyncSession>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a session row and returns its id.
    pub fn create(&self, options: SessionOptions) -> SessionId {
        let id = Uuid::new_v4();
        self.sessions.lock().insert(id, SyncSession::new(id, options));
        id
    }

    /// Runs `f` against the session, or fails with `SessionNotFound`.
    pub fn with<R>(&self, id: SessionId, f: impl FnOnce(&mut SyncSession) -> R) -> SyncResult<R> {
        let mut sessions = self.sessions.lock();
        let session = sessions.get_mut(&id).ok_or(SyncError::SessionNotFound(id))?;
        Ok(f(session))
    }

    /// Appends an error to the session, making it terminal.
    ///
    /// Appending never overwrites: earlier errors are preserved so the
    /// full failure history reaches the client.
    pub fn mark_errored(&self, id: SessionId, message: impl Into<String>) {
        let message = message.into();
        tracing::error!(session_id = %id, error = %message, "sync session errored");
        let mut sessions = self.sessions.lock();
        if let Some(session) = sessions.get_mut(&id) {
            session.errors.push(message);
        }
    }

    /// A point-in-time copy of the session, for inspection.
    pub fn snapshot(&self, id: SessionId) -> Option<SyncSession> {
        self.sessions.lock().get(&id).cloned()
    }

    /// Number of sessions neither completed nor errored.
    pub fn active_count(&self) -> usize {
        self.sessions
            .lock()
            .values()
            .filter(|s| s.completed_at.is_none() && !s.is_errored())
            .count()
    }
}
