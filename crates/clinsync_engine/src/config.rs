//! Configuration for the sync engine.

use std::time::Duration;

/// Configuration for the central sync engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// The logical clock's increment per tick-tock. Must be even and
    /// non-zero so the "tick" half stays unique to the requesting caller.
    pub tick_increment: u64,
    /// Idle time since last connection after which a session is
    /// terminally timed out.
    pub session_timeout: Duration,
    /// Maximum concurrently active sessions before
    /// [`is_sync_capacity_full`](crate::SyncManager::is_sync_capacity_full)
    /// reports true.
    pub max_concurrent_sessions: usize,
    /// Default page size for outgoing change retrieval.
    pub max_records_per_pull_page: usize,
    /// Cap on newly-marked patients given full historical treatment per
    /// session; the rest are deferred to a later session.
    pub max_new_patients_full_sync: usize,
    /// Deployment-wide override: sync all lab requests for a facility
    /// regardless of the patient partition. Applies only to incremental,
    /// non-mobile sessions.
    pub sync_all_lab_requests: bool,
    /// Lookup cache settings.
    pub lookup: LookupConfig,
    /// How long the pending-edit barrier waits before giving up.
    pub pending_edit_timeout: Duration,
    /// Poll interval of the pending-edit barrier.
    pub pending_edit_poll_interval: Duration,
    /// Run background work (preparation, snapshot, persist) inline.
    ///
    /// Background work interferes between unit tests, so tests override
    /// this; production leaves it false and clients poll.
    pub await_preparation: bool,
}

impl EngineConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self {
            tick_increment: 2,
            session_timeout: Duration::from_secs(20 * 60),
            max_concurrent_sessions: 4,
            max_records_per_pull_page: 100,
            max_new_patients_full_sync: 100,
            sync_all_lab_requests: false,
            lookup: LookupConfig::default(),
            pending_edit_timeout: Duration::from_secs(10),
            pending_edit_poll_interval: Duration::from_millis(20),
            await_preparation: false,
        }
    }

    /// Sets the session idle timeout.
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Sets the cap on newly-marked patients fully synced per session.
    pub fn with_max_new_patients_full_sync(mut self, max: usize) -> Self {
        self.max_new_patients_full_sync = max;
        self
    }

    /// Sets the outgoing page size.
    pub fn with_max_records_per_pull_page(mut self, max: usize) -> Self {
        self.max_records_per_pull_page = max;
        self
    }

    /// Enables or disables the lookup cache path.
    pub fn with_lookup_enabled(mut self, enabled: bool) -> Self {
        self.lookup.enabled = enabled;
        self
    }

    /// Enables the deployment-wide lab request override.
    pub fn with_sync_all_lab_requests(mut self, enabled: bool) -> Self {
        self.sync_all_lab_requests = enabled;
        self
    }

    /// Runs background work inline (test override).
    pub fn awaiting_preparation(mut self) -> Self {
        self.await_preparation = true;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.tick_increment == 0 || self.tick_increment % 2 != 0 {
            return Err(format!(
                "tick_increment must be even and non-zero, got {}",
                self.tick_increment
            ));
        }
        if self.max_records_per_pull_page == 0 {
            return Err("max_records_per_pull_page must be non-zero".into());
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Lookup cache settings.
#[derive(Debug, Clone)]
pub struct LookupConfig {
    /// Whether pulls read from the lookup cache instead of scanning the
    /// source tables. When enabled, session preparation fails fast if the
    /// cache has never been built.
    pub enabled: bool,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self { enabled: false }
    }
}
