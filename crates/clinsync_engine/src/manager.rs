//! The central sync manager.

use crate::capture::{snapshot_outgoing_direct, snapshot_outgoing_from_lookup};
use crate::clock::LogicalClock;
use crate::config::EngineConfig;
use crate::device::DeviceTickLedger;
use crate::error::{SyncError, SyncResult};
use crate::lookup::{self, LookupCache};
use crate::marked::build_partition;
use crate::persist::persist_incoming_changes;
use crate::session::{SessionId, SessionOptions, SessionRegistry, SyncSession};
use crate::snapshot::{SnapshotRow, SnapshotStore};
use clinsync_model::{ChangeRecord, ModelRegistry, SyncModel, SyncScope};
use clinsync_store::Store;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::SystemTime;

/// Parameters a device supplies when initiating the pull phase.
#[derive(Debug, Clone, Default)]
pub struct PullParams {
    /// The tick horizon the device last saw (0 on initial sync).
    pub since: u64,
    /// Facilities the device replicates.
    pub facility_ids: Vec<String>,
    /// True for mobile devices, which never receive historical lab
    /// requests via the deployment-wide override.
    pub is_mobile: bool,
    /// Per-pull override of the newly-marked-patient full-sync cap.
    pub full_sync_patient_cap: Option<usize>,
}

/// Metadata a device fetches before paging outgoing changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PullMetadata {
    /// Number of outgoing changes waiting in the session's snapshot.
    pub total_to_pull: usize,
    /// The tick horizon the device should record after a successful pull.
    pub pull_until: u64,
}

enum ConnectState {
    Ok,
    Errored(SyncError),
    Completed,
    TimedOut,
}

/// The central half of the sync protocol.
///
/// Owns the session registry, the per-session snapshot tables, the device
/// tick ledger and the lookup cache; everything a device does goes through
/// one of its operations. Cloning is cheap and clones share all state, so
/// background work runs on a clone.
#[derive(Clone)]
pub struct SyncManager {
    store: Store,
    clock: LogicalClock,
    registry: Arc<ModelRegistry>,
    config: Arc<EngineConfig>,
    sessions: Arc<SessionRegistry>,
    snapshots: Arc<SnapshotStore>,
    ledger: Arc<DeviceTickLedger>,
    lookup: Arc<LookupCache>,
}

impl SyncManager {
    /// Creates a manager over the given store and model registry.
    pub fn new(store: Store, registry: ModelRegistry, config: EngineConfig) -> SyncResult<Self> {
        config.validate().map_err(SyncError::InvalidConfig)?;
        let clock = LogicalClock::new(store.clone(), config.tick_increment);
        Ok(Self {
            store,
            clock,
            registry: Arc::new(registry),
            config: Arc::new(config),
            sessions: Arc::new(SessionRegistry::new()),
            snapshots: Arc::new(SnapshotStore::new()),
            ledger: Arc::new(DeviceTickLedger::new()),
            lookup: Arc::new(LookupCache::new()),
        })
    }

    /// The device tick ledger.
    pub fn device_ledger(&self) -> &DeviceTickLedger {
        &self.ledger
    }

    /// The lookup cache.
    pub fn lookup_cache(&self) -> &LookupCache {
        &self.lookup
    }

    /// A point-in-time copy of a session row, for operator inspection.
    ///
    /// Unlike [`connect_to_session`](Self::connect_to_session) this never
    /// rejects: errored and completed sessions stay inspectable.
    pub fn session_snapshot(&self, id: SessionId) -> Option<SyncSession> {
        self.sessions.snapshot(id)
    }

    /// Returns true when active sessions have reached the configured
    /// concurrency cap; callers should tell devices to back off.
    pub fn is_sync_capacity_full(&self) -> bool {
        self.sessions.active_count() >= self.config.max_concurrent_sessions
    }

    /// Starts a session and kicks preparation off in the background.
    ///
    /// Returns as soon as the session row exists; the device polls
    /// [`check_session_ready`](Self::check_session_ready).
    pub fn start_session(&self, options: SessionOptions) -> SessionId {
        let id = self.sessions.create(options);
        self.snapshots.create(id);
        tracing::info!(session_id = %id, "started sync session");

        let manager = self.clone();
        self.run_background(move || manager.prepare_session(id));
        id
    }

    fn prepare_session(&self, id: SessionId) {
        let result = catch_unwind(AssertUnwindSafe(|| self.prepare_session_inner(id)));
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => self.sessions.mark_errored(id, err.to_string()),
            Err(_) => self.sessions.mark_errored(id, "session preparation panicked"),
        }
    }

    fn prepare_session_inner(&self, id: SessionId) -> SyncResult<()> {
        if self.config.lookup.enabled && lookup::lookup_horizon(&self.store).is_none() {
            return Err(SyncError::LookupNotBuilt);
        }

        let interval = self.clock.tick_tock();
        let (facility_ids, since) = self
            .sessions
            .with(id, |s| (s.options.facility_ids.clone(), s.options.since.unwrap_or(0)))?;
        let partition = build_partition(
            &self.store.read_view(),
            &facility_ids,
            since,
            self.config.max_new_patients_full_sync,
        );

        // The readiness signal: nothing may follow this write.
        self.sessions.with(id, |s| {
            s.partition = Some(partition);
            s.started_at_tick = Some(interval.tick);
        })?;
        Ok(())
    }

    /// Returns true once preparation has finished; an errored session
    /// rejects with its accumulated error text instead.
    pub fn check_session_ready(&self, id: SessionId) -> SyncResult<bool> {
        self.sessions.with(id, |s| match s.errored() {
            Some(err) => Err(err),
            None => Ok(s.started_at_tick.is_some()),
        })?
    }

    /// Re-establishes a device's claim on a session.
    ///
    /// Rejects errored, completed and idle-timed-out sessions; otherwise
    /// refreshes the last connection time and returns a snapshot of the
    /// session row.
    pub fn connect_to_session(&self, id: SessionId) -> SyncResult<SyncSession> {
        let timeout = self.config.session_timeout;
        let state = self.sessions.with(id, |s| {
            if let Some(err) = s.errored() {
                return ConnectState::Errored(err);
            }
            if s.completed_at.is_some() {
                return ConnectState::Completed;
            }
            if s.last_connection.elapsed() > timeout {
                return ConnectState::TimedOut;
            }
            s.last_connection = std::time::Instant::now();
            ConnectState::Ok
        })?;

        match state {
            ConnectState::Ok => self
                .sessions
                .snapshot(id)
                .ok_or(SyncError::SessionNotFound(id)),
            ConnectState::Errored(err) => Err(err),
            ConnectState::Completed => Err(SyncError::SessionCompleted(id)),
            ConnectState::TimedOut => {
                self.sessions
                    .mark_errored(id, "sync session timed out while idle");
                Err(self
                    .sessions
                    .with(id, |s| s.errored())?
                    .unwrap_or(SyncError::SessionNotFound(id)))
            }
        }
    }

    /// Completes a session and drops its snapshot table.
    pub fn end_session(&self, id: SessionId) -> SyncResult<()> {
        self.sessions.with(id, |s| {
            if let Some(err) = s.errored() {
                return Err(err);
            }
            if s.completed_at.is_some() {
                return Err(SyncError::SessionCompleted(id));
            }
            s.completed_at = Some(SystemTime::now());
            Ok(())
        })??;
        self.snapshots.drop_table(id);
        tracing::info!(session_id = %id, "completed sync session");
        Ok(())
    }

    /// Kicks off outgoing snapshot capture for the pull phase, serving
    /// every model the device may pull.
    ///
    /// Returns as soon as capture is scheduled; the device polls
    /// [`check_pull_ready`](Self::check_pull_ready). A capture already in
    /// flight for the session is an error.
    pub fn initiate_pull(&self, id: SessionId, params: PullParams) -> SyncResult<()> {
        self.initiate_pull_filtered(id, params, |_| true)
    }

    /// Like [`initiate_pull`](Self::initiate_pull), but capture only
    /// covers models the permission predicate admits (e.g. a device role
    /// not entitled to every model).
    pub fn initiate_pull_filtered(
        &self,
        id: SessionId,
        params: PullParams,
        permission: impl Fn(&dyn SyncModel) -> bool + Send + Sync + 'static,
    ) -> SyncResult<()> {
        self.connect_to_session(id)?;
        self.sessions.with(id, |s| {
            if s.snapshot_processing {
                return Err(SyncError::SnapshotProcessing(id));
            }
            s.snapshot_processing = true;
            s.pull_since = Some(params.since);
            Ok(())
        })??;

        let manager = self.clone();
        let permission: Arc<dyn Fn(&dyn SyncModel) -> bool + Send + Sync> = Arc::new(permission);
        self.run_background(move || manager.capture_snapshot(id, params, permission));
        Ok(())
    }

    fn capture_snapshot(
        &self,
        id: SessionId,
        params: PullParams,
        permission: Arc<dyn Fn(&dyn SyncModel) -> bool + Send + Sync>,
    ) {
        let result = catch_unwind(AssertUnwindSafe(|| {
            self.capture_snapshot_inner(id, &params, permission.as_ref())
        }));
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => self.sessions.mark_errored(id, err.to_string()),
            Err(_) => self.sessions.mark_errored(id, "snapshot capture panicked"),
        }
        // Clear the flag even on failure so the error, not the flag,
        // decides what the client sees next.
        let _ = self.sessions.with(id, |s| s.snapshot_processing = false);
    }

    fn capture_snapshot_inner(
        &self,
        id: SessionId,
        params: &PullParams,
        permission: &(dyn Fn(&dyn SyncModel) -> bool + Send + Sync),
    ) -> SyncResult<()> {
        let interval = self.clock.tick_tock();
        self.store.wait_for_pending_edits(
            interval.tick,
            self.config.pending_edit_timeout,
            self.config.pending_edit_poll_interval,
        )?;

        // When serving from the cache, never report a horizon the cache
        // has not reached.
        let pull_until = if self.config.lookup.enabled {
            let horizon = lookup::lookup_horizon(&self.store).ok_or(SyncError::LookupNotBuilt)?;
            interval.tick.min(horizon)
        } else {
            interval.tick
        };

        let view = self.store.read_view();
        let cap = params
            .full_sync_patient_cap
            .unwrap_or(self.config.max_new_patients_full_sync);
        let partition = build_partition(&view, &params.facility_ids, params.since, cap);

        let full_scope = SyncScope::new(params.facility_ids.clone(), partition.full.clone());
        let mut incremental_scope =
            SyncScope::new(params.facility_ids.clone(), partition.incremental.clone());
        incremental_scope.sync_all_lab_requests =
            self.config.sync_all_lab_requests && params.since > 0 && !params.is_mobile;

        self.snapshots.with(id, |snapshot| {
            // Newly marked patients get their whole history; the rest of
            // the capture is the incremental delta.
            if self.config.lookup.enabled {
                snapshot_outgoing_from_lookup(
                    snapshot,
                    &self.lookup,
                    &view,
                    &self.registry,
                    &full_scope,
                    0,
                    pull_until,
                    |m| permission(m) && m.is_patient_linked(),
                );
                snapshot_outgoing_from_lookup(
                    snapshot,
                    &self.lookup,
                    &view,
                    &self.registry,
                    &incremental_scope,
                    params.since,
                    pull_until,
                    permission,
                );
            } else {
                snapshot_outgoing_direct(
                    snapshot,
                    &view,
                    &self.registry,
                    &full_scope,
                    0,
                    pull_until,
                    |m| permission(m) && m.is_patient_linked(),
                );
                snapshot_outgoing_direct(
                    snapshot,
                    &view,
                    &self.registry,
                    &incremental_scope,
                    params.since,
                    pull_until,
                    permission,
                );
            }
            snapshot.remove_echoed();
        })?;

        self.sessions.with(id, |s| {
            s.partition = Some(partition);
            s.pull_until = Some(pull_until);
            s.snapshot_completed_at = Some(SystemTime::now());
        })?;
        Ok(())
    }

    /// Returns true once the session's outgoing snapshot is ready to
    /// serve; a capture that died midway surfaces as a session error.
    pub fn check_pull_ready(&self, id: SessionId) -> SyncResult<bool> {
        self.sessions.with(id, |s| match s.errored() {
            Some(err) => Err(err),
            None => Ok(s.snapshot_completed_at.is_some()),
        })?
    }

    /// The pull totals a device fetches before paging changes.
    pub fn pull_metadata(&self, id: SessionId) -> SyncResult<PullMetadata> {
        let pull_until = self.sessions.with(id, |s| match s.errored() {
            Some(err) => Err(err),
            None => s.pull_until.ok_or(SyncError::SnapshotProcessing(id)),
        })??;
        let total_to_pull = self
            .snapshots
            .with(id, |t| t.count(clinsync_model::SessionDirection::Outgoing))?;

        self.sessions.with(id, |s| {
            s.debug_info
                .insert("totalToPull".to_owned(), serde_json::json!(total_to_pull));
        })?;
        Ok(PullMetadata {
            total_to_pull,
            pull_until,
        })
    }

    /// An ordered page of the session's outgoing changes.
    pub fn get_outgoing_changes(
        &self,
        id: SessionId,
        offset: usize,
        limit: Option<usize>,
    ) -> SyncResult<Vec<SnapshotRow>> {
        self.connect_to_session(id)?;
        let limit = limit
            .unwrap_or(self.config.max_records_per_pull_page)
            .min(self.config.max_records_per_pull_page);
        self.snapshots.with(id, |t| t.outgoing_page(offset, limit))
    }

    /// Accepts a batch of pushed changes into the session's snapshot.
    ///
    /// Every change is validated against its model's declared direction
    /// before any is accepted: a change for a model that forbids incoming
    /// writes rejects the whole push, errors the session and records the
    /// offending record in the session's debug info.
    pub fn add_incoming_changes(&self, id: SessionId, changes: &[ChangeRecord]) -> SyncResult<()> {
        self.connect_to_session(id)?;

        for change in changes {
            let Some(model) = self.registry.get(&change.record_type) else {
                let err = SyncError::UnknownRecordType(change.record_type.clone());
                self.sessions.mark_errored(id, err.to_string());
                return Err(err);
            };
            if !model.sync_direction().allows_incoming() {
                let err = SyncError::SecurityViolation {
                    record_type: change.record_type.clone(),
                    record_id: change.record_id.clone(),
                };
                self.sessions.with(id, |s| {
                    s.debug_info.insert(
                        "rejectedRecord".to_owned(),
                        serde_json::json!({
                            "type": change.record_type,
                            "id": change.record_id,
                        }),
                    );
                })?;
                self.sessions.mark_errored(id, err.to_string());
                return Err(err);
            }
        }

        self.snapshots.with(id, |snapshot| {
            for change in changes {
                snapshot.insert_incoming(change);
            }
        })
    }

    /// Signals that the device has pushed everything and kicks off
    /// persistence in the background.
    ///
    /// The device polls [`check_push_complete`](Self::check_push_complete).
    /// `device_id` overrides the one given at session start. When
    /// `audited_models` is given, only pushed changes of those record
    /// types are persisted.
    pub fn complete_push(
        &self,
        id: SessionId,
        device_id: Option<String>,
        audited_models: Option<Vec<String>>,
    ) -> SyncResult<()> {
        self.connect_to_session(id)?;
        let device_id =
            device_id.or(self.sessions.with(id, |s| s.options.device_id.clone())?);

        let manager = self.clone();
        self.run_background(move || manager.persist_session(id, device_id, audited_models));
        Ok(())
    }

    fn persist_session(
        &self,
        id: SessionId,
        device_id: Option<String>,
        audited_models: Option<Vec<String>>,
    ) {
        let result = catch_unwind(AssertUnwindSafe(|| {
            self.snapshots.with(id, |snapshot| {
                persist_incoming_changes(
                    &self.store,
                    &self.clock,
                    &self.registry,
                    &self.ledger,
                    snapshot,
                    device_id.as_deref(),
                    audited_models.as_deref(),
                )
            })?
        }));
        match result {
            Ok(Ok(_)) => {
                let _ = self
                    .sessions
                    .with(id, |s| s.persist_completed_at = Some(SystemTime::now()));
            }
            Ok(Err(err)) => self.sessions.mark_errored(id, err.to_string()),
            Err(_) => self.sessions.mark_errored(id, "persisting incoming changes panicked"),
        }
    }

    /// Returns true once the session's pushed changes are fully persisted;
    /// a persist that failed surfaces as a session error.
    pub fn check_push_complete(&self, id: SessionId) -> SyncResult<bool> {
        self.sessions.with(id, |s| match s.errored() {
            Some(err) => Err(err),
            None => Ok(s.persist_completed_at.is_some()),
        })?
    }

    /// Refreshes the lookup cache with everything written since the last
    /// run. Deployments schedule this; it is safe to run concurrently
    /// with sessions.
    pub fn update_lookup_table(&self) -> SyncResult<usize> {
        lookup::update_lookup_table(
            &self.lookup,
            &self.store,
            &self.clock,
            &self.registry,
            &self.config,
        )
    }

    fn run_background(&self, f: impl FnOnce() + Send + 'static) {
        if self.config.await_preparation {
            f();
        } else {
            std::thread::spawn(f);
        }
    }
}
