//! The denormalized sync lookup cache.
//!
//! Large deployments pay a heavy price re-deriving patient and facility
//! links on every pull; the cache keeps one pre-projected row per record,
//! maintained incrementally by a scheduled refresh, so the pull path reads
//! it instead of scanning source tables.

use crate::capture::project_data;
use crate::clock::{LogicalClock, LOOKUP_UP_TO_TICK_KEY};
use crate::config::EngineConfig;
use crate::error::SyncResult;
use clinsync_model::{ModelRegistry, RecordData, RecordValue};
use clinsync_store::{Store, StoreView};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::SystemTime;

/// Table holding encounter rows, used to resolve a record's patient link
/// through its encounter when the record has no direct patient column.
pub const ENCOUNTERS_TABLE: &str = "encounters";

/// Column on an encounter row naming its patient.
pub const ENCOUNTER_PATIENT_COLUMN: &str = "patient_id";

/// One denormalized cache row, keyed by `(record_type, record_id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupRow {
    /// The source model.
    pub record_type: String,
    /// The source record id.
    pub record_id: String,
    /// Soft-deletion flag, mirrored from the source row.
    pub is_deleted: bool,
    /// The projected data served to devices.
    pub data: RecordData,
    /// The source row's last-write tick.
    pub updated_at_sync_tick: u64,
    /// Resolved patient link (direct column, or via the encounter).
    pub patient_id: Option<String>,
    /// The record's encounter link, if any.
    pub encounter_id: Option<String>,
    /// The record's facility link, if any.
    pub facility_id: Option<String>,
    /// Mirrored from the model declaration.
    pub is_lab_request: bool,
}

/// One refresh invocation's debug-log entry.
#[derive(Debug, Clone)]
pub struct RefreshLogEntry {
    /// The horizon the refresh started from (`None` on the first build).
    pub since: Option<u64>,
    /// Rows actually mutated, on success.
    pub changes_count: Option<usize>,
    /// The failure, if the refresh failed.
    pub error: Option<String>,
    /// When the refresh started.
    pub started_at: SystemTime,
    /// When the refresh finished.
    pub completed_at: SystemTime,
}

/// The lookup cache: denormalized rows plus the refresh debug log.
#[derive(Default)]
pub struct LookupCache {
    rows: Mutex<BTreeMap<(String, String), LookupRow>>,
    log: Mutex<Vec<RefreshLogEntry>>,
}

impl LookupCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a row. Returns true if anything changed, so
    /// refreshes can report a faithful mutation count and stay idempotent.
    pub fn upsert(&self, row: LookupRow) -> bool {
        let key = (row.record_type.clone(), row.record_id.clone());
        let mut rows = self.rows.lock();
        if rows.get(&key) == Some(&row) {
            return false;
        }
        rows.insert(key, row);
        true
    }

    /// The cached row for a record, if present.
    pub fn get(&self, record_type: &str, record_id: &str) -> Option<LookupRow> {
        self.rows
            .lock()
            .get(&(record_type.to_owned(), record_id.to_owned()))
            .cloned()
    }

    /// Rows of one model changed in `(since, until]`, in record-id order.
    pub fn changed_in(&self, record_type: &str, since: u64, until: u64) -> Vec<LookupRow> {
        self.rows
            .lock()
            .range((record_type.to_owned(), String::new())..)
            .take_while(|((t, _), _)| t == record_type)
            .filter(|(_, row)| row.updated_at_sync_tick > since && row.updated_at_sync_tick <= until)
            .map(|(_, row)| row.clone())
            .collect()
    }

    /// Number of cached rows.
    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    /// Returns true if the cache holds no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }

    /// The refresh debug log, oldest first.
    pub fn refresh_log(&self) -> Vec<RefreshLogEntry> {
        self.log.lock().clone()
    }

    fn push_log(&self, entry: RefreshLogEntry) {
        self.log.lock().push(entry);
    }
}

/// The tick horizon the cache is complete up to. `None` means the cache
/// has never been built.
pub fn lookup_horizon(store: &Store) -> Option<u64> {
    store.facts().get(LOOKUP_UP_TO_TICK_KEY)
}

/// Refreshes the cache with everything written since the last run.
///
/// Takes a fresh tick, waits out pending edits below it, then upserts
/// every pull-capable row changed in `(previous horizon, tick]`. The
/// horizon advances only after every model succeeded, so a partial
/// failure leaves the same window to be retried by the next run. Running
/// twice with no intervening writes mutates nothing.
///
/// Exactly one debug-log entry is recorded per invocation, success or
/// failure.
pub fn update_lookup_table(
    cache: &LookupCache,
    store: &Store,
    clock: &LogicalClock,
    registry: &ModelRegistry,
    config: &EngineConfig,
) -> SyncResult<usize> {
    let started_at = SystemTime::now();
    let since = lookup_horizon(store);

    let result = refresh_window(cache, store, clock, registry, config, since);
    match &result {
        Ok((changes_count, up_to)) => {
            store.facts().set(LOOKUP_UP_TO_TICK_KEY, *up_to);
            cache.push_log(RefreshLogEntry {
                since,
                changes_count: Some(*changes_count),
                error: None,
                started_at,
                completed_at: SystemTime::now(),
            });
            tracing::debug!(
                since = ?since,
                up_to,
                changes_count,
                "sync lookup table updated"
            );
        }
        Err(err) => {
            cache.push_log(RefreshLogEntry {
                since,
                changes_count: None,
                error: Some(err.to_string()),
                started_at,
                completed_at: SystemTime::now(),
            });
            tracing::error!(error = %err, "sync lookup table update failed");
        }
    }
    result.map(|(changes_count, _)| changes_count)
}

fn refresh_window(
    cache: &LookupCache,
    store: &Store,
    clock: &LogicalClock,
    registry: &ModelRegistry,
    config: &EngineConfig,
    since: Option<u64>,
) -> SyncResult<(usize, u64)> {
    let interval = clock.tick_tock();
    store.wait_for_pending_edits(
        interval.tick,
        config.pending_edit_timeout,
        config.pending_edit_poll_interval,
    )?;
    let view = store.read_view();

    let mut changes_count = 0;
    for model in registry.pull_models() {
        let Some(table) = view.table(model.record_type()) else {
            continue;
        };
        for row in table.changed_in(since.unwrap_or(0), interval.tick) {
            let encounter_id = model
                .encounter_column()
                .and_then(|column| row.data.get(column).and_then(RecordValue::as_text))
                .map(str::to_owned);
            let patient_id = model
                .patient_column()
                .and_then(|column| row.data.get(column).and_then(RecordValue::as_text))
                .map(str::to_owned)
                .or_else(|| resolve_patient_via_encounter(&view, encounter_id.as_deref()));
            let facility_id = model
                .facility_column()
                .and_then(|column| row.data.get(column).and_then(RecordValue::as_text))
                .map(str::to_owned);

            if cache.upsert(LookupRow {
                record_type: model.record_type().to_owned(),
                record_id: row.id.clone(),
                is_deleted: row.is_deleted,
                data: project_data(&row.data),
                updated_at_sync_tick: row.updated_at_sync_tick,
                patient_id,
                encounter_id,
                facility_id,
                is_lab_request: model.is_lab_request(),
            }) {
                changes_count += 1;
            }
        }
    }
    Ok((changes_count, interval.tick))
}

pub(crate) fn resolve_patient_via_encounter(
    view: &StoreView,
    encounter_id: Option<&str>,
) -> Option<String> {
    let encounter = view.get_row(ENCOUNTERS_TABLE, encounter_id?)?;
    encounter
        .data
        .get(ENCOUNTER_PATIENT_COLUMN)
        .and_then(RecordValue::as_text)
        .map(str::to_owned)
}
