//! Outgoing change capture.
//!
//! Two equivalent paths fill a session's snapshot table: a direct scan of
//! the authoritative tables, and a read over the denormalized lookup
//! cache. Both share the same column projection and scope filtering, so a
//! deployment can switch paths without changing what devices receive.

use crate::lookup::{resolve_patient_via_encounter, LookupCache};
use crate::snapshot::SnapshotTable;
use clinsync_model::{
    ChangelogEntry, ModelRegistry, RecordData, RecordValue, SyncModel, SyncScope,
};
use clinsync_store::StoreView;

/// Columns stripped from outgoing data before it leaves the central store.
///
/// `updated_at_sync_tick` is re-stamped by the receiving store; the other
/// two are central-side bookkeeping with no meaning on a device.
pub const EXCLUDED_COLUMNS: [&str; 3] = ["updated_at_sync_tick", "deleted_at", "marked_for_sync_at"];

/// Table holding per-record audit changelog entries.
pub const CHANGELOG_TABLE: &str = "sync_changelog";

/// Copies a row's data minus the excluded columns.
///
/// Everything else passes through untouched, byte columns included.
pub fn project_data(data: &RecordData) -> RecordData {
    data.iter()
        .filter(|(column, _)| !EXCLUDED_COLUMNS.contains(&column.as_str()))
        .map(|(column, value)| (column.clone(), value.clone()))
        .collect()
}

/// Collects the audit changelog entries recorded for a record, in logged
/// order.
pub fn changelog_for(view: &StoreView, record_type: &str, record_id: &str) -> Vec<ChangelogEntry> {
    let Some(table) = view.table(CHANGELOG_TABLE) else {
        return Vec::new();
    };

    let mut entries: Vec<ChangelogEntry> = table
        .rows()
        .filter(|row| !row.is_deleted)
        .filter(|row| {
            row.data.get("record_type").and_then(RecordValue::as_text) == Some(record_type)
                && row.data.get("record_id").and_then(RecordValue::as_text) == Some(record_id)
        })
        .map(|row| ChangelogEntry {
            record_type: record_type.to_owned(),
            record_id: record_id.to_owned(),
            device_id: row
                .data
                .get("device_id")
                .and_then(RecordValue::as_text)
                .map(str::to_owned),
            logged_at_sync_tick: row
                .data
                .get("logged_at_sync_tick")
                .and_then(RecordValue::as_integer)
                .unwrap_or(0) as u64,
        })
        .collect();
    entries.sort_by_key(|e| e.logged_at_sync_tick);
    entries
}

/// The direct path's scope check.
///
/// Rows linked to a patient only through their encounter resolve that
/// link against the view first; everything else defers to the model's
/// own filter.
fn row_in_scope(
    view: &StoreView,
    model: &dyn SyncModel,
    data: &RecordData,
    scope: &SyncScope,
) -> bool {
    if model.patient_column().is_none() {
        if let Some(column) = model.encounter_column() {
            if model.is_lab_request() && scope.sync_all_lab_requests {
                return true;
            }
            let encounter_id = data.get(column).and_then(RecordValue::as_text);
            return resolve_patient_via_encounter(view, encounter_id)
                .is_some_and(|patient_id| scope.includes_patient(&patient_id));
        }
    }
    model.in_scope(data, scope)
}

/// Captures outgoing changes by scanning the authoritative tables.
///
/// Walks the pull-capable models the filter admits, in registry
/// (dependency) order, selecting rows whose tick falls in `(since, until]`
/// and that pass the model's scope filter. Returns the number of rows
/// inserted.
pub fn snapshot_outgoing_direct(
    snapshot: &mut SnapshotTable,
    view: &StoreView,
    registry: &ModelRegistry,
    scope: &SyncScope,
    since: u64,
    until: u64,
    filter: impl Fn(&dyn SyncModel) -> bool,
) -> usize {
    let mut inserted = 0;
    for model in registry.pull_models() {
        if !filter(model.as_ref()) {
            continue;
        }
        let Some(table) = view.table(model.record_type()) else {
            continue;
        };
        for row in table.changed_in(since, until) {
            if !row_in_scope(view, model.as_ref(), &row.data, scope) {
                continue;
            }
            snapshot.insert_outgoing(
                model.record_type(),
                row.id.clone(),
                row.is_deleted,
                project_data(&row.data),
                changelog_for(view, model.record_type(), &row.id),
            );
            inserted += 1;
        }
    }
    inserted
}

/// Captures outgoing changes by reading the lookup cache.
///
/// Equivalent to [`snapshot_outgoing_direct`] for any `until` at or below
/// the cache's horizon; the scope filter runs over the cache's
/// denormalized patient and facility links instead of re-reading source
/// rows. Returns the number of rows inserted.
pub fn snapshot_outgoing_from_lookup(
    snapshot: &mut SnapshotTable,
    cache: &LookupCache,
    view: &StoreView,
    registry: &ModelRegistry,
    scope: &SyncScope,
    since: u64,
    until: u64,
    filter: impl Fn(&dyn SyncModel) -> bool,
) -> usize {
    let mut inserted = 0;
    for model in registry.pull_models() {
        if !filter(model.as_ref()) {
            continue;
        }
        for row in cache.changed_in(model.record_type(), since, until) {
            let in_scope = if row.is_lab_request && scope.sync_all_lab_requests {
                true
            } else if let Some(patient_id) = row.patient_id.as_deref() {
                // Denormalized link, resolved through the encounter when
                // the source row has no direct patient column.
                scope.includes_patient(patient_id)
            } else if model.is_patient_linked() {
                // A patient-linked row whose link never resolved belongs
                // to no device.
                false
            } else if model.facility_column().is_some() {
                row.facility_id
                    .as_deref()
                    .is_some_and(|f| scope.includes_facility(f))
            } else {
                true
            };
            if !in_scope {
                continue;
            }
            snapshot.insert_outgoing(
                row.record_type.clone(),
                row.record_id.clone(),
                row.is_deleted,
                row.data.clone(),
                changelog_for(view, &row.record_type, &row.record_id),
            );
            inserted += 1;
        }
    }
    inserted
}
