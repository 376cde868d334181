//! Conflict resolvers applied while persisting pushed changes.

use clinsync_model::{RecordData, RecordValue};
use clinsync_store::{Store, StoreView, WriteBatch};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Column holding a record's human-facing identifier.
pub const DISPLAY_ID_COLUMN: &str = "display_id";

/// Table holding recurring appointment schedules.
pub const SCHEDULES_TABLE: &str = "appointment_schedules";

/// Table holding appointments, including schedule-generated ones.
pub const APPOINTMENTS_TABLE: &str = "appointments";

/// Column linking a generated appointment to its schedule.
pub const SCHEDULE_COLUMN: &str = "schedule_id";

/// Column bounding a schedule's generation window (ISO date text).
pub const UNTIL_DATE_COLUMN: &str = "until_date";

/// Column marking a schedule as cancelled.
pub const CANCELLED_COLUMN: &str = "is_cancelled";

/// Column holding an appointment's date (ISO date text).
pub const START_DATE_COLUMN: &str = "start_date";

// Fixed namespace for deterministic record ids. Changing it would fork
// identity across deployments, so it never changes.
const DETERMINISTIC_ID_NAMESPACE: Uuid = Uuid::from_u128(0x5a1d_c5f8_93b4_4e7a_9f26_0d8b_41c7_a3e9);

/// Derives a record id from its parent column values.
///
/// Two devices creating the "same" derived record (same model, same
/// parents) while offline produce the same id and converge on one row
/// instead of accumulating duplicates.
pub fn deterministic_record_id(record_type: &str, parent_a: &str, parent_b: &str) -> String {
    let name = format!("{record_type}:{parent_a}:{parent_b}");
    Uuid::new_v5(&DETERMINISTIC_ID_NAMESPACE, name.as_bytes()).to_string()
}

/// Resolves a display-identifier collision between an incoming record and
/// a different existing record.
///
/// Both records keep existing, renamed deterministically by arrival
/// order: the existing row's identifier gets `_duplicate_1`, the incoming
/// one `_duplicate_2`. The existing row is rewritten through `batch` so
/// the rename is stamped with the push's tock and propagates outward like
/// any other change. A record updating its own identifier never
/// collides with itself.
///
/// Returns the renamed existing record's id, if a collision was found.
pub fn resolve_duplicate_display_id(
    view: &StoreView,
    batch: &mut WriteBatch,
    record_type: &str,
    record_id: &str,
    data: &mut RecordData,
) -> Option<String> {
    let display_id = data.get(DISPLAY_ID_COLUMN).and_then(RecordValue::as_text)?.to_owned();

    let table = view.table(record_type)?;
    let existing = table.rows().find(|row| {
        row.id != record_id
            && !row.is_deleted
            && row.data.get(DISPLAY_ID_COLUMN).and_then(RecordValue::as_text)
                == Some(display_id.as_str())
    })?;

    let mut existing_data = existing.data.clone();
    existing_data.insert(
        DISPLAY_ID_COLUMN.to_owned(),
        RecordValue::from(format!("{display_id}_duplicate_1")),
    );
    batch.put(record_type, existing.id.clone(), existing_data);

    data.insert(
        DISPLAY_ID_COLUMN.to_owned(),
        RecordValue::from(format!("{display_id}_duplicate_2")),
    );
    Some(existing.id.clone())
}

/// Soft-deletes schedule-generated appointments left outside their
/// schedule's bounds by a push.
///
/// For each modified schedule: if the schedule was cancelled, every
/// generated appointment goes; otherwise appointments dated past the new
/// `until_date` go. The deletions are ordinary stamped writes, so they
/// propagate to every device rather than being silently suppressed.
/// Returns the number of appointments deleted.
pub fn clean_stale_schedule_appointments(
    store: &Store,
    stamp: u64,
    schedule_ids: &BTreeSet<String>,
) -> usize {
    if schedule_ids.is_empty() {
        return 0;
    }
    let view = store.read_view();
    let Some(appointments) = view.table(APPOINTMENTS_TABLE) else {
        return 0;
    };

    let mut stale: Vec<String> = Vec::new();
    for schedule_id in schedule_ids {
        let Some(schedule) = view.get_row(SCHEDULES_TABLE, schedule_id) else {
            continue;
        };
        let cancelled = schedule
            .data
            .get(CANCELLED_COLUMN)
            .and_then(RecordValue::as_bool)
            .unwrap_or(false)
            || schedule.is_deleted;
        let until_date = schedule
            .data
            .get(UNTIL_DATE_COLUMN)
            .and_then(RecordValue::as_text);

        for appointment in appointments.rows() {
            if appointment.is_deleted {
                continue;
            }
            if appointment.data.get(SCHEDULE_COLUMN).and_then(RecordValue::as_text)
                != Some(schedule_id.as_str())
            {
                continue;
            }
            // ISO dates compare lexicographically.
            let past_bound = match until_date {
                Some(until) => appointment
                    .data
                    .get(START_DATE_COLUMN)
                    .and_then(RecordValue::as_text)
                    .is_some_and(|start| start > until),
                None => false,
            };
            if cancelled || past_bound {
                stale.push(appointment.id.clone());
            }
        }
    }

    if stale.is_empty() {
        return 0;
    }
    let deleted = stale.len();
    let mut batch = store.begin_write(stamp);
    for id in stale {
        batch.soft_delete(APPOINTMENTS_TABLE, id);
    }
    batch.commit();
    deleted
}
