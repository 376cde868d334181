//! Persisting pushed changes into the authoritative tables.

use crate::capture::CHANGELOG_TABLE;
use crate::clock::LogicalClock;
use crate::device::DeviceTickLedger;
use crate::error::{SyncError, SyncResult};
use crate::resolvers::{
    clean_stale_schedule_appointments, deterministic_record_id, resolve_duplicate_display_id,
    SCHEDULES_TABLE,
};
use crate::snapshot::SnapshotTable;
use clinsync_model::{ModelRegistry, RecordData, RecordValue, SessionDirection};
use clinsync_store::Store;
use std::collections::BTreeSet;

/// What a completed persist did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistOutcome {
    /// The tock every persisted row was stamped with.
    pub saved_at_sync_tick: u64,
    /// Number of incoming changes applied.
    pub saved_count: usize,
    /// Display-identifier collisions resolved.
    pub renamed_duplicates: usize,
    /// Schedule-generated appointments deleted by post-push cleanup.
    pub stale_appointments_deleted: usize,
}

/// Commits a session's incoming snapshot rows.
///
/// One tick-tock supplies the unique tock every row is stamped with; the
/// rows are applied in registry (dependency) order within a single write
/// batch, consulting the conflict resolvers as they go. After the commit
/// the tock is recorded against the pushing device, and a second
/// tick-tock stamps post-push adjustments so they land above the
/// session's pull boundary and reach the device in the same session.
///
/// When `audited_models` is given, only pushed changes of those record
/// types are persisted; the rest stay in the snapshot unstamped.
pub fn persist_incoming_changes(
    store: &Store,
    clock: &LogicalClock,
    registry: &ModelRegistry,
    ledger: &DeviceTickLedger,
    snapshot: &mut SnapshotTable,
    device_id: Option<&str>,
    audited_models: Option<&[String]>,
) -> SyncResult<PersistOutcome> {
    let interval = clock.tick_tock();
    let tock = interval.tock;
    let included =
        |record_type: &str| audited_models.is_none_or(|m| m.iter().any(|t| t == record_type));

    let view = store.read_view();
    let mut batch = store.begin_write(tock);
    let mut saved_count = 0;
    let mut renamed_duplicates = 0;
    let mut touched_schedules: BTreeSet<String> = BTreeSet::new();

    for model in registry.push_models() {
        if !included(model.record_type()) {
            continue;
        }
        let incoming: Vec<(String, bool, RecordData)> = snapshot
            .incoming()
            .filter(|row| row.record_type == model.record_type())
            .map(|row| (row.record_id.clone(), row.is_deleted, row.data.clone()))
            .collect();

        for (pushed_id, is_deleted, mut data) in incoming {
            let record_id = match model.deterministic_id_parents() {
                Some((parent_a, parent_b)) => {
                    let a = data.get(parent_a).and_then(RecordValue::as_text);
                    let b = data.get(parent_b).and_then(RecordValue::as_text);
                    match (a, b) {
                        (Some(a), Some(b)) => deterministic_record_id(model.record_type(), a, b),
                        _ => pushed_id,
                    }
                }
                None => pushed_id,
            };

            if resolve_duplicate_display_id(
                &view,
                &mut batch,
                model.record_type(),
                &record_id,
                &mut data,
            )
            .is_some()
            {
                renamed_duplicates += 1;
            }

            if model.record_type() == SCHEDULES_TABLE {
                touched_schedules.insert(record_id.clone());
            }

            if is_deleted {
                batch.soft_delete(model.record_type(), record_id.clone());
            } else {
                batch.put(model.record_type(), record_id.clone(), data);
            }

            let mut entry = RecordData::new();
            entry.insert("record_type".to_owned(), RecordValue::from(model.record_type()));
            entry.insert("record_id".to_owned(), RecordValue::from(record_id.clone()));
            if let Some(device_id) = device_id {
                entry.insert("device_id".to_owned(), RecordValue::from(device_id));
            }
            entry.insert("logged_at_sync_tick".to_owned(), RecordValue::from(tock as i64));
            batch.put(
                CHANGELOG_TABLE,
                format!("{}:{}:{}", model.record_type(), record_id, tock),
                entry,
            );

            saved_count += 1;
        }
    }

    let expected = snapshot
        .incoming()
        .filter(|row| included(&row.record_type))
        .count();
    if saved_count != expected {
        // add_incoming_changes validates record types, so a miss here
        // means a model was deregistered mid-session.
        let missing = snapshot
            .incoming()
            .find(|row| registry.get(&row.record_type).is_none())
            .map(|row| row.record_type.clone())
            .unwrap_or_default();
        return Err(SyncError::UnknownRecordType(missing));
    }

    batch.commit();
    snapshot.stamp_incoming_matching(tock, included);
    if let Some(device_id) = device_id {
        ledger.record(tock, device_id)?;
    }

    let adjust = clock.tick_tock();
    let stale_appointments_deleted =
        clean_stale_schedule_appointments(store, adjust.tock, &touched_schedules);

    tracing::info!(
        saved_at_sync_tick = tock,
        saved_count,
        renamed_duplicates,
        stale_appointments_deleted,
        "persisted incoming changes"
    );
    Ok(PersistOutcome {
        saved_at_sync_tick: tock,
        saved_count,
        renamed_duplicates,
        stale_appointments_deleted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolvers::APPOINTMENTS_TABLE;
    use clinsync_model::{ChangeRecord, ModelDef, SyncDirection};

    fn registry() -> ModelRegistry {
        let mut registry = ModelRegistry::new();
        registry
            .register(ModelDef::new("patients", SyncDirection::Bidirectional))
            .register(
                ModelDef::new("patient_allergies", SyncDirection::Bidirectional)
                    .with_patient_column("patient_id")
                    .with_deterministic_id("patient_id", "allergy_id"),
            )
            .register(ModelDef::new(SCHEDULES_TABLE, SyncDirection::Bidirectional))
            .register(ModelDef::new(APPOINTMENTS_TABLE, SyncDirection::Bidirectional));
        registry
    }

    fn data(pairs: &[(&str, RecordValue)]) -> RecordData {
        pairs.iter().map(|(k, v)| ((*k).to_owned(), v.clone())).collect()
    }

    fn setup() -> (Store, LogicalClock, ModelRegistry, DeviceTickLedger) {
        let store = Store::new();
        let clock = LogicalClock::new(store.clone(), 2);
        (store, clock, registry(), DeviceTickLedger::new())
    }

    #[test]
    fn persists_in_one_stamp_and_records_the_device() {
        let (store, clock, registry, ledger) = setup();
        let mut snapshot = SnapshotTable::new();
        snapshot.insert_incoming(&ChangeRecord::new(
            "patients",
            "p1",
            data(&[("name", RecordValue::from("alice"))]),
        ));
        snapshot.insert_incoming(
            &ChangeRecord::new("patients", "p2", RecordData::new()).deleted(),
        );

        let outcome = persist_incoming_changes(
            &store,
            &clock,
            &registry,
            &ledger,
            &mut snapshot,
            Some("mobile-1"),
            None,
        )
        .unwrap();

        assert_eq!(outcome.saved_count, 2);
        let p1 = store.get_row("patients", "p1").unwrap();
        assert_eq!(p1.updated_at_sync_tick, outcome.saved_at_sync_tick);
        assert!(store.get_row("patients", "p2").unwrap().is_deleted);
        assert_eq!(
            ledger.device_for(outcome.saved_at_sync_tick),
            Some("mobile-1".to_owned())
        );
        assert!(snapshot
            .incoming()
            .all(|r| r.saved_at_sync_tick == Some(outcome.saved_at_sync_tick)));
        // A changelog entry was written for each persisted change.
        assert_eq!(store.table_len(CHANGELOG_TABLE), 2);
    }

    #[test]
    fn deterministic_ids_merge_across_devices() {
        let (store, clock, registry, ledger) = setup();
        let allergy = data(&[
            ("patient_id", RecordValue::from("p1")),
            ("allergy_id", RecordValue::from("penicillin")),
        ]);

        for (local_id, device) in [("tmp-a", "device-a"), ("tmp-b", "device-b")] {
            let mut snapshot = SnapshotTable::new();
            snapshot.insert_incoming(&ChangeRecord::new("patient_allergies", local_id, allergy.clone()));
            persist_incoming_changes(&store, &clock, &registry, &ledger, &mut snapshot, Some(device), None)
                .unwrap();
        }

        // Both devices converged on the derived id; their local ids never
        // reached the table.
        assert_eq!(store.table_len("patient_allergies"), 1);
        let derived = deterministic_record_id("patient_allergies", "p1", "penicillin");
        assert!(store.get_row("patient_allergies", &derived).is_some());
    }

    #[test]
    fn audited_models_limit_what_persists() {
        let (store, clock, registry, ledger) = setup();
        let mut snapshot = SnapshotTable::new();
        snapshot.insert_incoming(&ChangeRecord::new(
            "patients",
            "p1",
            data(&[("name", RecordValue::from("alice"))]),
        ));
        snapshot.insert_incoming(&ChangeRecord::new(
            APPOINTMENTS_TABLE,
            "a1",
            data(&[("start_date", RecordValue::from("2026-09-01"))]),
        ));

        let audited = vec!["patients".to_owned()];
        let outcome = persist_incoming_changes(
            &store,
            &clock,
            &registry,
            &ledger,
            &mut snapshot,
            None,
            Some(&audited),
        )
        .unwrap();

        assert_eq!(outcome.saved_count, 1);
        assert!(store.get_row("patients", "p1").is_some());
        assert!(store.get_row(APPOINTMENTS_TABLE, "a1").is_none());
        // Only the audited row carries the persist stamp.
        for row in snapshot.incoming() {
            let stamped = row.saved_at_sync_tick.is_some();
            assert_eq!(stamped, row.record_type == "patients");
        }
    }

    #[test]
    fn duplicate_display_id_renames_both_records() {
        let (store, clock, registry, ledger) = setup();
        let mut seed = store.begin_write(clock.tick_tock().tock);
        seed.put(
            "patients",
            "p-existing",
            data(&[("display_id", RecordValue::from("ABC123"))]),
        );
        seed.commit();

        let mut snapshot = SnapshotTable::new();
        snapshot.insert_incoming(&ChangeRecord::new(
            "patients",
            "p-incoming",
            data(&[("display_id", RecordValue::from("ABC123"))]),
        ));
        let outcome =
            persist_incoming_changes(&store, &clock, &registry, &ledger, &mut snapshot, None, None)
                .unwrap();
        assert_eq!(outcome.renamed_duplicates, 1);

        let existing = store.get_row("patients", "p-existing").unwrap();
        let incoming = store.get_row("patients", "p-incoming").unwrap();
        assert_eq!(
            existing.data.get("display_id").and_then(RecordValue::as_text),
            Some("ABC123_duplicate_1")
        );
        assert_eq!(
            incoming.data.get("display_id").and_then(RecordValue::as_text),
            Some("ABC123_duplicate_2")
        );
        // Both renames carry the persist stamp, so both propagate.
        assert_eq!(existing.updated_at_sync_tick, outcome.saved_at_sync_tick);
    }

    #[test]
    fn schedule_push_triggers_stale_cleanup_above_the_persist_stamp() {
        let (store, clock, registry, ledger) = setup();
        let mut seed = store.begin_write(clock.tick_tock().tock);
        seed.put(
            APPOINTMENTS_TABLE,
            "a-out",
            data(&[
                ("schedule_id", RecordValue::from("s1")),
                ("start_date", RecordValue::from("2026-09-01")),
            ]),
        );
        seed.commit();

        let mut snapshot = SnapshotTable::new();
        snapshot.insert_incoming(&ChangeRecord::new(
            SCHEDULES_TABLE,
            "s1",
            data(&[("until_date", RecordValue::from("2026-06-30"))]),
        ));
        let outcome =
            persist_incoming_changes(&store, &clock, &registry, &ledger, &mut snapshot, None, None)
                .unwrap();

        assert_eq!(outcome.stale_appointments_deleted, 1);
        let deleted = store.get_row(APPOINTMENTS_TABLE, "a-out").unwrap();
        assert!(deleted.is_deleted);
        // Stamped after the persist tock, so a pull bounded by the later
        // tick still includes it.
        assert!(deleted.updated_at_sync_tick > outcome.saved_at_sync_tick);
    }
}
