//! End-to-end session flows against an in-memory store.

use clinsync_engine::lookup::lookup_horizon;
use clinsync_engine::marked::{
    FACILITY_COLUMN, LAST_INTERACTION_COLUMN, PATIENT_COLUMN, PATIENT_FACILITIES_TABLE,
};
use clinsync_engine::{
    EngineConfig, LogicalClock, PullParams, SessionId, SessionOptions, SnapshotRow, SyncError,
    SyncManager,
};
use clinsync_model::{ChangeRecord, ModelDef, ModelRegistry, RecordData, RecordValue, SyncDirection};
use clinsync_store::Store;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn registry() -> ModelRegistry {
    let mut registry = ModelRegistry::new();
    registry
        .register(
            ModelDef::new("patients", SyncDirection::Bidirectional).with_patient_column("id"),
        )
        .register(
            ModelDef::new(PATIENT_FACILITIES_TABLE, SyncDirection::Bidirectional)
                .with_patient_column(PATIENT_COLUMN),
        )
        .register(
            ModelDef::new("encounters", SyncDirection::Bidirectional)
                .with_patient_column(PATIENT_COLUMN),
        )
        .register(
            ModelDef::new("lab_requests", SyncDirection::Bidirectional)
                .with_patient_column(PATIENT_COLUMN)
                .lab_request(),
        )
        .register(
            ModelDef::new("vitals", SyncDirection::Bidirectional)
                .with_encounter_column("encounter_id"),
        )
        .register(ModelDef::new("reference_data", SyncDirection::PullFromCentral));
    registry
}

fn manager_with(config: EngineConfig) -> (SyncManager, Store, LogicalClock) {
    let store = Store::new();
    let clock = LogicalClock::new(store.clone(), 2);
    let manager = SyncManager::new(store.clone(), registry(), config).unwrap();
    (manager, store, clock)
}

fn manager() -> (SyncManager, Store, LogicalClock) {
    manager_with(EngineConfig::new().awaiting_preparation())
}

fn data(pairs: &[(&str, RecordValue)]) -> RecordData {
    pairs.iter().map(|(k, v)| ((*k).to_owned(), v.clone())).collect()
}

fn write(store: &Store, clock: &LogicalClock, table: &str, id: &str, row: RecordData) -> u64 {
    let tock = clock.tick_tock().tock;
    let mut batch = store.begin_write(tock);
    batch.put(table, id, row);
    batch.commit();
    tock
}

fn mark_patient(store: &Store, clock: &LogicalClock, patient: &str, facility: &str, interacted: i64) -> u64 {
    write(
        store,
        clock,
        PATIENT_FACILITIES_TABLE,
        &format!("{patient}-{facility}"),
        data(&[
            (PATIENT_COLUMN, RecordValue::from(patient)),
            (FACILITY_COLUMN, RecordValue::from(facility)),
            (LAST_INTERACTION_COLUMN, RecordValue::from(interacted)),
        ]),
    )
}

fn start_ready_session(manager: &SyncManager, facility: &str, since: u64) -> SessionId {
    let id = manager.start_session(SessionOptions {
        device_id: Some("device-1".to_owned()),
        facility_ids: vec![facility.to_owned()],
        since: Some(since),
        ..SessionOptions::default()
    });
    assert!(manager.check_session_ready(id).unwrap());
    id
}

fn pull_all(manager: &SyncManager, id: SessionId, since: u64, facility: &str) -> Vec<SnapshotRow> {
    manager
        .initiate_pull(
            id,
            PullParams {
                since,
                facility_ids: vec![facility.to_owned()],
                ..PullParams::default()
            },
        )
        .unwrap();
    assert!(manager.check_pull_ready(id).unwrap());
    manager.get_outgoing_changes(id, 0, None).unwrap()
}

fn record_keys(rows: &[SnapshotRow]) -> Vec<(String, String)> {
    rows.iter().map(|r| (r.record_type.clone(), r.record_id.clone())).collect()
}

#[test]
fn full_session_push_then_pull() {
    init_tracing();
    let (manager, store, clock) = manager();
    write(&store, &clock, "patients", "p1", data(&[("id", RecordValue::from("p1"))]));
    mark_patient(&store, &clock, "p1", "f1", 100);
    write(&store, &clock, "reference_data", "rd1", data(&[("code", RecordValue::from("ICD-10"))]));

    let id = start_ready_session(&manager, "f1", 0);
    manager.connect_to_session(id).unwrap();

    // Push an encounter for the marked patient.
    let encounter = data(&[(PATIENT_COLUMN, RecordValue::from("p1"))]);
    manager
        .add_incoming_changes(id, &[ChangeRecord::new("encounters", "e1", encounter)])
        .unwrap();
    manager.complete_push(id, None, None).unwrap();
    assert!(manager.check_push_complete(id).unwrap());

    // Persisted authoritatively and attributed to the device.
    let saved = store.get_row("encounters", "e1").unwrap();
    assert_eq!(
        manager.device_ledger().device_for(saved.updated_at_sync_tick),
        Some("device-1".to_owned())
    );

    let rows = pull_all(&manager, id, 0, "f1");
    let keys = record_keys(&rows);
    assert!(keys.contains(&("patients".to_owned(), "p1".to_owned())));
    assert!(keys.contains(&("reference_data".to_owned(), "rd1".to_owned())));
    // The device's own push is not echoed back.
    assert!(!keys.contains(&("encounters".to_owned(), "e1".to_owned())));

    let metadata = manager.pull_metadata(id).unwrap();
    assert_eq!(metadata.total_to_pull, rows.len());
    assert!(metadata.pull_until > saved.updated_at_sync_tick);

    manager.end_session(id).unwrap();
    assert!(matches!(
        manager.connect_to_session(id),
        Err(SyncError::SessionCompleted(_))
    ));
}

#[test]
fn outgoing_pages_follow_dependency_order() {
    let (manager, store, clock) = manager();
    mark_patient(&store, &clock, "p1", "f1", 100);
    // Children written before their parent.
    write(&store, &clock, "encounters", "e1", data(&[(PATIENT_COLUMN, RecordValue::from("p1"))]));
    write(&store, &clock, "patients", "p1", data(&[("id", RecordValue::from("p1"))]));

    let id = start_ready_session(&manager, "f1", 0);
    let rows = pull_all(&manager, id, 0, "f1");

    let patient_pos = rows.iter().position(|r| r.record_type == "patients").unwrap();
    let encounter_pos = rows.iter().position(|r| r.record_type == "encounters").unwrap();
    assert!(patient_pos < encounter_pos);

    // Paging respects the same order with a page size of one.
    let mut paged = Vec::new();
    let mut offset = 0;
    loop {
        let page = manager.get_outgoing_changes(id, offset, Some(1)).unwrap();
        if page.is_empty() {
            break;
        }
        offset += page.len();
        paged.extend(page);
    }
    assert_eq!(record_keys(&paged), record_keys(&rows));
}

#[test]
fn snapshot_boundary_excludes_later_writes() {
    let (manager, store, clock) = manager();
    mark_patient(&store, &clock, "p1", "f1", 100);
    write(&store, &clock, "patients", "p1", data(&[("id", RecordValue::from("p1"))]));

    let first = start_ready_session(&manager, "f1", 0);
    let rows = pull_all(&manager, first, 0, "f1");
    let first_until = manager.pull_metadata(first).unwrap().pull_until;
    assert!(record_keys(&rows).contains(&("patients".to_owned(), "p1".to_owned())));

    // A write after the boundary is invisible to this snapshot but lands
    // in the next session's interval.
    write(&store, &clock, "patients", "p1", data(&[
        ("id", RecordValue::from("p1")),
        ("name", RecordValue::from("renamed")),
    ]));
    assert_eq!(manager.get_outgoing_changes(first, 0, None).unwrap().len(), rows.len());
    manager.end_session(first).unwrap();

    let second = start_ready_session(&manager, "f1", first_until);
    let rows = pull_all(&manager, second, first_until, "f1");
    assert_eq!(record_keys(&rows), [("patients".to_owned(), "p1".to_owned())]);
}

#[test]
fn capture_waits_for_in_flight_writes_below_the_boundary() {
    let (manager, store, clock) = manager();
    mark_patient(&store, &clock, "p1", "f1", 100);

    // An open batch stamped below the capture boundary: the barrier must
    // wait for it, so the row is present despite committing late.
    let mut batch = store.begin_write(clock.tick_tock().tock);
    batch.put("patients", "p1", data(&[("id", RecordValue::from("p1"))]));
    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(40));
        batch.commit();
    });

    let id = start_ready_session(&manager, "f1", 0);
    let rows = pull_all(&manager, id, 0, "f1");
    handle.join().unwrap();
    assert!(record_keys(&rows).contains(&("patients".to_owned(), "p1".to_owned())));
}

#[test]
fn newly_marked_patients_are_capped_and_deferred_entirely() {
    let (manager, store, clock) = manager();
    // Historical records, written long before the device's horizon.
    for patient in ["p-recent", "p-stale", "p-known"] {
        write(&store, &clock, "patients", patient, data(&[("id", RecordValue::from(patient))]));
        write(
            &store,
            &clock,
            "encounters",
            &format!("e-{patient}"),
            data(&[(PATIENT_COLUMN, RecordValue::from(patient))]),
        );
    }
    let since = mark_patient(&store, &clock, "p-known", "f1", 999);
    mark_patient(&store, &clock, "p-recent", "f1", 200);
    mark_patient(&store, &clock, "p-stale", "f1", 100);

    let id = start_ready_session(&manager, "f1", since);
    manager
        .initiate_pull(
            id,
            PullParams {
                since,
                facility_ids: vec!["f1".to_owned()],
                full_sync_patient_cap: Some(1),
                ..PullParams::default()
            },
        )
        .unwrap();
    assert!(manager.check_pull_ready(id).unwrap());
    let keys = record_keys(&manager.get_outgoing_changes(id, 0, None).unwrap());

    // The most recently interacted-with new patient gets full history.
    assert!(keys.contains(&("patients".to_owned(), "p-recent".to_owned())));
    assert!(keys.contains(&("encounters".to_owned(), "e-p-recent".to_owned())));
    // Beyond the cap: deferred entirely, not trimmed to a delta.
    assert!(!keys.iter().any(|(_, id)| id.contains("p-stale")));
    // Previously marked patients stay incremental no matter how recently
    // they were touched; their history predates `since`.
    assert!(!keys.contains(&("encounters".to_owned(), "e-p-known".to_owned())));
}

#[test]
fn incoming_direction_violation_errors_the_session() {
    let (manager, _store, _clock) = manager();
    let id = start_ready_session(&manager, "f1", 0);

    let err = manager
        .add_incoming_changes(
            id,
            &[ChangeRecord::new("reference_data", "rd9", RecordData::new())],
        )
        .unwrap_err();
    assert!(matches!(err, SyncError::SecurityViolation { .. }));

    // The offending record is recorded for triage.
    let err = manager.connect_to_session(id).unwrap_err();
    let message = err.to_string();
    assert!(message.contains(&id.to_string()));
    assert!(message.contains("reference_data"));

    // Exactly one error entry, and the rejected record in debug info.
    let session = manager.session_snapshot(id).unwrap();
    assert_eq!(session.errors.len(), 1);
    assert_eq!(
        session.debug_info.get("rejectedRecord"),
        Some(&serde_json::json!({ "type": "reference_data", "id": "rd9" }))
    );

    // Terminal: every subsequent operation surfaces the stored error.
    assert!(manager.check_session_ready(id).is_err());
    assert!(manager.check_pull_ready(id).is_err());
    assert!(manager.get_outgoing_changes(id, 0, None).is_err());
    assert!(manager.end_session(id).is_err());
}

#[test]
fn encounter_linked_records_stay_in_their_patients_scope() {
    let (manager, store, clock) = manager();
    mark_patient(&store, &clock, "p1", "f1", 100);
    mark_patient(&store, &clock, "p2", "f2", 100);
    for (patient, encounter, vital) in [("p1", "e1", "v1"), ("p2", "e2", "v2")] {
        write(&store, &clock, "patients", patient, data(&[("id", RecordValue::from(patient))]));
        write(
            &store,
            &clock,
            "encounters",
            encounter,
            data(&[(PATIENT_COLUMN, RecordValue::from(patient))]),
        );
        write(
            &store,
            &clock,
            "vitals",
            vital,
            data(&[("encounter_id", RecordValue::from(encounter))]),
        );
    }

    let id = start_ready_session(&manager, "f1", 0);
    let keys = record_keys(&pull_all(&manager, id, 0, "f1"));

    // Records owned through an encounter follow that encounter's patient:
    // p2 belongs to another facility, so nothing of its chart leaks.
    assert!(keys.contains(&("vitals".to_owned(), "v1".to_owned())));
    assert!(!keys.iter().any(|(_, record_id)| record_id == "v2"));
    assert!(!keys.iter().any(|(_, record_id)| record_id == "e2" || record_id == "p2"));
}

#[test]
fn audited_push_persists_only_the_named_models() {
    let (manager, store, clock) = manager();
    mark_patient(&store, &clock, "p1", "f1", 100);

    let id = start_ready_session(&manager, "f1", 0);
    manager
        .add_incoming_changes(
            id,
            &[
                ChangeRecord::new(
                    "encounters",
                    "e1",
                    data(&[(PATIENT_COLUMN, RecordValue::from("p1"))]),
                ),
                ChangeRecord::new(
                    "lab_requests",
                    "lr1",
                    data(&[(PATIENT_COLUMN, RecordValue::from("p1"))]),
                ),
            ],
        )
        .unwrap();
    manager
        .complete_push(id, None, Some(vec!["encounters".to_owned()]))
        .unwrap();
    assert!(manager.check_push_complete(id).unwrap());

    assert!(store.get_row("encounters", "e1").is_some());
    assert!(store.get_row("lab_requests", "lr1").is_none());
}

#[test]
fn idle_sessions_time_out_terminally() {
    let (manager, _store, _clock) = manager_with(
        EngineConfig::new()
            .awaiting_preparation()
            .with_session_timeout(Duration::from_millis(20)),
    );
    let id = start_ready_session(&manager, "f1", 0);
    std::thread::sleep(Duration::from_millis(50));

    assert!(manager.connect_to_session(id).is_err());
    // Still terminal after the error is recorded.
    assert!(manager.connect_to_session(id).is_err());
    assert!(manager.check_session_ready(id).is_err());
}

#[test]
fn capacity_reflects_active_sessions_only() {
    let (manager, _store, _clock) = manager_with(
        EngineConfig::new().awaiting_preparation().with_session_timeout(Duration::from_secs(60)),
    );
    assert!(!manager.is_sync_capacity_full());

    let sessions: Vec<_> = (0..4).map(|_| start_ready_session(&manager, "f1", 0)).collect();
    assert!(manager.is_sync_capacity_full());

    for id in sessions {
        manager.end_session(id).unwrap();
    }
    assert!(!manager.is_sync_capacity_full());
}

#[test]
fn permission_predicate_limits_served_models() {
    let (manager, store, clock) = manager();
    mark_patient(&store, &clock, "p1", "f1", 100);
    write(&store, &clock, "patients", "p1", data(&[("id", RecordValue::from("p1"))]));
    write(&store, &clock, "reference_data", "rd1", data(&[("code", RecordValue::from("x"))]));

    let id = start_ready_session(&manager, "f1", 0);
    manager
        .initiate_pull_filtered(
            id,
            PullParams {
                since: 0,
                facility_ids: vec!["f1".to_owned()],
                ..PullParams::default()
            },
            |m| m.record_type() != "reference_data",
        )
        .unwrap();
    assert!(manager.check_pull_ready(id).unwrap());

    let keys = record_keys(&manager.get_outgoing_changes(id, 0, None).unwrap());
    assert!(keys.contains(&("patients".to_owned(), "p1".to_owned())));
    assert!(!keys.iter().any(|(record_type, _)| record_type == "reference_data"));
}

#[test]
fn duplicate_display_ids_propagate_to_all_clients() {
    let (manager, store, clock) = manager();
    mark_patient(&store, &clock, "p-existing", "f1", 100);
    mark_patient(&store, &clock, "p-incoming", "f1", 100);
    write(
        &store,
        &clock,
        "patients",
        "p-existing",
        data(&[("id", RecordValue::from("p-existing")), ("display_id", RecordValue::from("ABC123"))]),
    );

    let id = start_ready_session(&manager, "f1", 0);
    manager
        .add_incoming_changes(
            id,
            &[ChangeRecord::new(
                "patients",
                "p-incoming",
                data(&[("id", RecordValue::from("p-incoming")), ("display_id", RecordValue::from("ABC123"))]),
            )],
        )
        .unwrap();
    manager.complete_push(id, Some("device-9".to_owned()), None).unwrap();
    assert!(manager.check_push_complete(id).unwrap());

    let rows = pull_all(&manager, id, 0, "f1");
    let display_of = |record_id: &str| {
        rows.iter()
            .find(|r| r.record_id == record_id)
            .and_then(|r| r.data.get("display_id"))
            .and_then(RecordValue::as_text)
            .map(str::to_owned)
    };
    // Both renames reach the pulling side; the incoming record survives
    // echo removal because its data changed on the way in.
    assert_eq!(display_of("p-existing").as_deref(), Some("ABC123_duplicate_1"));
    assert_eq!(display_of("p-incoming").as_deref(), Some("ABC123_duplicate_2"));

    // The incoming record carries its audit trail.
    let incoming = rows.iter().find(|r| r.record_id == "p-incoming").unwrap();
    assert!(incoming
        .changelog_records
        .iter()
        .any(|e| e.device_id.as_deref() == Some("device-9")));
}

#[test]
fn lookup_path_serves_the_same_changes_as_direct() {
    init_tracing();
    let store = Store::new();
    let clock = LogicalClock::new(store.clone(), 2);
    let direct = SyncManager::new(
        store.clone(),
        registry(),
        EngineConfig::new().awaiting_preparation(),
    )
    .unwrap();
    let cached = SyncManager::new(
        store.clone(),
        registry(),
        EngineConfig::new().awaiting_preparation().with_lookup_enabled(true),
    )
    .unwrap();

    mark_patient(&store, &clock, "p1", "f1", 100);
    write(&store, &clock, "patients", "p1", data(&[("id", RecordValue::from("p1"))]));
    write(&store, &clock, "encounters", "e1", data(&[(PATIENT_COLUMN, RecordValue::from("p1"))]));
    // Patient-linked only through its encounter; the cache serves it off
    // the denormalized link, the direct path resolves it live.
    write(&store, &clock, "vitals", "v1", data(&[("encounter_id", RecordValue::from("e1"))]));
    write(&store, &clock, "reference_data", "rd1", data(&[("code", RecordValue::from("x"))]));

    // Until the cache is built, cached sessions refuse to prepare.
    let premature = cached.start_session(SessionOptions {
        facility_ids: vec!["f1".to_owned()],
        since: Some(0),
        ..SessionOptions::default()
    });
    let err = cached.check_session_ready(premature).unwrap_err();
    assert!(err.to_string().contains("lookup"));

    cached.update_lookup_table().unwrap();

    let direct_session = start_ready_session(&direct, "f1", 0);
    let cached_session = start_ready_session(&cached, "f1", 0);
    let mut direct_rows = record_keys(&pull_all(&direct, direct_session, 0, "f1"));
    let mut cached_rows = record_keys(&pull_all(&cached, cached_session, 0, "f1"));
    direct_rows.sort();
    cached_rows.sort();
    assert!(cached_rows.contains(&("vitals".to_owned(), "v1".to_owned())));
    assert_eq!(direct_rows, cached_rows);
}

#[test]
fn lookup_pull_horizon_is_clamped_to_the_cache() {
    let (_, store, clock) = manager();
    let cached = SyncManager::new(
        store.clone(),
        registry(),
        EngineConfig::new().awaiting_preparation().with_lookup_enabled(true),
    )
    .unwrap();
    mark_patient(&store, &clock, "p1", "f1", 100);
    cached.update_lookup_table().unwrap();
    let horizon = lookup_horizon(&store).unwrap();

    // Written after the refresh: beyond the cache's horizon.
    write(&store, &clock, "reference_data", "rd-late", data(&[("code", RecordValue::from("x"))]));

    let id = start_ready_session(&cached, "f1", 0);
    let rows = pull_all(&cached, id, 0, "f1");
    let metadata = cached.pull_metadata(id).unwrap();
    assert_eq!(metadata.pull_until, horizon);
    assert!(metadata.pull_until < clock.current());
    assert!(!record_keys(&rows).contains(&("reference_data".to_owned(), "rd-late".to_owned())));
}

mod clock_properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        // Intervals from one clock never overlap and always advance, for
        // any even increment.
        #[test]
        fn tick_tock_intervals_stay_disjoint(half in 1u64..8, count in 1usize..50) {
            let store = Store::new();
            let clock = LogicalClock::new(store, half * 2);

            let mut previous_tock = 0;
            for _ in 0..count {
                let interval = clock.tick_tock();
                prop_assert!(interval.tick > previous_tock);
                prop_assert_eq!(interval.tock, interval.tick + 1);
                previous_tock = interval.tock;
            }
        }
    }
}
