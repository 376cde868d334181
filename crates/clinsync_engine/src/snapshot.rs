//! Per-session ephemeral snapshot tables.

use crate::error::{SyncError, SyncResult};
use crate::session::SessionId;
use clinsync_model::{ChangeRecord, ChangelogEntry, RecordData, SessionDirection};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A candidate change row held in a session's snapshot table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRow {
    /// Per-session monotonic row id; outgoing retrieval pages over it.
    pub id: u64,
    /// Which way the row is travelling.
    pub direction: SessionDirection,
    /// The model the row belongs to.
    pub record_type: String,
    /// The changed record's id.
    pub record_id: String,
    /// True for (soft) deletions.
    pub is_deleted: bool,
    /// The record's projected columns.
    pub data: RecordData,
    /// Cheap change-fingerprint summed from per-field ticks, when the
    /// pushing client tracked them.
    pub updated_at_by_field_sum: Option<i64>,
    /// Audit entries attached to outgoing rows.
    pub changelog_records: Vec<ChangelogEntry>,
    /// The tock incoming rows were persisted at, once committed.
    pub saved_at_sync_tick: Option<u64>,
}

/// One session's ephemeral snapshot table.
///
/// Holds candidate outgoing and incoming change rows before they are
/// committed to authoritative tables; destroyed with the session.
/// Insertion happens in model-registry (dependency) order, so paging over
/// row ids yields dependency-ordered retrieval.
#[derive(Debug, Default)]
pub struct SnapshotTable {
    next_id: u64,
    rows: Vec<SnapshotRow>,
}

impl SnapshotTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an outgoing candidate row.
    pub fn insert_outgoing(
        &mut self,
        record_type: impl Into<String>,
        record_id: impl Into<String>,
        is_deleted: bool,
        data: RecordData,
        changelog_records: Vec<ChangelogEntry>,
    ) {
        self.next_id += 1;
        self.rows.push(SnapshotRow {
            id: self.next_id,
            direction: SessionDirection::Outgoing,
            record_type: record_type.into(),
            record_id: record_id.into(),
            is_deleted,
            data,
            updated_at_by_field_sum: None,
            changelog_records,
            saved_at_sync_tick: None,
        });
    }

    /// Appends an incoming pushed change.
    pub fn insert_incoming(&mut self, change: &ChangeRecord) {
        self.next_id += 1;
        self.rows.push(SnapshotRow {
            id: self.next_id,
            direction: SessionDirection::Incoming,
            record_type: change.record_type.clone(),
            record_id: change.record_id.clone(),
            is_deleted: change.is_deleted,
            data: change.data.clone(),
            updated_at_by_field_sum: change.field_tick_sum(),
            changelog_records: Vec::new(),
            saved_at_sync_tick: None,
        });
    }

    /// An ordered page of outgoing rows.
    pub fn outgoing_page(&self, offset: usize, limit: usize) -> Vec<SnapshotRow> {
        self.rows
            .iter()
            .filter(|r| r.direction == SessionDirection::Outgoing)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Number of rows travelling in the given direction.
    pub fn count(&self, direction: SessionDirection) -> usize {
        self.rows.iter().filter(|r| r.direction == direction).count()
    }

    /// The incoming rows, in arrival order.
    pub fn incoming(&self) -> impl Iterator<Item = &SnapshotRow> {
        self.rows.iter().filter(|r| r.direction == SessionDirection::Incoming)
    }

    /// Stamps every incoming row with the tock it was persisted at.
    pub fn stamp_incoming(&mut self, tock: u64) {
        self.stamp_incoming_matching(tock, |_| true);
    }

    /// Stamps incoming rows of the accepted record types; rows a filtered
    /// persist skipped stay unstamped.
    pub fn stamp_incoming_matching(&mut self, tock: u64, mut accept: impl FnMut(&str) -> bool) {
        for row in &mut self.rows {
            if row.direction == SessionDirection::Incoming && accept(&row.record_type) {
                row.saved_at_sync_tick = Some(tock);
            }
        }
    }

    /// Deletes outgoing rows that merely echo a change pushed in this
    /// same session.
    ///
    /// An outgoing row is an echo when an incoming row exists for the
    /// same record with identical projected data and deletion flag; rows
    /// the central store adjusted after the push (renamed identifiers,
    /// retroactive deletions) differ in data and survive. Returns the
    /// number of rows removed.
    pub fn remove_echoed(&mut self) -> usize {
        let incoming: Vec<(String, String, bool, RecordData)> = self
            .incoming()
            .map(|r| (r.record_type.clone(), r.record_id.clone(), r.is_deleted, r.data.clone()))
            .collect();

        let before = self.rows.len();
        self.rows.retain(|row| {
            if row.direction != SessionDirection::Outgoing {
                return true;
            }
            !incoming.iter().any(|(record_type, record_id, is_deleted, data)| {
                *record_type == row.record_type
                    && *record_id == row.record_id
                    && *is_deleted == row.is_deleted
                    && *data == row.data
            })
        });
        before - self.rows.len()
    }
}

/// The set of live snapshot tables, one per active session.
///
/// Strict isolation: concurrent sessions never observe each other's
/// candidate rows. Each table carries its own lock; the registry lock is
/// held only long enough to look a table up, so one session's capture or
/// persist never blocks another's.
#[derive(Default)]
pub struct SnapshotStore {
    tables: Mutex<BTreeMap<SessionId, Arc<Mutex<SnapshotTable>>>>,
}

impl SnapshotStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the session's table.
    pub fn create(&self, session_id: SessionId) {
        self.tables
            .lock()
            .insert(session_id, Arc::new(Mutex::new(SnapshotTable::new())));
    }

    /// Drops the session's table.
    pub fn drop_table(&self, session_id: SessionId) {
        self.tables.lock().remove(&session_id);
    }

    /// Runs `f` against the session's table, holding only that table's
    /// lock while it runs.
    pub fn with<R>(
        &self,
        session_id: SessionId,
        f: impl FnOnce(&mut SnapshotTable) -> R,
    ) -> SyncResult<R> {
        let table = self
            .tables
            .lock()
            .get(&session_id)
            .cloned()
            .ok_or(SyncError::SessionNotFound(session_id))?;
        let mut table = table.lock();
        Ok(f(&mut table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clinsync_model::RecordValue;
    use uuid::Uuid;

    fn data(name: &str) -> RecordData {
        let mut data = RecordData::new();
        data.insert("name".to_owned(), RecordValue::from(name));
        data
    }

    #[test]
    fn outgoing_paging_preserves_insertion_order() {
        let mut table = SnapshotTable::new();
        for i in 0..5 {
            table.insert_outgoing("patients", format!("p{i}"), false, data("x"), Vec::new());
        }

        let page = table.outgoing_page(1, 2);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].record_id, "p1");
        assert_eq!(page[1].record_id, "p2");
    }

    #[test]
    fn incoming_rows_are_not_served() {
        let mut table = SnapshotTable::new();
        table.insert_incoming(&ChangeRecord::new("patients", "p1", data("a")));
        table.insert_outgoing("patients", "p2", false, data("b"), Vec::new());

        let page = table.outgoing_page(0, 10);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].record_id, "p2");
        assert_eq!(table.count(SessionDirection::Incoming), 1);
        assert_eq!(table.count(SessionDirection::Outgoing), 1);
    }

    #[test]
    fn stamp_incoming_sets_saved_tick() {
        let mut table = SnapshotTable::new();
        table.insert_incoming(&ChangeRecord::new("patients", "p1", data("a")));
        table.insert_outgoing("patients", "p2", false, data("b"), Vec::new());

        table.stamp_incoming(42);
        assert_eq!(table.incoming().next().unwrap().saved_at_sync_tick, Some(42));
        assert_eq!(table.outgoing_page(0, 10)[0].saved_at_sync_tick, None);
    }

    #[test]
    fn echo_removal_matches_identical_data_only() {
        let mut table = SnapshotTable::new();
        table.insert_incoming(&ChangeRecord::new("patients", "p1", data("same")));
        // Pure echo: identical data.
        table.insert_outgoing("patients", "p1", false, data("same"), Vec::new());
        // Adjusted after push: survives.
        table.insert_outgoing("patients", "p2", false, data("changed"), Vec::new());

        assert_eq!(table.remove_echoed(), 1);
        let remaining = table.outgoing_page(0, 10);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].record_id, "p2");
    }

    #[test]
    fn sessions_are_isolated() {
        let store = SnapshotStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store.create(a);
        store.create(b);

        store
            .with(a, |t| t.insert_outgoing("patients", "p1", false, data("x"), Vec::new()))
            .unwrap();

        assert_eq!(store.with(a, |t| t.count(SessionDirection::Outgoing)).unwrap(), 1);
        assert_eq!(store.with(b, |t| t.count(SessionDirection::Outgoing)).unwrap(), 0);

        store.drop_table(a);
        assert!(store.with(a, |_| ()).is_err());
    }

    #[test]
    fn one_sessions_work_does_not_block_another() {
        let store = Arc::new(SnapshotStore::new());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store.create(a);
        store.create(b);

        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let worker = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                store
                    .with(a, |t| {
                        entered_tx.send(()).unwrap();
                        release_rx.recv().unwrap();
                        t.insert_outgoing("patients", "p1", false, data("x"), Vec::new());
                    })
                    .unwrap();
            })
        };

        // While a's closure is parked mid-capture, b's table stays
        // reachable; a single store-wide lock would deadlock here.
        entered_rx.recv().unwrap();
        store
            .with(b, |t| t.insert_outgoing("patients", "p2", false, data("y"), Vec::new()))
            .unwrap();
        release_tx.send(()).unwrap();
        worker.join().unwrap();

        assert_eq!(store.with(a, |t| t.count(SessionDirection::Outgoing)).unwrap(), 1);
        assert_eq!(store.with(b, |t| t.count(SessionDirection::Outgoing)).unwrap(), 1);
    }
}
