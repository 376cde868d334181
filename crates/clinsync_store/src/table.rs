//! Tables of tick-stamped rows.

use clinsync_model::RecordData;
use std::collections::BTreeMap;

/// A stored record row.
///
/// Every write stamps `updated_at_sync_tick` with the writer's sync tick;
/// deletions are soft, keeping the row (and its data) visible to capture
/// so the deletion itself can propagate to devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    /// The record id.
    pub id: String,
    /// The record's columns.
    pub data: RecordData,
    /// The sync tick of the last write to this row.
    pub updated_at_sync_tick: u64,
    /// True if the row has been soft-deleted.
    pub is_deleted: bool,
}

/// A named table of rows, keyed by record id.
#[derive(Debug, Clone, Default)]
pub struct Table {
    rows: BTreeMap<String, Row>,
}

impl Table {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the row with the given id.
    pub fn get(&self, id: &str) -> Option<&Row> {
        self.rows.get(id)
    }

    /// Inserts or replaces a row, stamping it with `tick`.
    pub fn upsert(&mut self, id: impl Into<String>, data: RecordData, tick: u64) {
        let id = id.into();
        self.rows.insert(
            id.clone(),
            Row {
                id,
                data,
                updated_at_sync_tick: tick,
                is_deleted: false,
            },
        );
    }

    /// Soft-deletes a row, stamping the deletion with `tick`.
    ///
    /// Deleting an unknown id records a bare deleted row so the deletion
    /// still propagates.
    pub fn soft_delete(&mut self, id: impl Into<String>, tick: u64) {
        let id = id.into();
        let row = self.rows.entry(id.clone()).or_insert_with(|| Row {
            id,
            data: RecordData::new(),
            updated_at_sync_tick: tick,
            is_deleted: false,
        });
        row.is_deleted = true;
        row.updated_at_sync_tick = tick;
    }

    /// Rows whose last-write tick falls in the closed-open interval
    /// `(since, until]`, in id order.
    pub fn changed_in(&self, since: u64, until: u64) -> impl Iterator<Item = &Row> {
        self.rows
            .values()
            .filter(move |row| row.updated_at_sync_tick > since && row.updated_at_sync_tick <= until)
    }

    /// All rows, in id order.
    pub fn rows(&self) -> impl Iterator<Item = &Row> {
        self.rows.values()
    }

    /// Number of rows (including soft-deleted ones).
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if the table holds no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
