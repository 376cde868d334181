//! Change records exchanged during a sync session.

use crate::value::RecordData;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which way a snapshot record is travelling within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionDirection {
    /// Pushed up by a device, waiting to be persisted centrally.
    Incoming,
    /// Captured centrally, waiting to be pulled down by a device.
    Outgoing,
}

/// A single record change, as pushed by or pulled down to a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// The model this change belongs to, e.g. `"patients"`.
    pub record_type: String,
    /// The changed record's id.
    pub record_id: String,
    /// True if this change is a (soft) deletion.
    pub is_deleted: bool,
    /// The record's columns. Binary columns are byte-exact.
    pub data: RecordData,
    /// Per-field update ticks, when the client tracks them. Summed into a
    /// cheap change-fingerprint on the snapshot row.
    pub updated_at_by_field: Option<BTreeMap<String, i64>>,
}

impl ChangeRecord {
    /// Creates a change record with no per-field ticks.
    pub fn new(
        record_type: impl Into<String>,
        record_id: impl Into<String>,
        data: RecordData,
    ) -> Self {
        Self {
            record_type: record_type.into(),
            record_id: record_id.into(),
            is_deleted: false,
            data,
            updated_at_by_field: None,
        }
    }

    /// Marks this change as a deletion.
    pub fn deleted(mut self) -> Self {
        self.is_deleted = true;
        self
    }

    /// Sums the per-field ticks into a single fingerprint, if present.
    pub fn field_tick_sum(&self) -> Option<i64> {
        self.updated_at_by_field
            .as_ref()
            .map(|fields| fields.values().sum())
    }
}

/// An audit entry attached to an outgoing snapshot record.
///
/// Changelog entries record which device wrote a change and at which sync
/// tick, so a pulling device can reconstruct edit history for merged
/// records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangelogEntry {
    /// The record the entry describes.
    pub record_type: String,
    /// The record's id.
    pub record_id: String,
    /// The device that produced the change, if known.
    pub device_id: Option<String>,
    /// The sync tick the change was persisted at.
    pub logged_at_sync_tick: u64,
}
