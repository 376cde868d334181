//! The marked-for-sync resolver.

use clinsync_model::RecordValue;
use clinsync_store::StoreView;
use std::collections::BTreeSet;

/// Table associating patients with the facilities replicating them.
pub const PATIENT_FACILITIES_TABLE: &str = "patient_facilities";

/// Column linking an association row to its patient.
pub const PATIENT_COLUMN: &str = "patient_id";

/// Column linking an association row to its facility.
pub const FACILITY_COLUMN: &str = "facility_id";

/// Column holding the patient's last interaction time at the facility.
pub const LAST_INTERACTION_COLUMN: &str = "last_interaction_at";

/// The per-session partition of in-scope patients.
///
/// Newly marked patients (association created after the device's last-seen
/// tick) need a full historical resync; previously marked patients get
/// only the incremental delta, no matter how recently they were touched.
/// Newly marked patients beyond the full-sync cap are deferred entirely to
/// a later session: an incremental slice would silently hide their
/// history from a device that has never seen them.
#[derive(Debug, Clone, Default)]
pub struct PatientPartition {
    /// Patients receiving full historical treatment this session.
    pub full: BTreeSet<String>,
    /// Patients receiving only the incremental delta.
    pub incremental: BTreeSet<String>,
    /// Newly marked patients deferred to a later session.
    pub deferred: BTreeSet<String>,
}

impl PatientPartition {
    /// Number of patients receiving any treatment this session.
    pub fn in_scope_count(&self) -> usize {
        self.full.len() + self.incremental.len()
    }
}

/// Partitions the patients marked for sync at the given facilities.
///
/// `since` is the tick horizon the device last saw; an association row
/// stamped after it means the device has never seen that patient.
/// `full_limit` caps how many newly marked patients get the full
/// treatment, most recently interacted-with first.
pub fn build_partition(
    view: &StoreView,
    facility_ids: &[String],
    since: u64,
    full_limit: usize,
) -> PatientPartition {
    let mut partition = PatientPartition::default();
    let Some(table) = view.table(PATIENT_FACILITIES_TABLE) else {
        return partition;
    };

    // (last interaction, patient id) for newly marked rows, so ties sort
    // deterministically by id.
    let mut newly_marked: Vec<(i64, String)> = Vec::new();

    for row in table.rows() {
        if row.is_deleted {
            continue;
        }
        let Some(facility_id) = row.data.get(FACILITY_COLUMN).and_then(RecordValue::as_text) else {
            continue;
        };
        if !facility_ids.iter().any(|f| f == facility_id) {
            continue;
        }
        let Some(patient_id) = row.data.get(PATIENT_COLUMN).and_then(RecordValue::as_text) else {
            continue;
        };

        if row.updated_at_sync_tick > since {
            let last_interaction = row
                .data
                .get(LAST_INTERACTION_COLUMN)
                .and_then(RecordValue::as_integer)
                .unwrap_or(0);
            newly_marked.push((last_interaction, patient_id.to_owned()));
        } else {
            partition.incremental.insert(patient_id.to_owned());
        }
    }

    newly_marked.sort_by(|a, b| b.cmp(a));
    for (index, (_, patient_id)) in newly_marked.into_iter().enumerate() {
        if index < full_limit {
            partition.full.insert(patient_id);
        } else {
            partition.deferred.insert(patient_id);
        }
    }

    partition
}
