//! Per-model sync declarations.

use crate::direction::SyncDirection;
use crate::value::{RecordData, RecordValue};
use std::collections::BTreeSet;

/// The scope a snapshot capture runs under.
///
/// Built once per capture pass from the session's facility ids and the
/// marked-for-sync patient partition.
#[derive(Debug, Clone, Default)]
pub struct SyncScope {
    /// Facilities the device belongs to.
    pub facility_ids: Vec<String>,
    /// Patients in scope for this capture pass.
    pub patient_ids: BTreeSet<String>,
    /// Deployment-wide override: lab requests sync regardless of the
    /// owning patient's marked-for-sync status.
    pub sync_all_lab_requests: bool,
}

impl SyncScope {
    /// Creates a scope over the given facilities and patients.
    pub fn new(facility_ids: Vec<String>, patient_ids: BTreeSet<String>) -> Self {
        Self {
            facility_ids,
            patient_ids,
            sync_all_lab_requests: false,
        }
    }

    /// Returns true if the patient is in scope.
    pub fn includes_patient(&self, patient_id: &str) -> bool {
        self.patient_ids.contains(patient_id)
    }

    /// Returns true if the facility is in scope.
    pub fn includes_facility(&self, facility_id: &str) -> bool {
        self.facility_ids.iter().any(|f| f == facility_id)
    }
}

/// A syncable model's declaration, consumed polymorphically by the capture
/// and cache components.
///
/// Implementations declare which direction the model syncs in and which
/// columns tie a row to a patient, facility or encounter. The provided
/// [`in_scope`](SyncModel::in_scope) filter is derived from those columns;
/// models with unusual scoping rules can override it.
pub trait SyncModel: Send + Sync {
    /// The model's record type, e.g. `"patients"`.
    fn record_type(&self) -> &str;

    /// The model's declared sync direction.
    fn sync_direction(&self) -> SyncDirection;

    /// Column holding the owning patient id, if the model is
    /// patient-linked.
    fn patient_column(&self) -> Option<&str> {
        None
    }

    /// Column holding the owning facility id, if the model is
    /// facility-scoped.
    fn facility_column(&self) -> Option<&str> {
        None
    }

    /// Column holding the owning encounter id, if any.
    fn encounter_column(&self) -> Option<&str> {
        None
    }

    /// True for lab request models, which may be configured to sync fully
    /// regardless of the patient partition.
    fn is_lab_request(&self) -> bool {
        false
    }

    /// Columns whose values deterministically derive this model's record
    /// ids, for derived records that independent writers must converge on.
    fn deterministic_id_parents(&self) -> Option<(&str, &str)> {
        None
    }

    /// True when rows ultimately belong to a patient, either through a
    /// direct patient column or through their encounter.
    fn is_patient_linked(&self) -> bool {
        self.patient_column().is_some() || self.encounter_column().is_some()
    }

    /// Returns true if a row belongs in the given capture scope.
    ///
    /// Covers the links readable off the row itself; encounter-linked
    /// models need the encounter row to name the patient, so the capture
    /// paths resolve that link before falling back to this filter.
    fn in_scope(&self, data: &RecordData, scope: &SyncScope) -> bool {
        if self.is_lab_request() && scope.sync_all_lab_requests {
            return true;
        }
        if let Some(column) = self.patient_column() {
            return match data.get(column).and_then(RecordValue::as_text) {
                Some(patient_id) => scope.includes_patient(patient_id),
                None => false,
            };
        }
        if let Some(column) = self.facility_column() {
            return match data.get(column).and_then(RecordValue::as_text) {
                Some(facility_id) => scope.includes_facility(facility_id),
                None => false,
            };
        }
        // Facility-independent reference data syncs everywhere.
        true
    }
}

/// A plain, builder-style [`SyncModel`] implementation.
///
/// Covers every model in practice; a bespoke trait impl is only needed for
/// models whose scope filter cannot be expressed through declared columns.
#[derive(Debug, Clone)]
pub struct ModelDef {
    record_type: String,
    direction: SyncDirection,
    patient_column: Option<String>,
    facility_column: Option<String>,
    encounter_column: Option<String>,
    is_lab_request: bool,
    deterministic_id_parents: Option<(String, String)>,
}

impl ModelDef {
    /// Creates a model declaration.
    pub fn new(record_type: impl Into<String>, direction: SyncDirection) -> Self {
        Self {
            record_type: record_type.into(),
            direction,
            patient_column: None,
            facility_column: None,
            encounter_column: None,
            is_lab_request: false,
            deterministic_id_parents: None,
        }
    }

    /// Declares the patient-link column.
    pub fn with_patient_column(mut self, column: impl Into<String>) -> Self {
        self.patient_column = Some(column.into());
        self
    }

    /// Declares the facility-scope column.
    pub fn with_facility_column(mut self, column: impl Into<String>) -> Self {
        self.facility_column = Some(column.into());
        self
    }

    /// Declares the encounter-link column.
    pub fn with_encounter_column(mut self, column: impl Into<String>) -> Self {
        self.encounter_column = Some(column.into());
        self
    }

    /// Marks this model as a lab request model.
    pub fn lab_request(mut self) -> Self {
        self.is_lab_request = true;
        self
    }

    /// Declares that record ids derive deterministically from two parent
    /// columns.
    pub fn with_deterministic_id(
        mut self,
        parent_a: impl Into<String>,
        parent_b: impl Into<String>,
    ) -> Self {
        self.deterministic_id_parents = Some((parent_a.into(), parent_b.into()));
        self
    }
}

impl SyncModel for ModelDef {
    fn record_type(&self) -> &str {
        &self.record_type
    }

    fn sync_direction(&self) -> SyncDirection {
        self.direction
    }

    fn patient_column(&self) -> Option<&str> {
        self.patient_column.as_deref()
    }

    fn facility_column(&self) -> Option<&str> {
        self.facility_column.as_deref()
    }

    fn encounter_column(&self) -> Option<&str> {
        self.encounter_column.as_deref()
    }

    fn is_lab_request(&self) -> bool {
        self.is_lab_request
    }

    fn deterministic_id_parents(&self) -> Option<(&str, &str)> {
        self.deterministic_id_parents
            .as_ref()
            .map(|(a, b)| (a.as_str(), b.as_str()))
    }
}
