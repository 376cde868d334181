//! Sync direction declarations.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The direction a model is allowed to sync in, from the device's
/// perspective.
///
/// The central store enforces these declarations during both capture
/// phases: a model that does not allow incoming writes rejects the entire
/// push as a security violation, and a model that does not allow outgoing
/// reads is never snapshotted for pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncDirection {
    /// Never synced in either direction.
    DoNotSync,
    /// Devices push records up to the central store only.
    PushToCentral,
    /// Devices pull records down from the central store only.
    PullFromCentral,
    /// Synced in both directions.
    Bidirectional,
}

impl SyncDirection {
    /// Returns true if the central store accepts incoming pushes for this
    /// model.
    pub fn allows_incoming(&self) -> bool {
        matches!(
            self,
            SyncDirection::PushToCentral | SyncDirection::Bidirectional
        )
    }

    /// Returns true if the central store serves this model in outgoing
    /// pulls.
    pub fn allows_outgoing(&self) -> bool {
        matches!(
            self,
            SyncDirection::PullFromCentral | SyncDirection::Bidirectional
        )
    }
}

impl fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncDirection::DoNotSync => "do_not_sync",
            SyncDirection::PushToCentral => "push_to_central",
            SyncDirection::PullFromCentral => "pull_from_central",
            SyncDirection::Bidirectional => "bidirectional",
        };
        f.write_str(name)
    }
}
