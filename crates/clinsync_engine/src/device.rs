//! The device tick ledger.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Records which tick value was allocated to which client device during a
/// push.
///
/// One entry per committed push, keyed by the tock the push was persisted
/// at. Because tick-tock never hands out the same tock twice, concurrent
/// pushes can never appear to share a tick; the ledger enforces the
/// invariant anyway so a violation surfaces loudly instead of silently
/// corrupting conflict resolution.
#[derive(Debug, Default)]
pub struct DeviceTickLedger {
    entries: Mutex<BTreeMap<u64, String>>,
}

impl DeviceTickLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `device_id`'s push was persisted at `tick`.
    pub fn record(&self, tick: u64, device_id: impl Into<String>) -> SyncResult<()> {
        let device_id = device_id.into();
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&tick) {
            if *existing != device_id {
                return Err(SyncError::DeviceTickConflict {
                    tick,
                    existing: existing.clone(),
                    device: device_id,
                });
            }
            return Ok(());
        }
        entries.insert(tick, device_id);
        Ok(())
    }

    /// The device that pushed at `tick`, if any.
    pub fn device_for(&self, tick: u64) -> Option<String> {
        self.entries.lock().get(&tick).cloned()
    }

    /// The most recent tick recorded for a device.
    pub fn last_tick_for(&self, device_id: &str) -> Option<u64> {
        self.entries
            .lock()
            .iter()
            .rev()
            .find(|(_, d)| d.as_str() == device_id)
            .map(|(t, _)| *t)
    }

    /// Number of recorded pushes.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if no pushes have been recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
