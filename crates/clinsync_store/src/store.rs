//! The store: tables, facts, write batches and the pending-edit barrier.

use crate::error::{StoreError, StoreResult};
use crate::facts::SystemFacts;
use crate::table::{Row, Table};
use clinsync_model::RecordData;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The shared record store.
///
/// Cloning is cheap; all clones observe the same state. Ordinary
/// application writes and the sync engine's own writes both go through
/// [`WriteBatch`], so the pending-edit barrier sees every open write.
#[derive(Clone, Default)]
pub struct Store {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    tables: RwLock<BTreeMap<String, Table>>,
    facts: SystemFacts,
    // stamp tick -> number of open batches carrying that stamp
    pending: Mutex<BTreeMap<u64, usize>>,
}

impl Store {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// The global system facts.
    pub fn facts(&self) -> &SystemFacts {
        &self.inner.facts
    }

    /// Begins a write batch stamping its rows with `stamp`.
    ///
    /// The stamp is registered as a pending edit until the batch commits
    /// or is dropped.
    pub fn begin_write(&self, stamp: u64) -> WriteBatch {
        *self.inner.pending.lock().entry(stamp).or_insert(0) += 1;
        WriteBatch {
            store: self.clone(),
            stamp,
            ops: Vec::new(),
            finished: false,
        }
    }

    /// Takes a repeatable-read view of every table.
    ///
    /// The view is a consistent copy: concurrent commits after this call
    /// are not visible through it.
    pub fn read_view(&self) -> StoreView {
        StoreView {
            tables: self.inner.tables.read().clone(),
        }
    }

    /// Returns the current committed row, bypassing any view.
    pub fn get_row(&self, table: &str, id: &str) -> Option<Row> {
        self.inner.tables.read().get(table).and_then(|t| t.get(id).cloned())
    }

    /// Number of rows currently in a table.
    pub fn table_len(&self, table: &str) -> usize {
        self.inner.tables.read().get(table).map_or(0, Table::len)
    }

    /// Waits until every write batch stamped below `boundary` that was
    /// open when this call started has finished.
    ///
    /// This is a bounded busy-poll over the stamps actually observed open
    /// at barrier time; batches that begin after the barrier never extend
    /// the wait, and no lock is held while sleeping.
    pub fn wait_for_pending_edits(
        &self,
        boundary: u64,
        timeout: Duration,
        poll_interval: Duration,
    ) -> StoreResult<()> {
        let observed: Vec<u64> = {
            let pending = self.inner.pending.lock();
            pending.range(..boundary).map(|(stamp, _)| *stamp).collect()
        };
        if observed.is_empty() {
            return Ok(());
        }

        let started = Instant::now();
        loop {
            let open = {
                let pending = self.inner.pending.lock();
                observed.iter().filter(|stamp| pending.contains_key(stamp)).count()
            };
            if open == 0 {
                return Ok(());
            }
            if started.elapsed() >= timeout {
                return Err(StoreError::PendingEditTimeout {
                    boundary,
                    open,
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            std::thread::sleep(poll_interval);
        }
    }

    /// Number of currently open write batches (for tests and diagnostics).
    pub fn open_batch_count(&self) -> usize {
        self.inner.pending.lock().values().sum()
    }

    fn apply(&self, ops: &[BatchOp], stamp: u64) {
        let mut tables = self.inner.tables.write();
        for op in ops {
            match op {
                BatchOp::Upsert { table, id, data } => {
                    tables
                        .entry(table.clone())
                        .or_default()
                        .upsert(id.clone(), data.clone(), stamp);
                }
                BatchOp::SoftDelete { table, id } => {
                    tables.entry(table.clone()).or_default().soft_delete(id.clone(), stamp);
                }
            }
        }
    }

    fn release_stamp(&self, stamp: u64) {
        let mut pending = self.inner.pending.lock();
        if let Some(count) = pending.get_mut(&stamp) {
            *count -= 1;
            if *count == 0 {
                pending.remove(&stamp);
            }
        }
    }
}

enum BatchOp {
    Upsert {
        table: String,
        id: String,
        data: RecordData,
    },
    SoftDelete {
        table: String,
        id: String,
    },
}

/// A buffered write transaction.
///
/// Writes are invisible until [`commit`](WriteBatch::commit), which
/// applies them atomically under the table lock. Dropping an uncommitted
/// batch abandons the writes and releases the pending-edit registration.
pub struct WriteBatch {
    store: Store,
    stamp: u64,
    ops: Vec<BatchOp>,
    finished: bool,
}

impl WriteBatch {
    /// The tick this batch stamps its rows with.
    pub fn stamp(&self) -> u64 {
        self.stamp
    }

    /// Buffers an insert-or-replace of a row.
    pub fn put(&mut self, table: impl Into<String>, id: impl Into<String>, data: RecordData) {
        self.ops.push(BatchOp::Upsert {
            table: table.into(),
            id: id.into(),
            data,
        });
    }

    /// Buffers a soft-deletion of a row.
    pub fn soft_delete(&mut self, table: impl Into<String>, id: impl Into<String>) {
        self.ops.push(BatchOp::SoftDelete {
            table: table.into(),
            id: id.into(),
        });
    }

    /// Applies every buffered write atomically and releases the
    /// pending-edit registration.
    pub fn commit(mut self) {
        self.store.apply(&self.ops, self.stamp);
        self.store.release_stamp(self.stamp);
        self.finished = true;
    }
}

impl Drop for WriteBatch {
    fn drop(&mut self) {
        if !self.finished {
            self.store.release_stamp(self.stamp);
        }
    }
}

/// A repeatable-read view of the store.
#[derive(Debug, Clone)]
pub struct StoreView {
    tables: BTreeMap<String, Table>,
}

impl StoreView {
    /// The named table, if it exists in this view.
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    /// The row with the given id, if present in this view.
    pub fn get_row(&self, table: &str, id: &str) -> Option<&Row> {
        self.tables.get(table).and_then(|t| t.get(id))
    }
}
