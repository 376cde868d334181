//! # clinsync engine
//!
//! The central half of a bidirectional sync protocol for intermittently
//! connected clinical facilities and mobile devices.
//!
//! Everything is ordered by a single logical clock, the **sync tick**: a
//! global counter advanced only by "tick-tock" ([`LogicalClock`]), whose
//! tick half is unique to the requesting caller and whose tock half stamps
//! the caller's own writes. Devices sync through polling-based sessions
//! ([`SyncManager`]): start, prepare, push, persist, capture, pull,
//! complete — with every failure recorded on the session row so a device
//! polling from another process still sees it.
//!
//! ## Crate layout
//!
//! - [`manager`] — the session state machine and every device-facing
//!   operation
//! - [`clock`] — the tick-tock logical clock
//! - [`marked`] — partitioning marked-for-sync patients into full,
//!   incremental and deferred treatment
//! - [`snapshot`], [`capture`] — per-session snapshot tables and the two
//!   equivalent outgoing capture paths
//! - [`lookup`] — the denormalized lookup cache and its incremental
//!   maintainer
//! - [`persist`], [`resolvers`] — committing pushed changes and resolving
//!   conflicts on the way in
//! - [`device`] — the tick-to-device ledger

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod capture;
pub mod clock;
pub mod config;
pub mod device;
pub mod error;
pub mod lookup;
pub mod manager;
pub mod marked;
pub mod persist;
pub mod resolvers;
pub mod session;
pub mod snapshot;

pub use clock::{LogicalClock, TickTock};
pub use config::{EngineConfig, LookupConfig};
pub use device::DeviceTickLedger;
pub use error::{SyncError, SyncResult};
pub use lookup::{LookupCache, LookupRow};
pub use manager::{PullMetadata, PullParams, SyncManager};
pub use marked::PatientPartition;
pub use persist::PersistOutcome;
pub use session::{SessionId, SessionOptions, SyncSession};
pub use snapshot::{SnapshotRow, SnapshotTable};
