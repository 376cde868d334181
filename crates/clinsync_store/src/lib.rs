//! # clinsync store
//!
//! The relational-store collaborator the sync engine runs against.
//!
//! This crate provides:
//! - Named tables of tick-stamped rows ([`Table`], [`Row`])
//! - Global system facts: named scalars with atomic increment
//!   ([`SystemFacts`])
//! - Write batches that stamp rows with a sync tick and register in a
//!   pending-edit registry until committed ([`WriteBatch`])
//! - Repeatable-read views for snapshot capture ([`StoreView`])
//! - A bounded busy-poll barrier over pending edits
//!   ([`Store::wait_for_pending_edits`])
//!
//! ## Key invariants
//!
//! - A committed batch becomes visible atomically: a view taken at any
//!   point sees either all of a batch's rows or none of them.
//! - A batch's stamp tick stays registered from `begin_write` until the
//!   batch commits or is dropped, so a barrier at tick `t` can wait for
//!   every write stamped below `t` that was open at barrier time.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod facts;
mod store;
mod table;

pub use error::{StoreError, StoreResult};
pub use facts::SystemFacts;
pub use store::{Store, StoreView, WriteBatch};
pub use table::{Row, Table};
