//! # clinsync model
//!
//! Domain contract shared by the clinsync store and engine.
//!
//! This crate provides:
//! - Dynamic record values ([`RecordValue`]) with byte-exact binary fields
//! - Change records exchanged during a sync session ([`ChangeRecord`])
//! - The per-model sync declaration ([`SyncModel`], [`ModelDef`])
//! - The model registry in dependency order ([`ModelRegistry`])
//!
//! The engine never hardcodes a model list: each syncable model declares
//! its own sync direction and scope filter, and the engine consumes those
//! declarations polymorphically.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
mod direction;
mod model;
mod registry;
mod value;

pub use change::{ChangeRecord, ChangelogEntry, SessionDirection};
pub use direction::SyncDirection;
pub use model::{ModelDef, SyncModel, SyncScope};
pub use registry::ModelRegistry;
pub use value::{RecordData, RecordValue};
