//! Model registry in dependency order.

use crate::direction::SyncDirection;
use crate::model::SyncModel;
use std::sync::Arc;

/// The set of syncable models, in dependency order.
///
/// Registration order matters: parents must be registered before their
/// children (patients before encounters, encounters before lab requests),
/// because both snapshot capture and incoming persistence walk the
/// registry in order so that a pulled or pushed child never arrives before
/// its parent.
#[derive(Clone, Default)]
pub struct ModelRegistry {
    models: Vec<Arc<dyn SyncModel>>,
}

impl ModelRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a model. Order of registration is dependency order.
    pub fn register(&mut self, model: impl SyncModel + 'static) -> &mut Self {
        self.models.push(Arc::new(model));
        self
    }

    /// Looks a model up by record type.
    pub fn get(&self, record_type: &str) -> Option<&Arc<dyn SyncModel>> {
        self.models.iter().find(|m| m.record_type() == record_type)
    }

    /// All models, in dependency order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn SyncModel>> {
        self.models.iter()
    }

    /// Models the central store serves in outgoing pulls, in dependency
    /// order.
    pub fn pull_models(&self) -> impl Iterator<Item = &Arc<dyn SyncModel>> {
        self.models
            .iter()
            .filter(|m| m.sync_direction().allows_outgoing())
    }

    /// Models the central store accepts incoming pushes for, in dependency
    /// order.
    pub fn push_models(&self) -> impl Iterator<Item = &Arc<dyn SyncModel>> {
        self.models
            .iter()
            .filter(|m| m.sync_direction().allows_incoming())
    }

    /// Models with the given declared direction.
    pub fn models_for_direction(
        &self,
        direction: SyncDirection,
    ) -> impl Iterator<Item = &Arc<dyn SyncModel>> {
        self.models
            .iter()
            .filter(move |m| m.sync_direction() == direction)
    }

    /// Number of registered models.
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Returns true if no models are registered.
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.models.iter().map(|m| m.record_type()))
            .finish()
    }
}
