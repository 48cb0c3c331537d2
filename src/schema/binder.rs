//! Model binder: attaches a model handle per registered schema to a tenant connection.

use crate::schema::registry::{EntityKind, SchemaDefinition, SchemaRegistration, SchemaRegistry};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// A schema bound to one tenant database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Model {
    pub kind: EntityKind,
    /// Physical database the model reads and writes.
    pub database: String,
    pub collection: String,
    pub schema: Arc<SchemaDefinition>,
}

impl Model {
    fn from_registration(database: &str, registration: &SchemaRegistration) -> Self {
        Self {
            kind: registration.kind,
            database: database.to_string(),
            collection: registration.collection_name().to_string(),
            schema: Arc::clone(&registration.schema),
        }
    }

    /// Fully qualified `database.collection` name.
    pub fn namespace(&self) -> String {
        format!("{}.{}", self.database, self.collection)
    }
}

/// Models exposed by one connection, at most one per kind.
#[derive(Debug, Default)]
pub struct ModelSet {
    models: RwLock<HashMap<EntityKind, Arc<Model>>>,
}

impl ModelSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: EntityKind) -> Option<Arc<Model>> {
        self.models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
    }

    pub fn contains(&self, kind: EntityKind) -> bool {
        self.models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&kind)
    }

    pub fn len(&self) -> usize {
        self.models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bound kinds, sorted.
    pub fn kinds(&self) -> Vec<EntityKind> {
        let mut kinds: Vec<_> = self
            .models
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        kinds.sort();
        kinds
    }

    /// Insert unless a model of the same kind is already present.
    fn insert_if_absent(&self, model: Model) -> bool {
        let mut models = self.models.write().unwrap_or_else(PoisonError::into_inner);
        if models.contains_key(&model.kind) {
            return false;
        }
        models.insert(model.kind, Arc::new(model));
        true
    }
}

/// Binds registry contents onto connections.
#[derive(Debug, Clone)]
pub struct ModelBinder {
    registry: Arc<SchemaRegistry>,
}

impl ModelBinder {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    /// Attach every registered schema missing from `models`.
    ///
    /// Safe to call repeatedly; returns the number of newly bound models.
    pub fn bind(&self, database: &str, models: &ModelSet) -> usize {
        self.registry.ensure_registered();

        let bound = self
            .registry
            .get_all()
            .iter()
            .filter(|registration| !models.contains(registration.kind))
            .map(|registration| Model::from_registration(database, registration))
            .filter(|model| models.insert_if_absent(model.clone()))
            .count();

        if bound > 0 {
            debug!(database = %database, bound, total = models.len(), "Bound models");
        }
        bound
    }
}
