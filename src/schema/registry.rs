//! Schema registry: the catalog of entity schemas shared by every tenant database.
//!
//! Registration is keyed by [`EntityKind`], a closed set of the entities the
//! back office stores. The first registration of a kind wins; later calls are
//! no-ops so schema modules can register defensively.

use crate::error::{PoolError, PoolResult};
use crate::schema::entities;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use tracing::debug;

/// Entities stored in each tenant database.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum EntityKind {
    Customer,
    Vendor,
    Product,
    Category,
    Bill,
    Promotion,
    User,
}

impl EntityKind {
    pub const ALL: [EntityKind; 7] = [
        EntityKind::Customer,
        EntityKind::Vendor,
        EntityKind::Product,
        EntityKind::Category,
        EntityKind::Bill,
        EntityKind::Promotion,
        EntityKind::User,
    ];

    /// Model name, as used by callers looking a model up.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Customer => "Customer",
            Self::Vendor => "Vendor",
            Self::Product => "Product",
            Self::Category => "Category",
            Self::Bill => "Bill",
            Self::Promotion => "Promotion",
            Self::User => "User",
        }
    }

    /// Collection used when a registration carries no override.
    pub fn default_collection(&self) -> &'static str {
        match self {
            Self::Customer => "customers",
            Self::Vendor => "vendors",
            Self::Product => "products",
            Self::Category => "categories",
            Self::Bill => "bills",
            Self::Promotion => "promotions",
            Self::User => "users",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for EntityKind {
    type Err = PoolError;

    fn from_str(s: &str) -> PoolResult<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| PoolError::invalid_input(format!("Unknown model name: {}", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Date,
    ObjectId,
    Array,
    Object,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    pub field_type: FieldType,
    pub required: bool,
    pub unique: bool,
}

/// Shape of one entity. Opaque to the pool; carried to bound models.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    pub fields: Vec<FieldDefinition>,
    /// Adds `created_at` / `updated_at` bookkeeping.
    pub timestamps: bool,
}

impl SchemaDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Optional field.
    pub fn field(mut self, name: &str, field_type: FieldType) -> Self {
        self.fields.push(FieldDefinition {
            name: name.to_string(),
            field_type,
            required: false,
            unique: false,
        });
        self
    }

    pub fn required(mut self, name: &str, field_type: FieldType) -> Self {
        self.fields.push(FieldDefinition {
            name: name.to_string(),
            field_type,
            required: true,
            unique: false,
        });
        self
    }

    /// Required field with a uniqueness constraint.
    pub fn unique(mut self, name: &str, field_type: FieldType) -> Self {
        self.fields.push(FieldDefinition {
            name: name.to_string(),
            field_type,
            required: true,
            unique: true,
        });
        self
    }

    pub fn with_timestamps(mut self) -> Self {
        self.timestamps = true;
        self
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelOptions {
    /// Storage collection override.
    pub collection: Option<String>,
}

impl ModelOptions {
    pub fn collection(name: impl Into<String>) -> Self {
        Self {
            collection: Some(name.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaRegistration {
    pub kind: EntityKind,
    pub schema: Arc<SchemaDefinition>,
    pub options: ModelOptions,
}

impl SchemaRegistration {
    /// Effective collection name.
    pub fn collection_name(&self) -> &str {
        self.options
            .collection
            .as_deref()
            .unwrap_or_else(|| self.kind.default_collection())
    }
}

/// Catalog of entity schemas.
///
/// Construct one per process (or per test) and share it behind an `Arc`.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    entries: RwLock<BTreeMap<EntityKind, Arc<SchemaRegistration>>>,
    builtins: OnceLock<usize>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the built-in entity schemas.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.ensure_registered();
        registry
    }

    /// Register a schema. Returns `false` when the kind was already registered,
    /// in which case the existing registration is kept.
    pub fn register(
        &self,
        kind: EntityKind,
        schema: SchemaDefinition,
        options: ModelOptions,
    ) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(&kind) {
            debug!(model = %kind, "Schema already registered, keeping first registration");
            return false;
        }
        entries.insert(
            kind,
            Arc::new(SchemaRegistration {
                kind,
                schema: Arc::new(schema),
                options,
            }),
        );
        debug!(model = %kind, "Registered schema");
        true
    }

    /// Populate the built-in schemas once, if nothing has been registered yet.
    ///
    /// Returns the number of registrations present afterwards.
    pub fn ensure_registered(&self) -> usize {
        if self.is_empty() {
            self.builtins
                .get_or_init(|| entities::register_builtin_schemas(self));
        }
        self.len()
    }

    pub fn get(&self, kind: EntityKind) -> Option<Arc<SchemaRegistration>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned()
    }

    /// Snapshot of every registration, ordered by kind.
    pub fn get_all(&self) -> Vec<Arc<SchemaRegistration>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
