//! Entity schemas and their binding onto tenant connections.
//!
//! - Schema registry (typed by entity kind, idempotent registration)
//! - Built-in back-office entity schemas
//! - Model binder attaching registered schemas to a connection

pub mod binder;
pub mod entities;
pub mod registry;

pub use binder::{Model, ModelBinder, ModelSet};
pub use entities::{builtin_schema, register_builtin_schemas};
pub use registry::{
    EntityKind, FieldDefinition, FieldType, ModelOptions, SchemaDefinition, SchemaRegistration,
    SchemaRegistry,
};
