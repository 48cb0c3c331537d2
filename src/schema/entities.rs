//! Built-in schemas for the back-office entities.

use crate::schema::registry::{
    EntityKind, FieldType, ModelOptions, SchemaDefinition, SchemaRegistry,
};

/// Schema for one built-in entity.
pub fn builtin_schema(kind: EntityKind) -> (SchemaDefinition, ModelOptions) {
    match kind {
        EntityKind::Customer => (
            SchemaDefinition::new()
                .required("name", FieldType::String)
                .unique("phone", FieldType::String)
                .field("email", FieldType::String)
                .field("address", FieldType::String)
                .field("loyalty_points", FieldType::Number)
                .with_timestamps(),
            ModelOptions::default(),
        ),
        EntityKind::Vendor => (
            SchemaDefinition::new()
                .required("name", FieldType::String)
                .unique("phone", FieldType::String)
                .field("company", FieldType::String)
                .field("balance", FieldType::Number)
                .with_timestamps(),
            ModelOptions::default(),
        ),
        EntityKind::Product => (
            SchemaDefinition::new()
                .required("name", FieldType::String)
                .unique("barcode", FieldType::String)
                .required("price", FieldType::Number)
                .field("cost", FieldType::Number)
                .field("stock", FieldType::Number)
                .field("category", FieldType::ObjectId)
                .field("vendor", FieldType::ObjectId)
                .with_timestamps(),
            ModelOptions::default(),
        ),
        EntityKind::Category => (
            SchemaDefinition::new()
                .unique("name", FieldType::String)
                .field("description", FieldType::String),
            ModelOptions::collection("product_categories"),
        ),
        EntityKind::Bill => (
            SchemaDefinition::new()
                .unique("bill_number", FieldType::String)
                .field("customer", FieldType::ObjectId)
                .required("items", FieldType::Array)
                .required("total", FieldType::Number)
                .field("discount", FieldType::Number)
                .field("payment_method", FieldType::String)
                .with_timestamps(),
            ModelOptions::default(),
        ),
        EntityKind::Promotion => (
            SchemaDefinition::new()
                .unique("code", FieldType::String)
                .required("discount_percent", FieldType::Number)
                .required("starts_at", FieldType::Date)
                .required("ends_at", FieldType::Date)
                .field("active", FieldType::Boolean),
            ModelOptions::default(),
        ),
        EntityKind::User => (
            SchemaDefinition::new()
                .unique("username", FieldType::String)
                .required("role", FieldType::String)
                .field("display_name", FieldType::String)
                .with_timestamps(),
            ModelOptions::default(),
        ),
    }
}

/// Register every built-in schema; returns how many were newly added.
pub fn register_builtin_schemas(registry: &SchemaRegistry) -> usize {
    EntityKind::ALL
        .iter()
        .filter(|&&kind| {
            let (schema, options) = builtin_schema(kind);
            registry.register(kind, schema, options)
        })
        .count()
}
