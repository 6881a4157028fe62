//! Entity metadata consumed by the engine.
//!
//! The schema compiler emits one `static` [`EntityMeta`] per entity. The engine reads
//! it to resolve field names to columns, pick the primary key, order results and
//! resolve relations. Nothing here is mutated at runtime.

use crate::error::{Result, StoreError};
use crate::value::{is_null, to_json_value};
use once_cell::sync::Lazy;
use regex::Regex;
use sea_query::Value;
use serde::Serialize;

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("failed to compile identifier regex")
});

/// Whether `name` is a plain SQL identifier (letters, digits, underscore).
pub fn is_valid_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

/// Value type of a field as stored in the database
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Bool,
    SmallInt,
    Int,
    BigInt,
    Float,
    Double,
    Text,
    Bytes,
    Json,
    Uuid,
    Timestamp,
    TimestampTz,
    Date,
}

impl FieldType {
    /// Typed SQL NULL for this field type. Postgres checks parameter types even for
    /// NULLs, so an untyped null would be rejected.
    pub fn null(&self) -> Value {
        match self {
            FieldType::Bool => Value::Bool(None),
            FieldType::SmallInt => Value::SmallInt(None),
            FieldType::Int => Value::Int(None),
            FieldType::BigInt => Value::BigInt(None),
            FieldType::Float => Value::Float(None),
            FieldType::Double => Value::Double(None),
            FieldType::Text => Value::String(None),
            FieldType::Bytes => Value::Bytes(None),
            FieldType::Json => Value::Json(None),
            FieldType::Uuid => Value::Uuid(None),
            FieldType::Timestamp => Value::ChronoDateTime(None),
            FieldType::TimestampTz => Value::ChronoDateTimeUtc(None),
            FieldType::Date => Value::ChronoDate(None),
        }
    }
}

/// Per-field flags set by the schema compiler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FieldFlags {
    pub primary_key: bool,
    pub auto_increment: bool,
    /// Stored as a JSON document
    pub json: bool,
    /// Repeated scalar, stored as a JSON array
    pub repeated: bool,
}

impl FieldFlags {
    pub const NONE: FieldFlags = FieldFlags {
        primary_key: false,
        auto_increment: false,
        json: false,
        repeated: false,
    };
    /// Server-generated serial key
    pub const SERIAL_KEY: FieldFlags = FieldFlags {
        primary_key: true,
        auto_increment: true,
        json: false,
        repeated: false,
    };
    /// Client-generated key (e.g. UUID filled in before insert)
    pub const KEY: FieldFlags = FieldFlags {
        primary_key: true,
        auto_increment: false,
        json: false,
        repeated: false,
    };
    pub const JSON: FieldFlags = FieldFlags {
        primary_key: false,
        auto_increment: false,
        json: true,
        repeated: false,
    };
    pub const REPEATED: FieldFlags = FieldFlags {
        primary_key: false,
        auto_increment: false,
        json: false,
        repeated: true,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldMeta {
    /// Name used in conditions and change sets
    pub name: &'static str,
    /// Source column name
    pub column: &'static str,
    pub ty: FieldType,
    pub nullable: bool,
    pub flags: FieldFlags,
}

impl FieldMeta {
    pub const fn new(name: &'static str, column: &'static str, ty: FieldType) -> Self {
        Self {
            name,
            column,
            ty,
            nullable: false,
            flags: FieldFlags::NONE,
        }
    }

    pub const fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub const fn flags(mut self, flags: FieldFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Key whose value the client must supply (generated before insert when it is a UUID).
    pub fn is_client_generated_key(&self) -> bool {
        self.flags.primary_key && !self.flags.auto_increment
    }

    /// Stored as a JSON document, either flagged as one or as a repeated scalar.
    pub fn is_json_encoded(&self) -> bool {
        self.flags.json || self.flags.repeated || self.ty == FieldType::Json
    }

    /// Encode `value` for this field. JSON-encoded fields are serialized; a
    /// repeated field must serialize to an array.
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Value> {
        if !self.is_json_encoded() {
            return Err(StoreError::query_build(format!(
                "field {} is not JSON-encoded",
                self.name
            )));
        }
        self.bind(to_json_value(value)?)
    }

    /// Check a value about to be written to this field.
    ///
    /// NULLs become the field's typed NULL. JSON-encoded fields only accept JSON
    /// values, and repeated fields only JSON arrays.
    pub fn bind(&self, value: Value) -> Result<Value> {
        if is_null(&value) {
            return Ok(if self.is_json_encoded() {
                Value::Json(None)
            } else {
                self.ty.null()
            });
        }
        if !self.is_json_encoded() {
            return Ok(value);
        }
        match &value {
            Value::Json(Some(json)) if self.flags.repeated && !json.is_array() => {
                Err(StoreError::query_build(format!(
                    "repeated field {} needs a JSON array, got {json}",
                    self.name
                )))
            }
            Value::Json(Some(_)) => Ok(value),
            other => Err(StoreError::query_build(format!(
                "field {} is JSON-encoded, got {other:?}",
                self.name
            ))),
        }
    }
}

/// Sort direction for default ordering and `OrderBy` conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl From<SortDirection> for sea_query::Order {
    fn from(direction: SortDirection) -> Self {
        match direction {
            SortDirection::Asc => sea_query::Order::Asc,
            SortDirection::Desc => sea_query::Order::Desc,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    One,
    Many,
}

/// Foreign-key association between two entities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationMeta {
    pub name: &'static str,
    /// Field on the owner holding the join value
    pub local_field: &'static str,
    pub target_entity: &'static str,
    /// Field on the target matched against `local_field`
    pub target_field: &'static str,
    pub cardinality: Cardinality,
    /// The owner's join field may be unset
    pub optional: bool,
}

#[derive(Debug)]
pub struct EntityMeta {
    pub name: &'static str,
    pub table: &'static str,
    pub fields: &'static [FieldMeta],
    pub relations: &'static [RelationMeta],
    /// Order applied to selects without an explicit sort. Empty means primary key ascending.
    pub default_order: &'static [(&'static str, SortDirection)],
}

impl EntityMeta {
    pub fn field(&self, name: &str) -> Option<&'static FieldMeta> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Resolve a field name to its metadata, failing with a build error for
    /// malformed or unknown names.
    pub fn resolve(&self, name: &str) -> Result<&'static FieldMeta> {
        if !is_valid_identifier(name) {
            return Err(StoreError::query_build(format!(
                "malformed field name {name:?} on {}",
                self.name
            )));
        }
        self.field(name).ok_or_else(|| {
            StoreError::query_build(format!("unknown field {name:?} on {}", self.name))
        })
    }

    pub fn column_of(&self, name: &str) -> Result<&'static str> {
        self.resolve(name).map(|f| f.column)
    }

    pub fn primary_key(&self) -> Result<&'static FieldMeta> {
        self.fields
            .iter()
            .find(|f| f.flags.primary_key)
            .ok_or_else(|| StoreError::query_build(format!("{} has no primary key", self.name)))
    }

    pub fn relation(&self, name: &str) -> Option<&'static RelationMeta> {
        self.relations.iter().find(|r| r.name == name)
    }

    pub fn columns(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields.iter().map(|f| f.column)
    }

    /// Index of a field in declaration order.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub static AUTHOR: EntityMeta = EntityMeta {
        name: "Author",
        table: "authors",
        fields: &[
            FieldMeta::new("id", "id", FieldType::BigInt).flags(FieldFlags::SERIAL_KEY),
            FieldMeta::new("name", "name", FieldType::Text),
            FieldMeta::new("email", "email_address", FieldType::Text),
            FieldMeta::new("bio", "bio", FieldType::Text).nullable(),
        ],
        relations: &[],
        default_order: &[],
    };

    pub static BOOK: EntityMeta = EntityMeta {
        name: "Book",
        table: "books",
        fields: &[
            FieldMeta::new("id", "id", FieldType::Uuid).flags(FieldFlags::KEY),
            FieldMeta::new("author_id", "author_id", FieldType::BigInt).nullable(),
            FieldMeta::new("title", "title", FieldType::Text),
            FieldMeta::new("pages", "pages", FieldType::Int),
            FieldMeta::new("tags", "tags", FieldType::Json)
                .nullable()
                .flags(FieldFlags::REPEATED),
            FieldMeta::new("extra", "extra", FieldType::Json)
                .nullable()
                .flags(FieldFlags::JSON),
        ],
        relations: &[RelationMeta {
            name: "author",
            local_field: "author_id",
            target_entity: "Author",
            target_field: "id",
            cardinality: Cardinality::One,
            optional: true,
        }],
        default_order: &[("title", SortDirection::Asc)],
    };
}
