//! The per-entity contract and sparse change sets.
//!
//! Generated code implements [`Entity`] for each row struct; everything else in
//! the engine is generic over it.

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::metadata::EntityMeta;
use crate::transaction::Context;
use crate::value::{Record, TryGetable};
use sea_query::Value;
use std::sync::Arc;

/// A row-shaped record mapped to a table.
pub trait Entity: Sized + Send + Sync + 'static {
    fn meta() -> &'static EntityMeta;

    /// Scan a row returned by `SELECT *` or `RETURNING *`.
    fn from_record(record: &Record) -> Result<Self>;

    /// Current value of a field, `None` for unknown names.
    fn get(&self, field: &str) -> Option<Value>;

    /// Overwrite a field with a value of the field's type.
    fn set(&mut self, field: &str, value: Value) -> Result<()>;

    /// Create nested children after `created` was inserted. `source` is the
    /// entity the caller passed in and still holds the children.
    ///
    /// Implementations call [`crate::relation::create_children`] once per
    /// relation in declaration order.
    fn create_relations(
        _db: &Arc<Database>,
        _ctx: &Context,
        _source: &mut Self,
        _created: &mut Self,
    ) -> Result<()> {
        Ok(())
    }

    /// Primary key value.
    fn primary_key(&self) -> Result<Value> {
        let pk = Self::meta().primary_key()?;
        self.get(pk.name).ok_or_else(|| {
            StoreError::query_build(format!("{} does not expose its key", Self::meta().name))
        })
    }
}

/// Extract a typed value for [`Entity::set`] implementations.
pub fn take<T: TryGetable>(field: &str, value: Value) -> Result<T> {
    T::try_get(value).map_err(|e| StoreError::scan(format!("field {field:?}: {e}")))
}

/// Nullable variant of [`take`].
pub fn take_opt<T: TryGetable>(field: &str, value: Value) -> Result<Option<T>> {
    T::try_get_opt(value).map_err(|e| StoreError::scan(format!("field {field:?}: {e}")))
}

/// State of one field in a sparse update.
///
/// ```
/// use rowkeeper::ActiveValue;
/// use sea_query::Value;
///
/// let set = ActiveValue::Set(Value::Int(Some(42)));
/// assert!(set.is_set());
/// assert!(ActiveValue::Null.is_null());
/// assert!(ActiveValue::NotSet.is_not_set());
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ActiveValue {
    /// Write this value
    Set(Value),
    /// Write SQL NULL
    Null,
    /// Leave the column unchanged
    #[default]
    NotSet,
}

impl ActiveValue {
    #[must_use]
    pub fn is_set(&self) -> bool {
        matches!(self, ActiveValue::Set(_))
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, ActiveValue::Null)
    }

    #[must_use]
    pub fn is_not_set(&self) -> bool {
        matches!(self, ActiveValue::NotSet)
    }

    /// `Some(None)` for an explicit NULL, `None` when not set.
    #[must_use]
    pub fn into_change(self) -> Option<Option<Value>> {
        match self {
            ActiveValue::Set(v) => Some(Some(v)),
            ActiveValue::Null => Some(None),
            ActiveValue::NotSet => None,
        }
    }
}

impl<T: Into<Value>> From<Option<T>> for ActiveValue {
    /// `Some(v)` sets, `None` writes NULL.
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => ActiveValue::Set(v.into()),
            None => ActiveValue::Null,
        }
    }
}

/// Fields to change in an update, in insertion order.
///
/// A field that is not mentioned is left alone. A field set to NULL is
/// written as NULL.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Changes {
    entries: Vec<(String, Option<Value>)>,
}

impl Changes {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn set(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.put(field, Some(value.into()));
        self
    }

    #[must_use]
    pub fn set_null(mut self, field: &str) -> Self {
        self.put(field, None);
        self
    }

    /// Apply a field from a generated partial struct.
    #[must_use]
    pub fn apply(mut self, field: &str, value: ActiveValue) -> Self {
        if let Some(change) = value.into_change() {
            self.put(field, change);
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&Value>)> {
        self.entries.iter().map(|(f, v)| (f.as_str(), v.as_ref()))
    }

    /// Setting a field twice keeps its first position and the last value.
    fn put(&mut self, field: &str, value: Option<Value>) {
        match self.entries.iter_mut().find(|(f, _)| f == field) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((field.to_string(), value)),
        }
    }
}
