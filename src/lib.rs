//! # Rowkeeper
//!
//! Metadata-driven entity storage over PostgreSQL using the `may` runtime.
//!
//! One generic [`EntityStore`] serves every entity described by a static
//! [`EntityMeta`]: conditions render to parameterized SQL, statements are routed
//! to the read or write connection (or the context's open transaction), and
//! driver failures come back as a small [`ErrorKind`] taxonomy.
//!
//! See `README.md` for the architecture and configuration.

pub mod condition;
pub mod config;
pub mod connection;
pub mod database;
pub mod entity;
pub mod error;
pub mod executor;
pub mod metadata;
pub mod metrics;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod query;
pub mod raw_sql;
pub mod relation;
pub mod store;
pub mod transaction;
pub mod translator;
pub mod value;
pub mod value_conversion;

pub use condition::Condition;
pub use config::StoreConfig;
pub use database::{Database, Intent};
pub use entity::{take, take_opt, ActiveValue, Changes, Entity};
pub use error::{DbFailure, DriverError, ErrorKind, Result, StoreError};
pub use executor::{Connection, Executor, PgConnection, TxHandle};
pub use metadata::{
    Cardinality, EntityMeta, FieldFlags, FieldMeta, FieldType, RelationMeta, SortDirection,
};
pub use query::{Lock, LockMode, LockWait, Paginator, QueryBuilder, QueryOptions};
pub use relation::{create_children, Loaded, Relation, RelationLoader};
pub use store::EntityStore;
pub use transaction::{CancelToken, Context, IsolationLevel, TransactionManager};
pub use translator::{ErrorTranslator, PostgresTranslator};
pub use value::{Record, TryGetable, ValueExtractionError};

/// Everything generated entity code and callers usually need.
pub mod prelude {
    pub use crate::{
        take, take_opt, ActiveValue, Cardinality, Changes, Condition, Context, Database, Entity,
        EntityMeta, EntityStore, ErrorKind, FieldFlags, FieldMeta, FieldType, Intent, Loaded,
        Lock, QueryOptions, Record, Relation, RelationLoader, RelationMeta, Result, SortDirection,
        StoreError,
    };
    pub use sea_query::Value;
}
