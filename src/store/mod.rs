//! Generic entity store.
//!
//! One [`EntityStore<E>`] serves any entity: statements are rendered from
//! `E::meta()`, routed through the shared [`Database`], and rows are scanned
//! with `E::from_record`. Reads live in `read.rs`, writes in `write.rs`.

mod read;
mod write;

use crate::database::{Database, Intent};
use crate::entity::Entity;
use crate::error::{DriverError, Result, StoreError};
use crate::metadata::EntityMeta;
use crate::query::QueryBuilder;
use crate::raw_sql;
use crate::transaction::Context;
use crate::value::Record;
use sea_query::Value;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

pub struct EntityStore<E: Entity> {
    db: Arc<Database>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> Clone for EntityStore<E> {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
            _entity: PhantomData,
        }
    }
}

impl<E: Entity> fmt::Debug for EntityStore<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityStore")
            .field("entity", &E::meta().name)
            .finish()
    }
}

impl<E: Entity> EntityStore<E> {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            _entity: PhantomData,
        }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn meta(&self) -> &'static EntityMeta {
        E::meta()
    }

    /// Builder pre-bound to this entity.
    pub fn query_builder(&self) -> QueryBuilder {
        QueryBuilder::new(E::meta())
    }

    /// Raw statement on the write side (or the context's transaction).
    pub fn query(&self, ctx: &Context, sql: &str, params: &[Value]) -> Result<u64> {
        raw_sql::query(&self.db, ctx, sql, params).map_err(|e| e.during("query", E::meta().name))
    }

    /// Raw single-row statement; `RowNotFound` when nothing comes back.
    ///
    /// `intent` picks the connection outside a transaction: pass
    /// [`Intent::Write`] for `INSERT ... RETURNING` and friends so they reach the
    /// primary.
    pub fn query_row(&self, ctx: &Context, intent: Intent, sql: &str, params: &[Value]) -> Result<Record> {
        raw_sql::query_row(&self.db, ctx, intent, sql, params)
            .map_err(|e| e.during("query_row", E::meta().name))
    }

    pub fn query_rows(
        &self,
        ctx: &Context,
        intent: Intent,
        sql: &str,
        params: &[Value],
    ) -> Result<Vec<Record>> {
        raw_sql::query_rows(&self.db, ctx, intent, sql, params)
            .map_err(|e| e.during("query_rows", E::meta().name))
    }

    fn fail(&self, err: DriverError, operation: &'static str) -> StoreError {
        self.db.fail(err, operation, E::meta().name)
    }

    fn context(&self, err: StoreError, operation: &'static str) -> StoreError {
        err.during(operation, E::meta().name)
    }

    fn scan(&self, records: &[Record], operation: &'static str) -> Result<Vec<E>> {
        records
            .iter()
            .map(E::from_record)
            .collect::<Result<Vec<_>>>()
            .map_err(|e| self.context(e, operation))
    }

    fn fetch(&self, ctx: &Context, intent: Intent, builder: &QueryBuilder, operation: &'static str) -> Result<Vec<E>> {
        let (sql, values) = builder.render_select().map_err(|e| self.context(e, operation))?;
        let route = self.db.route(ctx, intent).map_err(|e| self.context(e, operation))?;
        let records = route
            .query_all(&sql, &values)
            .map_err(|e| self.fail(e, operation))?;
        self.scan(&records, operation)
    }
}
