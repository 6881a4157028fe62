use super::EntityStore;
use crate::condition::{Condition, Ident};
use crate::database::Intent;
use crate::entity::{Changes, Entity};
use crate::error::{ErrorKind, Result, StoreError};
use crate::metadata::{EntityMeta, FieldType};
use crate::query::QueryOptions;
use crate::transaction::Context;
use crate::value::{is_null, Record};
use sea_query::{Expr, ExprTrait, InsertStatement, OnConflict, PostgresQueryBuilder, Query, Value};
use uuid::Uuid;

/// Columns and values for one INSERT row. Serial keys are left to the server;
/// unset UUID keys are generated and written back to the entity. Each value is
/// checked against its field with [`FieldMeta::bind`](crate::metadata::FieldMeta::bind).
fn insert_row<E: Entity>(entity: &mut E) -> Result<(Vec<&'static str>, Vec<Value>)> {
    let meta = E::meta();
    let mut columns = Vec::with_capacity(meta.fields.len());
    let mut values = Vec::with_capacity(meta.fields.len());
    for field in meta.fields {
        if field.flags.auto_increment {
            continue;
        }
        let mut value = entity.get(field.name).unwrap_or_else(|| field.ty.null());
        if field.is_client_generated_key() && is_null(&value) {
            if field.ty != FieldType::Uuid {
                return Err(StoreError::query_build(format!(
                    "key {} of {} must be set before insert",
                    field.name, meta.name
                )));
            }
            value = Value::from(Uuid::new_v4());
            entity.set(field.name, value.clone())?;
        }
        columns.push(field.column);
        values.push(field.bind(value)?);
    }
    Ok((columns, values))
}

fn insert_into(meta: &EntityMeta, columns: &[&'static str]) -> InsertStatement {
    let mut stmt = Query::insert();
    stmt.into_table(Ident(meta.table))
        .columns(columns.iter().map(|c| Ident(*c)));
    stmt
}

fn add_row(stmt: &mut InsertStatement, values: Vec<Value>) -> Result<()> {
    stmt.values(values.into_iter().map(Expr::val))
        .map(|_| ())
        .map_err(|e| StoreError::query_build(format!("invalid insert row: {e}")))
}

impl<E: Entity> EntityStore<E> {
    /// Insert one entity and return it as stored (generated keys filled in).
    ///
    /// With `populate_relations`, nested children are created afterwards in
    /// declaration order with the new key injected. Wrap the call in
    /// `exec_with_tx` to make parent and children atomic.
    pub fn create(&self, ctx: &Context, mut entity: E, options: QueryOptions) -> Result<E> {
        let meta = E::meta();
        let (columns, values) = insert_row(&mut entity).map_err(|e| self.context(e, "create"))?;

        let mut stmt = insert_into(meta, &columns);
        add_row(&mut stmt, values).map_err(|e| self.context(e, "create"))?;
        stmt.returning_all();
        let (sql, params) = stmt.build(PostgresQueryBuilder);

        let route = self
            .db
            .route(ctx, Intent::Write)
            .map_err(|e| self.context(e, "create"))?;
        let record = route
            .query_opt(&sql, &params.0)
            .map_err(|e| self.fail(e, "create"))?
            .ok_or_else(|| self.context(StoreError::scan("INSERT returned no row"), "create"))?;
        let mut created = E::from_record(&record).map_err(|e| self.context(e, "create"))?;

        if options.populate_relations {
            E::create_relations(&self.db, ctx, &mut entity, &mut created)
                .map_err(|e| self.context(e, "create"))?;
        }
        log::debug!("created {}", meta.name);
        Ok(created)
    }

    /// Insert many entities in one statement.
    pub fn batch_create(&self, ctx: &Context, entities: Vec<E>, options: QueryOptions) -> Result<Vec<E>> {
        if options.populate_relations {
            return Err(self.context(
                StoreError::query_build("relations cannot be populated by a batch insert"),
                "batch_create",
            ));
        }
        let Some(mut stmt) = self.batch_insert(entities, "batch_create")? else {
            return Ok(Vec::new());
        };
        stmt.returning_all();
        let records = self.run_insert(ctx, &stmt, "batch_create")?;
        self.scan(&records, "batch_create")
    }

    /// Insert many entities, skipping rows that collide on `conflict_field`.
    /// Returns the keys of the rows actually inserted.
    pub fn batch_create_ignore_conflict(
        &self,
        ctx: &Context,
        entities: Vec<E>,
        conflict_field: &str,
    ) -> Result<Vec<Value>> {
        let operation = "batch_create_ignore_conflict";
        let meta = E::meta();
        let conflict = meta
            .column_of(conflict_field)
            .map_err(|e| self.context(e, operation))?;
        let pk = meta.primary_key().map_err(|e| self.context(e, operation))?;

        let Some(mut stmt) = self.batch_insert(entities, operation)? else {
            return Ok(Vec::new());
        };
        let mut on_conflict = OnConflict::column(Ident(conflict));
        on_conflict.do_nothing();
        stmt.on_conflict(on_conflict).returning_col(Ident(pk.column));

        let records = self.run_insert(ctx, &stmt, operation)?;
        records
            .iter()
            .map(|r| {
                r.value(pk.column).cloned().ok_or_else(|| {
                    StoreError::scan(format!("RETURNING row lacks {}", pk.column))
                })
            })
            .collect::<Result<Vec<_>>>()
            .map_err(|e| self.context(e, operation))
    }

    /// Insert, or on conflict over `conflict_fields` update exactly
    /// `update_fields` from the incoming row. Returns the key either way.
    pub fn upsert(
        &self,
        ctx: &Context,
        mut entity: E,
        conflict_fields: &[&str],
        update_fields: &[&str],
    ) -> Result<Value> {
        let operation = "upsert";
        let meta = E::meta();
        if conflict_fields.is_empty() {
            return Err(self.context(
                StoreError::query_build("upsert needs at least one conflict field"),
                operation,
            ));
        }
        let resolve = |fields: &[&str]| -> Result<Vec<&'static str>> {
            fields.iter().map(|f| meta.column_of(f)).collect()
        };
        let conflict_columns = resolve(conflict_fields).map_err(|e| self.context(e, operation))?;
        let mut update_columns = resolve(update_fields).map_err(|e| self.context(e, operation))?;
        if update_columns.is_empty() {
            // DO NOTHING would return no row on conflict
            update_columns.push(conflict_columns[0]);
        }
        let pk = meta.primary_key().map_err(|e| self.context(e, operation))?;

        let (columns, values) = insert_row(&mut entity).map_err(|e| self.context(e, operation))?;
        let mut stmt = insert_into(meta, &columns);
        add_row(&mut stmt, values).map_err(|e| self.context(e, operation))?;

        let mut on_conflict = OnConflict::columns(conflict_columns.iter().map(|c| Ident(*c)));
        on_conflict.update_columns(update_columns.iter().map(|c| Ident(*c)));
        stmt.on_conflict(on_conflict).returning_col(Ident(pk.column));

        let record = self
            .run_insert(ctx, &stmt, operation)?
            .into_iter()
            .next()
            .ok_or_else(|| self.context(StoreError::scan("upsert returned no row"), operation))?;
        record
            .value(pk.column)
            .cloned()
            .ok_or_else(|| self.context(StoreError::scan("upsert row lacks key"), operation))
    }

    /// Apply a sparse change set to one row and return the updated row.
    ///
    /// Fields absent from `changes` are untouched; fields set to NULL are written
    /// as NULL. An empty change set is rejected without touching the database.
    pub fn update(&self, ctx: &Context, id: impl Into<Value>, changes: &Changes) -> Result<E> {
        let operation = "update";
        let meta = E::meta();
        if changes.is_empty() {
            return Err(self.context(
                StoreError::query_build(format!("no fields to update on {}", meta.name)),
                operation,
            ));
        }
        let pk = meta.primary_key().map_err(|e| self.context(e, operation))?;

        let mut stmt = Query::update();
        stmt.table(Ident(meta.table));
        for (name, value) in changes.iter() {
            let field = meta.resolve(name).map_err(|e| self.context(e, operation))?;
            let value = match value {
                Some(v) => field.bind(v.clone()).map_err(|e| self.context(e, operation))?,
                None if field.nullable => field.ty.null(),
                None => {
                    return Err(self.context(
                        StoreError::query_build(format!("field {name} is not nullable")),
                        operation,
                    ));
                }
            };
            stmt.value(Ident(field.column), Expr::val(value));
        }
        stmt.and_where(Expr::col(Ident(pk.column)).eq(Expr::val(id.into())))
            .returning_all();
        let (sql, params) = stmt.build(PostgresQueryBuilder);

        let route = self
            .db
            .route(ctx, Intent::Write)
            .map_err(|e| self.context(e, operation))?;
        let record = route
            .query_opt(&sql, &params.0)
            .map_err(|e| self.fail(e, operation))?
            .ok_or_else(|| {
                self.context(
                    StoreError::row_not_found(format!("no {} with that key", meta.name)),
                    operation,
                )
            })?;
        E::from_record(&record).map_err(|e| self.context(e, operation))
    }

    /// Delete one row by key. A missing row is `RowNotFound`.
    pub fn delete_by_id(&self, ctx: &Context, id: impl Into<Value>) -> Result<()> {
        let pk = E::meta()
            .primary_key()
            .map_err(|e| self.context(e, "delete_by_id"))?;
        let deleted = self.delete_with(
            ctx,
            vec![Condition::Eq(pk.name.to_string(), id.into())],
            "delete_by_id",
        )?;
        if deleted == 0 {
            return Err(self.context(
                StoreError::row_not_found(format!("no {} with that key", E::meta().name)),
                "delete_by_id",
            ));
        }
        Ok(())
    }

    /// Delete every row matching `filters`. Refuses to run without a filter.
    pub fn delete_many<I>(&self, ctx: &Context, filters: I) -> Result<u64>
    where
        I: IntoIterator<Item = Condition>,
    {
        let filters: Vec<Condition> = filters.into_iter().collect();
        if filters.iter().all(Condition::is_order_by) {
            return Err(self.context(
                StoreError::new(
                    ErrorKind::FiltersRequired,
                    format!("delete_many on {} needs at least one filter", E::meta().table),
                ),
                "delete_many",
            ));
        }
        self.delete_with(ctx, filters, "delete_many")
    }

    fn delete_with(&self, ctx: &Context, filters: Vec<Condition>, operation: &'static str) -> Result<u64> {
        let (sql, values) = self
            .query_builder()
            .with_filters(filters)
            .render_delete()
            .map_err(|e| self.context(e, operation))?;
        let route = self
            .db
            .route(ctx, Intent::Write)
            .map_err(|e| self.context(e, operation))?;
        route
            .execute(&sql, &values)
            .map_err(|e| self.fail(e, operation))
    }

    fn batch_insert(&self, entities: Vec<E>, operation: &'static str) -> Result<Option<InsertStatement>> {
        if entities.is_empty() {
            return Ok(None);
        }
        let mut stmt: Option<InsertStatement> = None;
        for mut entity in entities {
            let (columns, values) = insert_row(&mut entity).map_err(|e| self.context(e, operation))?;
            let stmt = stmt.get_or_insert_with(|| insert_into(E::meta(), &columns));
            add_row(stmt, values).map_err(|e| self.context(e, operation))?;
        }
        Ok(stmt)
    }

    fn run_insert(&self, ctx: &Context, stmt: &InsertStatement, operation: &'static str) -> Result<Vec<Record>> {
        let (sql, params) = stmt.build(PostgresQueryBuilder);
        let route = self
            .db
            .route(ctx, Intent::Write)
            .map_err(|e| self.context(e, operation))?;
        route
            .query_all(&sql, &params.0)
            .map_err(|e| self.fail(e, operation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::metadata::{FieldFlags, FieldMeta};
    use crate::mock::MockConnection;
    use std::sync::Arc;

    static NOTE: EntityMeta = EntityMeta {
        name: "Note",
        table: "notes",
        fields: &[
            FieldMeta::new("id", "id", FieldType::BigInt).flags(FieldFlags::SERIAL_KEY),
            FieldMeta::new("tags", "tags", FieldType::Json).flags(FieldFlags::REPEATED),
        ],
        relations: &[],
        default_order: &[],
    };

    #[derive(Debug, Default)]
    struct Note {
        id: i64,
        tags: serde_json::Value,
    }

    impl Entity for Note {
        fn meta() -> &'static EntityMeta {
            &NOTE
        }

        fn from_record(record: &Record) -> Result<Self> {
            Ok(Self {
                id: record.try_get("id")?,
                tags: record.try_get("tags")?,
            })
        }

        fn get(&self, field: &str) -> Option<Value> {
            match field {
                "id" => Some(Value::from(self.id)),
                "tags" => Some(Value::from(self.tags.clone())),
                _ => None,
            }
        }

        fn set(&mut self, field: &str, value: Value) -> Result<()> {
            match field {
                "id" => self.id = crate::entity::take(field, value)?,
                "tags" => self.tags = crate::entity::take(field, value)?,
                other => return Err(StoreError::query_build(format!("unknown field {other}"))),
            }
            Ok(())
        }
    }

    fn notes() -> (MockConnection, EntityStore<Note>) {
        let mock = MockConnection::new();
        let db = Arc::new(Database::new(Arc::new(mock.clone())));
        (mock, EntityStore::new(db))
    }

    #[test]
    fn test_repeated_field_is_written_as_json_array() {
        let (mock, store) = notes();
        mock.push_rows(vec![Record::from_pairs([
            ("id", Value::from(1i64)),
            ("tags", Value::from(serde_json::json!(["a", "b"]))),
        ])]);
        let tags = NOTE.resolve("tags").unwrap().encode(&["a", "b"]).unwrap();
        let note = Note {
            tags: crate::entity::take("tags", tags).unwrap(),
            ..Note::default()
        };

        let created = store
            .create(&Context::new(), note, QueryOptions::default())
            .unwrap();
        assert_eq!(created.tags, serde_json::json!(["a", "b"]));
        assert_eq!(
            mock.statements()[0].params,
            vec![Value::from(serde_json::json!(["a", "b"]))]
        );
    }

    #[test]
    fn test_repeated_field_rejects_non_arrays_before_io() {
        let (mock, store) = notes();
        let note = Note {
            tags: serde_json::json!({"a": 1}),
            ..Note::default()
        };
        let err = store
            .create(&Context::new(), note, QueryOptions::default())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QueryBuild);
        assert_eq!(err.operation(), "create");

        let err = store
            .update(&Context::new(), 1i64, &Changes::new().set("tags", "a"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QueryBuild);
        assert!(mock.statements().is_empty());
    }
}
