use super::EntityStore;
use crate::condition::Condition;
use crate::database::Intent;
use crate::entity::Entity;
use crate::error::{Result, StoreError};
use crate::query::{Lock, Paginator, QueryBuilder};
use crate::transaction::Context;
use sea_query::Value;

impl<E: Entity> EntityStore<E> {
    /// Row with the given primary key.
    pub fn find_by_id(&self, ctx: &Context, id: impl Into<Value>) -> Result<E> {
        let pk = E::meta()
            .primary_key()
            .map_err(|e| self.context(e, "find_by_id"))?;
        self.find_first(ctx, vec![Condition::Eq(pk.name.to_string(), id.into())], "find_by_id")
    }

    /// Row matching a unique field other than the key.
    pub fn find_by_key(&self, ctx: &Context, field: &str, value: impl Into<Value>) -> Result<E> {
        self.find_first(ctx, vec![Condition::eq(field, value)], "find_by_key")
    }

    /// Every matching row, ordered by the filters' sort keys or the default order.
    pub fn find_many<I>(&self, ctx: &Context, filters: I) -> Result<Vec<E>>
    where
        I: IntoIterator<Item = Condition>,
    {
        self.search(ctx, self.query_builder().with_filters(filters))
    }

    /// Run a fully configured builder on the read side.
    pub fn search(&self, ctx: &Context, builder: QueryBuilder) -> Result<Vec<E>> {
        let intent = if builder.options().lock.is_some() {
            Intent::Lock
        } else {
            Intent::Read
        };
        self.fetch(ctx, intent, &builder, "find_many")
    }

    /// First matching row by the default order. Zero rows is `RowNotFound`.
    pub fn find_one<I>(&self, ctx: &Context, filters: I) -> Result<E>
    where
        I: IntoIterator<Item = Condition>,
    {
        self.find_first(ctx, filters, "find_one")
    }

    fn find_first<I>(&self, ctx: &Context, filters: I, operation: &'static str) -> Result<E>
    where
        I: IntoIterator<Item = Condition>,
    {
        let builder = self
            .query_builder()
            .with_filters(filters)
            .with_pagination(Some(1), None);
        self.fetch(ctx, Intent::Read, &builder, operation)?
            .into_iter()
            .next()
            .ok_or_else(|| {
                self.context(
                    StoreError::row_not_found(format!("no {} matched", E::meta().name)),
                    operation,
                )
            })
    }

    /// Number of rows matching the filters; sort keys are ignored.
    pub fn count<I>(&self, ctx: &Context, filters: I) -> Result<u64>
    where
        I: IntoIterator<Item = Condition>,
    {
        let builder = self.query_builder().with_filters(filters);
        self.count_with(ctx, &builder)
    }

    fn count_with(&self, ctx: &Context, builder: &QueryBuilder) -> Result<u64> {
        let (sql, values) = builder
            .render_count()
            .map_err(|e| self.context(e, "count"))?;
        let route = self
            .db
            .route(ctx, Intent::Read)
            .map_err(|e| self.context(e, "count"))?;
        let record = route
            .query_opt(&sql, &values)
            .map_err(|e| self.fail(e, "count"))?
            .ok_or_else(|| self.context(StoreError::scan("COUNT returned no row"), "count"))?;
        let count: i64 = record
            .try_get("count")
            .map_err(|e| self.context(e, "count"))?;
        Ok(count.max(0) as u64)
    }

    pub fn exists<I>(&self, ctx: &Context, filters: I) -> Result<bool>
    where
        I: IntoIterator<Item = Condition>,
    {
        let (sql, values) = self
            .query_builder()
            .with_filters(filters)
            .render_exists()
            .map_err(|e| self.context(e, "exists"))?;
        let route = self
            .db
            .route(ctx, Intent::Read)
            .map_err(|e| self.context(e, "exists"))?;
        match route
            .query_opt(&sql, &values)
            .map_err(|e| self.fail(e, "exists"))?
        {
            Some(record) => record
                .try_get::<bool>("exists")
                .map_err(|e| self.context(e, "exists")),
            None => Ok(false),
        }
    }

    /// One page of results plus its [`Paginator`].
    ///
    /// Counts first, then fetches the page; both run in the context's transaction
    /// when one is open, otherwise writes in between can shift the page.
    pub fn find_many_with_pagination<I>(
        &self,
        ctx: &Context,
        limit: i64,
        page: i64,
        filters: I,
    ) -> Result<(Vec<E>, Paginator)>
    where
        I: IntoIterator<Item = Condition>,
    {
        Paginator::check(limit, page).map_err(|e| self.context(e, "find_many_with_pagination"))?;
        let filters: Vec<Condition> = filters.into_iter().collect();

        let total = self
            .count_with(ctx, &self.query_builder().with_filters(filters.clone()))
            .map_err(|e| self.context(e, "find_many_with_pagination"))?;
        let paginator = Paginator::new(total, limit, page)?;

        let builder = self
            .query_builder()
            .with_filters(filters)
            .with_pagination(Some(paginator.limit), Some(paginator.offset()));
        let items = self.fetch(ctx, Intent::Read, &builder, "find_many_with_pagination")?;
        Ok((items, paginator))
    }

    /// Page through with the configured default page size.
    pub fn find_page<I>(&self, ctx: &Context, page: i64, filters: I) -> Result<(Vec<E>, Paginator)>
    where
        I: IntoIterator<Item = Condition>,
    {
        self.find_many_with_pagination(ctx, self.db.default_page_size(), page, filters)
    }

    /// Lock the matching rows. Always runs on the write side.
    pub fn select_for_update<I>(&self, ctx: &Context, filters: I, lock: Lock) -> Result<Vec<E>>
    where
        I: IntoIterator<Item = Condition>,
    {
        let builder = self.query_builder().with_filters(filters).with_lock(lock);
        self.fetch(ctx, Intent::Lock, &builder, "select_for_update")
    }
}
