//! Per-call query builder and pagination.
//!
//! A [`QueryBuilder`] accumulates filters, sort keys, pagination and options for
//! one entity and renders exactly one statement:
//!
//! ```text
//! SELECT … FROM t [JOIN …] WHERE <filters ANDed> ORDER BY <sorts> LIMIT n OFFSET m [FOR …]
//! ```

use crate::condition::{column_ref, Condition, DeleteScope, Ident, SelectScope};
use crate::error::{ErrorKind, Result, StoreError};
use crate::metadata::{EntityMeta, SortDirection};
use sea_query::{
    Asterisk, Expr, ExprTrait, LockBehavior, LockType, PostgresQueryBuilder, Query, Value,
};

/// Row lock strength for `SELECT … FOR …`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMode {
    #[default]
    Update,
    NoKeyUpdate,
    Share,
    KeyShare,
}

/// What to do when a row is already locked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockWait {
    #[default]
    Wait,
    NoWait,
    SkipLocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Lock {
    pub mode: LockMode,
    pub wait: LockWait,
}

impl Lock {
    pub fn update() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn mode(mut self, mode: LockMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn wait(mut self, wait: LockWait) -> Self {
        self.wait = wait;
        self
    }
}

/// Per-call options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryOptions {
    /// Create nested relations on write
    pub populate_relations: bool,
    pub lock: Option<Lock>,
}

impl QueryOptions {
    pub fn populate_relations() -> Self {
        Self {
            populate_relations: true,
            ..Self::default()
        }
    }
}

/// A rendered statement and its positional parameters.
pub type Rendered = (String, Vec<Value>);

pub struct QueryBuilder {
    meta: &'static EntityMeta,
    conditions: Vec<Condition>,
    limit: Option<u64>,
    offset: Option<u64>,
    options: QueryOptions,
}

impl QueryBuilder {
    pub fn new(meta: &'static EntityMeta) -> Self {
        Self {
            meta,
            conditions: Vec::new(),
            limit: None,
            offset: None,
            options: QueryOptions::default(),
        }
    }

    pub fn meta(&self) -> &'static EntityMeta {
        self.meta
    }

    #[must_use]
    pub fn with_filter(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    #[must_use]
    pub fn with_filters<I: IntoIterator<Item = Condition>>(mut self, conditions: I) -> Self {
        self.conditions.extend(conditions);
        self
    }

    #[must_use]
    pub fn with_sort(self, field: &str, direction: SortDirection) -> Self {
        self.with_filter(Condition::OrderBy(field.to_string(), direction))
    }

    #[must_use]
    pub fn with_pagination(mut self, limit: Option<u64>, offset: Option<u64>) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn with_lock(mut self, lock: Lock) -> Self {
        self.options.lock = Some(lock);
        self
    }

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    /// Number of conditions that restrict rows (sort keys excluded).
    pub fn filter_count(&self) -> usize {
        self.conditions.iter().filter(|c| !c.is_order_by()).count()
    }

    fn select_scope(&self) -> Result<SelectScope> {
        let qualify = self.conditions.iter().any(Condition::is_join);
        let mut scope = SelectScope::new(self.meta, qualify);
        for condition in &self.conditions {
            condition.apply_select(&mut scope)?;
        }
        Ok(scope)
    }

    /// `SELECT` of every column.
    pub fn render_select(&self) -> Result<Rendered> {
        let scope = self.select_scope()?;
        let table = scope.qualify.then_some(self.meta.table);

        let mut stmt = Query::select();
        stmt.from(Ident(self.meta.table));
        for column in self.meta.columns() {
            stmt.column(column_ref(table, column));
        }
        for join in &scope.joins {
            stmt.inner_join(
                Ident(join.target.table),
                Expr::col(column_ref(Some(self.meta.table), join.local_column))
                    .equals(column_ref(Some(join.target.table), join.target_column)),
            );
        }
        if let Some(cond) = scope.where_condition() {
            stmt.cond_where(cond);
        }

        if scope.orders.is_empty() {
            for (column, direction) in self.default_order()? {
                stmt.order_by(column_ref(table, column), direction.into());
            }
        } else {
            for (column, direction) in &scope.orders {
                stmt.order_by(column.clone(), (*direction).into());
            }
        }

        if let Some(limit) = self.limit {
            stmt.limit(limit);
        }
        if let Some(offset) = self.offset {
            stmt.offset(offset);
        }
        if let Some(lock) = self.options.lock {
            let lock_type = match lock.mode {
                LockMode::Update => LockType::Update,
                LockMode::NoKeyUpdate => LockType::NoKeyUpdate,
                LockMode::Share => LockType::Share,
                LockMode::KeyShare => LockType::KeyShare,
            };
            match lock.wait {
                LockWait::Wait => stmt.lock(lock_type),
                LockWait::NoWait => stmt.lock_with_behavior(lock_type, LockBehavior::Nowait),
                LockWait::SkipLocked => {
                    stmt.lock_with_behavior(lock_type, LockBehavior::SkipLocked)
                }
            };
        }

        let (sql, values) = stmt.build(PostgresQueryBuilder);
        Ok((sql, values.0))
    }

    /// `SELECT COUNT(*) AS count` with filters and joins only.
    pub fn render_count(&self) -> Result<Rendered> {
        let scope = self.select_scope()?;
        let mut stmt = Query::select();
        stmt.from(Ident(self.meta.table))
            .expr_as(Expr::cust("COUNT(*)"), Ident("count"));
        for join in &scope.joins {
            stmt.inner_join(
                Ident(join.target.table),
                Expr::col(column_ref(Some(self.meta.table), join.local_column))
                    .equals(column_ref(Some(join.target.table), join.target_column)),
            );
        }
        if let Some(cond) = scope.where_condition() {
            stmt.cond_where(cond);
        }
        let (sql, values) = stmt.build(PostgresQueryBuilder);
        Ok((sql, values.0))
    }

    /// `DELETE` restricted by the filters. Refuses to render without a predicate.
    pub fn render_delete(&self) -> Result<Rendered> {
        let mut scope = DeleteScope::new(self.meta);
        for condition in &self.conditions {
            condition.apply_delete(&mut scope)?;
        }
        let cond = scope.where_condition().ok_or_else(|| {
            StoreError::new(
                ErrorKind::FiltersRequired,
                format!("refusing to delete every row of {}", self.meta.table),
            )
        })?;
        let mut stmt = Query::delete();
        stmt.from_table(Ident(self.meta.table)).cond_where(cond);
        let (sql, values) = stmt.build(PostgresQueryBuilder);
        Ok((sql, values.0))
    }

    /// `SELECT EXISTS (…)` over the filters.
    pub fn render_exists(&self) -> Result<Rendered> {
        let scope = self.select_scope()?;
        let mut inner = Query::select();
        inner.from(Ident(self.meta.table)).column(Asterisk);
        for join in &scope.joins {
            inner.inner_join(
                Ident(join.target.table),
                Expr::col(column_ref(Some(self.meta.table), join.local_column))
                    .equals(column_ref(Some(join.target.table), join.target_column)),
            );
        }
        if let Some(cond) = scope.where_condition() {
            inner.cond_where(cond);
        }
        let mut stmt = Query::select();
        stmt.expr_as(Expr::exists(inner), Ident("exists"));
        let (sql, values) = stmt.build(PostgresQueryBuilder);
        Ok((sql, values.0))
    }

    fn default_order(&self) -> Result<Vec<(&'static str, SortDirection)>> {
        if self.meta.default_order.is_empty() {
            let pk = self.meta.primary_key()?;
            return Ok(vec![(pk.column, SortDirection::Asc)]);
        }
        self.meta
            .default_order
            .iter()
            .map(|(field, direction)| Ok((self.meta.column_of(field)?, *direction)))
            .collect()
    }
}

/// Pagination summary returned with a page of results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Paginator {
    pub total_count: u64,
    pub limit: u64,
    /// 1-indexed
    pub page: u64,
    pub total_pages: u64,
}

impl Paginator {
    /// Validate caller-supplied pagination; `page < 1`, `limit <= 0` or an
    /// offset past `i64::MAX` is an error.
    pub fn check(limit: i64, page: i64) -> Result<(u64, u64)> {
        if limit <= 0 {
            return Err(StoreError::query_build(format!(
                "pagination limit must be positive, got {limit}"
            )));
        }
        if page < 1 {
            return Err(StoreError::query_build(format!(
                "pagination page must be at least 1, got {page}"
            )));
        }
        if (page - 1).checked_mul(limit).is_none() {
            return Err(StoreError::query_build(format!(
                "pagination offset out of range for page {page} of {limit} rows"
            )));
        }
        Ok((limit as u64, page as u64))
    }

    pub fn new(total_count: u64, limit: i64, page: i64) -> Result<Self> {
        let (limit, page) = Self::check(limit, page)?;
        Ok(Self {
            total_count,
            limit,
            page,
            total_pages: total_count.div_ceil(limit),
        })
    }

    pub fn offset(&self) -> u64 {
        self.page.saturating_sub(1).saturating_mul(self.limit)
    }

    pub fn has_next(&self) -> bool {
        self.page < self.total_pages
    }
}
