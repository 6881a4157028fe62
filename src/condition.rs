//! Condition algebra.
//!
//! A [`Condition`] is an immutable predicate, sort key or join. Field names are
//! resolved against [`EntityMeta`] while rendering, so an unknown or malformed
//! name fails with a query-build error before anything reaches the connection.
//!
//! Rendering goes through sea-query: leaves become expressions, `And`/`Or`
//! become nested `sea_query::Condition`s, and the placeholders come out in the
//! same left-to-right order as the text.

use crate::error::{ErrorKind, Result, StoreError};
use crate::metadata::{EntityMeta, SortDirection};
use sea_query::extension::postgres::PgExpr;
use sea_query::{
    ColumnRef, Condition as SqlCondition, Expr, ExprTrait, Iden, IntoColumnRef, Value,
};

/// Identifier borrowed from entity metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Ident(pub &'static str);

impl Iden for Ident {
    fn unquoted(&self) -> &str {
        self.0
    }
}

pub(crate) fn column_ref(table: Option<&'static str>, column: &'static str) -> ColumnRef {
    match table {
        Some(table) => (Ident(table), Ident(column)).into_column_ref(),
        None => Ident(column).into_column_ref(),
    }
}

#[derive(Debug, Clone)]
pub enum Condition {
    Eq(String, Value),
    NotEq(String, Value),
    Gt(String, Value),
    Lt(String, Value),
    Gte(String, Value),
    Lte(String, Value),
    /// Binds exactly two parameters, `min` then `max`.
    Between {
        field: String,
        min: Value,
        max: Value,
    },
    Like(String, String),
    NotLike(String, String),
    /// Case-insensitive `LIKE`
    ILike(String, String),
    /// An empty list matches nothing.
    In(String, Vec<Value>),
    /// An empty list matches everything.
    NotIn(String, Vec<Value>),
    IsNull(String),
    IsNotNull(String),
    /// Sort key; only valid at the top level.
    OrderBy(String, SortDirection),
    And(Vec<Condition>),
    Or(Vec<Condition>),
    /// `INNER JOIN target ON owner.local_field = target.target_field`, with
    /// `filters` resolved against the target. Only valid at the top level of a select.
    Join {
        target: &'static EntityMeta,
        local_field: String,
        target_field: String,
        filters: Vec<Condition>,
    },
    /// Raw predicate. Use `?` for placeholders; they are renumbered in order.
    Custom { sql: String, values: Vec<Value> },
}

impl Condition {
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Condition::Eq(field.to_string(), value.into())
    }

    pub fn not_eq(field: &str, value: impl Into<Value>) -> Self {
        Condition::NotEq(field.to_string(), value.into())
    }

    pub fn gt(field: &str, value: impl Into<Value>) -> Self {
        Condition::Gt(field.to_string(), value.into())
    }

    pub fn lt(field: &str, value: impl Into<Value>) -> Self {
        Condition::Lt(field.to_string(), value.into())
    }

    pub fn gte(field: &str, value: impl Into<Value>) -> Self {
        Condition::Gte(field.to_string(), value.into())
    }

    pub fn lte(field: &str, value: impl Into<Value>) -> Self {
        Condition::Lte(field.to_string(), value.into())
    }

    pub fn between(field: &str, min: impl Into<Value>, max: impl Into<Value>) -> Self {
        Condition::Between {
            field: field.to_string(),
            min: min.into(),
            max: max.into(),
        }
    }

    pub fn like(field: &str, pattern: &str) -> Self {
        Condition::Like(field.to_string(), pattern.to_string())
    }

    pub fn not_like(field: &str, pattern: &str) -> Self {
        Condition::NotLike(field.to_string(), pattern.to_string())
    }

    pub fn ilike(field: &str, pattern: &str) -> Self {
        Condition::ILike(field.to_string(), pattern.to_string())
    }

    pub fn is_in<V: Into<Value>>(field: &str, values: impl IntoIterator<Item = V>) -> Self {
        Condition::In(field.to_string(), values.into_iter().map(Into::into).collect())
    }

    pub fn not_in<V: Into<Value>>(field: &str, values: impl IntoIterator<Item = V>) -> Self {
        Condition::NotIn(field.to_string(), values.into_iter().map(Into::into).collect())
    }

    pub fn is_null(field: &str) -> Self {
        Condition::IsNull(field.to_string())
    }

    pub fn is_not_null(field: &str) -> Self {
        Condition::IsNotNull(field.to_string())
    }

    pub fn asc(field: &str) -> Self {
        Condition::OrderBy(field.to_string(), SortDirection::Asc)
    }

    pub fn desc(field: &str) -> Self {
        Condition::OrderBy(field.to_string(), SortDirection::Desc)
    }

    pub fn and(children: Vec<Condition>) -> Self {
        Condition::And(children)
    }

    pub fn or(children: Vec<Condition>) -> Self {
        Condition::Or(children)
    }

    pub fn join(
        target: &'static EntityMeta,
        local_field: &str,
        target_field: &str,
        filters: Vec<Condition>,
    ) -> Self {
        Condition::Join {
            target,
            local_field: local_field.to_string(),
            target_field: target_field.to_string(),
            filters,
        }
    }

    pub fn custom<V: Into<Value>>(sql: &str, values: impl IntoIterator<Item = V>) -> Self {
        Condition::Custom {
            sql: sql.to_string(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_join(&self) -> bool {
        matches!(self, Condition::Join { .. })
    }

    pub fn is_order_by(&self) -> bool {
        matches!(self, Condition::OrderBy(..))
    }

    /// Add this condition to a select.
    pub fn apply_select(&self, scope: &mut SelectScope) -> Result<()> {
        match self {
            Condition::OrderBy(field, direction) => {
                let column = scope.meta.column_of(field)?;
                let table = scope.qualify.then_some(scope.meta.table);
                scope.orders.push((column_ref(table, column), *direction));
                Ok(())
            }
            Condition::Join {
                target,
                local_field,
                target_field,
                filters,
            } => {
                let local = scope.meta.column_of(local_field)?;
                let remote = target.column_of(target_field)?;
                for filter in filters {
                    scope.predicates.push(filter.predicate(target, true)?);
                }
                scope.joins.push(JoinClause {
                    target,
                    local_column: local,
                    target_column: remote,
                });
                Ok(())
            }
            _ => {
                let predicate = self.predicate(scope.meta, scope.qualify)?;
                scope.predicates.push(predicate);
                Ok(())
            }
        }
    }

    /// Add this condition to a delete. Sort keys are ignored; joins are rejected.
    pub fn apply_delete(&self, scope: &mut DeleteScope) -> Result<()> {
        match self {
            Condition::OrderBy(..) => Ok(()),
            Condition::Join { .. } => Err(StoreError::query_build(format!(
                "join conditions cannot be used to delete {}",
                scope.meta.name
            ))),
            _ => {
                let predicate = self.predicate(scope.meta, false)?;
                scope.predicates.push(predicate);
                Ok(())
            }
        }
    }

    fn predicate(&self, meta: &'static EntityMeta, qualify: bool) -> Result<SqlCondition> {
        let col = |field: &str| -> Result<Expr> {
            let column = meta.column_of(field)?;
            Ok(Expr::col(column_ref(qualify.then_some(meta.table), column)))
        };
        let expr = match self {
            Condition::Eq(f, v) => col(f)?.eq(Expr::val(v.clone())),
            Condition::NotEq(f, v) => col(f)?.ne(Expr::val(v.clone())),
            Condition::Gt(f, v) => col(f)?.gt(Expr::val(v.clone())),
            Condition::Lt(f, v) => col(f)?.lt(Expr::val(v.clone())),
            Condition::Gte(f, v) => col(f)?.gte(Expr::val(v.clone())),
            Condition::Lte(f, v) => col(f)?.lte(Expr::val(v.clone())),
            Condition::Between { field, min, max } => {
                col(field)?.between(Expr::val(min.clone()), Expr::val(max.clone()))
            }
            Condition::Like(f, p) => col(f)?.like(p.as_str()),
            Condition::NotLike(f, p) => col(f)?.not_like(p.as_str()),
            Condition::ILike(f, p) => col(f)?.ilike(p.as_str()),
            Condition::In(f, values) => {
                let column = col(f)?;
                if values.is_empty() {
                    Expr::cust("FALSE")
                } else {
                    column.is_in(values.iter().cloned().map(Expr::val))
                }
            }
            Condition::NotIn(f, values) => {
                let column = col(f)?;
                if values.is_empty() {
                    Expr::cust("TRUE")
                } else {
                    column.is_not_in(values.iter().cloned().map(Expr::val))
                }
            }
            Condition::IsNull(f) => col(f)?.is_null(),
            Condition::IsNotNull(f) => col(f)?.is_not_null(),
            Condition::Custom { sql, values } => {
                Expr::cust_with_values(sql.clone(), values.iter().cloned())
            }
            Condition::And(children) | Condition::Or(children) => {
                if children.is_empty() {
                    return Err(StoreError::query_build(format!(
                        "empty {} group on {}",
                        if matches!(self, Condition::And(_)) { "And" } else { "Or" },
                        meta.name
                    )));
                }
                let mut group = match self {
                    Condition::And(_) => SqlCondition::all(),
                    _ => SqlCondition::any(),
                };
                for child in children {
                    group = group.add(child.predicate(meta, qualify)?);
                }
                return Ok(group);
            }
            Condition::OrderBy(..) | Condition::Join { .. } => {
                return Err(StoreError::new(
                    ErrorKind::QueryBuild,
                    "OrderBy and Join are only allowed at the top level",
                ));
            }
        };
        Ok(SqlCondition::all().add(expr))
    }
}

#[derive(Debug, Clone)]
pub(crate) struct JoinClause {
    pub target: &'static EntityMeta,
    pub local_column: &'static str,
    pub target_column: &'static str,
}

/// Accumulates the parts of a select while conditions are applied.
#[derive(Debug)]
pub struct SelectScope {
    pub(crate) meta: &'static EntityMeta,
    /// Column references carry the table name (set when any join is present).
    pub(crate) qualify: bool,
    pub(crate) predicates: Vec<SqlCondition>,
    pub(crate) orders: Vec<(ColumnRef, SortDirection)>,
    pub(crate) joins: Vec<JoinClause>,
}

impl SelectScope {
    pub fn new(meta: &'static EntityMeta, qualify: bool) -> Self {
        Self {
            meta,
            qualify,
            predicates: Vec::new(),
            orders: Vec::new(),
            joins: Vec::new(),
        }
    }

    /// The ANDed WHERE clause, or `None` without predicates.
    pub fn where_condition(&self) -> Option<SqlCondition> {
        and_all(&self.predicates)
    }
}

#[derive(Debug)]
pub struct DeleteScope {
    pub(crate) meta: &'static EntityMeta,
    pub(crate) predicates: Vec<SqlCondition>,
}

impl DeleteScope {
    pub fn new(meta: &'static EntityMeta) -> Self {
        Self {
            meta,
            predicates: Vec::new(),
        }
    }

    pub fn where_condition(&self) -> Option<SqlCondition> {
        and_all(&self.predicates)
    }
}

fn and_all(predicates: &[SqlCondition]) -> Option<SqlCondition> {
    if predicates.is_empty() {
        return None;
    }
    Some(
        predicates
            .iter()
            .cloned()
            .fold(SqlCondition::all(), |all, p| all.add(p)),
    )
}
