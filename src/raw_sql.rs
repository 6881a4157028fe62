//! Raw SQL escape hatch.
//!
//! Runs hand-written statements through the same routing as the stores: the
//! context's transaction when one is open, otherwise the read or write side.
//! Placeholders are PostgreSQL style (`$1`, `$2`, ...).

use crate::database::{Database, Intent};
use crate::error::{Result, StoreError};
use crate::transaction::Context;
use crate::value::Record;
use sea_query::Value;

/// Execute a statement on the write side and return the affected row count.
pub fn query(db: &Database, ctx: &Context, sql: &str, params: &[Value]) -> Result<u64> {
    let route = db.route(ctx, Intent::Write)?;
    route
        .execute(sql, params)
        .map_err(|e| db.fail(e, "query", ""))
}

/// First row of a query. Zero rows is `RowNotFound`.
pub fn query_row(
    db: &Database,
    ctx: &Context,
    intent: Intent,
    sql: &str,
    params: &[Value],
) -> Result<Record> {
    let route = db.route(ctx, intent)?;
    route
        .query_opt(sql, params)
        .map_err(|e| db.fail(e, "query_row", ""))?
        .ok_or_else(|| StoreError::row_not_found("query returned no rows").during("query_row", ""))
}

/// Every row of a query, fully buffered.
pub fn query_rows(
    db: &Database,
    ctx: &Context,
    intent: Intent,
    sql: &str,
    params: &[Value],
) -> Result<Vec<Record>> {
    let route = db.route(ctx, intent)?;
    route
        .query_all(sql, params)
        .map_err(|e| db.fail(e, "query_rows", ""))
}
