//! Executor seam between the engine and the database driver.
//!
//! The engine only ever talks to these traits. Statements arrive as SQL text plus
//! sea-query [`Value`]s and rows come back as [`Record`]s, so the store can be
//! driven by `may_postgres` in production and by [`crate::mock`] in tests.

use crate::connection;
use crate::error::DriverError;
use crate::transaction::{IsolationLevel, PgTransaction};
use crate::value::Record;
use crate::value_conversion::{record_from_row, with_converted_params};
use may_postgres::Client;
use sea_query::Value;
use std::time::Instant;

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;
#[cfg(feature = "metrics")]
use crate::metrics::METRICS;

/// Trait for executing statements
///
/// Implemented by pooled connections, open transactions and test doubles.
pub trait Executor: Send + Sync {
    /// Execute a statement and return the number of rows affected.
    fn execute(&self, sql: &str, params: &[Value]) -> Result<u64, DriverError>;

    /// Execute a query and return every row, fully buffered.
    fn query_all(&self, sql: &str, params: &[Value]) -> Result<Vec<Record>, DriverError>;

    /// Execute a query and return the first row, if any.
    fn query_opt(&self, sql: &str, params: &[Value]) -> Result<Option<Record>, DriverError> {
        Ok(self.query_all(sql, params)?.into_iter().next())
    }
}

/// A pooled handle that can also open transactions.
pub trait Connection: Executor {
    /// Open a transaction on a dedicated session.
    fn begin(&self, isolation: IsolationLevel) -> Result<Box<dyn TxHandle>, DriverError>;
}

/// An open transaction. Once committed or rolled back every further call
/// fails with [`DriverError::TransactionClosed`].
pub trait TxHandle: Executor {
    fn commit(&self) -> Result<(), DriverError>;
    fn rollback(&self) -> Result<(), DriverError>;
}

/// Run one statement against a `may_postgres` client with tracing and metrics.
pub(crate) fn run_execute(client: &Client, sql: &str, params: &[Value]) -> Result<u64, DriverError> {
    #[cfg(feature = "tracing")]
    let _span = tracing_helpers::execute_query_span(sql).entered();

    let start = Instant::now();
    let result = with_converted_params(params, |args| {
        client.execute(sql, args).map_err(DriverError::from)
    });
    observe(start, &result);
    result
}

/// Run one query against a `may_postgres` client and decode every row.
pub(crate) fn run_query(
    client: &Client,
    sql: &str,
    params: &[Value],
) -> Result<Vec<Record>, DriverError> {
    #[cfg(feature = "tracing")]
    let _span = tracing_helpers::execute_query_span(sql).entered();

    let start = Instant::now();
    let result = with_converted_params(params, |args| {
        let rows = client.query(sql, args).map_err(DriverError::from)?;
        rows.iter().map(record_from_row).collect()
    });
    observe(start, &result);
    result
}

#[cfg_attr(not(feature = "metrics"), allow(unused_variables))]
fn observe<T>(start: Instant, result: &Result<T, DriverError>) {
    let duration = start.elapsed();
    #[cfg(feature = "metrics")]
    {
        METRICS.record_query(duration);
        if result.is_err() {
            METRICS.record_query_error();
        }
    }
    log::trace!("statement finished in {:?}", duration);
}

/// [`Connection`] backed by a `may_postgres::Client`.
///
/// Plain statements share the client. Each transaction opens its own session
/// from the stored URL so `BEGIN` never leaks onto statements of other callers.
pub struct PgConnection {
    url: String,
    client: Client,
    session_setup: Vec<String>,
}

impl PgConnection {
    /// Connect to `url`.
    pub fn connect(url: &str) -> Result<Self, DriverError> {
        let client = connection::connect(url)
            .map_err(|e| DriverError::Connection(e.to_string()))?;
        Ok(Self {
            url: url.to_string(),
            client,
            session_setup: Vec::new(),
        })
    }

    /// Apply `SET statement_timeout` to this session and to every transaction session.
    pub fn with_statement_timeout(mut self, millis: u64) -> Result<Self, DriverError> {
        let statement = format!("SET statement_timeout = {millis}");
        run_execute(&self.client, &statement, &[])?;
        self.session_setup.push(statement);
        Ok(self)
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Executor for PgConnection {
    fn execute(&self, sql: &str, params: &[Value]) -> Result<u64, DriverError> {
        run_execute(&self.client, sql, params)
    }

    fn query_all(&self, sql: &str, params: &[Value]) -> Result<Vec<Record>, DriverError> {
        run_query(&self.client, sql, params)
    }
}

impl Connection for PgConnection {
    fn begin(&self, isolation: IsolationLevel) -> Result<Box<dyn TxHandle>, DriverError> {
        let client = connection::connect(&self.url)
            .map_err(|e| DriverError::Connection(e.to_string()))?;
        for statement in &self.session_setup {
            run_execute(&client, statement, &[])?;
        }
        let tx = PgTransaction::begin(client, isolation)?;
        Ok(Box::new(tx))
    }
}
