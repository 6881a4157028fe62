//! Context-scoped transactions.
//!
//! A transaction is opened by [`TransactionManager::begin`] and travels inside the
//! returned [`Context`]. Every store call made with that context runs on the
//! transaction's session; calls made with a plain context run on the pools.
//!
//! ```no_run
//! use rowkeeper::{Context, Database, Result};
//!
//! fn transfer(db: &Database) -> Result<()> {
//!     db.transactions().exec_with_tx(&Context::new(), |ctx| {
//!         // store calls with `ctx` share one transaction
//!         let _ = ctx.transaction_id();
//!         Ok(())
//!     })
//! }
//! ```

use crate::error::{DriverError, ErrorKind, Result, StoreError};
use crate::executor::{run_execute, run_query, Connection, Executor, TxHandle};
use crate::translator::ErrorTranslator;
use crate::value::Record;
use may_postgres::Client;
use sea_query::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;
#[cfg(feature = "metrics")]
use crate::metrics::METRICS;

/// Transaction isolation level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Read committed (default)
    #[default]
    ReadCommitted,
    /// Repeatable read
    RepeatableRead,
    /// Serializable
    Serializable,
}

impl IsolationLevel {
    /// PostgreSQL syntax
    pub fn to_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }

    /// Statement that opens a transaction at this level.
    pub fn begin_statement(&self) -> String {
        format!("BEGIN ISOLATION LEVEL {}", self.to_sql())
    }
}

/// A `may_postgres` session running one transaction.
pub struct PgTransaction {
    client: Client,
    closed: AtomicBool,
}

impl PgTransaction {
    /// Start a transaction on a session nobody else uses.
    pub(crate) fn begin(client: Client, isolation: IsolationLevel) -> Result<Self, DriverError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::begin_transaction_span().entered();

        run_execute(&client, &isolation.begin_statement(), &[])?;
        Ok(Self {
            client,
            closed: AtomicBool::new(false),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), DriverError> {
        if self.is_closed() {
            return Err(DriverError::TransactionClosed);
        }
        Ok(())
    }

    fn finish(&self, statement: &str) -> Result<(), DriverError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(DriverError::TransactionClosed);
        }
        run_execute(&self.client, statement, &[]).map(|_| ())
    }
}

impl Executor for PgTransaction {
    fn execute(&self, sql: &str, params: &[Value]) -> Result<u64, DriverError> {
        self.ensure_open()?;
        run_execute(&self.client, sql, params)
    }

    fn query_all(&self, sql: &str, params: &[Value]) -> Result<Vec<Record>, DriverError> {
        self.ensure_open()?;
        run_query(&self.client, sql, params)
    }
}

impl TxHandle for PgTransaction {
    fn commit(&self) -> Result<(), DriverError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::commit_transaction_span().entered();
        self.finish("COMMIT")
    }

    fn rollback(&self) -> Result<(), DriverError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::rollback_transaction_span().entered();
        self.finish("ROLLBACK")
    }
}

/// Cooperative cancellation flag shared between a caller and its work.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

static NEXT_TX_ID: AtomicU64 = AtomicU64::new(1);

/// Transaction carried by a [`Context`].
pub struct ActiveTx {
    id: u64,
    isolation: IsolationLevel,
    handle: Box<dyn TxHandle>,
    finished: AtomicBool,
}

impl ActiveTx {
    fn new(handle: Box<dyn TxHandle>, isolation: IsolationLevel) -> Self {
        Self {
            id: NEXT_TX_ID.fetch_add(1, Ordering::Relaxed),
            isolation,
            handle,
            finished: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Mark finished; returns false when it already was.
    fn close(&self) -> bool {
        !self.finished.swap(true, Ordering::SeqCst)
    }
}

impl fmt::Debug for ActiveTx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveTx")
            .field("id", &self.id)
            .field("isolation", &self.isolation)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl Executor for ActiveTx {
    fn execute(&self, sql: &str, params: &[Value]) -> Result<u64, DriverError> {
        if self.is_finished() {
            return Err(DriverError::TransactionClosed);
        }
        self.handle.execute(sql, params)
    }

    fn query_all(&self, sql: &str, params: &[Value]) -> Result<Vec<Record>, DriverError> {
        if self.is_finished() {
            return Err(DriverError::TransactionClosed);
        }
        self.handle.query_all(sql, params)
    }
}

/// Request-scoped state threaded through every store call: the open
/// transaction (if any), a deadline and a cancellation token.
///
/// Cloning is cheap. Clones share the same transaction.
#[derive(Debug, Clone, Default)]
pub struct Context {
    tx: Option<Arc<ActiveTx>>,
    deadline: Option<Instant>,
    cancel: Option<CancelToken>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Same context with a deadline `timeout` from now. An earlier existing
    /// deadline is kept.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    #[must_use]
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let mut ctx = self.clone();
        ctx.deadline = Some(match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        });
        ctx
    }

    #[must_use]
    pub fn with_cancel(&self, token: CancelToken) -> Self {
        let mut ctx = self.clone();
        ctx.cancel = Some(token);
        ctx
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; zero once it has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Id of the open transaction, for logging and correlation.
    pub fn transaction_id(&self) -> Option<u64> {
        self.tx.as_ref().filter(|tx| !tx.is_finished()).map(|tx| tx.id())
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction_id().is_some()
    }

    pub(crate) fn transaction(&self) -> Option<&Arc<ActiveTx>> {
        self.tx.as_ref()
    }

    /// Fails when the context was cancelled or its deadline passed.
    pub fn check(&self) -> Result<(), DriverError> {
        if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Err(DriverError::Canceled("context cancelled".to_string()));
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(DriverError::Canceled("context deadline exceeded".to_string()));
        }
        Ok(())
    }

    fn with_transaction(&self, tx: ActiveTx) -> Self {
        let mut ctx = self.clone();
        ctx.tx = Some(Arc::new(tx));
        ctx
    }
}

/// Opens, finishes and scopes transactions on the write connection.
pub struct TransactionManager {
    connection: Arc<dyn Connection>,
    translator: Arc<dyn ErrorTranslator>,
}

impl TransactionManager {
    pub fn new(connection: Arc<dyn Connection>, translator: Arc<dyn ErrorTranslator>) -> Self {
        Self {
            connection,
            translator,
        }
    }

    /// Open a transaction at the default isolation level. Returns the same
    /// context when one is already open.
    pub fn begin(&self, ctx: &Context) -> Result<Context> {
        self.begin_with(ctx, IsolationLevel::default())
    }

    pub fn begin_with(&self, ctx: &Context, isolation: IsolationLevel) -> Result<Context> {
        if ctx.in_transaction() {
            return Ok(ctx.clone());
        }
        ctx.check()
            .map_err(|e| self.fail(e, "begin"))?;
        let handle = self
            .connection
            .begin(isolation)
            .map_err(|e| self.fail(e, "begin"))?;
        let tx = ActiveTx::new(handle, isolation);
        log::debug!("transaction {} started ({})", tx.id(), isolation.to_sql());
        #[cfg(feature = "metrics")]
        METRICS.record_transaction("begin");
        Ok(ctx.with_transaction(tx))
    }

    pub fn commit(&self, ctx: &Context) -> Result<()> {
        let tx = self.take_open(ctx, "commit")?;
        tx.handle.commit().map_err(|e| self.fail(e, "commit"))?;
        log::debug!("transaction {} committed", tx.id());
        #[cfg(feature = "metrics")]
        METRICS.record_transaction("commit");
        Ok(())
    }

    pub fn rollback(&self, ctx: &Context) -> Result<()> {
        let tx = self.take_open(ctx, "rollback")?;
        tx.handle.rollback().map_err(|e| self.fail(e, "rollback"))?;
        log::debug!("transaction {} rolled back", tx.id());
        #[cfg(feature = "metrics")]
        METRICS.record_transaction("rollback");
        Ok(())
    }

    pub fn in_transaction(&self, ctx: &Context) -> bool {
        ctx.in_transaction()
    }

    /// Run `f` inside a transaction.
    ///
    /// With a transaction already on `ctx`, `f` joins it and nothing is committed
    /// here. Otherwise a transaction is opened, committed when `f` succeeds and
    /// rolled back when it fails. A rollback that finds the transaction already
    /// finished is ignored; any other rollback failure is appended to `f`'s error.
    pub fn exec_with_tx<T, F>(&self, ctx: &Context, f: F) -> Result<T>
    where
        F: FnOnce(&Context) -> Result<T>,
    {
        if ctx.in_transaction() {
            return f(ctx);
        }

        let tx_ctx = self.begin(ctx)?;
        match f(&tx_ctx) {
            Ok(value) => {
                self.commit(&tx_ctx)?;
                Ok(value)
            }
            Err(err) => match self.rollback(&tx_ctx) {
                Ok(()) => Err(err),
                Err(rollback_err) if rollback_err.is(ErrorKind::NoTransaction) => {
                    log::warn!("rollback skipped, transaction already finished: {rollback_err}");
                    Err(err)
                }
                Err(rollback_err) => {
                    log::warn!("rollback failed after error {err}: {rollback_err}");
                    Err(err.annotate(format!("rollback failed: {rollback_err}")))
                }
            },
        }
    }

    fn take_open(&self, ctx: &Context, operation: &'static str) -> Result<Arc<ActiveTx>> {
        let tx = ctx
            .transaction()
            .ok_or_else(|| StoreError::no_transaction("no transaction on context"))
            .map_err(|e| e.during(operation, ""))?;
        if !tx.close() {
            return Err(StoreError::no_transaction(format!(
                "transaction {} has already been committed or rolled back",
                tx.id()
            ))
            .during(operation, ""));
        }
        Ok(Arc::clone(tx))
    }

    fn fail(&self, err: DriverError, operation: &'static str) -> StoreError {
        self.translator.translate(err).during(operation, "")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockConnection;
    use crate::translator::PostgresTranslator;

    fn manager(mock: &MockConnection) -> TransactionManager {
        TransactionManager::new(Arc::new(mock.clone()), Arc::new(PostgresTranslator))
    }

    #[test]
    fn test_isolation_level_to_sql() {
        assert_eq!(IsolationLevel::ReadCommitted.to_sql(), "READ COMMITTED");
        assert_eq!(IsolationLevel::RepeatableRead.to_sql(), "REPEATABLE READ");
        assert_eq!(IsolationLevel::Serializable.to_sql(), "SERIALIZABLE");
        assert_eq!(
            IsolationLevel::Serializable.begin_statement(),
            "BEGIN ISOLATION LEVEL SERIALIZABLE"
        );
    }

    #[test]
    fn test_begin_is_idempotent() {
        let mock = MockConnection::new();
        let tm = manager(&mock);
        let ctx = tm.begin(&Context::new()).unwrap();
        let again = tm.begin(&ctx).unwrap();
        assert_eq!(ctx.transaction_id(), again.transaction_id());
        assert_eq!(mock.statements_matching("BEGIN").len(), 1);
    }

    #[test]
    fn test_commit_without_transaction() {
        let mock = MockConnection::new();
        let tm = manager(&mock);
        let err = tm.commit(&Context::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoTransaction);
        let err = tm.rollback(&Context::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoTransaction);
    }

    #[test]
    fn test_second_commit_reports_no_transaction() {
        let mock = MockConnection::new();
        let tm = manager(&mock);
        let ctx = tm.begin(&Context::new()).unwrap();
        tm.commit(&ctx).unwrap();
        assert!(!ctx.in_transaction());
        let err = tm.commit(&ctx).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoTransaction);
        assert_eq!(mock.statements_matching("COMMIT").len(), 1);
    }

    #[test]
    fn test_exec_with_tx_rolls_back_on_error() {
        let mock = MockConnection::new();
        let tm = manager(&mock);
        let result: Result<()> = tm.exec_with_tx(&Context::new(), |ctx| {
            assert!(ctx.in_transaction());
            Err(StoreError::query_build("boom"))
        });
        assert_eq!(result.unwrap_err().kind(), ErrorKind::QueryBuild);
        assert_eq!(mock.statements_matching("ROLLBACK").len(), 1);
        assert!(mock.statements_matching("COMMIT").is_empty());
    }

    #[test]
    fn test_exec_with_tx_ignores_rollback_of_finished_transaction() {
        let mock = MockConnection::new();
        let tm = manager(&mock);
        let result: Result<()> = tm.exec_with_tx(&Context::new(), |ctx| {
            tm.commit(ctx)?;
            Err(StoreError::query_build("after commit"))
        });
        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QueryBuild);
        assert!(!err.message().contains("rollback failed"));
    }

    #[test]
    fn test_cancelled_context_does_not_begin() {
        let mock = MockConnection::new();
        let tm = manager(&mock);
        let token = CancelToken::new();
        token.cancel();
        let err = tm.begin(&Context::new().with_cancel(token)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Canceled);
        assert!(mock.statements().is_empty());
    }

    #[test]
    fn test_with_deadline_keeps_earliest() {
        let now = Instant::now();
        let ctx = Context::new().with_deadline(now + Duration::from_secs(1));
        let later = ctx.with_deadline(now + Duration::from_secs(60));
        assert_eq!(later.deadline(), Some(now + Duration::from_secs(1)));
        let expired = Context::new().with_deadline(now);
        assert!(matches!(expired.check(), Err(DriverError::Canceled(_))));
    }
}
