//! Read/write-split database handle.
//!
//! [`Database`] owns the write connection, an optional read replica, the
//! transaction manager and the error translator. Every statement goes through
//! [`Database::route`]: an open transaction on the context wins, otherwise reads
//! use the replica and writes and locks use the primary.

use crate::config::StoreConfig;
use crate::connection::redact;
use crate::error::{DriverError, Result, StoreError};
use crate::executor::{Connection, Executor, PgConnection};
use crate::transaction::{ActiveTx, Context, IsolationLevel, TransactionManager};
use crate::translator::{ErrorTranslator, PostgresTranslator};
use crate::value::Record;
use sea_query::Value;
use std::sync::Arc;
use std::time::Duration;

/// What a statement intends to do; decides the connection outside a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Read,
    Write,
    /// Row locks must see the primary.
    Lock,
}

/// Connection selected for one statement.
pub struct Route<'a> {
    ctx: &'a Context,
    target: Target<'a>,
    log_statements: bool,
}

#[derive(Clone, Copy)]
enum Target<'a> {
    Pool(&'a dyn Connection),
    Tx(&'a ActiveTx),
}

impl Route<'_> {
    pub fn transaction_id(&self) -> Option<u64> {
        match self.target {
            Target::Tx(tx) => Some(tx.id()),
            Target::Pool(_) => None,
        }
    }

    fn before(&self, sql: &str, params: &[Value]) -> Result<(), DriverError> {
        self.ctx.check()?;
        if self.log_statements {
            log::debug!("{sql} -- {} params", params.len());
        }
        Ok(())
    }

    /// Run `f` with the statement bounded by the context deadline.
    ///
    /// Inside a transaction the bound is a `SET LOCAL statement_timeout` ahead of
    /// the statement. On a pool the statement gets a short transaction of its
    /// own so the bound cannot leak onto other callers of the shared session.
    fn run<T>(
        &self,
        sql: &str,
        params: &[Value],
        f: impl FnOnce(&dyn Executor) -> Result<T, DriverError>,
    ) -> Result<T, DriverError> {
        self.before(sql, params)?;
        let Some(budget) = self.ctx.remaining() else {
            return match self.target {
                Target::Pool(conn) => f(&Borrowed(conn)),
                Target::Tx(tx) => f(tx),
            };
        };
        let bound = statement_timeout(budget);
        match self.target {
            Target::Tx(tx) => {
                tx.execute(&bound, &[])?;
                f(tx)
            }
            Target::Pool(conn) => {
                let tx = conn.begin(IsolationLevel::default())?;
                let result = tx.execute(&bound, &[]).and_then(|_| f(&Borrowed(tx.as_ref())));
                match result {
                    Ok(value) => {
                        tx.commit()?;
                        Ok(value)
                    }
                    Err(err) => {
                        if let Err(rollback_err) = tx.rollback() {
                            log::warn!("rollback of bounded statement failed: {rollback_err}");
                        }
                        Err(err)
                    }
                }
            }
        }
    }

    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<u64, DriverError> {
        self.run(sql, params, |exec| exec.execute(sql, params))
    }

    pub fn query_all(&self, sql: &str, params: &[Value]) -> Result<Vec<Record>, DriverError> {
        self.run(sql, params, |exec| exec.query_all(sql, params))
    }

    pub fn query_opt(&self, sql: &str, params: &[Value]) -> Result<Option<Record>, DriverError> {
        Ok(self.query_all(sql, params)?.into_iter().next())
    }
}

/// Hands a `dyn Connection` or `dyn TxHandle` on as a `&dyn Executor`.
struct Borrowed<'a, E: ?Sized>(&'a E);

impl<E: Executor + ?Sized> Executor for Borrowed<'_, E> {
    fn execute(&self, sql: &str, params: &[Value]) -> Result<u64, DriverError> {
        self.0.execute(sql, params)
    }

    fn query_all(&self, sql: &str, params: &[Value]) -> Result<Vec<Record>, DriverError> {
        self.0.query_all(sql, params)
    }
}

/// `SET LOCAL statement_timeout` for the time left. Zero would disable the
/// timeout, so the bound never drops below one millisecond.
fn statement_timeout(budget: Duration) -> String {
    let millis = u64::try_from(budget.as_millis()).unwrap_or(u64::MAX).max(1);
    format!("SET LOCAL statement_timeout = {millis}")
}

pub struct Database {
    write: Arc<dyn Connection>,
    read: Option<Arc<dyn Connection>>,
    transactions: TransactionManager,
    translator: Arc<dyn ErrorTranslator>,
    default_page_size: i64,
    log_statements: bool,
}

impl Database {
    /// Single-connection database using the PostgreSQL translator.
    pub fn new(write: Arc<dyn Connection>) -> Self {
        let translator: Arc<dyn ErrorTranslator> = Arc::new(PostgresTranslator);
        Self {
            transactions: TransactionManager::new(Arc::clone(&write), Arc::clone(&translator)),
            write,
            read: None,
            translator,
            default_page_size: StoreConfig::default().default_page_size,
            log_statements: false,
        }
    }

    /// Send reads outside transactions to `read`.
    #[must_use]
    pub fn with_read_replica(mut self, read: Arc<dyn Connection>) -> Self {
        self.read = Some(read);
        self
    }

    #[must_use]
    pub fn with_translator(mut self, translator: Arc<dyn ErrorTranslator>) -> Self {
        self.transactions = TransactionManager::new(Arc::clone(&self.write), Arc::clone(&translator));
        self.translator = translator;
        self
    }

    #[must_use]
    pub fn with_statement_logging(mut self, enabled: bool) -> Self {
        self.log_statements = enabled;
        self
    }

    #[must_use]
    pub fn with_default_page_size(mut self, size: i64) -> Self {
        self.default_page_size = size;
        self
    }

    /// Open the configured connections.
    pub fn connect(config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        let open = |url: &str| -> Result<Arc<dyn Connection>> {
            log::info!("connecting to {}", redact(url));
            let mut conn = PgConnection::connect(url).map_err(|e| {
                PostgresTranslator.translate(e).during("connect", "")
            })?;
            if let Some(millis) = config.statement_timeout_ms {
                conn = conn
                    .with_statement_timeout(millis)
                    .map_err(|e| PostgresTranslator.translate(e).during("connect", ""))?;
            }
            Ok(Arc::new(conn))
        };

        let mut db = Database::new(open(&config.write_url)?)
            .with_statement_logging(config.log_statements)
            .with_default_page_size(config.default_page_size);
        if let Some(read_url) = &config.read_url {
            db = db.with_read_replica(open(read_url)?);
        }
        Ok(db)
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    pub fn translator(&self) -> &dyn ErrorTranslator {
        self.translator.as_ref()
    }

    pub fn default_page_size(&self) -> i64 {
        self.default_page_size
    }

    /// Translate a driver failure and tag it with where it happened.
    pub fn fail(&self, err: DriverError, operation: &'static str, entity: &'static str) -> StoreError {
        self.translator.translate(err).during(operation, entity)
    }

    /// Pick the connection for a statement.
    ///
    /// A context whose transaction was already committed or rolled back fails
    /// with `NoTransaction` instead of falling back to the pools.
    pub fn route<'a>(&'a self, ctx: &'a Context, intent: Intent) -> Result<Route<'a>> {
        let target = match ctx.transaction() {
            Some(tx) if tx.is_finished() => {
                return Err(StoreError::no_transaction(format!(
                    "transaction {} has already been committed or rolled back",
                    tx.id()
                )));
            }
            Some(tx) => Target::Tx(tx.as_ref()),
            None => match (intent, &self.read) {
                (Intent::Read, Some(read)) => Target::Pool(read.as_ref()),
                _ => Target::Pool(self.write.as_ref()),
            },
        };
        log::trace!(
            "routing {:?} to {}",
            intent,
            match target {
                Target::Tx(tx) => format!("transaction {}", tx.id()),
                Target::Pool(_) if intent == Intent::Read && self.read.is_some() => {
                    "read replica".to_string()
                }
                Target::Pool(_) => "primary".to_string(),
            }
        );
        Ok(Route {
            ctx,
            target,
            log_statements: self.log_statements,
        })
    }

    /// `SELECT 1` on every configured connection.
    pub fn ping(&self, ctx: &Context) -> Result<()> {
        let mut targets: Vec<&dyn Connection> = vec![self.write.as_ref()];
        if let Some(read) = &self.read {
            targets.push(read.as_ref());
        }
        for conn in targets {
            ctx.check().map_err(|e| self.fail(e, "ping", ""))?;
            conn.query_all("SELECT 1", &[])
                .map_err(|e| self.fail(e, "ping", ""))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::mock::MockConnection;

    #[test]
    fn test_reads_use_replica_and_writes_use_primary() {
        let primary = MockConnection::named("primary");
        let replica = MockConnection::named("replica");
        let db = Database::new(Arc::new(primary.clone()))
            .with_read_replica(Arc::new(replica.clone()));
        let ctx = Context::new();

        db.route(&ctx, Intent::Read).unwrap().query_all("SELECT 1", &[]).unwrap();
        db.route(&ctx, Intent::Write).unwrap().execute("UPDATE x", &[]).unwrap();
        db.route(&ctx, Intent::Lock).unwrap().query_all("SELECT 2", &[]).unwrap();

        assert_eq!(replica.sql_log(), vec!["SELECT 1"]);
        assert_eq!(primary.sql_log(), vec!["UPDATE x", "SELECT 2"]);
    }

    #[test]
    fn test_transaction_overrides_read_split() {
        let primary = MockConnection::named("primary");
        let replica = MockConnection::named("replica");
        let db = Database::new(Arc::new(primary.clone()))
            .with_read_replica(Arc::new(replica.clone()));
        let ctx = db.transactions().begin(&Context::new()).unwrap();

        let route = db.route(&ctx, Intent::Read).unwrap();
        assert_eq!(route.transaction_id(), ctx.transaction_id());
        route.query_all("SELECT 1", &[]).unwrap();

        assert!(replica.statements().is_empty());
        let last = primary.statements().pop().unwrap();
        assert_eq!(last.sql, "SELECT 1");
        assert!(last.transaction.is_some());
    }

    #[test]
    fn test_stale_transaction_context_is_rejected() {
        let primary = MockConnection::new();
        let db = Database::new(Arc::new(primary.clone()));
        let ctx = db.transactions().begin(&Context::new()).unwrap();
        db.transactions().commit(&ctx).unwrap();
        let err = db.route(&ctx, Intent::Write).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NoTransaction);
    }

    #[test]
    fn test_cancelled_context_sends_nothing() {
        let primary = MockConnection::new();
        let db = Database::new(Arc::new(primary.clone()));
        let token = crate::transaction::CancelToken::new();
        let ctx = Context::new().with_cancel(token.clone());
        token.cancel();
        let err = db
            .route(&ctx, Intent::Read)
            .unwrap()
            .query_all("SELECT 1", &[])
            .unwrap_err();
        assert!(matches!(err, DriverError::Canceled(_)));
        assert!(primary.statements().is_empty());
    }

    #[test]
    fn test_deadline_bounds_pooled_statement() {
        let primary = MockConnection::named("primary");
        let replica = MockConnection::named("replica");
        let db = Database::new(Arc::new(primary.clone()))
            .with_read_replica(Arc::new(replica.clone()));
        let ctx = Context::new().with_timeout(Duration::from_secs(30));

        db.route(&ctx, Intent::Read).unwrap().query_all("SELECT 1", &[]).unwrap();

        let log = replica.sql_log();
        assert_eq!(log.len(), 4, "{log:?}");
        assert!(log[0].starts_with("BEGIN"));
        let millis: u64 = log[1]
            .strip_prefix("SET LOCAL statement_timeout = ")
            .unwrap()
            .parse()
            .unwrap();
        assert!(millis > 0 && millis <= 30_000, "{millis}");
        assert_eq!(log[2], "SELECT 1");
        assert_eq!(log[3], "COMMIT");
        assert!(primary.statements().is_empty());
    }

    #[test]
    fn test_deadline_bounds_statement_inside_transaction() {
        let primary = MockConnection::new();
        let db = Database::new(Arc::new(primary.clone()));
        let ctx = db
            .transactions()
            .begin(&Context::new().with_timeout(Duration::from_secs(5)))
            .unwrap();

        db.route(&ctx, Intent::Write).unwrap().execute("UPDATE x", &[]).unwrap();

        let log = primary.statements();
        assert_eq!(log.len(), 3);
        assert!(log[1].sql.starts_with("SET LOCAL statement_timeout = "));
        assert_eq!(log[2].sql, "UPDATE x");
        assert!(log[1..].iter().all(|s| s.transaction == log[0].transaction));
    }

    #[test]
    fn test_bounded_statement_failure_rolls_back() {
        let primary = MockConnection::new();
        let db = Database::new(Arc::new(primary.clone()));
        let ctx = Context::new().with_timeout(Duration::from_secs(5));
        primary.push_affected(0);
        primary.push_error(DriverError::Database(crate::error::DbFailure::new(
            "57014",
            "canceling statement due to statement timeout",
        )));

        let err = db
            .route(&ctx, Intent::Read)
            .unwrap()
            .query_all("SELECT pg_sleep(10)", &[])
            .unwrap_err();
        assert_eq!(db.fail(err, "find_many", "Author").kind(), ErrorKind::Canceled);
        assert_eq!(primary.sql_log().last().map(String::as_str), Some("ROLLBACK"));
    }

    #[test]
    fn test_timeout_bound_never_disables_the_limit() {
        assert_eq!(statement_timeout(Duration::ZERO), "SET LOCAL statement_timeout = 1");
        assert_eq!(
            statement_timeout(Duration::from_millis(1500)),
            "SET LOCAL statement_timeout = 1500"
        );
    }

    #[test]
    fn test_ping_hits_every_connection() {
        let primary = MockConnection::named("primary");
        let replica = MockConnection::named("replica");
        let db = Database::new(Arc::new(primary.clone()))
            .with_read_replica(Arc::new(replica.clone()));
        db.ping(&Context::new()).unwrap();
        assert_eq!(primary.sql_log(), vec!["SELECT 1"]);
        assert_eq!(replica.sql_log(), vec!["SELECT 1"]);
    }
}
