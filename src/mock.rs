//! In-memory connection for tests.
//!
//! [`MockConnection`] records every statement it receives (including the
//! `BEGIN`/`COMMIT`/`ROLLBACK` of transactions opened on it) and answers from a
//! queue of canned replies. An empty queue answers with zero rows.
//!
//! ```
//! use rowkeeper::mock::MockConnection;
//! use rowkeeper::{Executor, Record};
//! use sea_query::Value;
//!
//! let mock = MockConnection::new();
//! mock.push_rows(vec![Record::from_pairs([("id", Value::from(1i64))])]);
//! let rows = mock.query_all("SELECT id FROM t", &[]).unwrap();
//! assert_eq!(rows.len(), 1);
//! assert_eq!(mock.sql_log(), vec!["SELECT id FROM t"]);
//! ```

use crate::error::DriverError;
use crate::executor::{Connection, Executor, TxHandle};
use crate::transaction::IsolationLevel;
use crate::value::Record;
use sea_query::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// One statement seen by the mock.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// Name of the connection that received it
    pub connection: String,
    pub sql: String,
    pub params: Vec<Value>,
    /// Mock-local transaction number, `None` outside transactions
    pub transaction: Option<u64>,
}

/// Canned answer for the next statement.
#[derive(Debug, Clone)]
pub enum Reply {
    Rows(Vec<Record>),
    Affected(u64),
    Error(DriverError),
}

#[derive(Debug, Default)]
struct State {
    statements: Vec<Statement>,
    replies: VecDeque<Reply>,
    next_tx: u64,
    fail_begin: Option<DriverError>,
    fail_rollback: Option<DriverError>,
}

#[derive(Debug, Clone)]
pub struct MockConnection {
    name: String,
    state: Arc<Mutex<State>>,
}

impl Default for MockConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnection {
    pub fn new() -> Self {
        Self::named("primary")
    }

    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push_reply(&self, reply: Reply) -> &Self {
        self.state().replies.push_back(reply);
        self
    }

    pub fn push_rows(&self, rows: Vec<Record>) -> &Self {
        self.push_reply(Reply::Rows(rows))
    }

    pub fn push_affected(&self, count: u64) -> &Self {
        self.push_reply(Reply::Affected(count))
    }

    pub fn push_error(&self, err: DriverError) -> &Self {
        self.push_reply(Reply::Error(err))
    }

    /// Make the next `begin` fail.
    pub fn fail_next_begin(&self, err: DriverError) {
        self.state().fail_begin = Some(err);
    }

    /// Make the next rollback fail.
    pub fn fail_next_rollback(&self, err: DriverError) {
        self.state().fail_rollback = Some(err);
    }

    pub fn statements(&self) -> Vec<Statement> {
        self.state().statements.clone()
    }

    /// SQL text of every statement, in order.
    pub fn sql_log(&self) -> Vec<String> {
        self.state().statements.iter().map(|s| s.sql.clone()).collect()
    }

    /// Statements whose SQL starts with `prefix`.
    pub fn statements_matching(&self, prefix: &str) -> Vec<Statement> {
        self.state()
            .statements
            .iter()
            .filter(|s| s.sql.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Statements other than transaction control.
    pub fn data_statements(&self) -> Vec<Statement> {
        self.state()
            .statements
            .iter()
            .filter(|s| !is_control(&s.sql))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        let mut state = self.state();
        state.statements.clear();
        state.replies.clear();
    }

    fn record(&self, sql: &str, params: &[Value], transaction: Option<u64>) -> Option<Reply> {
        let mut state = self.state();
        state.statements.push(Statement {
            connection: self.name.clone(),
            sql: sql.to_string(),
            params: params.to_vec(),
            transaction,
        });
        if is_control(sql) {
            return None;
        }
        state.replies.pop_front()
    }

    fn run_execute(&self, sql: &str, params: &[Value], tx: Option<u64>) -> Result<u64, DriverError> {
        match self.record(sql, params, tx) {
            None => Ok(0),
            Some(Reply::Affected(n)) => Ok(n),
            Some(Reply::Rows(rows)) => Ok(rows.len() as u64),
            Some(Reply::Error(e)) => Err(e),
        }
    }

    fn run_query(
        &self,
        sql: &str,
        params: &[Value],
        tx: Option<u64>,
    ) -> Result<Vec<Record>, DriverError> {
        match self.record(sql, params, tx) {
            None | Some(Reply::Affected(_)) => Ok(Vec::new()),
            Some(Reply::Rows(rows)) => Ok(rows),
            Some(Reply::Error(e)) => Err(e),
        }
    }
}

fn is_control(sql: &str) -> bool {
    sql.starts_with("BEGIN") || sql == "COMMIT" || sql == "ROLLBACK"
}

impl Executor for MockConnection {
    fn execute(&self, sql: &str, params: &[Value]) -> Result<u64, DriverError> {
        self.run_execute(sql, params, None)
    }

    fn query_all(&self, sql: &str, params: &[Value]) -> Result<Vec<Record>, DriverError> {
        self.run_query(sql, params, None)
    }
}

impl Connection for MockConnection {
    fn begin(&self, isolation: IsolationLevel) -> Result<Box<dyn TxHandle>, DriverError> {
        let id = {
            let mut state = self.state();
            if let Some(err) = state.fail_begin.take() {
                return Err(err);
            }
            state.next_tx += 1;
            state.next_tx
        };
        self.record(&isolation.begin_statement(), &[], Some(id));
        Ok(Box::new(MockTx {
            conn: self.clone(),
            id,
            closed: AtomicBool::new(false),
        }))
    }
}

struct MockTx {
    conn: MockConnection,
    id: u64,
    closed: AtomicBool,
}

impl Executor for MockTx {
    fn execute(&self, sql: &str, params: &[Value]) -> Result<u64, DriverError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DriverError::TransactionClosed);
        }
        self.conn.run_execute(sql, params, Some(self.id))
    }

    fn query_all(&self, sql: &str, params: &[Value]) -> Result<Vec<Record>, DriverError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DriverError::TransactionClosed);
        }
        self.conn.run_query(sql, params, Some(self.id))
    }
}

impl TxHandle for MockTx {
    fn commit(&self) -> Result<(), DriverError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(DriverError::TransactionClosed);
        }
        self.conn.record("COMMIT", &[], Some(self.id));
        Ok(())
    }

    fn rollback(&self) -> Result<(), DriverError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(DriverError::TransactionClosed);
        }
        self.conn.record("ROLLBACK", &[], Some(self.id));
        match self.conn.state().fail_rollback.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replies_are_consumed_in_order() {
        let mock = MockConnection::new();
        mock.push_affected(3)
            .push_error(DriverError::Other("boom".into()));
        assert_eq!(mock.execute("UPDATE a", &[]).unwrap(), 3);
        assert!(mock.query_all("SELECT a", &[]).is_err());
        assert!(mock.query_all("SELECT a", &[]).unwrap().is_empty());
    }

    #[test]
    fn test_transaction_statements_are_tagged() {
        let mock = MockConnection::new();
        let tx = mock.begin(IsolationLevel::RepeatableRead).unwrap();
        tx.execute("INSERT 1", &[Value::from(1i32)]).unwrap();
        tx.commit().unwrap();
        assert!(matches!(tx.commit(), Err(DriverError::TransactionClosed)));
        assert!(matches!(tx.execute("INSERT 2", &[]), Err(DriverError::TransactionClosed)));

        let log = mock.statements();
        assert_eq!(log[0].sql, "BEGIN ISOLATION LEVEL REPEATABLE READ");
        assert_eq!(log[1].transaction, Some(1));
        assert_eq!(log[1].params, vec![Value::from(1i32)]);
        assert_eq!(log[2].sql, "COMMIT");
        assert_eq!(mock.data_statements().len(), 1);
    }
}
