//! Transaction scoping through the stores.

mod common;

use common::{author_row, database, Author};
use rowkeeper::prelude::*;
use rowkeeper::{CancelToken, DriverError, IsolationLevel};
use std::time::{Duration, Instant};

#[test]
fn test_nested_exec_with_tx_shares_one_transaction() {
    let (mock, db) = database();
    let store = EntityStore::<Author>::new(db.clone());
    let tm = db.transactions();
    mock.push_rows(vec![author_row(1, "Ada", "ada@example.com", None)]);
    mock.push_error(DriverError::Other("disk full".into()));

    let result: Result<()> = tm.exec_with_tx(&Context::new(), |outer| {
        store.create(outer, Author::new("Ada", "ada@example.com"), QueryOptions::default())?;
        tm.exec_with_tx(outer, |inner| {
            assert_eq!(inner.transaction_id(), outer.transaction_id());
            store.create(inner, Author::new("Bob", "bob@example.com"), QueryOptions::default())?;
            Ok(())
        })
    });

    let err = result.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Storage);
    assert_eq!(mock.statements_matching("BEGIN").len(), 1);
    assert!(mock.statements_matching("COMMIT").is_empty());
    assert_eq!(mock.statements_matching("ROLLBACK").len(), 1);

    let inserts = mock.statements_matching("INSERT");
    assert_eq!(inserts.len(), 2);
    assert_eq!(inserts[0].transaction, inserts[1].transaction);
}

#[test]
fn test_successful_exec_with_tx_commits_once() {
    let (mock, db) = database();
    let store = EntityStore::<Author>::new(db.clone());
    mock.push_rows(vec![author_row(1, "Ada", "ada@example.com", None)]);
    mock.push_affected(1);

    let created = db
        .transactions()
        .exec_with_tx(&Context::new(), |ctx| {
            let author =
                store.create(ctx, Author::new("Ada", "ada@example.com"), QueryOptions::default())?;
            db.transactions().exec_with_tx(ctx, |ctx| store.delete_by_id(ctx, author.id))?;
            Ok(author)
        })
        .unwrap();
    assert_eq!(created.id, 1);
    assert_eq!(
        mock.sql_log()
            .iter()
            .filter(|s| s.as_str() == "COMMIT")
            .count(),
        1
    );
}

#[test]
fn test_rollback_failure_is_reported_with_the_original_error() {
    let (mock, db) = database();
    mock.fail_next_rollback(DriverError::Connection("connection reset".into()));

    let err = db
        .transactions()
        .exec_with_tx(&Context::new(), |_| -> Result<()> {
            Err(StoreError::query_build("bad input"))
        })
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QueryBuild);
    assert!(err.message().contains("bad input"));
    assert!(err.message().contains("rollback failed"));
}

#[test]
fn test_begin_failure_runs_nothing() {
    let (mock, db) = database();
    mock.fail_next_begin(DriverError::Connection("refused".into()));
    let mut ran = false;
    let err = db
        .transactions()
        .exec_with_tx(&Context::new(), |_| {
            ran = true;
            Ok(())
        })
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Storage);
    assert!(!ran);
    assert!(mock.statements().is_empty());
}

#[test]
fn test_isolation_level_reaches_begin() {
    let (mock, db) = database();
    let tm = db.transactions();
    let ctx = tm
        .begin_with(&Context::new(), IsolationLevel::Serializable)
        .unwrap();
    assert!(tm.in_transaction(&ctx));
    tm.rollback(&ctx).unwrap();
    assert!(!tm.in_transaction(&ctx));
    assert_eq!(
        mock.sql_log(),
        vec!["BEGIN ISOLATION LEVEL SERIALIZABLE", "ROLLBACK"]
    );
}

#[test]
fn test_finished_transaction_context_is_not_reused() {
    let (mock, db) = database();
    let store = EntityStore::<Author>::new(db.clone());
    let ctx = db.transactions().begin(&Context::new()).unwrap();
    db.transactions().commit(&ctx).unwrap();

    let err = store.find_many(&ctx, vec![]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoTransaction);
    assert!(mock.data_statements().is_empty());
}

#[test]
fn test_cancellation_stops_the_next_statement_and_rolls_back() {
    let (mock, db) = database();
    let store = EntityStore::<Author>::new(db.clone());
    let token = CancelToken::new();
    let ctx = Context::new().with_cancel(token.clone());
    mock.push_rows(vec![Record::from_pairs([("count", Value::from(2i64))])]);

    let err = db
        .transactions()
        .exec_with_tx(&ctx, |ctx| {
            store.count(ctx, vec![])?;
            token.cancel();
            store.count(ctx, vec![])
        })
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Canceled);
    assert_eq!(mock.data_statements().len(), 1);
    assert_eq!(mock.statements_matching("ROLLBACK").len(), 1);
}

#[test]
fn test_expired_deadline_sends_nothing() {
    let (mock, db) = database();
    let store = EntityStore::<Author>::new(db);
    let ctx = Context::new().with_deadline(Instant::now() - Duration::from_millis(1));
    let err = store.find_by_id(&ctx, 1i64).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Canceled);
    assert!(mock.statements().is_empty());
}

#[test]
fn test_store_is_shared_across_threads() {
    let (mock, db) = database();
    let store = EntityStore::<Author>::new(db);
    std::thread::scope(|scope| {
        for i in 0..4i64 {
            let store = store.clone();
            scope.spawn(move || {
                store
                    .find_many(&Context::new(), vec![Condition::eq("id", i)])
                    .unwrap()
            });
        }
    });
    assert_eq!(mock.statements().len(), 4);
}
