use asupersync::runtime::RuntimeBuilder;
use asupersync::{Cx, Outcome};

use sqlrunner::{Event, EventKind};
use sqlrunner_core::{ConnectionErrorKind, Error, QueryErrorKind, Value};
use sqlrunner_sqlite::{SqliteConfig, SqliteDriver};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

fn expect_err<T>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Ok(_) => panic!("expected error, got success"),
        Outcome::Err(e) => e,
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

/// Auto-save to a callback that counts invocations and keeps the last image.
fn counting_config() -> (SqliteConfig, Arc<AtomicUsize>, Arc<Mutex<Vec<u8>>>) {
    let saves = Arc::new(AtomicUsize::new(0));
    let image = Arc::new(Mutex::new(Vec::new()));
    let config = {
        let saves = Arc::clone(&saves);
        let image = Arc::clone(&image);
        SqliteConfig::memory().auto_save_with(move |bytes| {
            saves.fetch_add(1, Ordering::SeqCst);
            *image.lock().expect("lock poisoned") = bytes;
            Ok(())
        })
    };
    (config, saves, image)
}

#[test]
fn insert_reports_affected_rows_and_generated_id() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let driver = SqliteDriver::open_memory().unwrap();
    let mut runner = driver.create_query_runner().unwrap();

    rt.block_on(async {
        unwrap_outcome(
            runner
                .query(&cx, "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)", &[])
                .await,
        );
        let result = unwrap_outcome(
            runner
                .query_structured(
                    &cx,
                    "INSERT INTO users (name) VALUES (?), (?)",
                    &[Value::Text("alice".into()), Value::Text("bob".into())],
                )
                .await,
        );
        assert_eq!(result.affected, 2);
        assert_eq!(result.generated_id, Some(2));
        assert!(result.rows.is_empty());
        assert!(runner.is_dirty());

        let rows = unwrap_outcome(
            runner
                .query(&cx, "SELECT id, name FROM users WHERE id > ?", &[Value::Int(1)])
                .await,
        );
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_by_name("name"), Some(&Value::Text("bob".into())));
        assert_eq!(rows[0].get_by_name("id"), Some(&Value::BigInt(2)));

        let select = unwrap_outcome(
            runner
                .query_structured(&cx, "SELECT count(*) AS n FROM users", &[])
                .await,
        );
        assert_eq!(select.generated_id, None);
        assert_eq!(select.rows[0].get(0), Some(&Value::BigInt(2)));
    });
}

#[test]
fn statements_after_an_insert_report_no_generated_id() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let driver = SqliteDriver::open_memory().unwrap();
    let mut runner = driver.create_query_runner().unwrap();

    rt.block_on(async {
        unwrap_outcome(
            runner
                .query(&cx, "CREATE TABLE t (id INTEGER PRIMARY KEY, n INTEGER)", &[])
                .await,
        );
        let inserted = unwrap_outcome(
            runner
                .query_structured(&cx, "INSERT INTO t (n) VALUES (?)", &[Value::Int(1)])
                .await,
        );
        assert_eq!(inserted.generated_id, Some(1));

        let missed = unwrap_outcome(
            runner
                .query_structured(&cx, "UPDATE t SET n = 2 WHERE id = 99", &[])
                .await,
        );
        assert_eq!(missed.affected, 0);
        assert_eq!(missed.generated_id, None);

        let updated = unwrap_outcome(
            runner
                .query_structured(&cx, "UPDATE t SET n = 3 WHERE id = 1", &[])
                .await,
        );
        assert_eq!(updated.affected, 1);
        assert_eq!(updated.generated_id, None);

        let ddl = unwrap_outcome(
            runner
                .query_structured(&cx, "CREATE TABLE u (x INT)", &[])
                .await,
        );
        assert_eq!(ddl.generated_id, None);

        let ignored = unwrap_outcome(
            runner
                .query_structured(&cx, "INSERT OR IGNORE INTO t (id, n) VALUES (1, 9)", &[])
                .await,
        );
        assert_eq!(ignored.affected, 0);
        assert_eq!(ignored.generated_id, None);
    });
}

#[test]
fn declared_json_and_boolean_columns_are_coerced() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let driver = SqliteDriver::open_memory().unwrap();
    let mut runner = driver.create_query_runner().unwrap();

    rt.block_on(async {
        unwrap_outcome(
            runner
                .query(
                    &cx,
                    "CREATE TABLE settings (meta JSON, extra TEXT, enabled BOOLEAN)",
                    &[],
                )
                .await,
        );
        unwrap_outcome(
            runner
                .query(
                    &cx,
                    "INSERT INTO settings VALUES (?, ?, ?)",
                    &[
                        Value::Json(serde_json::json!({"theme": "dark"})),
                        Value::Text("{\"x\":1}".into()),
                        Value::Bool(true),
                    ],
                )
                .await,
        );
        let rows = unwrap_outcome(
            runner
                .query(&cx, "SELECT meta, extra, enabled FROM settings", &[])
                .await,
        );
        let row = &rows[0];
        assert_eq!(
            row.get_by_name("meta"),
            Some(&Value::Json(serde_json::json!({"theme": "dark"})))
        );
        assert_eq!(row.get_by_name("extra"), Some(&Value::Text("{\"x\":1}".into())));
        assert_eq!(row.get_by_name("enabled"), Some(&Value::Bool(true)));
    });
}

#[test]
fn flush_writes_auto_save_location_and_reopen_loads_it() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let dir = tempfile::tempdir().unwrap();
    let location = dir.path().join("data").join("app.sqlite");

    {
        let driver = SqliteDriver::open(SqliteConfig::memory().auto_save_to(&location)).unwrap();
        let mut runner = driver.create_query_runner().unwrap();
        rt.block_on(async {
            unwrap_outcome(runner.query(&cx, "CREATE TABLE t (v TEXT)", &[]).await);
            unwrap_outcome(
                runner
                    .query(&cx, "INSERT INTO t VALUES (?)", &[Value::Text("kept".into())])
                    .await,
            );
            assert!(!location.exists());
            unwrap_outcome(runner.flush(&cx).await);
            assert!(location.exists());
            assert!(!runner.is_dirty());
            unwrap_outcome(runner.release(&cx).await);
        });
    }

    let driver = SqliteDriver::open(SqliteConfig::memory().auto_save_to(&location)).unwrap();
    let mut runner = driver.create_query_runner().unwrap();
    rt.block_on(async {
        let rows = unwrap_outcome(runner.query(&cx, "SELECT v FROM t", &[]).await);
        assert_eq!(rows[0].get(0), Some(&Value::Text("kept".into())));
    });
}

#[test]
fn nested_rollback_inside_committed_transaction_persists_once() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (config, saves, image) = counting_config();
    let driver = SqliteDriver::open(config).unwrap();
    let mut runner = driver.create_query_runner().unwrap();

    rt.block_on(async {
        unwrap_outcome(runner.query(&cx, "CREATE TABLE t (id INTEGER)", &[]).await);
        unwrap_outcome(runner.flush(&cx).await);
        assert_eq!(saves.load(Ordering::SeqCst), 1);

        unwrap_outcome(runner.begin_transaction(&cx, None).await);
        unwrap_outcome(runner.query(&cx, "INSERT INTO t VALUES (1)", &[]).await);
        unwrap_outcome(runner.begin_transaction(&cx, None).await);
        unwrap_outcome(runner.query(&cx, "INSERT INTO t VALUES (2)", &[]).await);
        unwrap_outcome(runner.flush(&cx).await);
        assert_eq!(saves.load(Ordering::SeqCst), 1, "flush deferred inside transaction");

        unwrap_outcome(runner.rollback_transaction(&cx).await);
        assert_eq!(runner.transaction_depth(), 1);
        unwrap_outcome(runner.commit_transaction(&cx).await);
        assert_eq!(saves.load(Ordering::SeqCst), 2);
        assert!(!runner.is_dirty());
        assert!(driver.connection().is_autocommit());

        let rows = unwrap_outcome(runner.query(&cx, "SELECT id FROM t", &[]).await);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get(0), Some(&Value::BigInt(1)));
    });

    assert!(
        image
            .lock()
            .expect("lock poisoned")
            .starts_with(b"SQLite format 3\0")
    );
}

#[test]
fn outer_rollback_of_clean_session_needs_no_flush() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (config, saves, _image) = counting_config();
    let driver = SqliteDriver::open(config).unwrap();
    let mut runner = driver.create_query_runner().unwrap();

    rt.block_on(async {
        unwrap_outcome(runner.query(&cx, "CREATE TABLE t (id INTEGER)", &[]).await);
        unwrap_outcome(runner.flush(&cx).await);

        unwrap_outcome(runner.begin_transaction(&cx, None).await);
        unwrap_outcome(runner.query(&cx, "INSERT INTO t VALUES (1)", &[]).await);
        unwrap_outcome(runner.rollback_transaction(&cx).await);
        assert!(!runner.is_dirty());

        unwrap_outcome(runner.release(&cx).await);
    });
    assert_eq!(saves.load(Ordering::SeqCst), 1);
}

#[test]
fn constraint_violation_is_wrapped_with_statement_context() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let driver = SqliteDriver::open_memory().unwrap();
    let mut runner = driver.create_query_runner().unwrap();

    let failures = Arc::new(AtomicUsize::new(0));
    {
        let failures = Arc::clone(&failures);
        driver
            .broadcaster()
            .subscribe(EventKind::AfterQuery, move |event| {
                if let Event::AfterQuery(after) = event {
                    if !after.success {
                        failures.fetch_add(1, Ordering::SeqCst);
                    }
                }
                None
            });
    }

    rt.block_on(async {
        unwrap_outcome(
            runner
                .query(&cx, "CREATE TABLE t (id INTEGER PRIMARY KEY)", &[])
                .await,
        );
        unwrap_outcome(runner.query(&cx, "INSERT INTO t VALUES (?)", &[Value::Int(7)]).await);

        let err = expect_err(runner.query(&cx, "INSERT INTO t VALUES (?)", &[Value::Int(7)]).await);
        match &err {
            Error::QueryExecution(e) => {
                assert_eq!(e.sql, "INSERT INTO t VALUES (?)");
                assert_eq!(e.params, vec![Value::Int(7)]);
                match e.cause.as_ref() {
                    Error::Query(q) => assert_eq!(q.kind, QueryErrorKind::Constraint),
                    other => panic!("unexpected cause: {other}"),
                }
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.sql(), Some("INSERT INTO t VALUES (?)"));

        // The failed statement was finalized; the connection is usable.
        let rows = unwrap_outcome(runner.query(&cx, "SELECT id FROM t", &[]).await);
        assert_eq!(rows.len(), 1);
    });
    assert_eq!(failures.load(Ordering::SeqCst), 1);
}

#[test]
fn single_writer_until_release() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let driver = SqliteDriver::open_memory().unwrap();
    let mut first = driver.create_query_runner().unwrap();

    match driver.create_query_runner() {
        Err(Error::Connection(e)) => assert_eq!(e.kind, ConnectionErrorKind::Busy),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("second runner must be refused"),
    }

    rt.block_on(async {
        unwrap_outcome(first.release(&cx).await);
        assert!(first.is_released());
        assert!(matches!(
            expect_err(first.query(&cx, "SELECT 1", &[]).await),
            Error::SessionReleased
        ));
    });

    let mut second = driver.create_query_runner().unwrap();
    rt.block_on(async {
        let rows = unwrap_outcome(second.query(&cx, "SELECT 1", &[]).await);
        assert_eq!(rows[0].get(0), Some(&Value::BigInt(1)));
    });
}

#[test]
fn migration_hooks_toggle_foreign_keys() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let driver = SqliteDriver::open_memory().unwrap();
    let mut runner = driver.create_query_runner().unwrap();

    rt.block_on(async {
        unwrap_outcome(runner.after_migration(&cx).await);
        let rows = unwrap_outcome(runner.query(&cx, "PRAGMA foreign_keys", &[]).await);
        assert_eq!(rows[0].get(0), Some(&Value::BigInt(1)));

        unwrap_outcome(runner.before_migration(&cx).await);
        let rows = unwrap_outcome(runner.query(&cx, "PRAGMA foreign_keys", &[]).await);
        assert_eq!(rows[0].get(0), Some(&Value::BigInt(0)));
    });
}

#[test]
fn release_rolls_back_open_transaction() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("file.db");
    let driver = SqliteDriver::open(SqliteConfig::file(path.to_string_lossy())).unwrap();

    let mut runner = driver.create_query_runner().unwrap();
    rt.block_on(async {
        unwrap_outcome(runner.query(&cx, "CREATE TABLE t (id INTEGER)", &[]).await);
        unwrap_outcome(runner.begin_transaction(&cx, None).await);
        unwrap_outcome(runner.query(&cx, "INSERT INTO t VALUES (1)", &[]).await);
        unwrap_outcome(runner.release(&cx).await);
    });
    assert!(driver.connection().is_autocommit());

    let mut runner = driver.create_query_runner().unwrap();
    rt.block_on(async {
        let rows = unwrap_outcome(runner.query(&cx, "SELECT id FROM t", &[]).await);
        assert!(rows.is_empty());
    });
}

#[test]
fn save_and_export_copy_the_database() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("copy.sqlite");
    let driver = SqliteDriver::open_memory().unwrap();
    driver
        .connection()
        .execute_raw("CREATE TABLE t (v INTEGER); INSERT INTO t VALUES (5);")
        .unwrap();

    driver.save(&path).unwrap();
    let exported = driver.export().unwrap();
    assert!(exported.starts_with(b"SQLite format 3\0"));
    assert!(std::fs::read(&path).unwrap().starts_with(b"SQLite format 3\0"));

    let copy = SqliteDriver::open(SqliteConfig::memory().location(&path)).unwrap();
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let mut runner = copy.create_query_runner().unwrap();
    rt.block_on(async {
        let rows = unwrap_outcome(runner.query(&cx, "SELECT v FROM t", &[]).await);
        assert_eq!(rows[0].get(0), Some(&Value::BigInt(5)));
    });
}
