//! Runs against a live server only when `MIGRUN_TEST_CLICKHOUSE_URL` is set,
//! e.g. `http://localhost:8123`. User and password come from
//! `MIGRUN_TEST_CLICKHOUSE_USER` / `MIGRUN_TEST_CLICKHOUSE_PASSWORD`.

use migrun_common::Error;
use migrun_config::ConnectionConfig;
use migrun_db::{ClickhouseEngine, MigrationEngine, MigrationRunner, MigrationTarget};
use uuid::Uuid;

fn live_config() -> Option<ConnectionConfig> {
    let url = std::env::var("MIGRUN_TEST_CLICKHOUSE_URL").ok()?;
    let user = std::env::var("MIGRUN_TEST_CLICKHOUSE_USER").unwrap_or_else(|_| "default".into());
    let password = std::env::var("MIGRUN_TEST_CLICKHOUSE_PASSWORD").unwrap_or_default();
    let database = format!("migrun_test_{}", Uuid::new_v4().simple());
    Some(ConnectionConfig::new(&url, &user, &password, &database))
}

#[test]
fn migrates_a_fresh_clickhouse_database() {
    let Some(config) = live_config() else {
        eprintln!("MIGRUN_TEST_CLICKHOUSE_URL not set, skipping");
        return;
    };
    let migrations = tempfile::tempdir().unwrap();
    std::fs::write(
        migrations.path().join("001_init.sql"),
        "CREATE TABLE players (id UInt64, name String) ENGINE = MergeTree ORDER BY id;",
    )
    .unwrap();
    std::fs::write(
        migrations.path().join("002_add_col.sql"),
        "ALTER TABLE players ADD COLUMN rating Int32 DEFAULT 1500;\n\
         INSERT INTO players (id, name) VALUES (1, 'why?');",
    )
    .unwrap();

    let engine = ClickhouseEngine::new().unwrap();
    let runner = MigrationRunner::new(engine.clone());

    let err = runner
        .migrate(&config, migrations.path(), false, true)
        .unwrap_err();
    assert!(matches!(err, Error::DatabaseMissing(_)));

    let report = runner
        .migrate(&config, migrations.path(), true, true)
        .unwrap();
    assert_eq!(
        report.applied.iter().map(|r| r.version).collect::<Vec<_>>(),
        vec![1, 2]
    );

    let again = runner
        .migrate(&config, migrations.path(), true, true)
        .unwrap();
    assert!(again.applied.is_empty());
    assert_eq!(again.skipped, 2);

    let mut target = engine.connect(&config).unwrap();
    let applied = target.applied_migrations().unwrap();
    assert_eq!(applied[1].applied_at, report.applied[1].applied_at);
    assert_eq!(target.try_lock("other").unwrap(), migrun_db::LockOutcome::Acquired);
    assert!(matches!(
        runner.migrate(&config, migrations.path(), true, true),
        Err(Error::Locked(_))
    ));
    assert!(runner.force_unlock(&config).unwrap());
}
