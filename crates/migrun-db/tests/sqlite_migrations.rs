use std::path::Path;

use migrun_common::Error;
use migrun_config::{ConnectionConfig, DriftPolicy};
use migrun_db::{
    MigrationRunner, MigrationState, MigrationTarget, SqliteEngine, SqliteTarget,
};
use tempfile::TempDir;

/// A data directory holding the database file plus a migrations directory.
struct Fixture {
    data: TempDir,
    migrations: TempDir,
}

impl Fixture {
    fn new(files: &[(&str, &str)]) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("migrun_db=debug")
            .with_test_writer()
            .try_init();

        let fixture = Self {
            data: tempfile::tempdir().expect("data dir"),
            migrations: tempfile::tempdir().expect("migrations dir"),
        };
        for (name, sql) in files {
            fixture.write(name, sql);
        }
        fixture
    }

    fn write(&self, name: &str, sql: &str) {
        std::fs::write(self.migrations.path().join(name), sql).unwrap();
    }

    fn config(&self) -> ConnectionConfig {
        ConnectionConfig::new(
            &self.data.path().to_string_lossy(),
            "sparganothis",
            "sparganothis",
            "sparganothis",
        )
    }

    fn dir(&self) -> &Path {
        self.migrations.path()
    }

    fn db_path(&self) -> std::path::PathBuf {
        self.data.path().join("sparganothis.db")
    }

    fn target(&self) -> SqliteTarget {
        SqliteTarget::open(&self.db_path()).unwrap()
    }

    fn applied_versions(&self) -> Vec<u64> {
        self.target()
            .applied_migrations()
            .unwrap()
            .into_iter()
            .map(|r| r.version)
            .collect()
    }

    fn table_names(&self) -> Vec<String> {
        let target = self.target();
        let mut stmt = target
            .connection()
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<String>, _>>()
            .unwrap()
    }
}

fn runner() -> MigrationRunner<SqliteEngine> {
    MigrationRunner::new(SqliteEngine)
}

#[test]
fn applies_init_and_add_col_in_order_on_empty_target() {
    let fx = Fixture::new(&[
        (
            "001_init.sql",
            "CREATE TABLE players (id INTEGER PRIMARY KEY, name TEXT NOT NULL);",
        ),
        ("002_add_col.sql", "ALTER TABLE players ADD COLUMN rating INTEGER;"),
    ]);

    let report = runner().migrate(&fx.config(), fx.dir(), true, true).unwrap();

    assert_eq!(
        report.applied.iter().map(|r| r.version).collect::<Vec<_>>(),
        vec![1, 2]
    );
    assert_eq!(report.applied[0].name, "init");
    assert_eq!(report.applied[1].name, "add_col");
    assert_eq!(fx.applied_versions(), vec![1, 2]);

    let applied = fx.target().applied_migrations().unwrap();
    assert!(applied[0].applied_at <= applied[1].applied_at);
    assert_eq!(applied[0].applied_by, "sparganothis");

    fx.target()
        .connection()
        .execute("INSERT INTO players (name, rating) VALUES ('a', 1500)", [])
        .unwrap();
}

#[test]
fn second_run_applies_nothing() {
    let fx = Fixture::new(&[
        ("001_init.sql", "CREATE TABLE a (x INTEGER);"),
        ("002_more.sql", "CREATE TABLE b (y INTEGER);"),
    ]);

    let first = runner().migrate(&fx.config(), fx.dir(), true, true).unwrap();
    assert_eq!(first.applied.len(), 2);

    let second = runner().migrate(&fx.config(), fx.dir(), true, true).unwrap();
    assert!(second.applied.is_empty());
    assert_eq!(second.skipped, 2);
    assert_eq!(fx.applied_versions(), vec![1, 2]);
}

#[test]
fn applies_in_numeric_version_order() {
    // lexical order would build the index on b before b exists
    let fx = Fixture::new(&[
        ("10_index.sql", "CREATE INDEX idx_b ON b (y);"),
        ("9_table_b.sql", "CREATE TABLE b (y INTEGER REFERENCES a (x));"),
        ("2_table_a.sql", "CREATE TABLE a (x INTEGER PRIMARY KEY);"),
    ]);

    let report = runner().migrate(&fx.config(), fx.dir(), true, true).unwrap();
    let versions: Vec<u64> = report.applied.iter().map(|r| r.version).collect();
    assert_eq!(versions, vec![2, 9, 10]);
    assert!(versions.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn failure_stops_the_run_and_is_not_recorded() {
    let fx = Fixture::new(&[
        ("001_init.sql", "CREATE TABLE a (x INTEGER);"),
        (
            "002_broken.sql",
            "CREATE TABLE b (y INTEGER);\nINSERT INTO does_not_exist VALUES (1);",
        ),
        ("003_after.sql", "CREATE TABLE c (z INTEGER);"),
    ]);

    let err = runner()
        .migrate(&fx.config(), fx.dir(), true, true)
        .unwrap_err();
    match err {
        Error::MigrationFailed { version, name, .. } => {
            assert_eq!(version, 2);
            assert_eq!(name, "broken");
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(fx.applied_versions(), vec![1]);
    let tables = fx.table_names();
    assert!(tables.contains(&"a".to_string()));
    // 002 rolled back as a unit, 003 never ran
    assert!(!tables.contains(&"b".to_string()));
    assert!(!tables.contains(&"c".to_string()));

    // once fixed, the run resumes at 002
    fx.write(
        "002_broken.sql",
        "CREATE TABLE b (y INTEGER);\nCREATE TABLE does_not_exist (v INTEGER);",
    );
    let report = runner().migrate(&fx.config(), fx.dir(), true, true).unwrap();
    assert_eq!(
        report.applied.iter().map(|r| r.version).collect::<Vec<_>>(),
        vec![2, 3]
    );
}

#[test]
fn missing_database_is_not_created_without_permission() {
    let fx = Fixture::new(&[("001_init.sql", "CREATE TABLE a (x INTEGER);")]);

    let err = runner()
        .migrate(&fx.config(), fx.dir(), false, true)
        .unwrap_err();
    assert!(matches!(err, Error::DatabaseMissing(ref name) if name == "sparganothis"));
    assert!(!fx.db_path().exists());
}

#[test]
fn unreachable_host_fails_before_any_migration() {
    let fx = Fixture::new(&[("001_init.sql", "CREATE TABLE a (x INTEGER);")]);
    let missing_host = fx.data.path().join("nowhere");
    let config = ConnectionConfig::new(&missing_host.to_string_lossy(), "u", "p", "db");

    let err = runner().migrate(&config, fx.dir(), true, true).unwrap_err();
    assert!(matches!(err, Error::Connection(_)));
    assert!(!missing_host.exists());
}

#[test]
fn missing_migrations_directory_is_an_error() {
    let fx = Fixture::new(&[]);
    let err = runner()
        .migrate(&fx.config(), &fx.dir().join("absent"), true, true)
        .unwrap_err();
    assert!(matches!(err, Error::MigrationsDirMissing(_)));
}

#[test]
fn single_statement_mode_runs_one_statement_files() {
    let fx = Fixture::new(&[
        ("001_init.sql", "CREATE TABLE a (x INTEGER);\n"),
        ("002_seed.sql", "INSERT INTO a VALUES (1)"),
    ]);

    let report = runner().migrate(&fx.config(), fx.dir(), true, false).unwrap();
    assert_eq!(report.applied.len(), 2);

    fx.write("003_two.sql", "INSERT INTO a VALUES (2); INSERT INTO a VALUES (3);");
    let err = runner()
        .migrate(&fx.config(), fx.dir(), true, false)
        .unwrap_err();
    assert!(matches!(err, Error::MultipleStatements { count: 2, .. }));
    assert_eq!(fx.applied_versions(), vec![1, 2]);
}

#[test]
fn changed_applied_file_is_flagged_not_reapplied() {
    let fx = Fixture::new(&[("001_init.sql", "CREATE TABLE a (x INTEGER);")]);
    runner().migrate(&fx.config(), fx.dir(), true, true).unwrap();

    fx.write("001_init.sql", "CREATE TABLE a (x INTEGER, y TEXT);");
    let err = runner()
        .migrate(&fx.config(), fx.dir(), true, true)
        .unwrap_err();
    assert!(matches!(err, Error::ChecksumMismatch { version: 1, .. }));

    let report = runner()
        .with_drift_policy(DriftPolicy::Warn)
        .migrate(&fx.config(), fx.dir(), true, true)
        .unwrap();
    assert_eq!(report.drifted, vec![1]);
    assert!(report.applied.is_empty());

    let status = runner().status(&fx.config(), fx.dir()).unwrap();
    assert!(matches!(status[0].state, MigrationState::Drifted { .. }));
}

#[test]
fn concurrent_run_is_rejected_while_lock_is_held() {
    let fx = Fixture::new(&[("001_init.sql", "CREATE TABLE a (x INTEGER);")]);
    runner().migrate(&fx.config(), fx.dir(), true, true).unwrap();

    let mut other = fx.target();
    other.try_lock("crashed-run").unwrap();

    fx.write("002_next.sql", "CREATE TABLE b (y INTEGER);");
    let err = runner()
        .migrate(&fx.config(), fx.dir(), true, true)
        .unwrap_err();
    assert!(matches!(err, Error::Locked(ref holder) if holder == "crashed-run"));
    assert_eq!(fx.applied_versions(), vec![1]);

    assert!(runner().force_unlock(&fx.config()).unwrap());
    runner().migrate(&fx.config(), fx.dir(), true, true).unwrap();
    assert_eq!(fx.applied_versions(), vec![1, 2]);
}

#[test]
fn plan_and_status_are_read_only() {
    let fx = Fixture::new(&[
        ("001_init.sql", "CREATE TABLE a (x INTEGER);"),
        ("002_more.sql", "CREATE TABLE b (y INTEGER);"),
    ]);

    let plan = runner().plan(&fx.config(), fx.dir()).unwrap();
    assert!(!plan.database_exists);
    assert_eq!(plan.pending.len(), 2);
    assert!(!fx.db_path().exists());

    runner().migrate(&fx.config(), fx.dir(), true, true).unwrap();
    fx.write("003_new.sql", "CREATE TABLE c (z INTEGER);");

    let plan = runner().plan(&fx.config(), fx.dir()).unwrap();
    assert!(plan.database_exists);
    assert_eq!(
        plan.pending.iter().map(|e| e.version).collect::<Vec<_>>(),
        vec![3]
    );
    assert_eq!(fx.applied_versions(), vec![1, 2]);
    assert!(!fx.table_names().contains(&"c".to_string()));
}

#[test]
fn trigger_bodies_survive_statement_splitting() {
    let fx = Fixture::new(&[(
        "001_audit.sql",
        "CREATE TABLE scores (id INTEGER PRIMARY KEY, value INTEGER);
         CREATE TABLE audit (msg TEXT);
         CREATE TRIGGER scores_audit AFTER INSERT ON scores BEGIN
             INSERT INTO audit VALUES ('insert; scores');
         END;",
    )]);

    runner().migrate(&fx.config(), fx.dir(), true, true).unwrap();

    let target = fx.target();
    target
        .connection()
        .execute("INSERT INTO scores (value) VALUES (10)", [])
        .unwrap();
    let msg: String = target
        .connection()
        .query_row("SELECT msg FROM audit", [], |row| row.get(0))
        .unwrap();
    assert_eq!(msg, "insert; scores");
}

const LABEL_TRIGGER: &str = "CREATE TABLE t (x INTEGER, s TEXT);
CREATE TRIGGER label AFTER INSERT ON t BEGIN
    UPDATE t SET s = CASE WHEN new.x > 0 THEN 'pos' ELSE 'neg' END WHERE rowid = new.rowid;
END;";

fn label_of(fx: &Fixture, x: i64) -> String {
    let target = fx.target();
    target
        .connection()
        .execute("INSERT INTO t (x) VALUES (?1)", [x])
        .unwrap();
    target
        .connection()
        .query_row("SELECT s FROM t WHERE x = ?1", [x], |row| row.get(0))
        .unwrap()
}

#[test]
fn trigger_with_case_expression_applies_in_multi_statement_mode() {
    let fx = Fixture::new(&[("001_t.sql", LABEL_TRIGGER)]);

    let report = runner().migrate(&fx.config(), fx.dir(), true, true).unwrap();
    assert_eq!(report.applied.len(), 1);
    assert_eq!(label_of(&fx, 5), "pos");
    assert_eq!(label_of(&fx, -5), "neg");
}

#[test]
fn trigger_with_case_expression_applies_in_single_statement_mode() {
    let fx = Fixture::new(&[
        ("001_t.sql", "CREATE TABLE t (x INTEGER, s TEXT);"),
        (
            "002_label.sql",
            "CREATE TRIGGER label AFTER INSERT ON t BEGIN
                 UPDATE t SET s = CASE WHEN new.x > 0 THEN 'pos' ELSE 'neg' END
                     WHERE rowid = new.rowid;
             END;",
        ),
    ]);

    let report = runner().migrate(&fx.config(), fx.dir(), true, false).unwrap();
    assert_eq!(report.applied.len(), 2);
    assert_eq!(label_of(&fx, 1), "pos");
}

#[test]
fn empty_and_comment_only_files_are_recorded() {
    let fx = Fixture::new(&[
        ("001_init.sql", "CREATE TABLE a (x INTEGER);"),
        ("002_placeholder.sql", ""),
        ("003_notes.sql", "-- reserved for the rating backfill\n/* nothing; yet */\n"),
    ]);

    let report = runner().migrate(&fx.config(), fx.dir(), true, true).unwrap();
    assert_eq!(
        report.applied.iter().map(|r| r.version).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );

    assert_eq!(fx.applied_versions(), vec![1, 2, 3]);
    let status = runner().status(&fx.config(), fx.dir()).unwrap();
    assert!(
        status
            .iter()
            .all(|e| matches!(e.state, MigrationState::Applied { .. }))
    );
}

#[test]
fn comment_only_file_is_recorded_in_single_statement_mode() {
    let fx = Fixture::new(&[("001_notes.sql", "-- nothing to do yet\n")]);

    let report = runner().migrate(&fx.config(), fx.dir(), true, false).unwrap();
    assert_eq!(report.applied.len(), 1);
    assert_eq!(report.applied[0].name, "notes");
    assert_eq!(fx.applied_versions(), vec![1]);
}
