use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use migrun_common::{Error, Result};
use migrun_config::ConnectionConfig;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use tracing::{debug, info};

use crate::engine::{
    AppliedMigrationRecord, LOCK_TABLE, LockOutcome, MIGRATIONS_TABLE, MigrationEngine,
    MigrationTarget,
};
use crate::migrations::Migration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite engine. The connection host is a data directory and each database
/// is the file `<host>/<database>.db`. Users, passwords and cluster names
/// have no meaning for SQLite; the user is only recorded as `applied_by`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteEngine;

impl SqliteEngine {
    pub fn database_path(config: &ConnectionConfig) -> Result<PathBuf> {
        let name = config.database();
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(Error::Config(format!("invalid database name `{name}`")));
        }
        Ok(Path::new(config.host()).join(format!("{name}.db")))
    }

    fn data_dir(config: &ConnectionConfig) -> Result<&Path> {
        let dir = Path::new(config.host());
        if !dir.is_dir() {
            return Err(Error::Connection(format!(
                "data directory {} does not exist",
                dir.display()
            )));
        }
        Ok(dir)
    }
}

impl MigrationEngine for SqliteEngine {
    type Target = SqliteTarget;

    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn database_exists(&self, config: &ConnectionConfig) -> Result<bool> {
        Self::data_dir(config)?;
        Ok(Self::database_path(config)?.is_file())
    }

    fn create_database(&self, config: &ConnectionConfig) -> Result<()> {
        Self::data_dir(config)?;
        let path = Self::database_path(config)?;
        info!("creating database {}", path.display());

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&path, flags)
            .map_err(|e| Error::Connection(format!("failed to create database: {e}")))?;

        // Switching to WAL writes the header, so the file is a real database
        // even before any table exists.
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .map_err(|e| Error::Database(format!("failed to initialise database: {e}")))?;
        Ok(())
    }

    fn connect(&self, config: &ConnectionConfig) -> Result<SqliteTarget> {
        if !self.database_exists(config)? {
            return Err(Error::DatabaseMissing(config.database().to_string()));
        }
        if let Some(cluster) = config.cluster() {
            debug!(cluster, "sqlite has no clusters, ignoring cluster name");
        }

        let path = Self::database_path(config)?;
        SqliteTarget::open(&path)
    }
}

/// An open connection to a SQLite database under migration.
pub struct SqliteTarget {
    conn: Connection,
}

impl SqliteTarget {
    pub fn open(path: &Path) -> Result<Self> {
        info!("opening migration target at {}", path.display());
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags)
            .map_err(|e| Error::Connection(format!("failed to open database: {e}")))?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Connection(format!("failed to open in-memory database: {e}")))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| Error::Database(format!("failed to set busy timeout: {e}")))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;
        Ok(Self { conn })
    }

    /// Borrow the underlying connection, e.g. to inspect migrated schema.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn table_exists(&self, table: &str) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
                |row| row.get(0),
            )
            .map_err(|e| Error::Database(format!("failed to inspect schema: {e}")))?;
        Ok(count > 0)
    }
}

impl MigrationTarget for SqliteTarget {
    fn ensure_bookkeeping(&mut self) -> Result<()> {
        self.conn
            .execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {MIGRATIONS_TABLE} (
                    version INTEGER PRIMARY KEY,
                    name TEXT NOT NULL,
                    checksum TEXT NOT NULL,
                    applied_by TEXT NOT NULL,
                    applied_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS {LOCK_TABLE} (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    holder TEXT NOT NULL,
                    acquired_at TEXT NOT NULL
                );"
            ))
            .map_err(|e| Error::Database(format!("failed to create bookkeeping tables: {e}")))?;
        Ok(())
    }

    fn applied_migrations(&mut self) -> Result<Vec<AppliedMigrationRecord>> {
        if !self.table_exists(MIGRATIONS_TABLE)? {
            return Ok(Vec::new());
        }

        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT version, name, checksum, applied_by, applied_at
                 FROM {MIGRATIONS_TABLE}
                 ORDER BY version ASC"
            ))
            .map_err(|e| Error::Database(format!("failed to prepare query: {e}")))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(|e| Error::Database(format!("failed to query applied migrations: {e}")))?;

        let mut records = Vec::new();
        for row in rows {
            let (version, name, checksum, applied_by, applied_at) =
                row.map_err(|e| Error::Database(format!("failed to read migration row: {e}")))?;
            records.push(AppliedMigrationRecord {
                version: version as u64,
                name,
                checksum,
                applied_by,
                applied_at: parse_datetime(&applied_at).map_err(|e| {
                    Error::Database(format!("migration {version} has a corrupt applied_at: {e}"))
                })?,
            });
        }
        Ok(records)
    }

    fn try_lock(&mut self, holder: &str) -> Result<LockOutcome> {
        let inserted = self
            .conn
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO {LOCK_TABLE} (id, holder, acquired_at) VALUES (1, ?1, ?2)"
                ),
                params![holder, Utc::now().to_rfc3339()],
            )
            .map_err(|e| Error::Database(format!("failed to acquire lock: {e}")))?;

        if inserted == 1 {
            debug!(holder, "migration lock acquired");
            return Ok(LockOutcome::Acquired);
        }

        let current: Option<String> = self
            .conn
            .query_row(
                &format!("SELECT holder FROM {LOCK_TABLE} WHERE id = 1"),
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Database(format!("failed to read lock holder: {e}")))?;

        match current {
            Some(other) => Ok(LockOutcome::HeldBy(other)),
            // released between the insert and the read; try once more
            None => self.try_lock(holder),
        }
    }

    fn unlock(&mut self, holder: &str) -> Result<()> {
        self.conn
            .execute(
                &format!("DELETE FROM {LOCK_TABLE} WHERE id = 1 AND holder = ?1"),
                params![holder],
            )
            .map_err(|e| Error::Database(format!("failed to release lock: {e}")))?;
        debug!(holder, "migration lock released");
        Ok(())
    }

    fn force_unlock(&mut self) -> Result<bool> {
        if !self.table_exists(LOCK_TABLE)? {
            return Ok(false);
        }
        let removed = self
            .conn
            .execute(&format!("DELETE FROM {LOCK_TABLE} WHERE id = 1"), [])
            .map_err(|e| Error::Database(format!("failed to clear lock: {e}")))?;
        Ok(removed > 0)
    }

    fn apply(
        &mut self,
        migration: &Migration,
        statements: &[String],
        applied_by: &str,
    ) -> Result<AppliedMigrationRecord> {
        let failed = |reason: String| Error::MigrationFailed {
            version: migration.version,
            name: migration.name.clone(),
            reason,
        };

        let tx = self
            .conn
            .transaction()
            .map_err(|e| failed(format!("failed to begin transaction: {e}")))?;

        for statement in statements {
            tx.execute_batch(statement).map_err(|e| failed(e.to_string()))?;
        }

        let applied_at = Utc::now();
        tx.execute(
            &format!(
                "INSERT INTO {MIGRATIONS_TABLE} (version, name, checksum, applied_by, applied_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)"
            ),
            params![
                migration.version as i64,
                migration.name,
                migration.checksum,
                applied_by,
                applied_at.to_rfc3339()
            ],
        )
        .map_err(|e| failed(format!("failed to record migration: {e}")))?;

        tx.commit()
            .map_err(|e| failed(format!("failed to commit: {e}")))?;

        Ok(AppliedMigrationRecord {
            version: migration.version,
            name: migration.name.clone(),
            checksum: migration.checksum.clone(),
            applied_by: applied_by.to_string(),
            applied_at,
        })
    }
}

fn parse_datetime(s: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // rows written by hand with datetime('now') use "YYYY-MM-DD HH:MM:SS"
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|naive| naive.and_utc())
        })
}
