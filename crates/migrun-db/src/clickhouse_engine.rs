use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use clickhouse::{Client, Row};
use migrun_common::{Error, Result};
use migrun_config::ConnectionConfig;
use serde::Deserialize;
use tokio::runtime::Runtime;
use tracing::{debug, info};

use crate::engine::{
    AppliedMigrationRecord, LOCK_TABLE, LockOutcome, MIGRATIONS_TABLE, MigrationEngine,
    MigrationTarget,
};
use crate::migrations::Migration;

const DEFAULT_HTTP_PORT: u16 = 8123;

/// ClickHouse engine over the HTTP interface.
///
/// `host` is either a bare host (`localhost`, port 8123 is assumed), a
/// `host:port` pair or a full `http(s)://` URL. User and password are sent
/// with every request. With a cluster name set, the database and the
/// bookkeeping tables are created `ON CLUSTER` and the tables are replicated.
///
/// ClickHouse has no multi-statement transactions: statements of a failing
/// migration that ran before the failure stay applied, but the migration is
/// not recorded.
#[derive(Clone)]
pub struct ClickhouseEngine {
    runtime: Arc<Runtime>,
}

impl ClickhouseEngine {
    pub fn new() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::Connection(format!("failed to start async runtime: {e}")))?;
        Ok(Self {
            runtime: Arc::new(runtime),
        })
    }

    pub fn url(config: &ConnectionConfig) -> String {
        let host = config.host().trim_end_matches('/');
        if host.contains("://") {
            host.to_string()
        } else if host.contains(':') {
            format!("http://{host}")
        } else {
            format!("http://{host}:{DEFAULT_HTTP_PORT}")
        }
    }

    /// A client without a default database, for server-level statements.
    fn server_client(config: &ConnectionConfig) -> Client {
        Client::default()
            .with_url(Self::url(config))
            .with_user(config.user())
            .with_password(config.password())
    }
}

impl MigrationEngine for ClickhouseEngine {
    type Target = ClickhouseTarget;

    fn name(&self) -> &'static str {
        "clickhouse"
    }

    fn database_exists(&self, config: &ConnectionConfig) -> Result<bool> {
        validate_identifier("database", config.database())?;
        let client = Self::server_client(config);
        let count = self
            .runtime
            .block_on(
                client
                    .query("SELECT count() FROM system.databases WHERE name = ?")
                    .bind(config.database())
                    .fetch_one::<u64>(),
            )
            .map_err(|e| {
                Error::Connection(format!(
                    "failed to reach ClickHouse at {}: {e}",
                    Self::url(config)
                ))
            })?;
        Ok(count > 0)
    }

    fn create_database(&self, config: &ConnectionConfig) -> Result<()> {
        let sql = create_database_sql(config)?;
        info!("creating database {}", config.database());
        let client = Self::server_client(config);
        self.runtime
            .block_on(client.query(&escape_placeholders(&sql)).execute())
            .map_err(|e| Error::Database(format!("failed to create database: {e}")))
    }

    fn connect(&self, config: &ConnectionConfig) -> Result<ClickhouseTarget> {
        if !self.database_exists(config)? {
            return Err(Error::DatabaseMissing(config.database().to_string()));
        }
        if let Some(cluster) = config.cluster() {
            validate_identifier("cluster", cluster)?;
        }

        info!(url = %Self::url(config), "opening migration target");
        Ok(ClickhouseTarget {
            runtime: Arc::clone(&self.runtime),
            client: Self::server_client(config).with_database(config.database()),
            database: config.database().to_string(),
            cluster: config.cluster().map(str::to_string),
        })
    }
}

#[derive(Debug, Row, Deserialize)]
struct AppliedRow {
    version: u64,
    name: String,
    checksum: String,
    applied_by: String,
    applied_at_ms: i64,
}

#[derive(Debug, Row, Deserialize)]
struct HolderRow {
    holder: String,
}

/// A session on an existing ClickHouse database.
pub struct ClickhouseTarget {
    runtime: Arc<Runtime>,
    client: Client,
    database: String,
    cluster: Option<String>,
}

impl ClickhouseTarget {
    fn table_exists(&self, table: &str) -> Result<bool> {
        let count = self
            .runtime
            .block_on(
                self.client
                    .query("SELECT count() FROM system.tables WHERE database = ? AND name = ?")
                    .bind(self.database.as_str())
                    .bind(table)
                    .fetch_one::<u64>(),
            )
            .map_err(|e| Error::Database(format!("failed to inspect schema: {e}")))?;
        Ok(count > 0)
    }

    fn lock_holders(&self) -> Result<Vec<String>> {
        let rows = self
            .runtime
            .block_on(
                self.client
                    .query(&format!(
                        "SELECT holder FROM {} ORDER BY acquired_at, holder",
                        self.table(LOCK_TABLE)
                    ))
                    .fetch_all::<HolderRow>(),
            )
            .map_err(|e| Error::Database(format!("failed to read lock holder: {e}")))?;
        Ok(rows.into_iter().map(|r| r.holder).collect())
    }

    fn delete_holder(&self, holder: &str) -> Result<()> {
        self.runtime
            .block_on(
                self.client
                    .query(&format!(
                        "ALTER TABLE {}{} DELETE WHERE holder = ? SETTINGS mutations_sync = 2",
                        self.table(LOCK_TABLE),
                        on_cluster(self.cluster.as_deref())
                    ))
                    .bind(holder)
                    .execute(),
            )
            .map_err(|e| Error::Database(format!("failed to release lock: {e}")))
    }

    fn table(&self, table: &str) -> String {
        format!("{}.{}", quote_identifier(&self.database), quote_identifier(table))
    }
}

impl MigrationTarget for ClickhouseTarget {
    fn ensure_bookkeeping(&mut self) -> Result<()> {
        for ddl in bookkeeping_ddl(&self.database, self.cluster.as_deref()) {
            self.runtime
                .block_on(self.client.query(&escape_placeholders(&ddl)).execute())
                .map_err(|e| {
                    Error::Database(format!("failed to create bookkeeping tables: {e}"))
                })?;
        }
        Ok(())
    }

    fn applied_migrations(&mut self) -> Result<Vec<AppliedMigrationRecord>> {
        if !self.table_exists(MIGRATIONS_TABLE)? {
            return Ok(Vec::new());
        }

        let rows = self
            .runtime
            .block_on(
                self.client
                    .query(&format!(
                        "SELECT version, name, checksum, applied_by,
                                toUnixTimestamp64Milli(applied_at) AS applied_at_ms
                         FROM {}
                         ORDER BY version ASC",
                        self.table(MIGRATIONS_TABLE)
                    ))
                    .fetch_all::<AppliedRow>(),
            )
            .map_err(|e| Error::Database(format!("failed to query applied migrations: {e}")))?;

        rows.into_iter()
            .map(|row| -> Result<AppliedMigrationRecord> {
                let applied_at = DateTime::from_timestamp_millis(row.applied_at_ms).ok_or_else(
                    || {
                        Error::Database(format!(
                            "migration {} has a corrupt applied_at: {}",
                            row.version, row.applied_at_ms
                        ))
                    },
                )?;
                Ok(AppliedMigrationRecord {
                    version: row.version,
                    name: row.name,
                    checksum: row.checksum,
                    applied_by: row.applied_by,
                    applied_at,
                })
            })
            .collect()
    }

    fn try_lock(&mut self, holder: &str) -> Result<LockOutcome> {
        if let Some(current) = self.lock_holders()?.into_iter().next() {
            return Ok(if current == holder {
                LockOutcome::Acquired
            } else {
                LockOutcome::HeldBy(current)
            });
        }

        self.runtime
            .block_on(
                self.client
                    .query(&format!(
                        "INSERT INTO {} (holder, acquired_at) SELECT ?, now64(3, 'UTC')",
                        self.table(LOCK_TABLE)
                    ))
                    .bind(holder)
                    .execute(),
            )
            .map_err(|e| Error::Database(format!("failed to acquire lock: {e}")))?;

        // two runs may insert at once; the earliest row wins
        match self.lock_holders()?.into_iter().next() {
            Some(first) if first == holder => {
                debug!(holder, "migration lock acquired");
                Ok(LockOutcome::Acquired)
            }
            Some(first) => {
                self.delete_holder(holder)?;
                Ok(LockOutcome::HeldBy(first))
            }
            None => Err(Error::Database(
                "lock row vanished right after it was written".into(),
            )),
        }
    }

    fn unlock(&mut self, holder: &str) -> Result<()> {
        self.delete_holder(holder)?;
        debug!(holder, "migration lock released");
        Ok(())
    }

    fn force_unlock(&mut self) -> Result<bool> {
        if !self.table_exists(LOCK_TABLE)? || self.lock_holders()?.is_empty() {
            return Ok(false);
        }
        self.runtime
            .block_on(
                self.client
                    .query(&format!(
                        "TRUNCATE TABLE {}{}",
                        self.table(LOCK_TABLE),
                        on_cluster(self.cluster.as_deref())
                    ))
                    .execute(),
            )
            .map_err(|e| Error::Database(format!("failed to clear lock: {e}")))?;
        Ok(true)
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

        for statement in statements {
            self.runtime
                .block_on(self.client.query(&escape_placeholders(statement)).execute())
                .map_err(|e| failed(e.to_string()))?;
        }

        let applied_at = Utc::now().trunc_subsecs(3);
        self.runtime
            .block_on(
                self.client
                    .query(&format!(
                        "INSERT INTO {} (version, name, checksum, applied_by, applied_at)
                         SELECT ?, ?, ?, ?, fromUnixTimestamp64Milli(toInt64(?), 'UTC')",
                        self.table(MIGRATIONS_TABLE)
                    ))
                    .bind(migration.version)
                    .bind(migration.name.as_str())
                    .bind(migration.checksum.as_str())
                    .bind(applied_by)
                    .bind(applied_at.timestamp_millis())
                    .execute(),
            )
            .map_err(|e| failed(format!("failed to record migration: {e}")))?;

        Ok(AppliedMigrationRecord {
            version: migration.version,
            name: migration.name.clone(),
            checksum: migration.checksum.clone(),
            applied_by: applied_by.to_string(),
            applied_at,
        })
    }
}

fn create_database_sql(config: &ConnectionConfig) -> Result<String> {
    validate_identifier("database", config.database())?;
    if let Some(cluster) = config.cluster() {
        validate_identifier("cluster", cluster)?;
    }
    Ok(format!(
        "CREATE DATABASE IF NOT EXISTS {}{}",
        quote_identifier(config.database()),
        on_cluster(config.cluster())
    ))
}

fn bookkeeping_ddl(database: &str, cluster: Option<&str>) -> [String; 2] {
    let table = |name: &str| format!("{}.{}", quote_identifier(database), quote_identifier(name));
    let engine = match cluster {
        Some(_) => "ReplicatedMergeTree('/clickhouse/tables/{shard}/{database}/{table}', '{replica}')",
        None => "MergeTree",
    };
    let on_cluster = on_cluster(cluster);

    [
        format!(
            "CREATE TABLE IF NOT EXISTS {}{on_cluster} (
                version UInt64,
                name String,
                checksum String,
                applied_by String,
                applied_at DateTime64(3, 'UTC')
            ) ENGINE = {engine} ORDER BY version",
            table(MIGRATIONS_TABLE)
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {}{on_cluster} (
                holder String,
                acquired_at DateTime64(3, 'UTC')
            ) ENGINE = {engine} ORDER BY (acquired_at, holder)",
            table(LOCK_TABLE)
        ),
    ]
}

fn on_cluster(cluster: Option<&str>) -> String {
    cluster
        .map(|c| format!(" ON CLUSTER {}", quote_identifier(c)))
        .unwrap_or_default()
}

fn quote_identifier(name: &str) -> String {
    format!("`{name}`")
}

/// Names end up inside backquotes and query templates, so the characters
/// that would break out of either are refused.
fn validate_identifier(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() || name.chars().any(|c| matches!(c, '`' | '\\' | '?') || c.is_control()) {
        return Err(Error::Config(format!("invalid {kind} name `{name}`")));
    }
    Ok(())
}

/// The client treats `?` as a bind placeholder; raw SQL must double it.
fn escape_placeholders(sql: &str) -> String {
    sql.replace('?', "??")
}
