use chrono::{DateTime, Utc};
use migrun_common::Result;
use migrun_config::ConnectionConfig;
use serde::{Deserialize, Serialize};

use crate::migrations::Migration;

/// Name of the bookkeeping table that records applied migrations.
pub const MIGRATIONS_TABLE: &str = "_migrun_migrations";
/// Name of the single-row table that holds the advisory run lock.
pub const LOCK_TABLE: &str = "_migrun_lock";

/// A persisted row of the bookkeeping table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedMigrationRecord {
    pub version: u64,
    pub name: String,
    pub checksum: String,
    pub applied_by: String,
    pub applied_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    HeldBy(String),
}

/// A database engine capable of hosting migration targets.
pub trait MigrationEngine {
    type Target: MigrationTarget;

    /// Short engine identifier, used in log spans.
    fn name(&self) -> &'static str;

    /// Whether the database named by `config` exists. Fails only when the
    /// server/storage behind `config` cannot be reached at all.
    fn database_exists(&self, config: &ConnectionConfig) -> Result<bool>;

    fn create_database(&self, config: &ConnectionConfig) -> Result<()>;

    /// Open a session on an existing database. Never creates the database.
    fn connect(&self, config: &ConnectionConfig) -> Result<Self::Target>;
}

/// An open session on the database being migrated.
pub trait MigrationTarget {
    /// Create the bookkeeping and lock tables if they are missing.
    fn ensure_bookkeeping(&mut self) -> Result<()>;

    /// Applied records ordered by version. Empty when the bookkeeping table
    /// has not been created yet.
    fn applied_migrations(&mut self) -> Result<Vec<AppliedMigrationRecord>>;

    fn try_lock(&mut self, holder: &str) -> Result<LockOutcome>;

    /// Release the lock if `holder` still owns it.
    fn unlock(&mut self, holder: &str) -> Result<()>;

    /// Clear the lock regardless of its owner. Returns whether one was held.
    fn force_unlock(&mut self) -> Result<bool>;

    /// Execute `statements` and record `migration` as applied, atomically
    /// where the engine allows it. Nothing is recorded if a statement fails.
    fn apply(
        &mut self,
        migration: &Migration,
        statements: &[String],
        applied_by: &str,
    ) -> Result<AppliedMigrationRecord>;
}
