pub mod clickhouse_engine;
pub mod engine;
pub mod migrations;
pub mod plan;
pub mod runner;
pub mod sqlite;
pub mod statements;

pub use clickhouse_engine::{ClickhouseEngine, ClickhouseTarget};
pub use engine::{AppliedMigrationRecord, LockOutcome, MigrationEngine, MigrationTarget};
pub use migrations::{Migration, MigrationSet};
pub use plan::{MigrationState, StatusEntry};
pub use runner::{MigrationPlan, MigrationReport, MigrationRunner};
pub use sqlite::{SqliteEngine, SqliteTarget};
