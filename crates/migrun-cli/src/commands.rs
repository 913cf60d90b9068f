use anyhow::{Context, Result};
use migrun_config::{AppConfig, DriftPolicy, EngineKind};
use migrun_db::{
    ClickhouseEngine, MigrationEngine, MigrationRunner, MigrationState, SqliteEngine, StatusEntry,
};
use tracing::info;

/// Effective options for a `migrate` invocation, after flags are merged
/// over the loaded config.
#[derive(Debug, Clone, Copy)]
pub struct MigrateOptions {
    pub dry_run: bool,
    pub create_database: bool,
    pub multi_statement: bool,
    pub drift: DriftPolicy,
}

impl MigrateOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            dry_run: false,
            create_database: config.migrations.create_database,
            multi_statement: config.migrations.multi_statement,
            drift: config.migrations.drift,
        }
    }
}

fn runner<E: MigrationEngine>(engine: E, drift: DriftPolicy) -> MigrationRunner<E> {
    MigrationRunner::new(engine).with_drift_policy(drift)
}

pub fn migrate(config: &AppConfig, options: MigrateOptions) -> Result<()> {
    match config.database.engine {
        EngineKind::Sqlite => migrate_with(runner(SqliteEngine, options.drift), config, options),
        EngineKind::Clickhouse => migrate_with(
            runner(ClickhouseEngine::new()?, options.drift),
            config,
            options,
        ),
    }
}

pub fn status(config: &AppConfig, json: bool) -> Result<()> {
    let drift = config.migrations.drift;
    match config.database.engine {
        EngineKind::Sqlite => status_with(runner(SqliteEngine, drift), config, json),
        EngineKind::Clickhouse => status_with(runner(ClickhouseEngine::new()?, drift), config, json),
    }
}

pub fn unlock(config: &AppConfig) -> Result<()> {
    let drift = config.migrations.drift;
    match config.database.engine {
        EngineKind::Sqlite => unlock_with(runner(SqliteEngine, drift), config),
        EngineKind::Clickhouse => unlock_with(runner(ClickhouseEngine::new()?, drift), config),
    }
}

fn migrate_with<E: MigrationEngine>(
    runner: MigrationRunner<E>,
    config: &AppConfig,
    options: MigrateOptions,
) -> Result<()> {
    let connection = config.database.to_connection();
    let dir = &config.migrations.dir;

    if options.dry_run {
        info!(target: "migrate", "dry run, nothing will be applied");
        let plan = runner
            .plan(&connection, dir)
            .context("failed to plan migrations")?;
        if !plan.database_exists {
            println!(
                "database `{}` does not exist{}",
                connection.database(),
                if options.create_database {
                    " and would be created"
                } else {
                    ""
                }
            );
        }
        if plan.pending.is_empty() {
            println!("nothing to apply");
        }
        for entry in &plan.pending {
            println!("would apply {:>6}  {}", entry.version, entry.name);
        }
        return Ok(());
    }

    info!(target: "migrate", "STARTED MIGRATING DATABASE.....");
    let report = runner
        .migrate(
            &connection,
            dir,
            options.create_database,
            options.multi_statement,
        )
        .context(format!(
            "migration of database `{}` failed",
            connection.database()
        ))?;

    for record in &report.applied {
        info!(target: "migrate", version = record.version, name = %record.name, "applied");
    }
    info!(target: "migrate", "DATABASE MIGRATION FINISHED OK.");
    Ok(())
}

fn status_with<E: MigrationEngine>(
    runner: MigrationRunner<E>,
    config: &AppConfig,
    json: bool,
) -> Result<()> {
    let connection = config.database.to_connection();
    let entries = runner
        .status(&connection, &config.migrations.dir)
        .context("failed to read migration status")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        print!("{}", render_status(&entries));
    }
    Ok(())
}

fn unlock_with<E: MigrationEngine>(runner: MigrationRunner<E>, config: &AppConfig) -> Result<()> {
    let connection = config.database.to_connection();
    let removed = runner
        .force_unlock(&connection)
        .context("failed to clear migration lock")?;
    if removed {
        println!("lock removed");
    } else {
        println!("no lock was held");
    }
    Ok(())
}

pub fn render_status(entries: &[StatusEntry]) -> String {
    if entries.is_empty() {
        return "no migrations found\n".to_string();
    }

    let mut out = format!("{:>8}  {:<8}  {:<25}  {}\n", "VERSION", "STATE", "APPLIED", "NAME");
    for entry in entries {
        let (state, applied_at) = match &entry.state {
            MigrationState::Applied { applied_at } => ("applied", Some(applied_at)),
            MigrationState::Pending => ("pending", None),
            MigrationState::Drifted { applied_at } => ("drifted", Some(applied_at)),
            MigrationState::Missing { applied_at } => ("missing", Some(applied_at)),
        };
        let applied_at = applied_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "{:>8}  {:<8}  {:<25}  {}\n",
            entry.version, state, applied_at, entry.name
        ));
    }
    out
}
