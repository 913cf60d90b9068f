//! # migrun
//!
//! Applies ordered SQL migration files to a database and records what ran.
//!
//! ```bash
//! migrun migrate            # apply pending migrations
//! migrun migrate --dry-run  # list what would be applied
//! migrun status             # per-migration state
//! migrun unlock             # clear a lock left by an interrupted run
//! ```

mod commands;
mod logging;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use migrun_config::{AppConfig, ConfigLoader, DriftPolicy, EngineKind};
use tracing::debug;

use crate::commands::MigrateOptions;
use crate::logging::LogFormat;

/// Apply ordered SQL migrations with bookkeeping, drift detection and locking
#[derive(Parser)]
#[command(name = "migrun")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to migrun.yml / migrun.yaml / migrun.toml in
    /// the working directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log filter (error, warn, info, debug, trace or a full directive)
    #[arg(short = 'L', long, env = "RUST_LOG", default_value = "info", global = true)]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Compact, global = true)]
    log_format: LogFormat,

    #[command(flatten)]
    connection: ConnectionArgs,
}

/// Connection overrides; each takes precedence over config file and env.
#[derive(Args, Default)]
struct ConnectionArgs {
    /// Database engine: sqlite or clickhouse
    #[arg(long, global = true)]
    engine: Option<EngineKind>,

    /// Database host (SQLite: directory holding database files; ClickHouse:
    /// host, host:port or HTTP URL)
    #[arg(long, global = true)]
    host: Option<String>,

    #[arg(long, global = true)]
    user: Option<String>,

    /// Prefer MIGRUN_DB_PASSWORD; flags are visible in process listings
    #[arg(long, global = true)]
    password: Option<String>,

    /// Database name
    #[arg(long, global = true)]
    database: Option<String>,

    #[arg(long, global = true)]
    cluster: Option<String>,

    /// Directory of NNN_name.sql migration files
    #[arg(long, global = true)]
    migrations_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply pending migrations
    Migrate(MigrateArgs),

    /// Show the state of every known migration
    Status(StatusArgs),

    /// Remove a migration lock left behind by an interrupted run
    Unlock,
}

#[derive(Args, Debug)]
struct MigrateArgs {
    /// Show what would be applied without changing anything
    #[arg(long)]
    dry_run: bool,

    /// Fail instead of creating the database when it does not exist
    #[arg(long)]
    no_create_db: bool,

    /// Treat every file as exactly one statement
    #[arg(long)]
    single_statement: bool,

    /// What to do when an applied migration file has changed
    #[arg(long)]
    drift: Option<DriftPolicy>,
}

#[derive(Args, Debug)]
struct StatusArgs {
    /// Print status as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    logging::init(&cli.log_level, cli.log_format)?;
    run(cli)
}

fn run(cli: Cli) -> Result<()> {
    let cwd = std::env::current_dir().context("failed to read working directory")?;
    let mut config = ConfigLoader::load(cli.config.as_deref(), &cwd)?;
    apply_overrides(&mut config, &cli.connection);
    debug!(database = ?config.database, migrations = ?config.migrations, "resolved config");

    match cli.command {
        Commands::Migrate(args) => {
            let mut options = MigrateOptions::from_config(&config);
            options.dry_run = args.dry_run;
            if args.no_create_db {
                options.create_database = false;
            }
            if args.single_statement {
                options.multi_statement = false;
            }
            if let Some(drift) = args.drift {
                options.drift = drift;
            }
            commands::migrate(&config, options)
        }
        Commands::Status(args) => commands::status(&config, args.json),
        Commands::Unlock => commands::unlock(&config),
    }
}

fn apply_overrides(config: &mut AppConfig, args: &ConnectionArgs) {
    if let Some(engine) = args.engine {
        config.database.engine = engine;
    }
    if let Some(host) = &args.host {
        config.database.host = host.clone();
    }
    if let Some(user) = &args.user {
        config.database.user = user.clone();
    }
    if let Some(password) = &args.password {
        config.database.password = password.clone();
    }
    if let Some(database) = &args.database {
        config.database.name = database.clone();
    }
    if let Some(cluster) = &args.cluster {
        config.database.cluster = Some(cluster.clone());
    }
    if let Some(dir) = &args.migrations_dir {
        config.migrations.dir = dir.clone();
    }
}
