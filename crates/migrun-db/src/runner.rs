use std::path::Path;
use std::time::{Duration, Instant};

use migrun_common::{Error, Result};
use migrun_config::{ConnectionConfig, DriftPolicy};
use tracing::{Span, error, info, info_span, warn};
use uuid::Uuid;

use crate::engine::{AppliedMigrationRecord, LockOutcome, MigrationEngine, MigrationTarget};
use crate::migrations::MigrationSet;
use crate::plan::{Diff, MigrationState, StatusEntry, status_entries};
use crate::statements;

/// Outcome of a successful [`MigrationRunner::migrate`] call.
#[derive(Debug, Clone, Default)]
pub struct MigrationReport {
    /// Migrations applied by this run, in the order they ran.
    pub applied: Vec<AppliedMigrationRecord>,
    /// Migrations on disk that were already applied.
    pub skipped: usize,
    /// Applied versions whose files changed since (only non-empty under
    /// [`DriftPolicy::Warn`]).
    pub drifted: Vec<u64>,
    /// Applied versions with no file on disk.
    pub missing: Vec<u64>,
    pub elapsed: Duration,
}

/// What a run would do, without doing it.
#[derive(Debug, Clone)]
pub struct MigrationPlan {
    pub database_exists: bool,
    pub pending: Vec<StatusEntry>,
    pub entries: Vec<StatusEntry>,
}

/// Applies ordered migrations from a directory to a target database.
///
/// The runner owns a tracing span; every run opens a child span carrying the
/// database name, so log output is attributable without any global logger
/// state.
pub struct MigrationRunner<E: MigrationEngine> {
    engine: E,
    drift_policy: DriftPolicy,
    span: Span,
}

impl<E: MigrationEngine> MigrationRunner<E> {
    pub fn new(engine: E) -> Self {
        let span = info_span!("migrun", engine = engine.name());
        Self {
            engine,
            drift_policy: DriftPolicy::default(),
            span,
        }
    }

    #[must_use]
    pub fn with_drift_policy(mut self, policy: DriftPolicy) -> Self {
        self.drift_policy = policy;
        self
    }

    /// Use a caller-provided span as the parent of every run.
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Bring the target up to date with `migrations_dir`.
    ///
    /// Pending migrations run in ascending version order, each in its own
    /// transaction together with its bookkeeping record. The first failure
    /// stops the run; the failing migration is not recorded and later ones
    /// are not attempted.
    pub fn migrate(
        &self,
        config: &ConnectionConfig,
        migrations_dir: &Path,
        create_db_if_missing: bool,
        allow_multi_statement: bool,
    ) -> Result<MigrationReport> {
        let run_span = info_span!(parent: &self.span, "migrate", database = config.database());
        let _enter = run_span.enter();
        let started = Instant::now();

        let mut target = self.open(config, create_db_if_missing)?;
        target.ensure_bookkeeping()?;

        let holder = Uuid::new_v4().to_string();
        if let LockOutcome::HeldBy(other) = target.try_lock(&holder)? {
            return Err(Error::Locked(other));
        }

        let result = self.run_pending(&mut target, config, migrations_dir, allow_multi_statement);
        let released = target.unlock(&holder);

        let mut report = match (result, released) {
            (Ok(report), Ok(())) => report,
            (Ok(_), Err(e)) | (Err(e), Ok(())) => return Err(e),
            (Err(e), Err(unlock_err)) => {
                error!("failed to release migration lock after error: {unlock_err}");
                return Err(e);
            }
        };
        report.elapsed = started.elapsed();

        info!(
            applied = report.applied.len(),
            skipped = report.skipped,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "migration run complete"
        );
        Ok(report)
    }

    /// Compute what [`migrate`](Self::migrate) would apply. Takes no lock,
    /// writes nothing and never creates the database.
    pub fn plan(&self, config: &ConnectionConfig, migrations_dir: &Path) -> Result<MigrationPlan> {
        let run_span = info_span!(parent: &self.span, "plan", database = config.database());
        let _enter = run_span.enter();

        let set = MigrationSet::load(migrations_dir)?;
        let database_exists = self.engine.database_exists(config)?;
        let applied = if database_exists {
            self.engine.connect(config)?.applied_migrations()?
        } else {
            Vec::new()
        };

        let entries = status_entries(&set, &applied);
        let pending = entries
            .iter()
            .filter(|e| e.state == MigrationState::Pending)
            .cloned()
            .collect();

        Ok(MigrationPlan {
            database_exists,
            pending,
            entries,
        })
    }

    /// Per-version state of every migration on disk or in the database.
    pub fn status(
        &self,
        config: &ConnectionConfig,
        migrations_dir: &Path,
    ) -> Result<Vec<StatusEntry>> {
        Ok(self.plan(config, migrations_dir)?.entries)
    }

    /// Remove a lock left behind by a crashed run. Returns whether a lock
    /// was held.
    pub fn force_unlock(&self, config: &ConnectionConfig) -> Result<bool> {
        let run_span = info_span!(parent: &self.span, "unlock", database = config.database());
        let _enter = run_span.enter();

        let removed = self.engine.connect(config)?.force_unlock()?;
        if removed {
            warn!("stale migration lock removed");
        } else {
            info!("no migration lock was held");
        }
        Ok(removed)
    }

    fn open(&self, config: &ConnectionConfig, create_db_if_missing: bool) -> Result<E::Target> {
        if !self.engine.database_exists(config)? {
            if !create_db_if_missing {
                return Err(Error::DatabaseMissing(config.database().to_string()));
            }
            self.engine.create_database(config)?;
            info!("created database {}", config.database());
        }
        self.engine.connect(config)
    }

    fn run_pending(
        &self,
        target: &mut E::Target,
        config: &ConnectionConfig,
        migrations_dir: &Path,
        allow_multi_statement: bool,
    ) -> Result<MigrationReport> {
        let set = MigrationSet::load(migrations_dir)?;
        let applied = target.applied_migrations()?;
        let diff = Diff::compute(&set, &applied);

        for record in &diff.missing {
            warn!(
                version = record.version,
                name = %record.name,
                "applied migration has no file on disk"
            );
        }
        for version in &diff.out_of_order {
            warn!(version, "pending migration is older than the latest applied one");
        }

        if let Some(first) = diff.drifted.first() {
            match self.drift_policy {
                DriftPolicy::Fail => {
                    return Err(Error::ChecksumMismatch {
                        version: first.version,
                        name: first.name.clone(),
                    });
                }
                DriftPolicy::Warn => {
                    for m in &diff.drifted {
                        warn!(
                            version = m.version,
                            name = %m.name,
                            "applied migration changed on disk, not re-applying"
                        );
                    }
                }
            }
        }

        let mut report = MigrationReport {
            skipped: diff.skipped,
            drifted: diff.drifted.iter().map(|m| m.version).collect(),
            missing: diff.missing.iter().map(|r| r.version).collect(),
            ..Default::default()
        };

        if diff.pending.is_empty() {
            info!(known = set.len(), "database is up to date");
            return Ok(report);
        }

        for migration in diff.pending {
            let statements = statements::prepare(migration, allow_multi_statement)?;
            info!(
                version = migration.version,
                name = %migration.name,
                statements = statements.len(),
                "applying migration"
            );

            let record = target
                .apply(migration, &statements, config.user())
                .inspect_err(|e| error!(version = migration.version, "{e}"))?;
            report.applied.push(record);
        }

        Ok(report)
    }
}
