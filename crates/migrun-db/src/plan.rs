use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::engine::AppliedMigrationRecord;
use crate::migrations::{Migration, MigrationSet};

/// Where a single migration stands relative to the target database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum MigrationState {
    Applied { applied_at: DateTime<Utc> },
    Pending,
    /// Applied, but the file on disk no longer matches the recorded checksum.
    Drifted { applied_at: DateTime<Utc> },
    /// Recorded as applied, but no file with this version exists any more.
    Missing { applied_at: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusEntry {
    pub version: u64,
    pub name: String,
    #[serde(flatten)]
    pub state: MigrationState,
}

/// Comparison of the migrations on disk with the bookkeeping table.
#[derive(Debug)]
pub struct Diff<'a> {
    pub pending: Vec<&'a Migration>,
    pub drifted: Vec<&'a Migration>,
    pub missing: Vec<&'a AppliedMigrationRecord>,
    pub skipped: usize,
    /// Pending versions lower than the highest applied version.
    pub out_of_order: Vec<u64>,
}

impl<'a> Diff<'a> {
    pub fn compute(set: &'a MigrationSet, applied: &'a [AppliedMigrationRecord]) -> Self {
        let by_version: BTreeMap<u64, &AppliedMigrationRecord> =
            applied.iter().map(|r| (r.version, r)).collect();
        let highest_applied = by_version.keys().next_back().copied();

        let mut pending = Vec::new();
        let mut drifted = Vec::new();
        let mut out_of_order = Vec::new();
        let mut skipped = 0;

        for migration in set {
            match by_version.get(&migration.version) {
                Some(record) => {
                    skipped += 1;
                    if record.checksum != migration.checksum {
                        drifted.push(migration);
                    }
                }
                None => {
                    if highest_applied.is_some_and(|h| migration.version < h) {
                        out_of_order.push(migration.version);
                    }
                    pending.push(migration);
                }
            }
        }

        let missing = applied
            .iter()
            .filter(|r| set.get(r.version).is_none())
            .collect();

        Self {
            pending,
            drifted,
            missing,
            skipped,
            out_of_order,
        }
    }
}

/// One entry per version known either on disk or in the database, ordered
/// by version.
pub fn status_entries(set: &MigrationSet, applied: &[AppliedMigrationRecord]) -> Vec<StatusEntry> {
    let mut entries: BTreeMap<u64, StatusEntry> = BTreeMap::new();

    for migration in set {
        entries.insert(
            migration.version,
            StatusEntry {
                version: migration.version,
                name: migration.name.clone(),
                state: MigrationState::Pending,
            },
        );
    }

    for record in applied {
        let state = match set.get(record.version) {
            Some(m) if m.checksum == record.checksum => MigrationState::Applied {
                applied_at: record.applied_at,
            },
            Some(_) => MigrationState::Drifted {
                applied_at: record.applied_at,
            },
            None => MigrationState::Missing {
                applied_at: record.applied_at,
            },
        };
        entries.insert(
            record.version,
            StatusEntry {
                version: record.version,
                name: record.name.clone(),
                state,
            },
        );
    }

    entries.into_values().collect()
}
