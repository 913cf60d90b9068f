use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use migrun_common::{Error, Result};
use regex::Regex;
use ring::digest::{SHA256, digest};
use tracing::debug;

static FILE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<version>\d+)(?:[_\-.](?P<name>.+))?\.sql$").expect("valid regex")
});

/// A single migration file.
///
/// The version is the numeric prefix of the file name and is the
/// migration's identifier in the bookkeeping table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub version: u64,
    pub name: String,
    pub file_name: String,
    pub sql: String,
    pub checksum: String,
}

impl Migration {
    pub fn new(version: u64, name: &str, file_name: &str, sql: String) -> Self {
        let checksum = checksum(sql.as_bytes());
        Self {
            version,
            name: name.to_string(),
            file_name: file_name.to_string(),
            sql,
            checksum,
        }
    }
}

/// Migrations loaded from a directory, sorted by ascending version.
#[derive(Debug, Clone, Default)]
pub struct MigrationSet {
    migrations: Vec<Migration>,
}

impl MigrationSet {
    /// Read every `*.sql` file in `dir`. Other files are ignored.
    pub fn load(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(Error::MigrationsDirMissing(dir.display().to_string()));
        }

        let mut by_version: BTreeMap<u64, Migration> = BTreeMap::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if !file_name.ends_with(".sql") {
                debug!("skipping non-migration file {file_name}");
                continue;
            }

            let (version, name) = parse_file_name(&file_name)?;
            let sql = std::fs::read_to_string(entry.path())?;
            let migration = Migration::new(version, &name, &file_name, sql);

            if let Some(existing) = by_version.get(&version) {
                let (first, second) = if existing.file_name < file_name {
                    (existing.file_name.clone(), file_name)
                } else {
                    (file_name, existing.file_name.clone())
                };
                return Err(Error::DuplicateVersion {
                    version,
                    first,
                    second,
                });
            }
            by_version.insert(version, migration);
        }

        Ok(Self {
            migrations: by_version.into_values().collect(),
        })
    }

    pub fn from_migrations(mut migrations: Vec<Migration>) -> Result<Self> {
        migrations.sort_by_key(|m| m.version);
        for pair in migrations.windows(2) {
            if pair[0].version == pair[1].version {
                return Err(Error::DuplicateVersion {
                    version: pair[0].version,
                    first: pair[0].file_name.clone(),
                    second: pair[1].file_name.clone(),
                });
            }
        }
        Ok(Self { migrations })
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Migration> {
        self.migrations.iter()
    }

    pub fn get(&self, version: u64) -> Option<&Migration> {
        self.migrations
            .binary_search_by_key(&version, |m| m.version)
            .ok()
            .map(|idx| &self.migrations[idx])
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}

impl<'a> IntoIterator for &'a MigrationSet {
    type Item = &'a Migration;
    type IntoIter = std::slice::Iter<'a, Migration>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Split `001_create_users.sql` into `(1, "create_users")`. A file with no
/// name part (`42.sql`) is named after its version.
pub fn parse_file_name(file_name: &str) -> Result<(u64, String)> {
    let invalid = || Error::InvalidMigrationName(file_name.to_string());

    let caps = FILE_NAME.captures(file_name).ok_or_else(invalid)?;
    let version: u64 = caps["version"].parse().map_err(|_| invalid())?;
    // versions are stored as SQLite INTEGER
    if version > i64::MAX as u64 {
        return Err(invalid());
    }
    let name = caps
        .name("name")
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| caps["version"].to_string());
    Ok((version, name))
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn checksum(bytes: &[u8]) -> String {
    digest(&SHA256, bytes)
        .as_ref()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
