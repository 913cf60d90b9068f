use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration as read from `migrun.yml` / `migrun.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseSettings,
    pub migrations: MigrationSettings,
}

/// Raw connection settings. Layered (file, env, flags) before being frozen
/// into a [`ConnectionConfig`].
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub engine: EngineKind,
    pub host: String,
    pub user: String,
    pub password: String,
    pub name: String,
    pub cluster: Option<String>,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            engine: EngineKind::default(),
            host: ".".to_string(),
            user: "migrun".to_string(),
            password: String::new(),
            name: "migrun".to_string(),
            cluster: None,
        }
    }
}

impl fmt::Debug for DatabaseSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseSettings")
            .field("engine", &self.engine)
            .field("host", &self.host)
            .field("user", &self.user)
            .field("password", &redacted(&self.password))
            .field("name", &self.name)
            .field("cluster", &self.cluster)
            .finish()
    }
}

impl DatabaseSettings {
    pub fn to_connection(&self) -> ConnectionConfig {
        let config = ConnectionConfig::new(&self.host, &self.user, &self.password, &self.name);
        match &self.cluster {
            Some(cluster) if !cluster.is_empty() => config.with_cluster(cluster),
            _ => config,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationSettings {
    pub dir: PathBuf,
    pub create_database: bool,
    pub multi_statement: bool,
    pub drift: DriftPolicy,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("migrations"),
            create_database: true,
            multi_statement: true,
            drift: DriftPolicy::default(),
        }
    }
}

/// Which database engine migrations are applied to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// `host` is a directory; each database is `<host>/<name>.db`.
    #[default]
    Sqlite,
    /// `host` is a server address, `name:port` or a full HTTP(S) URL.
    Clickhouse,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Sqlite => "sqlite",
            EngineKind::Clickhouse => "clickhouse",
        }
    }
}

impl std::str::FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(EngineKind::Sqlite),
            "clickhouse" => Ok(EngineKind::Clickhouse),
            other => Err(format!("unknown database engine: {other}")),
        }
    }
}

/// What to do when an applied migration's file no longer matches the
/// checksum recorded for it. Drifted migrations are never re-applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriftPolicy {
    #[default]
    Fail,
    Warn,
}

impl DriftPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriftPolicy::Fail => "fail",
            DriftPolicy::Warn => "warn",
        }
    }
}

impl std::str::FromStr for DriftPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fail" => Ok(DriftPolicy::Fail),
            "warn" => Ok(DriftPolicy::Warn),
            other => Err(format!("unknown drift policy: {other}")),
        }
    }
}

/// Connection parameters for a migration target. Immutable once built.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    host: String,
    user: String,
    password: String,
    database: String,
    cluster: Option<String>,
}

impl ConnectionConfig {
    pub fn new(host: &str, user: &str, password: &str, database: &str) -> Self {
        Self {
            host: host.to_string(),
            user: user.to_string(),
            password: password.to_string(),
            database: database.to_string(),
            cluster: None,
        }
    }

    #[must_use]
    pub fn with_cluster(mut self, cluster: &str) -> Self {
        self.cluster = Some(cluster.to_string());
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn cluster(&self) -> Option<&str> {
        self.cluster.as_deref()
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("user", &self.user)
            .field("password", &redacted(&self.password))
            .field("database", &self.database)
            .field("cluster", &self.cluster)
            .finish()
    }
}

fn redacted(secret: &str) -> &'static str {
    if secret.is_empty() { "" } else { "***" }
}
