use std::path::{Path, PathBuf};

use migrun_common::{Error, Result};
use tracing::{debug, info};

use crate::model::{AppConfig, EngineKind};

/// File names probed, in order, when no config path is given explicitly.
pub const DEFAULT_CONFIG_FILES: [&str; 3] = ["migrun.yml", "migrun.yaml", "migrun.toml"];

pub const ENV_DB_ENGINE: &str = "MIGRUN_DB_ENGINE";
pub const ENV_DB_HOST: &str = "MIGRUN_DB_HOST";
pub const ENV_DB_USER: &str = "MIGRUN_DB_USER";
pub const ENV_DB_PASSWORD: &str = "MIGRUN_DB_PASSWORD";
pub const ENV_DB_NAME: &str = "MIGRUN_DB_NAME";
pub const ENV_DB_CLUSTER: &str = "MIGRUN_DB_CLUSTER";
pub const ENV_MIGRATIONS_DIR: &str = "MIGRUN_MIGRATIONS_DIR";

/// Builds an [`AppConfig`] from defaults, an optional config file and the
/// process environment.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load from `explicit` if given, otherwise from the first default file
    /// found in `search_dir`, then apply environment overrides.
    pub fn load(explicit: Option<&Path>, search_dir: &Path) -> Result<AppConfig> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match Self::discover(search_dir) {
                Some(path) => Self::from_file(&path)?,
                None => {
                    debug!("no config file in {}, using defaults", search_dir.display());
                    AppConfig::default()
                }
            },
        };

        Self::apply_env(&mut config, |key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn discover(dir: &Path) -> Option<PathBuf> {
        DEFAULT_CONFIG_FILES
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.is_file())
    }

    pub fn from_file(path: &Path) -> Result<AppConfig> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {e}", path.display()))
        })?;

        if contents.trim().is_empty() {
            debug!("{} is empty, using defaults", path.display());
            return Ok(AppConfig::default());
        }

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let config = match ext {
            "yml" | "yaml" => serde_yaml::from_str(&contents)
                .map_err(|e| Error::Serialization(format!("YAML parse error: {e}")))?,
            "toml" => toml::from_str(&contents)
                .map_err(|e| Error::Serialization(format!("TOML parse error: {e}")))?,
            other => {
                return Err(Error::Config(format!(
                    "unsupported config extension: {other}"
                )));
            }
        };

        info!("loaded config from {}", path.display());
        Ok(config)
    }

    /// Overlay values from `lookup` (normally the process environment).
    /// Unset or empty variables leave the current value alone.
    pub fn apply_env<F>(config: &mut AppConfig, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = get(ENV_DB_ENGINE) {
            config.database.engine = v
                .parse::<EngineKind>()
                .map_err(|e| Error::Config(format!("{ENV_DB_ENGINE}: {e}")))?;
        }
        if let Some(v) = get(ENV_DB_HOST) {
            config.database.host = v;
        }
        if let Some(v) = get(ENV_DB_USER) {
            config.database.user = v;
        }
        if let Some(v) = get(ENV_DB_PASSWORD) {
            config.database.password = v;
        }
        if let Some(v) = get(ENV_DB_NAME) {
            config.database.name = v;
        }
        if let Some(v) = get(ENV_DB_CLUSTER) {
            config.database.cluster = Some(v);
        }
        if let Some(v) = get(ENV_MIGRATIONS_DIR) {
            config.migrations.dir = PathBuf::from(v);
        }
        Ok(())
    }
}
