use std::path::{Path, PathBuf};

use parley_common::{Error, Result};
use tracing::info;

use crate::model::AppConfig;

/// Loads `AppConfig` from a TOML file with environment overrides.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load from an explicit path. Missing file is an error; an empty file
    /// yields full defaults.
    pub fn load(path: &Path) -> Result<AppConfig> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let mut config: AppConfig = toml::from_str(&raw)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))?;
        Self::apply_env_overrides(&mut config);
        info!("loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load from the default location if present, otherwise fall back to
    /// built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<AppConfig> {
        match path {
            Some(p) => Self::load(p),
            None => {
                let default = Self::default_config_path();
                if default.exists() {
                    Self::load(&default)
                } else {
                    let mut config = AppConfig::default();
                    Self::apply_env_overrides(&mut config);
                    info!("no config file found, using defaults");
                    Ok(config)
                }
            }
        }
    }

    pub fn default_config_path() -> PathBuf {
        PathBuf::from("parley.toml")
    }

    /// A small, fixed set of env overrides for deploy-time knobs. Secrets are
    /// never in the file; the file only names the env var that carries them.
    fn apply_env_overrides(config: &mut AppConfig) {
        if let Ok(host) = std::env::var("PARLEY_HOST")
            && !host.trim().is_empty()
        {
            config.gateway.host = host;
        }
        if let Ok(port) = std::env::var("PARLEY_PORT")
            && let Ok(port) = port.trim().parse()
        {
            config.gateway.port = port;
        }
        if let Ok(path) = std::env::var("PARLEY_DB_PATH")
            && !path.trim().is_empty()
        {
            config.database.path = path;
        }
        if let Ok(token) = std::env::var("PARLEY_DEV_TOKEN")
            && !token.trim().is_empty()
        {
            config.gateway.dev_token = Some(token);
        }
    }
}
