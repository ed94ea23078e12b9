//! Configuration loading.
//!
//! A TOML file (every section optional), then `BABBLE_*` environment
//! overrides, then validation. Unknown keys are rejected.

use std::path::{Path, PathBuf};

use babble_core::{BabbleConfig, BabbleResult, ConfigError};

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "BABBLE_CONFIG";

/// Parse a TOML document. Not validated.
pub fn from_toml_str(contents: &str) -> BabbleResult<BabbleConfig> {
    toml::from_str(contents).map_err(|e| {
        ConfigError::Parse {
            reason: e.to_string(),
        }
        .into()
    })
}

/// Read and parse a TOML file. Not validated.
pub fn from_path(path: &Path) -> BabbleResult<BabbleConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    from_toml_str(&contents)
}

/// Load `path` (defaults when `None`), apply environment overrides and
/// validate.
pub fn load(path: Option<&Path>) -> BabbleResult<BabbleConfig> {
    let config = match path {
        Some(path) => from_path(path)?,
        None => BabbleConfig::default(),
    };
    let config = config.with_env_overrides();
    config.validate()?;
    tracing::debug!(path = ?path, "Configuration loaded");
    Ok(config)
}

/// [`load`] from the file named by `BABBLE_CONFIG`, if set.
pub fn load_from_env() -> BabbleResult<BabbleConfig> {
    load(config_path_from_env().as_deref())
}

pub fn config_path_from_env() -> Option<PathBuf> {
    std::env::var(CONFIG_PATH_ENV)
        .ok()
        .filter(|p| !p.trim().is_empty())
        .map(PathBuf::from)
}
