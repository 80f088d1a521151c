//! Layered settings for one invocation.
//!
//! Command-line flags win over `songbird.toml` beside the checkpoint, which wins
//! over `$SONGBIRD_HOME/config.toml`, which wins over built-in defaults. A config
//! file that cannot be read or parsed is skipped with a warning.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use crate::manager::{LoadMode, ManagerOptions, RegisterPolicy};
use crate::store::DEFAULT_SESSION_TYPE;

/// Project config file names, in lookup order.
pub const PROJECT_CONFIG_NAMES: [&str; 2] = ["songbird.toml", ".songbird.toml"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("Failed to parse config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SongbirdConfig {
    /// What `register` does with an already-known composite key.
    pub register_policy: Option<RegisterPolicy>,
    /// true = refuse to start over a malformed checkpoint.
    pub strict_load: Option<bool>,
    /// true = hold `<checkpoint>.lock` for the whole invocation.
    pub lock: Option<bool>,
    /// Session type written into new checkpoints.
    pub session_type: Option<String>,
}

impl SongbirdConfig {
    /// Fills unset fields from `fallback`.
    pub fn or(self, fallback: SongbirdConfig) -> SongbirdConfig {
        SongbirdConfig {
            register_policy: self.register_policy.or(fallback.register_policy),
            strict_load: self.strict_load.or(fallback.strict_load),
            lock: self.lock.or(fallback.lock),
            session_type: self.session_type.or(fallback.session_type),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedSettings {
    pub options: ManagerOptions,
    pub lock: bool,
}

/// `$SONGBIRD_HOME`, else `~/.songbird`.
pub fn songbird_home_dir() -> Option<PathBuf> {
    env_path("SONGBIRD_HOME").or_else(|| {
        env_path("HOME")
            .or_else(|| env_path("USERPROFILE"))
            .map(|home| home.join(".songbird"))
    })
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var_os(name)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
}

pub fn global_config_path() -> Option<PathBuf> {
    songbird_home_dir().map(|home| home.join("config.toml"))
}

/// Directory whose `songbird.toml` applies to the checkpoint at `checkpoint`.
pub fn checkpoint_config_dir(checkpoint: &Path) -> PathBuf {
    match checkpoint.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Parses one config file. A missing file is `Ok(None)`.
pub fn read_config(path: &Path) -> Result<Option<SongbirdConfig>, ConfigError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    toml::from_str(&text)
        .map(Some)
        .map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

/// First project config found beside the checkpoint.
pub fn project_config(checkpoint: &Path) -> Result<Option<SongbirdConfig>, ConfigError> {
    let dir = checkpoint_config_dir(checkpoint);
    for name in PROJECT_CONFIG_NAMES {
        if let Some(config) = read_config(&dir.join(name))? {
            return Ok(Some(config));
        }
    }
    Ok(None)
}

pub fn global_config() -> Result<Option<SongbirdConfig>, ConfigError> {
    match global_config_path() {
        Some(path) => read_config(&path),
        None => Ok(None),
    }
}

fn layer_or_default(
    scope: &str,
    loaded: Result<Option<SongbirdConfig>, ConfigError>,
) -> SongbirdConfig {
    match loaded {
        Ok(config) => config.unwrap_or_default(),
        Err(err) => {
            warn!(scope, error = %err, "ignoring config file");
            SongbirdConfig::default()
        }
    }
}

/// Layers `overrides` (usually command-line flags) over project config,
/// global config and built-in defaults, in that order.
pub fn resolve_settings(checkpoint: &Path, overrides: SongbirdConfig) -> ResolvedSettings {
    let project = layer_or_default("project", project_config(checkpoint));
    let global = layer_or_default("global", global_config());
    let merged = overrides.or(project).or(global);

    let load_mode = if merged.strict_load.unwrap_or(false) {
        LoadMode::Strict
    } else {
        LoadMode::Lenient
    };
    ResolvedSettings {
        options: ManagerOptions {
            register_policy: merged.register_policy.unwrap_or_default(),
            load_mode,
            session_type: merged
                .session_type
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_SESSION_TYPE.to_string()),
        },
        lock: merged.lock.unwrap_or(false),
    }
}
