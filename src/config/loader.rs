// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration loading from files and the environment.

use std::path::{Path, PathBuf};

use crate::error::ConfigError;

use super::types::MonitorConfig;

/// Config file names to search for (in order).
pub const CONFIG_FILES: &[&str] = &[
    "stackstat.json",
    ".stackstat.json",
    "stackstat.yaml",
    "stackstat.yml",
];

/// Global config directory name.
pub const GLOBAL_CONFIG_DIR: &str = ".stackstat";

/// Global config file name.
pub const GLOBAL_CONFIG_FILE: &str = "config.json";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "STACKSTAT_";

/// Get the global config directory path.
pub fn get_global_config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(GLOBAL_CONFIG_DIR))
}

/// Get the global config file path.
pub fn get_global_config_path() -> Option<PathBuf> {
    get_global_config_dir().map(|dir| dir.join(GLOBAL_CONFIG_FILE))
}

/// Load global configuration from ~/.stackstat/config.json.
pub fn load_global_config() -> Result<Option<MonitorConfig>, ConfigError> {
    let path = match get_global_config_path() {
        Some(p) => p,
        None => return Ok(None),
    };

    if !path.exists() {
        return Ok(None);
    }

    load_config_file(&path).map(Some)
}

/// Load configuration from a directory.
///
/// Searches for the names in [`CONFIG_FILES`] in order.
pub fn load_workspace_config(dir: &Path) -> Result<Option<MonitorConfig>, ConfigError> {
    for filename in CONFIG_FILES {
        let path = dir.join(filename);
        if path.exists() {
            return load_config_file(&path).map(Some);
        }
    }
    Ok(None)
}

/// Load a configuration file (JSON or YAML).
pub fn load_config_file(path: &Path) -> Result<MonitorConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");

    match extension.to_lowercase().as_str() {
        "yaml" | "yml" => serde_yaml::from_str(&content).map_err(ConfigError::from),
        _ => serde_json::from_str(&content).map_err(ConfigError::from),
    }
}

/// Write a default `stackstat.json` into `dir`, returning its path.
///
/// Refuses to shadow an existing config file unless `force` is set.
pub fn init_config(dir: &Path, force: bool) -> Result<PathBuf, ConfigError> {
    if !force {
        if let Some(existing) = CONFIG_FILES.iter().map(|f| dir.join(f)).find(|p| p.exists()) {
            return Err(ConfigError::invalid(
                existing.display().to_string(),
                "config file already exists",
            ));
        }
    }

    let path = dir.join(CONFIG_FILES[0]);
    let content = serde_json::to_string_pretty(&MonitorConfig::default())?;
    std::fs::write(&path, content)?;
    Ok(path)
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::invalid(key, e.to_string()))
}

/// Apply `STACKSTAT_*` overrides read through `lookup`.
pub fn apply_env_overrides(
    config: &mut MonitorConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    let var = |name: &str| {
        let key = format!("{}{}", ENV_PREFIX, name);
        lookup(&key).map(|value| (key, value))
    };

    if let Some((key, value)) = var("ENABLED") {
        config.enabled = parse_env(&key, &value)?;
    }
    if let Some((key, value)) = var("SAVE_FREQ_MINUTES") {
        config.save_freq_minutes = parse_env(&key, &value)?;
    }
    if let Some((key, value)) = var("DAYS_TO_KEEP") {
        config.days_to_keep = parse_env(&key, &value)?;
    }
    if let Some((key, value)) = var("MAX_QUEUE_SIZE") {
        config.max_queue_size = parse_env(&key, &value)?;
    }
    if let Some((_, value)) = var("APP_TYPE") {
        config.app_type = Some(value).filter(|v| !v.trim().is_empty());
    }
    if let Some((_, value)) = var("APP_INSTANCE") {
        if !value.trim().is_empty() {
            config.app_instance = value;
        }
    }
    Ok(())
}
