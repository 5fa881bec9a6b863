// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration module for stackstat.
//!
//! Configuration comes from the first file found in the application
//! directory (stackstat.json, .stackstat.json, stackstat.yaml, stackstat.yml),
//! else the global ~/.stackstat/config.json, else defaults. `STACKSTAT_*`
//! environment variables are applied last.

mod loader;
mod types;

// Re-export public types
pub use loader::{
    apply_env_overrides, get_global_config_dir, get_global_config_path, load_config_file,
    init_config, load_global_config, load_workspace_config, CONFIG_FILES, ENV_PREFIX,
    GLOBAL_CONFIG_DIR, GLOBAL_CONFIG_FILE,
};

pub use types::{
    default_app_instance, MonitorConfig, StorageConfig, StorageKind, DEFAULT_COLLECT_DELAY_MS,
    DEFAULT_DAYS_TO_KEEP, DEFAULT_MAX_ID_LENGTH, DEFAULT_MAX_QUEUE_SIZE,
    DEFAULT_SAVE_FREQ_MINUTES, UNKNOWN_HOST,
};

use crate::error::ConfigError;
use std::path::Path;

/// Load, override and validate the configuration for an application directory.
///
/// This is the main entry point for configuration loading.
pub fn load_config(dir: &Path) -> Result<MonitorConfig, ConfigError> {
    let config = match load_workspace_config(dir)? {
        Some(config) => config,
        None => load_global_config()?.unwrap_or_default(),
    };
    resolve(config)
}

/// Like [`load_config`] but from one explicit file, which must exist.
pub fn load_config_from(path: &Path) -> Result<MonitorConfig, ConfigError> {
    resolve(load_config_file(path)?)
}

fn resolve(mut config: MonitorConfig) -> Result<MonitorConfig, ConfigError> {
    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}
