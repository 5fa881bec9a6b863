// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Building storages from configuration.

use std::sync::Arc;

use tracing::{info, warn};

use super::{Granularity, MemoryStorage, SqliteStorage, Storage, StorageResult, TieredStorage};
use crate::config::{StorageConfig, StorageKind};

fn sqlite(config: &StorageConfig, prefix: &str) -> StorageResult<SqliteStorage> {
    let prefix = format!("{}{}", config.table_prefix, prefix);
    let storage = match &config.path {
        Some(path) => SqliteStorage::open(path, &prefix)?,
        None => SqliteStorage::open_in_memory(&prefix)?,
    };
    Ok(match config.histogram_page_size {
        Some(size) => storage.with_histogram_page_size(size),
        None => storage,
    })
}

/// Table prefix of one tier inside a tiered database.
pub fn tier_prefix(granularity: Granularity) -> &'static str {
    match granularity {
        Granularity::Raw => "",
        Granularity::Daily => "day_",
        Granularity::Weekly => "week_",
        Granularity::Monthly => "month_",
    }
}

/// Build a tiered storage over one SQLite database.
pub fn create_tiered(config: &StorageConfig) -> StorageResult<TieredStorage> {
    let tier = |granularity: Granularity| -> StorageResult<Arc<dyn Storage>> {
        let storage: Arc<dyn Storage> = Arc::new(sqlite(config, tier_prefix(granularity))?);
        Ok(storage)
    };
    Ok(TieredStorage::new(
        tier(Granularity::Raw)?,
        tier(Granularity::Daily)?,
        tier(Granularity::Weekly)?,
        tier(Granularity::Monthly)?,
    ))
}

/// Build the storage described by `config`.
pub fn create_storage(config: &StorageConfig) -> StorageResult<Arc<dyn Storage>> {
    let storage: Arc<dyn Storage> = match config.kind {
        StorageKind::Memory => Arc::new(MemoryStorage::new()),
        StorageKind::Sqlite => Arc::new(sqlite(config, "")?),
        StorageKind::Tiered => Arc::new(create_tiered(config)?),
    };
    info!(kind = ?config.kind, path = ?config.path, "Created stats storage");
    Ok(storage)
}

/// Like [`create_storage`] but logs failures and returns `None`.
pub fn safe_create(config: Option<&StorageConfig>) -> Option<Arc<dyn Storage>> {
    let config = config?;
    match create_storage(config) {
        Ok(storage) => Some(storage),
        Err(e) => {
            warn!(error = %e, kind = ?config.kind, "Failed to create stats storage, saving disabled");
            None
        }
    }
}
