// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Save scheduling, failure backoff and retention cleanup.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::Storage;
use crate::core::{Clock, Stats};

/// Minutes during which no save is attempted after a failure.
pub const FAILURE_COOLDOWN_MINUTES: i64 = 5;

const MILLIS_PER_MINUTE: i64 = 60_000;

/// Decides when the current window is persisted and does the persisting.
pub struct StatsPersistence {
    storage: Option<Arc<dyn Storage>>,
    clock: Arc<dyn Clock>,
    app_instance: Option<String>,
    app_type: Option<String>,
    save_freq_minutes: i64,
    days_to_keep: i64,
    /// Millis of the last successful save.
    last_save: AtomicI64,
    /// Millis of the last failed save, 0 when the last attempt succeeded.
    last_error: AtomicI64,
}

impl StatsPersistence {
    pub fn new(
        storage: Option<Arc<dyn Storage>>,
        clock: Arc<dyn Clock>,
        app_instance: Option<String>,
        app_type: Option<String>,
        save_freq_minutes: i64,
        days_to_keep: i64,
    ) -> Self {
        let now = clock.now().timestamp_millis();
        Self {
            storage,
            clock,
            app_instance,
            app_type,
            save_freq_minutes,
            days_to_keep,
            last_save: AtomicI64::new(now),
            last_error: AtomicI64::new(0),
        }
    }

    /// Configured storage, if any.
    pub fn storage(&self) -> Option<&Arc<dyn Storage>> {
        self.storage.as_ref()
    }

    /// Time of the last successful save (construction time before any).
    pub fn last_save_time(&self) -> Option<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp_millis(self.last_save.load(Ordering::Acquire))
    }

    /// Time of the last failed save, if the last attempt failed.
    pub fn last_error_time(&self) -> Option<DateTime<Utc>> {
        match self.last_error.load(Ordering::Acquire) {
            0 => None,
            millis => DateTime::<Utc>::from_timestamp_millis(millis),
        }
    }

    /// Whether a save is due.
    pub fn should_save(&self) -> bool {
        if self.storage.is_none() || self.save_freq_minutes <= 0 {
            return false;
        }
        let now = self.clock.now().timestamp_millis();

        let last_error = self.last_error.load(Ordering::Acquire);
        if last_error > 0 && now - last_error < FAILURE_COOLDOWN_MINUTES * MILLIS_PER_MINUTE {
            return false;
        }

        let since_save = now - self.last_save.load(Ordering::Acquire);
        since_save >= self.save_freq_minutes * MILLIS_PER_MINUTE
    }

    /// Persist `stats`, filling in missing dates first. Never fails.
    ///
    /// Returns whether the save succeeded.
    pub fn safe_save(&self, stats: &mut Stats) -> bool {
        let Some(storage) = &self.storage else {
            return false;
        };

        let now = self.clock.now();
        if stats.start_date.is_none() {
            stats.start_date = Some(now);
        }
        if stats.end_date.is_none() {
            stats.end_date = Some(now);
        }

        let start = Instant::now();
        match storage.save(stats, self.app_instance.as_deref(), self.app_type.as_deref()) {
            Ok(id) => {
                self.last_save.store(self.clock.now().timestamp_millis(), Ordering::Release);
                self.last_error.store(0, Ordering::Release);
                info!(
                    id = %id,
                    stats = stats.map.len(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Saved stats"
                );
                true
            }
            Err(e) => {
                self.last_error.store(self.clock.now().timestamp_millis(), Ordering::Release);
                warn!(
                    error = %e,
                    retry_after_minutes = FAILURE_COOLDOWN_MINUTES,
                    "Failed to save stats"
                );
                false
            }
        }
    }

    /// Drop data past retention. Skipped when disabled or the last save failed.
    pub fn safe_cleanup(&self) {
        let Some(storage) = &self.storage else {
            return;
        };
        if self.days_to_keep <= 0 || self.last_error.load(Ordering::Acquire) > 0 {
            return;
        }
        let days = u32::try_from(self.days_to_keep).unwrap_or(u32::MAX);

        let start = Instant::now();
        match storage.cleanup(days, self.app_type.as_deref()) {
            Ok(removed) => info!(
                removed,
                days_to_keep = days,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Cleaned up old stats"
            ),
            Err(e) => warn!(error = %e, "Failed to clean up old stats"),
        }
    }
}
