// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The long-lived monitoring service.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{debug, info};

use super::call_stack::CallStack;
use super::clock::{Clock, SystemClock};
use super::context::Context;
use super::current::CurrentStats;
use super::stats::Stats;
use super::tasks::CurrentStatsAsyncTasks;
use crate::config::MonitorConfig;
use crate::error::MonitorError;
use crate::storage::{safe_create, StatsPersistence, Storage};

/// Owns the configuration, the current window, its background workers and
/// the storage. Share it with `Arc` and give every caller its own
/// [`CallStack`].
pub struct Monitor {
    config: MonitorConfig,
    enabled: AtomicBool,
    current: Arc<CurrentStats>,
    persistence: Arc<StatsPersistence>,
    tasks: CurrentStatsAsyncTasks,
}

impl Monitor {
    /// Start on the current Tokio runtime.
    pub fn start(
        config: MonitorConfig,
        storage: Option<Arc<dyn Storage>>,
    ) -> Result<Arc<Self>, MonitorError> {
        let handle = Handle::try_current().map_err(|e| MonitorError::NoRuntime(e.to_string()))?;
        Self::with_handle(config, storage, handle, Arc::new(SystemClock))
    }

    /// Start on the current runtime with the storage described in the config.
    ///
    /// A storage that cannot be created is logged and saving is disabled.
    pub fn from_config(config: MonitorConfig) -> Result<Arc<Self>, MonitorError> {
        let storage = safe_create(config.storage.as_ref());
        Self::start(config, storage)
    }

    /// Start with an explicit runtime handle and clock.
    pub fn with_handle(
        config: MonitorConfig,
        storage: Option<Arc<dyn Storage>>,
        handle: Handle,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>, MonitorError> {
        config
            .validate()
            .map_err(|e| MonitorError::InvalidArgument(e.to_string()))?;

        let current = Arc::new(CurrentStats::new(
            config.max_stat_count,
            config.max_queue_size,
            config.aggregate_sub_calls,
            clock.clone(),
        ));
        let persistence = Arc::new(StatsPersistence::new(
            storage,
            clock,
            Some(config.app_instance.clone()),
            config.app_type.clone(),
            config.save_freq_minutes,
            config.days_to_keep,
        ));
        let tasks = CurrentStatsAsyncTasks::new(
            current.clone(),
            persistence.clone(),
            handle,
            Duration::from_millis(config.collect_delay_ms),
            config.enabled,
        );

        info!(
            enabled = config.enabled,
            app_instance = %config.app_instance,
            app_type = ?config.app_type,
            persistent = persistence.storage().is_some(),
            "Monitor started"
        );

        Ok(Arc::new(Self {
            enabled: AtomicBool::new(config.enabled),
            config,
            current,
            persistence,
            tasks,
        }))
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Switch instrumentation on or off at runtime.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        self.tasks.set_enabled(enabled);
        debug!(enabled, "Monitor enabled flag changed");
    }

    pub(crate) fn ensure_enabled(&self) -> Result<(), MonitorError> {
        if self.is_enabled() {
            Ok(())
        } else {
            Err(MonitorError::NotEnabled)
        }
    }

    /// A fresh call stack for one caller.
    pub fn call_stack(self: &Arc<Self>) -> CallStack {
        CallStack::new(self.clone())
    }

    /// Queue a finished tree and wake the collector.
    pub(crate) fn hand_off(&self, context: Context) {
        self.current.add(context);
        self.tasks.trigger_collect();
    }

    /// Run `f` with exclusive access to the current window.
    ///
    /// Collection is blocked while `f` runs, so keep it short and copy out
    /// what you need.
    pub fn process_stats<R>(&self, f: impl FnOnce(&Stats) -> R) -> Result<R, MonitorError> {
        self.ensure_enabled()?;
        Ok(self.current.read_stats(f))
    }

    /// Deep copy of the current window.
    pub fn current_stats(&self) -> Result<Stats, MonitorError> {
        self.process_stats(|stats| stats.deep_copy(true))
    }

    /// Discard the current window, returning it.
    pub fn reset_stats(&self) -> Result<Stats, MonitorError> {
        self.ensure_enabled()?;
        Ok(self.current.reset())
    }

    /// Configured storage, if any.
    pub fn storage(&self) -> Option<&Arc<dyn Storage>> {
        self.persistence.storage()
    }

    pub fn persistence(&self) -> &StatsPersistence {
        &self.persistence
    }

    /// Trees waiting for the collector.
    pub fn queue_len(&self) -> usize {
        self.current.queue_len()
    }

    /// Wait for running workers and merge whatever is still queued.
    pub async fn flush(&self) {
        while !self.tasks.is_idle() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.current.process_all_from_queue();
    }

    /// Persist the current window now, regardless of the save frequency.
    ///
    /// Returns false when no save could be scheduled.
    pub async fn save_now(&self) -> bool {
        self.flush().await;
        if !self.tasks.trigger_save() {
            return false;
        }
        while !self.tasks.is_idle() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        true
    }

    /// Stop background work. Safe to call more than once.
    pub fn stop(&self) {
        self.tasks.stop();
        info!("Monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, StatsFilter};

    fn config() -> MonitorConfig {
        MonitorConfig {
            collect_delay_ms: 0,
            ..MonitorConfig::enabled()
        }
    }

    #[test]
    fn test_start_without_runtime() {
        let result = Monitor::start(config(), None);
        assert!(matches!(result, Err(MonitorError::NoRuntime(_))));
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let invalid = MonitorConfig {
            max_queue_size: 0,
            ..config()
        };
        assert!(matches!(
            Monitor::start(invalid, None),
            Err(MonitorError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_reads_fail_when_disabled() {
        let monitor = Monitor::start(MonitorConfig::default(), None).unwrap();
        assert!(!monitor.is_enabled());
        assert_eq!(monitor.current_stats().unwrap_err(), MonitorError::NotEnabled);
        assert_eq!(monitor.reset_stats().unwrap_err(), MonitorError::NotEnabled);
        assert!(monitor.storage().is_none());
        monitor.stop();
    }

    #[tokio::test]
    async fn test_reset_stats() {
        let monitor = Monitor::start(config(), None).unwrap();
        let mut stack = monitor.call_stack();
        stack.enter("a").unwrap();
        stack.exit(false).unwrap();
        monitor.flush().await;

        let evicted = monitor.reset_stats().unwrap();
        assert_eq!(evicted.map["a"].hits, 1);
        assert!(monitor.current_stats().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_process_stats_reads_window() {
        let monitor = Monitor::start(config(), None).unwrap();
        let mut stack = monitor.call_stack();
        for _ in 0..3 {
            stack.enter("a").unwrap();
            stack.exit(false).unwrap();
        }
        monitor.flush().await;

        let hits = monitor
            .process_stats(|stats| stats.map.get("a").map(|s| s.hits))
            .unwrap();
        assert_eq!(hits, Some(3));
    }

    #[tokio::test]
    async fn test_save_now_persists_window() {
        let storage = Arc::new(MemoryStorage::new());
        let monitor = Monitor::start(
            MonitorConfig {
                app_type: Some("web".to_string()),
                ..config()
            },
            Some(storage.clone()),
        )
        .unwrap();

        let mut stack = monitor.call_stack();
        stack.enter("a").unwrap();
        stack.exit(false).unwrap();

        assert!(monitor.save_now().await);
        assert_eq!(storage.len(), 1);
        let filters = storage.find_filters(&StatsFilter::default()).unwrap();
        assert_eq!(filters.types, vec!["web"]);
        assert_eq!(filters.instances, vec![monitor.config().app_instance.clone()]);
        assert!(monitor.persistence().last_error_time().is_none());
    }

    #[tokio::test]
    async fn test_stop_twice() {
        let monitor = Monitor::start(config(), None).unwrap();
        monitor.stop();
        monitor.stop();
    }
}
