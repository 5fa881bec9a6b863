// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Background collector and saver workers.
//!
//! Each worker is single-slot: a trigger while the worker is in flight is
//! dropped, since the running pass will pick up whatever was queued.

use std::any::Any;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::current::CurrentStats;
use crate::storage::StatsPersistence;

/// Clears the in-flight flag when the task finishes or is aborted.
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Worker {
    name: &'static str,
    in_flight: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            in_flight: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Spawn `job` unless a previous run is still in flight.
    fn schedule<F>(&self, handle: &Handle, shutdown: &CancellationToken, job: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let guard = InFlightGuard(self.in_flight.clone());
        let shutdown = shutdown.clone();
        let name = self.name;
        let task = handle.spawn(async move {
            let _guard = guard;
            tokio::select! {
                _ = shutdown.cancelled() => debug!(worker = name, "Worker cancelled"),
                _ = job => {}
            }
        });
        *self.task.lock() = Some(task);
        true
    }

    fn abort(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Turn a crashed blocking pass into the window's fatal error.
fn record_failure(current: &CurrentStats, worker: &str, err: JoinError) {
    if err.is_panic() {
        let message = format!("{} crashed: {}", worker, panic_message(err.into_panic()));
        error!(worker, error = %message, "Stats worker crashed");
        current.set_fatal_error(message);
    } else {
        debug!(worker, "Stats worker pass cancelled");
    }
}

/// Schedules collecting and saving of the current window.
pub struct CurrentStatsAsyncTasks {
    current: Arc<CurrentStats>,
    persistence: Arc<StatsPersistence>,
    handle: Handle,
    collect_delay: Duration,
    enabled: AtomicBool,
    shutdown: CancellationToken,
    collector: Worker,
    saver: Worker,
}

impl CurrentStatsAsyncTasks {
    pub fn new(
        current: Arc<CurrentStats>,
        persistence: Arc<StatsPersistence>,
        handle: Handle,
        collect_delay: Duration,
        enabled: bool,
    ) -> Self {
        Self {
            current,
            persistence,
            handle,
            collect_delay,
            enabled: AtomicBool::new(enabled),
            shutdown: CancellationToken::new(),
            collector: Worker::new("collector"),
            saver: Worker::new("saver"),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Allow or refuse scheduling. No effect once stopped.
    pub fn set_enabled(&self, enabled: bool) {
        if !self.shutdown.is_cancelled() {
            self.enabled.store(enabled, Ordering::Release);
        }
    }

    /// Whether neither worker is running.
    pub fn is_idle(&self) -> bool {
        !self.collector.is_in_flight() && !self.saver.is_in_flight()
    }

    /// Schedule the collector, and the saver when a save is due.
    pub fn trigger_collect(&self) {
        if !self.is_enabled() || self.shutdown.is_cancelled() {
            return;
        }

        let current = self.current.clone();
        let delay = self.collect_delay;
        self.collector.schedule(&self.handle, &self.shutdown, async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let worker = current.clone();
            match tokio::task::spawn_blocking(move || worker.process_all_from_queue()).await {
                Ok(_) => {}
                Err(e) => record_failure(&current, "collector", e),
            }
        });

        if self.persistence.should_save() {
            self.trigger_save();
        }
    }

    /// Schedule the saver regardless of the save frequency.
    pub fn trigger_save(&self) -> bool {
        if !self.is_enabled() || self.shutdown.is_cancelled() {
            return false;
        }

        let current = self.current.clone();
        let persistence = self.persistence.clone();
        self.saver.schedule(&self.handle, &self.shutdown, async move {
            let worker = current.clone();
            let pass = tokio::task::spawn_blocking(move || {
                worker.process_all_from_queue();
                let mut stats = worker.reset();
                if persistence.safe_save(&mut stats) {
                    persistence.safe_cleanup();
                } else {
                    worker.merge_back(&stats);
                }
            });
            if let Err(e) = pass.await {
                record_failure(&current, "saver", e);
            }
        })
    }

    /// Stop scheduling and cancel running workers. Safe to call repeatedly.
    ///
    /// A blocking pass that already started runs to completion.
    pub fn stop(&self) {
        self.shutdown.cancel();
        if self.enabled.swap(false, Ordering::AcqRel) {
            debug!("Stopping stats workers");
        }
        self.collector.abort();
        self.saver.abort();
    }
}

impl Drop for CurrentStatsAsyncTasks {
    fn drop(&mut self) {
        self.stop();
    }
}
