// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The live statistics window and the queue that feeds it.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::clock::Clock;
use super::context::Context;
use super::stats::Stats;

/// Current-window statistics plus the bounded hand-off queue.
///
/// All access to the window goes through one lock. The hot path only touches
/// the queue, except when the queue is full and the lost counter is bumped.
pub struct CurrentStats {
    stats: Mutex<Stats>,
    sender: mpsc::Sender<Context>,
    receiver: Mutex<mpsc::Receiver<Context>>,
    max_stat_count: u64,
    aggregate_sub_calls: bool,
    clock: Arc<dyn Clock>,
}

impl CurrentStats {
    pub fn new(
        max_stat_count: u64,
        max_queue_size: usize,
        aggregate_sub_calls: bool,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(max_queue_size.max(1));
        let stats = Stats::new(max_stat_count, aggregate_sub_calls, clock.now());
        Self {
            stats: Mutex::new(stats),
            sender,
            receiver: Mutex::new(receiver),
            max_stat_count,
            aggregate_sub_calls,
            clock,
        }
    }

    /// Queue a finished tree without blocking. A full queue counts as lost.
    pub fn add(&self, context: Context) {
        if self.sender.try_send(context).is_err() {
            self.stats.lock().increment_lost();
        }
    }

    /// Number of trees waiting to be merged.
    pub fn queue_len(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    /// Merge every queued tree into the window. Returns how many were merged.
    pub fn process_all_from_queue(&self) -> usize {
        let mut stats = self.stats.lock();
        let mut receiver = self.receiver.lock();
        let mut processed = 0;
        while let Ok(context) = receiver.try_recv() {
            stats.store(&context);
            processed += 1;
        }
        if processed > 0 {
            debug!(processed, "Merged queued call trees");
        }
        processed
    }

    /// Run `f` with exclusive access to the window.
    pub fn read_stats<R>(&self, f: impl FnOnce(&Stats) -> R) -> R {
        f(&self.stats.lock())
    }

    /// Swap in a fresh window and return the old one.
    pub fn reset(&self) -> Stats {
        let fresh = Stats::new(self.max_stat_count, self.aggregate_sub_calls, self.clock.now());
        std::mem::replace(&mut *self.stats.lock(), fresh)
    }

    /// Fold a previously evicted window back in, children included.
    pub fn merge_back(&self, stats: &Stats) {
        self.stats.lock().merge(stats, true);
    }

    /// Record a background failure on the window.
    pub fn set_fatal_error(&self, message: impl Into<String>) {
        self.stats.lock().fatal_error = Some(message.into());
    }
}
