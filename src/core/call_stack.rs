// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-caller call tree builder.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use super::context::{normalize_id, Context};
use super::monitor::Monitor;
use crate::error::MonitorError;

struct Frame {
    context: Context,
    started: Instant,
}

impl Frame {
    fn finish(mut self, failed: bool) -> Context {
        self.context.elapsed = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.context.failed = failed;
        self.context
    }
}

/// Builds the call tree of one logical flow of execution.
///
/// A `CallStack` is owned by a single caller (a thread, a request, a task)
/// and is not shared. When the outermost scope exits the finished tree is
/// handed to the monitor's pipeline.
///
/// ```no_run
/// # use stackstat::{Monitor, MonitorConfig, MonitorError};
/// # fn find_user(_: u32) -> Result<String, MonitorError> { Ok(String::new()) }
/// # async fn run() -> anyhow::Result<()> {
/// let monitor = Monitor::start(MonitorConfig::enabled(), None)?;
/// let mut stack = monitor.call_stack();
/// let _user = stack.monitor("UserService.find", |stack| {
///     stack.monitor("UserRepository.load", |_| find_user(7))
/// })?;
/// # Ok(())
/// # }
/// ```
pub struct CallStack {
    monitor: Arc<Monitor>,
    frames: Vec<Frame>,
}

impl CallStack {
    pub(crate) fn new(monitor: Arc<Monitor>) -> Self {
        Self {
            monitor,
            frames: Vec::new(),
        }
    }

    /// Number of open scopes.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Open a scope. Returns true when it is the outermost one.
    pub fn enter(&mut self, id: &str) -> Result<bool, MonitorError> {
        self.monitor.ensure_enabled()?;
        let id = normalize_id(Some(id), self.monitor.config().max_id_length);
        let first = self.frames.is_empty();
        self.frames.push(Frame {
            context: Context::new(id, 0),
            started: Instant::now(),
        });
        Ok(first)
    }

    /// Close the innermost scope. No-op when nothing is open.
    pub fn exit(&mut self, failed: bool) -> Result<(), MonitorError> {
        self.monitor.ensure_enabled()?;
        let Some(frame) = self.frames.pop() else {
            return Ok(());
        };
        let context = frame.finish(failed);
        match self.frames.last_mut() {
            Some(parent) => parent.context.add_child(context),
            None => self.monitor.hand_off(context),
        }
        Ok(())
    }

    /// Close every open scope, marking each with `failed`, and hand off the
    /// root.
    pub fn exit_all(&mut self, failed: bool) -> Result<(), MonitorError> {
        self.monitor.ensure_enabled()?;
        let mut finished: Option<Context> = None;
        while let Some(mut frame) = self.frames.pop() {
            if let Some(child) = finished.take() {
                frame.context.add_child(child);
            }
            finished = Some(frame.finish(failed));
        }
        if let Some(root) = finished {
            self.monitor.hand_off(root);
        }
        Ok(())
    }

    /// Run `body` inside a scope named `id`.
    ///
    /// The scope is marked failed when `body` returns `Err` or panics. A panic
    /// is resumed once the scope is closed. The outermost scope closes every
    /// scope still open, so a body that leaked scopes cannot corrupt the tree.
    pub fn monitor<T, E, F>(&mut self, id: &str, body: F) -> Result<T, E>
    where
        E: From<MonitorError>,
        F: FnOnce(&mut Self) -> Result<T, E>,
    {
        let first = self.enter(id)?;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(self)));
        let failed = !matches!(outcome, Ok(Ok(_)));
        let closed = if first {
            self.exit_all(failed)
        } else {
            self.exit(failed)
        };

        match outcome {
            Ok(Ok(value)) => {
                closed?;
                Ok(value)
            }
            Ok(Err(e)) => Err(e),
            Err(payload) => panic::resume_unwind(payload),
        }
    }
}
