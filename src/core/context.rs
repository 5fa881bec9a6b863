// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Captured invocation trees.

use serde::{Deserialize, Serialize};

/// Id used when the caller passed no id at all.
pub const NULL_ID: &str = "<null>";

/// Id used when the caller passed a blank id.
pub const EMPTY_ID: &str = "<empty>";

/// One node of a captured call tree for a single logical invocation.
///
/// A tree is built by one [`CallStack`](super::CallStack) and handed off by value
/// to the pipeline once its outermost scope exits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    /// Operation identifier.
    pub id: String,

    /// Wall-clock duration in milliseconds.
    pub elapsed: u64,

    /// Whether the invocation completed with an error.
    #[serde(default)]
    pub failed: bool,

    /// Nested invocations, in completion order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Context>,
}

impl Context {
    /// Create a leaf context.
    pub fn new(id: impl Into<String>, elapsed: u64) -> Self {
        Self {
            id: id.into(),
            elapsed,
            failed: false,
            children: Vec::new(),
        }
    }

    /// Builder-style failed flag.
    pub fn failed(mut self, failed: bool) -> Self {
        self.failed = failed;
        self
    }

    /// Builder-style child append.
    pub fn with_child(mut self, child: Context) -> Self {
        self.children.push(child);
        self
    }

    /// Append a completed child.
    pub fn add_child(&mut self, child: Context) {
        self.children.push(child);
    }

    /// Count nodes in this tree, including the root.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(Context::node_count).sum::<usize>()
    }
}

/// Normalize a raw operation id.
///
/// Trims whitespace, maps absent and blank ids to sentinels, and truncates to
/// `max_len` characters.
pub fn normalize_id(id: Option<&str>, max_len: usize) -> String {
    let Some(id) = id else {
        return NULL_ID.to_string();
    };
    let id = id.trim();
    if id.is_empty() {
        return EMPTY_ID.to_string();
    }
    match id.char_indices().nth(max_len) {
        Some((cut, _)) => id[..cut].to_string(),
        None => id.to_string(),
    }
}
