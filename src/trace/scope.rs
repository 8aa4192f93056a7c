//! Trace scope: the carrier threaded through one unit of work.
//!
//! A [`TraceScope`] holds the trace id, the action name and the two mutable
//! accumulators (context and stats) of the record that owns it. Nested calls
//! inside the same unit take `&mut TraceScope` and write into the same maps.
//!
//! A scope is never shared between concurrently scheduled units. It has no
//! `Clone`; work scheduled elsewhere gets only a [`ScopeLink`] (id and action)
//! and builds a fresh scope with empty maps from it.

use std::collections::BTreeMap;

use crate::trace::mask::{is_masked, MASK};

/// Ordered multi-value context entries.
pub type ContextMap = BTreeMap<String, Vec<String>>;

/// Numeric stats, last write wins.
pub type StatMap = BTreeMap<String, f64>;

/// Per-unit carrier of id, action, context and stats.
#[derive(Debug, Default)]
pub struct TraceScope {
    id: String,
    action: String,
    context: ContextMap,
    stats: StatMap,
}

/// Linkage fields copied from a parent scope into a child record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeLink {
    pub id: String,
    pub action: String,
}

impl ScopeLink {
    /// Whether this link carries a root action to chain from.
    pub fn has_root(&self) -> bool {
        !self.action.is_empty()
    }
}

impl TraceScope {
    pub(crate) fn new(id: String, action: String) -> Self {
        Self {
            id,
            action,
            context: ContextMap::new(),
            stats: StatMap::new(),
        }
    }

    /// A scope not attached to any record (no id, no action).
    pub fn detached() -> Self {
        Self::default()
    }

    /// Trace id of the owning record; empty when detached.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Action of the owning record; empty when detached.
    pub fn action(&self) -> &str {
        &self.action
    }

    pub(crate) fn set_action(&mut self, action: String) {
        self.action = action;
    }

    /// Copy the linkage fields for a child unit.
    pub fn link(&self) -> ScopeLink {
        ScopeLink {
            id: self.id.clone(),
            action: self.action.clone(),
        }
    }

    /// Append values under `key`, redacting them if the key is masked.
    pub fn put_context<I, S>(&mut self, key: &str, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let masked = is_masked(key);
        let entry = self.context.entry(key.to_string()).or_default();
        for value in values {
            if masked {
                entry.push(MASK.to_string());
            } else {
                entry.push(value.into());
            }
        }
    }

    /// Values recorded under `key`.
    pub fn context(&self, key: &str) -> Option<&[String]> {
        self.context.get(key).map(Vec::as_slice)
    }

    /// All context entries.
    pub fn context_map(&self) -> &ContextMap {
        &self.context
    }

    /// Overwrite a stat.
    pub fn stat(&mut self, key: &str, value: f64) {
        self.stats.insert(key.to_string(), value);
    }

    /// Read a stat, `0.0` when absent.
    pub fn get_stat(&self, key: &str) -> f64 {
        self.stats.get(key).copied().unwrap_or_default()
    }

    /// Read-then-write accumulate. Not atomic; the scope has a single owner.
    pub fn increase_stat(&mut self, key: &str, delta: f64) {
        let current = self.get_stat(key);
        self.stat(key, current + delta);
    }

    /// All stats.
    pub fn stat_map(&self) -> &StatMap {
        &self.stats
    }

    /// Drop both accumulators, returning what they held.
    pub(crate) fn take_maps(&mut self) -> (ContextMap, StatMap) {
        (
            std::mem::take(&mut self.context),
            std::mem::take(&mut self.stats),
        )
    }
}
