//! Notification payloads and per-subscription key tracking.

use std::collections::BTreeSet;
use treesync_protocol::{KeyDelta, Node};

/// What a client listener receives.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// The current value at a literal path; `None` when absent or unknown.
    Value(Option<Node>),
    /// A key-membership change for a wildcard path.
    Keys(KeyChange),
}

impl Notification {
    /// Returns the value, if this is a value notification holding one.
    pub fn value(&self) -> Option<&Node> {
        match self {
            Notification::Value(node) => node.as_ref(),
            Notification::Keys(_) => None,
        }
    }
}

/// A change in the keys under a wildcard path's prefix.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyChange {
    /// The complete key set, or `None` when the prefix holds no object.
    Snapshot(Option<Vec<String>>),
    /// Keys present in the local cache, which may not hold every key.
    Observed(Vec<String>),
    /// A delta reported by the server.
    Delta(KeyDelta),
}

/// The set of keys an `each` subscription has already reported.
#[derive(Debug, Default)]
pub struct KeyTracker {
    handled: BTreeSet<String>,
}

impl KeyTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a change and returns the keys seen for the first time.
    pub fn apply(&mut self, change: &KeyChange) -> Vec<String> {
        match change {
            KeyChange::Snapshot(Some(keys)) => {
                let fresh = self.fresh(keys);
                self.handled = keys.iter().cloned().collect();
                fresh
            }
            KeyChange::Snapshot(None) => {
                self.handled.clear();
                Vec::new()
            }
            KeyChange::Observed(keys) => {
                let fresh = self.fresh(keys);
                self.handled.extend(fresh.iter().cloned());
                fresh
            }
            KeyChange::Delta(delta) => {
                for key in &delta.deleted {
                    self.handled.remove(key);
                }
                let fresh = self.fresh(&delta.added);
                self.handled.extend(fresh.iter().cloned());
                fresh
            }
        }
    }

    /// Returns true if `key` was already reported.
    pub fn contains(&self, key: &str) -> bool {
        self.handled.contains(key)
    }

    fn fresh(&self, keys: &[String]) -> Vec<String> {
        let mut seen = BTreeSet::new();
        keys.iter()
            .filter(|key| !self.handled.contains(*key) && seen.insert(key.as_str()))
            .cloned()
            .collect()
    }
}
