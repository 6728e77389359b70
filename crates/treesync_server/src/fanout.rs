//! Data delivered through the server's subscription fan-out.

use crate::connection::ConnectionId;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use treesync_core::{NotifyOptions, Store};
use treesync_protocol::{BatchedUpdate, KeyDelta, Path};

/// What a server-side listener receives after a mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum Fanout {
    /// The part of the update visible from the listener's path.
    Update {
        /// The connection that sent the update, if any.
        origin: Option<ConnectionId>,
        /// Update relative to the listener's path.
        update: BatchedUpdate,
    },
    /// Current keys under a wildcard listener's prefix.
    Keys(BTreeSet<String>),
}

impl Fanout {
    /// Reads the data for a listener at `listener` after `update` was
    /// applied to `store`.
    ///
    /// Literal listeners get the scoped update and are skipped when it is
    /// empty. Wildcard listeners get the key set of their anchor.
    pub(crate) fn for_listener(
        store: &Store,
        listener: &Path,
        origin: Option<ConnectionId>,
        update: &BatchedUpdate,
    ) -> Option<Fanout> {
        if listener.is_wildcard() {
            return Some(Fanout::Keys(current_keys(store, &listener.anchor())));
        }
        let scoped = update.scoped(listener);
        if scoped.is_empty() {
            return None;
        }
        Some(Fanout::Update {
            origin,
            update: scoped,
        })
    }
}

/// Returns the keys at `anchor`, empty when it holds no object.
pub(crate) fn current_keys(store: &Store, anchor: &Path) -> BTreeSet<String> {
    store
        .keys(anchor)
        .map(|keys| keys.into_iter().collect())
        .unwrap_or_default()
}

/// Paths an applied update touched, with how far each notification reaches.
///
/// The change must be the diff the store reported, so unchanged leaves are
/// not touched.
pub(crate) fn touched_paths(applied: &BatchedUpdate) -> Vec<(Path, NotifyOptions)> {
    let mut paths: Vec<Path> = applied.delete.clone();
    if let Some(changed) = &applied.change {
        changed.changed_paths(&Path::root(), &mut paths);
    }
    paths
        .into_iter()
        .map(|path| (path, NotifyOptions::both()))
        .collect()
}

/// The keys one key subscription has reported to its connection.
pub(crate) struct KeyLedger {
    known: Mutex<BTreeSet<String>>,
}

impl KeyLedger {
    pub(crate) fn new(initial: BTreeSet<String>) -> Self {
        Self {
            known: Mutex::new(initial),
        }
    }

    /// Records `current` and returns how it differs from the last record.
    pub(crate) fn advance(&self, current: &BTreeSet<String>) -> KeyDelta {
        let mut known = self.known.lock();
        let delta = KeyDelta {
            added: current.difference(&known).cloned().collect(),
            deleted: known.difference(current).cloned().collect(),
        };
        known.clone_from(current);
        delta
    }
}
