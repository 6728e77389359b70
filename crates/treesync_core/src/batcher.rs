//! Coalescing of outbound mutations.

use crate::store::Store;
use std::collections::BTreeSet;
use treesync_protocol::{BatchedUpdate, Node, Path};

/// One queued mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOp {
    /// A root-relative diff.
    Change(Node),
    /// A deleted path.
    Delete(Path),
}

/// A run of mutations inside one batching window.
///
/// Changes merge into a scratch store, so repeated writes to a leaf collapse
/// to the last one. Deletes remove from the scratch store and are remembered
/// so the receiver can apply them before the change.
#[derive(Debug, Default)]
pub struct PendingUpdate {
    scratch: Store,
    deletions: BTreeSet<Path>,
}

impl PendingUpdate {
    /// Folds one mutation into the window.
    pub fn push(&mut self, op: UpdateOp) {
        match op {
            UpdateOp::Change(diff) => {
                self.scratch.put(diff);
            }
            UpdateOp::Delete(path) => {
                // wildcards never reach the batcher; a failed delete is a no-op
                if self.scratch.del(&path).is_ok() {
                    self.deletions.insert(path);
                }
            }
        }
    }

    /// Turns the window into one update message.
    pub fn into_update(self) -> BatchedUpdate {
        let change = if self.scratch.is_empty() {
            None
        } else {
            Some(self.scratch.root().clone())
        };
        BatchedUpdate {
            change,
            delete: self.deletions.into_iter().collect(),
        }
    }
}
