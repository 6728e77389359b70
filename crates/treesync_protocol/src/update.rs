//! Coalesced updates and key-membership deltas.

use crate::error::PathError;
use crate::node::{Located, Node};
use crate::path::Path;
use serde::{Deserialize, Serialize};

/// One coalesced mutation message.
///
/// # Ordering contract
///
/// Consumers must apply every path in `delete` before merging `change`. A
/// path may appear in both when it was deleted and recreated inside one
/// batching window; applying in this order leaves the recreated value in
/// place. `Store::apply` in `treesync_core` implements this contract.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchedUpdate {
    /// Changed sub-tree.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change: Option<Node>,
    /// Deleted paths.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub delete: Vec<Path>,
}

impl BatchedUpdate {
    /// Creates an update carrying only a change.
    pub fn change(node: Node) -> Self {
        Self {
            change: Some(node),
            delete: Vec::new(),
        }
    }

    /// Creates an update carrying only deletions.
    pub fn delete(paths: Vec<Path>) -> Self {
        Self {
            change: None,
            delete: paths,
        }
    }

    /// Returns true if the update carries nothing.
    pub fn is_empty(&self) -> bool {
        self.change.is_none() && self.delete.is_empty()
    }

    /// Narrows a root-relative update to what a subscriber at `base` sees.
    ///
    /// The result is relative to `base`: deleted paths at or below `base`
    /// are stripped of the prefix, and a deleted ancestor, or a leaf written
    /// over an ancestor, turns into a delete of `""` (the base itself).
    pub fn scoped(&self, base: &Path) -> BatchedUpdate {
        let mut scoped = BatchedUpdate::default();

        for path in &self.delete {
            let relative = if path.is_ancestor_of(base) {
                Some(Path::root())
            } else {
                path.strip_prefix(base)
            };
            if let Some(relative) = relative {
                if !scoped.delete.contains(&relative) {
                    scoped.delete.push(relative);
                }
            }
        }

        if let Some(change) = &self.change {
            match change.locate(base) {
                Located::Found(node) => scoped.change = Some(node.clone()),
                Located::Shadowed => {
                    if !scoped.delete.contains(&Path::root()) {
                        scoped.delete.push(Path::root());
                    }
                }
                Located::Absent => {}
            }
        }

        scoped
    }

    /// Turns an update relative to `base` back into a root-relative one.
    pub fn rebase(self, base: &Path) -> Result<BatchedUpdate, PathError> {
        let delete = self
            .delete
            .iter()
            .map(|relative| base.join_path(relative))
            .collect::<Result<Vec<_>, _>>()?;
        let change = match self.change {
            Some(node) => Some(Node::wrap(base.literal()?, node)),
            None => None,
        };
        Ok(BatchedUpdate { change, delete })
    }
}

/// A change in the set of child keys under a path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDelta {
    /// Keys that appeared.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub added: Vec<String>,
    /// Keys that disappeared.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deleted: Vec<String>,
}

impl KeyDelta {
    /// Returns true if no key changed.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.deleted.is_empty()
    }
}
