//! Path-addressed tree store with structural diff and merge.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;
use treesync_protocol::{BatchedUpdate, Node, NodeValue, Path, PathError};

/// A store shared between a coordinator and its collaborators.
///
/// Coordinators never create their own store; the caller injects one, so
/// any number of independent coordinators can live in one process.
pub type SharedStore = Arc<RwLock<Store>>;

/// An in-memory tree rooted at an object node.
///
/// The store is mutated only through [`Store::put`], [`Store::del`] and
/// [`Store::apply`]. Each of these runs to completion before the next one
/// starts, so merging needs no finer-grained locking.
#[derive(Debug, Clone, PartialEq)]
pub struct Store {
    root: Node,
}

impl Store {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self { root: Node::empty() }
    }

    /// Creates an empty store ready to be shared.
    pub fn shared() -> SharedStore {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Creates a store holding a plain JSON object.
    pub fn from_json(value: Value) -> Result<Self, PathError> {
        let mut store = Self::new();
        store.put(Node::from_json(value)?);
        Ok(store)
    }

    /// Returns the root node.
    pub fn root(&self) -> &Node {
        &self.root
    }

    /// Returns true if the root has no children.
    pub fn is_empty(&self) -> bool {
        self.root.is_empty_object()
    }

    /// Reads the node at `path`.
    ///
    /// Absent paths, paths running through a leaf, and values recorded as
    /// unknown (`null` leaves) all read as `None`. The root path returns the
    /// whole tree.
    pub fn get(&self, path: &Path) -> Option<&Node> {
        let node = self.root.get(path)?;
        match &node.value {
            NodeValue::Leaf(Value::Null) => None,
            _ => Some(node),
        }
    }

    /// Returns the child keys at `path` if it holds an object.
    pub fn keys(&self, path: &Path) -> Option<Vec<String>> {
        self.get(path).and_then(Node::keys)
    }

    /// Merges a root-relative diff and returns what actually changed.
    ///
    /// Returns `None` when the store already contained everything in `diff`.
    pub fn put(&mut self, diff: Node) -> Option<Node> {
        if !diff.is_object() {
            warn!("ignoring non-object diff at the store root");
            return None;
        }
        merge(&mut self.root, diff)
    }

    /// Merges `node` at `path`.
    pub fn put_at(&mut self, path: &Path, node: Node) -> Result<Option<Node>, PathError> {
        Ok(self.put(Node::wrap(path.literal()?, node)))
    }

    /// Removes the value at `path` from its parent.
    ///
    /// Deleting the root clears every top-level key but keeps the root node.
    pub fn del(&mut self, path: &Path) -> Result<(), PathError> {
        path.literal()?;
        let (Some(parent), Some(key)) = (path.parent(), path.last()) else {
            match &mut self.root.value {
                NodeValue::Object(children) => children.clear(),
                value => *value = NodeValue::Object(BTreeMap::new()),
            }
            return Ok(());
        };
        if let Some(NodeValue::Object(children)) = self.node_mut(&parent).map(|n| &mut n.value) {
            children.remove(key);
        }
        Ok(())
    }

    /// Applies a root-relative update, deletes first.
    ///
    /// Returns the changed sub-tree produced by merging `update.change`.
    pub fn apply(&mut self, update: BatchedUpdate) -> Result<Option<Node>, PathError> {
        for path in &update.delete {
            self.del(path)?;
        }
        Ok(update.change.and_then(|change| self.put(change)))
    }

    fn node_mut(&mut self, path: &Path) -> Option<&mut Node> {
        let mut node = &mut self.root;
        for segment in path.segments() {
            node = match &mut node.value {
                NodeValue::Object(children) => children.get_mut(segment)?,
                NodeValue::Leaf(_) => return None,
            };
        }
        Some(node)
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

/// Merges `diff` into `target` and returns the part of `diff` that changed
/// something.
///
/// Leaves are overwritten when the value or metadata differs. Objects recurse
/// and keep a key only when its sub-diff is non-empty. A leaf replacing an
/// object, or the reverse, counts as a full change. New keys always count.
pub fn merge(target: &mut Node, diff: Node) -> Option<Node> {
    let meta_changed = diff.meta.is_some() && diff.meta != target.meta;

    match (&mut target.value, diff.value) {
        (NodeValue::Object(children), NodeValue::Object(incoming)) => {
            let mut changed = BTreeMap::new();
            for (key, sub) in incoming {
                match children.get_mut(&key) {
                    Some(child) => {
                        if let Some(sub_changed) = merge(child, sub) {
                            changed.insert(key, sub_changed);
                        }
                    }
                    None => {
                        changed.insert(key.clone(), sub.clone());
                        children.insert(key, sub);
                    }
                }
            }
            if meta_changed {
                target.meta = diff.meta.clone();
            }
            if changed.is_empty() && !meta_changed {
                return None;
            }
            Some(Node {
                value: NodeValue::Object(changed),
                meta: if meta_changed { diff.meta } else { None },
            })
        }
        (NodeValue::Leaf(current), NodeValue::Leaf(incoming)) => {
            if *current == incoming && !meta_changed {
                return None;
            }
            *current = incoming.clone();
            if meta_changed {
                target.meta = diff.meta.clone();
            }
            Some(Node {
                value: NodeValue::Leaf(incoming),
                meta: diff.meta,
            })
        }
        (_, value) => {
            let replacement = Node {
                value,
                meta: diff.meta,
            };
            *target = replacement.clone();
            Some(replacement)
        }
    }
}

/// Computes what merging `next` over `base` would change, without mutating.
///
/// This is [`merge`] run against a read-only base; `merge(base, next)` returns
/// the same result.
pub fn diff(base: Option<&Node>, next: &Node) -> Option<Node> {
    let Some(base) = base else {
        return Some(next.clone());
    };
    let meta_changed = next.meta.is_some() && next.meta != base.meta;

    match (&base.value, &next.value) {
        (NodeValue::Object(current), NodeValue::Object(incoming)) => {
            let changed: BTreeMap<String, Node> = incoming
                .iter()
                .filter_map(|(key, sub)| diff(current.get(key), sub).map(|d| (key.clone(), d)))
                .collect();
            if changed.is_empty() && !meta_changed {
                return None;
            }
            Some(Node {
                value: NodeValue::Object(changed),
                meta: if meta_changed { next.meta.clone() } else { None },
            })
        }
        (NodeValue::Leaf(current), NodeValue::Leaf(incoming)) => {
            if current == incoming && !meta_changed {
                None
            } else {
                Some(next.clone())
            }
        }
        _ => Some(next.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use treesync_protocol::Meta;

    fn p(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    fn node(value: Value) -> Node {
        Node::from_json(value).unwrap()
    }

    fn store(value: Value) -> Store {
        Store::from_json(value).unwrap()
    }

    #[test]
    fn get_handles_absent_leaf_and_unknown() {
        let store = store(json!({"a": {"b": 1}, "u": null}));
        assert_eq!(store.get(&p("a/b")).map(Node::to_json), Some(json!(1)));
        assert!(store.get(&p("a/c")).is_none());
        assert!(store.get(&p("a/b/c")).is_none());
        assert!(store.get(&p("u")).is_none());
        assert_eq!(
            store.get(&Path::root()).map(Node::to_json),
            Some(json!({"a": {"b": 1}, "u": null}))
        );
    }

    #[test]
    fn put_returns_only_changes() {
        let mut store = store(json!({"a": {"b": 1, "c": 2}, "d": 3}));
        let changed = store.put(node(json!({"a": {"b": 1, "c": 5}, "d": 3})));
        assert_eq!(changed.map(|n| n.to_json()), Some(json!({"a": {"c": 5}})));
        assert_eq!(
            store.root().to_json(),
            json!({"a": {"b": 1, "c": 5}, "d": 3})
        );
    }

    #[test]
    fn put_same_diff_twice_is_empty() {
        let mut store = Store::new();
        let diff = node(json!({"players": {"1": {"name": "Ralph"}}}));
        assert!(store.put(diff.clone()).is_some());
        assert!(store.put(diff).is_none());
    }

    #[test]
    fn shape_change_is_a_full_change() {
        let mut store = store(json!({"a": {"b": {"c": 1}}}));
        let changed = store.put(node(json!({"a": 7})));
        assert_eq!(changed.map(|n| n.to_json()), Some(json!({"a": 7})));

        let changed = store.put(node(json!({"a": {"x": 1}})));
        assert_eq!(changed.map(|n| n.to_json()), Some(json!({"a": {"x": 1}})));
    }

    #[test]
    fn meta_change_counts() {
        let mut store = store(json!({"a": 1}));
        let mut meta = Meta::new();
        meta.insert("by".into(), json!("client-1"));
        let diff = Node::wrap(&p("a"), Node::from_json(json!(1)).unwrap().with_meta(meta.clone()));

        let changed = store.put(diff.clone()).unwrap();
        assert_eq!(changed.get(&p("a")).unwrap().meta, Some(meta));
        assert!(store.put(diff).is_none());
    }

    #[test]
    fn root_leaf_diff_is_ignored() {
        let mut store = store(json!({"a": 1}));
        assert!(store.put(Node::from_json(json!(5)).unwrap()).is_none());
        assert_eq!(store.root().to_json(), json!({"a": 1}));
    }

    #[test]
    fn del_removes_terminal_key() {
        let mut store = store(json!({"a": {"b": 1, "c": 2}}));
        store.del(&p("a/b")).unwrap();
        assert_eq!(store.root().to_json(), json!({"a": {"c": 2}}));

        // absent and through-leaf deletes are no-ops
        store.del(&p("x/y")).unwrap();
        store.del(&p("a/c/d")).unwrap();
        assert_eq!(store.root().to_json(), json!({"a": {"c": 2}}));
    }

    #[test]
    fn del_root_clears_top_level() {
        let mut store = store(json!({"a": 1, "b": {"c": 2}}));
        store.del(&Path::root()).unwrap();
        assert!(store.is_empty());
        assert!(store.root().is_object());
    }

    #[test]
    fn wildcard_paths_are_rejected() {
        let mut store = Store::new();
        assert!(store.del(&p("a/*")).is_err());
        assert!(store.put_at(&p("a/*"), Node::from_json(json!(1)).unwrap()).is_err());
    }

    #[test]
    fn apply_deletes_before_change() {
        let mut store = store(json!({"a": {"old": 1}}));
        let update = BatchedUpdate {
            change: Some(node(json!({"a": {"new": 2}}))),
            delete: vec![p("a")],
        };
        store.apply(update).unwrap();
        assert_eq!(store.root().to_json(), json!({"a": {"new": 2}}));
    }

    #[test]
    fn diff_agrees_with_merge() {
        let base = node(json!({"a": {"b": 1, "c": [1, 2]}, "d": "x"}));
        let next = node(json!({"a": {"b": 2, "c": [1, 2]}, "e": true}));

        let computed = diff(Some(&base), &next);
        let mut merged = base.clone();
        assert_eq!(computed, merge(&mut merged, next));
        assert_eq!(
            computed.map(|n| n.to_json()),
            Some(json!({"a": {"b": 2}, "e": true}))
        );
        assert!(diff(Some(&merged), &node(json!({"d": "x"}))).is_none());
    }

    fn tree() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            (0i64..3).prop_map(Value::from),
            any::<bool>().prop_map(Value::from),
        ];
        leaf.prop_recursive(3, 24, 3, |inner| {
            prop::collection::btree_map(
                prop_oneof![Just("a"), Just("b"), Just("c")].prop_map(String::from),
                inner,
                1..3,
            )
            .prop_map(|map| Value::Object(map.into_iter().collect()))
        })
    }

    fn object_tree() -> impl Strategy<Value = Value> {
        tree().prop_map(|value| match value {
            Value::Object(_) => value,
            leaf => json!({ "a": leaf }),
        })
    }

    fn leaves(node: &Node, base: &Path, out: &mut Vec<(Path, Value)>) {
        match &node.value {
            NodeValue::Leaf(value) => out.push((base.clone(), value.clone())),
            NodeValue::Object(children) => {
                for (key, child) in children {
                    leaves(child, &base.child(key), out);
                }
            }
        }
    }

    fn leaf_at(node: &Node, path: &Path) -> Option<Value> {
        match node.get(path).map(|n| &n.value) {
            Some(NodeValue::Leaf(value)) => Some(value.clone()),
            _ => None,
        }
    }

    proptest! {
        #[test]
        fn merge_is_idempotent(a in object_tree(), b in object_tree()) {
            let mut store = Store::from_json(a).unwrap();
            let diff = node(b);
            store.put(diff.clone());
            prop_assert!(store.put(diff).is_none());
        }

        #[test]
        fn put_reports_exactly_the_differing_leaves(a in object_tree(), b in object_tree()) {
            let mut store = Store::from_json(a).unwrap();
            let before = store.root().clone();
            let next = node(b);
            let changed = store.put(next.clone()).unwrap_or_else(Node::empty);

            let mut next_leaves = Vec::new();
            leaves(&next, &Path::root(), &mut next_leaves);
            for (path, value) in &next_leaves {
                let differs = leaf_at(&before, path).as_ref() != Some(value);
                prop_assert_eq!(differs, leaf_at(&changed, path).is_some());
                let stored = leaf_at(store.root(), path);
                prop_assert_eq!(stored.as_ref(), Some(value));
            }

            let mut changed_leaves = Vec::new();
            leaves(&changed, &Path::root(), &mut changed_leaves);
            for (path, value) in changed_leaves {
                prop_assert_eq!(leaf_at(&next, &path), Some(value));
            }
        }
    }
}
