//! The recursive node model shared by stores and the wire format.

use crate::error::{PathError, ProtocolError, ProtocolResult};
use crate::path::{Path, WILDCARD};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Metadata attached to a node.
pub type Meta = Map<String, Value>;

/// The payload of a node: either a child map or a terminal value.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeValue {
    /// A primitive or an array. Arrays are opaque and never diffed per element.
    Leaf(Value),
    /// Child nodes keyed by path segment.
    Object(BTreeMap<String, Node>),
}

/// A node of the synchronized tree.
///
/// On the wire a node is `{"value": …, "meta"?: {…}}`, where a JSON object in
/// `value` is always a map of child nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Node {
    /// The node payload.
    pub value: NodeValue,
    /// Optional metadata, independent of the node's shape.
    pub meta: Option<Meta>,
}

impl Node {
    /// Creates an object node with no children.
    pub fn empty() -> Self {
        Self::object(BTreeMap::new())
    }

    /// Creates an object node from a child map.
    pub fn object(children: BTreeMap<String, Node>) -> Self {
        Self {
            value: NodeValue::Object(children),
            meta: None,
        }
    }

    /// Attaches metadata.
    pub fn with_meta(mut self, meta: Meta) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Converts a plain JSON value into a node tree.
    pub fn from_json(value: Value) -> Result<Self, PathError> {
        match value {
            Value::Object(map) => {
                let mut children = BTreeMap::new();
                for (key, child) in map {
                    validate_key(&key)?;
                    children.insert(key, Self::from_json(child)?);
                }
                Ok(Self::object(children))
            }
            other => Ok(Self {
                value: NodeValue::Leaf(other),
                meta: None,
            }),
        }
    }

    /// Converts this tree back into plain JSON, dropping metadata.
    pub fn to_json(&self) -> Value {
        match &self.value {
            NodeValue::Leaf(value) => value.clone(),
            NodeValue::Object(children) => Value::Object(
                children
                    .iter()
                    .map(|(key, child)| (key.clone(), child.to_json()))
                    .collect(),
            ),
        }
    }

    /// Nests `node` under `path`, producing a root-relative diff.
    pub fn wrap(path: &Path, node: Node) -> Node {
        path.segments().iter().rev().fold(node, |inner, segment| {
            let mut children = BTreeMap::new();
            children.insert(segment.clone(), inner);
            Node::object(children)
        })
    }

    /// Returns true if this node holds a child map.
    pub fn is_object(&self) -> bool {
        matches!(self.value, NodeValue::Object(_))
    }

    /// Returns true for an object node with no children.
    pub fn is_empty_object(&self) -> bool {
        matches!(&self.value, NodeValue::Object(children) if children.is_empty())
    }

    /// Returns the child map, if this is an object node.
    pub fn children(&self) -> Option<&BTreeMap<String, Node>> {
        match &self.value {
            NodeValue::Object(children) => Some(children),
            NodeValue::Leaf(_) => None,
        }
    }

    /// Returns the child keys, if this is an object node.
    pub fn keys(&self) -> Option<Vec<String>> {
        self.children().map(|children| children.keys().cloned().collect())
    }

    /// Follows `path` from this node. Paths through a leaf resolve to `None`.
    pub fn get(&self, path: &Path) -> Option<&Node> {
        let mut node = self;
        for segment in path.segments() {
            node = node.children()?.get(segment)?;
        }
        Some(node)
    }

    /// Resolves `path` and reports whether a leaf overwrite hides it.
    pub fn locate(&self, path: &Path) -> Located<'_> {
        let mut node = self;
        for segment in path.segments() {
            match &node.value {
                NodeValue::Object(children) => match children.get(segment) {
                    Some(child) => node = child,
                    None => return Located::Absent,
                },
                NodeValue::Leaf(_) => return Located::Shadowed,
            }
        }
        Located::Found(node)
    }

    /// Collects the paths a diff touches: leaves, emptied objects and nodes
    /// whose metadata changed.
    pub fn changed_paths(&self, base: &Path, out: &mut Vec<Path>) {
        match &self.value {
            NodeValue::Leaf(_) => out.push(base.clone()),
            NodeValue::Object(children) => {
                if children.is_empty() || self.meta.is_some() {
                    out.push(base.clone());
                }
                for (key, child) in children {
                    child.changed_paths(&base.child(key), out);
                }
            }
        }
    }

    /// Collects the outermost paths present in `old` but missing from `new`.
    ///
    /// Only object-to-object pairs contribute; a shape change replaces the
    /// whole sub-tree and needs no explicit delete.
    pub fn removed_paths(old: &Node, new: &Node, base: &Path, out: &mut Vec<Path>) {
        let (Some(old_children), Some(new_children)) = (old.children(), new.children()) else {
            return;
        };
        for (key, old_child) in old_children {
            match new_children.get(key) {
                Some(new_child) => {
                    Self::removed_paths(old_child, new_child, &base.child(key), out)
                }
                None => out.push(base.child(key)),
            }
        }
    }
}

/// Outcome of [`Node::locate`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Located<'a> {
    /// The path resolves to this node.
    Found(&'a Node),
    /// Some segment is missing from an object node.
    Absent,
    /// A leaf sits on the way to the path.
    Shadowed,
}

fn validate_key(key: &str) -> Result<(), PathError> {
    if key.is_empty() || key == WILDCARD || key.contains('/') {
        return Err(PathError::InvalidKey {
            key: key.to_owned(),
        });
    }
    Ok(())
}

impl TryFrom<Value> for Node {
    type Error = ProtocolError;

    fn try_from(value: Value) -> ProtocolResult<Self> {
        let Value::Object(mut fields) = value else {
            return Err(ProtocolError::InvalidNode("expected an object".into()));
        };

        let meta = match fields.remove("meta") {
            None | Some(Value::Null) => None,
            Some(Value::Object(meta)) => Some(meta),
            Some(_) => {
                return Err(ProtocolError::InvalidNode("meta must be an object".into()));
            }
        };

        let value = match fields.remove("value") {
            Some(Value::Object(children)) => {
                let mut decoded = BTreeMap::new();
                for (key, child) in children {
                    validate_key(&key)?;
                    decoded.insert(key, Node::try_from(child)?);
                }
                NodeValue::Object(decoded)
            }
            Some(leaf) => NodeValue::Leaf(leaf),
            None => return Err(ProtocolError::InvalidNode("missing value".into())),
        };

        Ok(Self { value, meta })
    }
}

impl From<Node> for Value {
    fn from(node: Node) -> Self {
        let mut fields = Map::new();
        let value = match node.value {
            NodeValue::Leaf(value) => value,
            NodeValue::Object(children) => Value::Object(
                children
                    .into_iter()
                    .map(|(key, child)| (key, Value::from(child)))
                    .collect(),
            ),
        };
        fields.insert("value".into(), value);
        if let Some(meta) = node.meta {
            fields.insert("meta".into(), Value::Object(meta));
        }
        Value::Object(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn p(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    #[test]
    fn from_json_builds_child_maps() {
        let node = Node::from_json(json!({"name": "Ralph", "tags": [1, 2]})).unwrap();
        assert!(node.is_object());
        assert_eq!(
            node.get(&p("name")).map(Node::to_json),
            Some(json!("Ralph"))
        );
        // arrays stay opaque
        assert!(!node.get(&p("tags")).unwrap().is_object());
        assert_eq!(node.to_json(), json!({"name": "Ralph", "tags": [1, 2]}));
    }

    #[test]
    fn from_json_rejects_bad_keys() {
        assert!(Node::from_json(json!({"a/b": 1})).is_err());
        assert!(Node::from_json(json!({"*": 1})).is_err());
        // a bad key anywhere in the tree fails the whole conversion
        let err = Node::from_json(json!({"ok": {"deep": {"x/y": 1}}})).unwrap_err();
        assert_eq!(err, PathError::InvalidKey { key: "x/y".into() });
    }

    #[test]
    fn wire_format() {
        let node = Node::from_json(json!({"name": "Ralph"})).unwrap();
        let wire = serde_json::to_value(&node).unwrap();
        assert_eq!(wire, json!({"value": {"name": {"value": "Ralph"}}}));

        let decoded: Node = serde_json::from_value(wire).unwrap();
        assert_eq!(decoded, node);
    }

    #[test]
    fn wire_format_keeps_meta() {
        let mut meta = Meta::new();
        meta.insert("author".into(), json!("a"));
        let node = Node::from_json(json!(3)).unwrap().with_meta(meta);

        let wire = serde_json::to_value(&node).unwrap();
        assert_eq!(wire, json!({"value": 3, "meta": {"author": "a"}}));
        assert_eq!(serde_json::from_value::<Node>(wire).unwrap(), node);
    }

    #[test]
    fn wire_decode_errors() {
        assert!(serde_json::from_value::<Node>(json!(3)).is_err());
        assert!(serde_json::from_value::<Node>(json!({"meta": {}})).is_err());
        assert!(serde_json::from_value::<Node>(json!({"value": 1, "meta": 2})).is_err());
    }

    #[test]
    fn wrap_nests_under_path() {
        let wrapped = Node::wrap(&p("a/b"), Node::from_json(json!(1)).unwrap());
        assert_eq!(wrapped.to_json(), json!({"a": {"b": 1}}));
        assert_eq!(Node::wrap(&Path::root(), Node::from_json(json!(1)).unwrap()).to_json(), json!(1));
    }

    #[test]
    fn get_through_leaf_is_none() {
        let node = Node::from_json(json!({"a": 1})).unwrap();
        assert!(node.get(&p("a/b")).is_none());
        assert_eq!(node.locate(&p("a/b")), Located::Shadowed);
        assert_eq!(node.locate(&p("c")), Located::Absent);
    }

    #[test]
    fn changed_and_removed_paths() {
        let diff = Node::from_json(json!({"a": {"b": 1, "c": {}}, "d": 2})).unwrap();
        let mut touched = Vec::new();
        diff.changed_paths(&Path::root(), &mut touched);
        assert_eq!(touched, vec![p("a/b"), p("a/c"), p("d")]);

        let old = Node::from_json(json!({"x": {"y": 1, "z": 2}, "w": 1})).unwrap();
        let new = Node::from_json(json!({"x": {"y": 1}})).unwrap();
        let mut removed = Vec::new();
        Node::removed_paths(&old, &new, &p("root"), &mut removed);
        assert_eq!(removed, vec![p("root/w"), p("root/x/z")]);
    }
}
