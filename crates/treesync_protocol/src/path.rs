//! Path algebra.
//!
//! A [`Path`] is a normalized, `/`-separated key sequence. Normalization and
//! the wildcard check happen once, in [`Path::parse`]; every other operation
//! works on the validated segment list.

use crate::error::PathError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The segment that marks a key-membership path.
pub const WILDCARD: &str = "*";

const SEPARATOR: char = '/';

/// A normalized tree path.
///
/// The root path has no segments and renders as `""`. A wildcard path ends in
/// `*` and denotes the direct children of its prefix; it may only be used for
/// key-membership subscriptions.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Path {
    segments: Vec<String>,
}

impl Path {
    /// Returns the root path.
    pub fn root() -> Self {
        Self::default()
    }

    /// Parses and normalizes a path.
    ///
    /// Leading, trailing and repeated separators are dropped. A `*` segment is
    /// only accepted in the final position.
    pub fn parse(input: &str) -> Result<Self, PathError> {
        let segments: Vec<String> = input
            .split(SEPARATOR)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect();

        let misplaced = segments
            .iter()
            .rev()
            .skip(1)
            .any(|segment| segment == WILDCARD);
        if misplaced {
            return Err(PathError::MisplacedWildcard {
                path: input.to_owned(),
            });
        }

        Ok(Self { segments })
    }

    /// Returns the segments of this path.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Returns the number of segments.
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Returns true for the root path.
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Returns true if this path ends in `*`.
    pub fn is_wildcard(&self) -> bool {
        self.segments.last().is_some_and(|s| s == WILDCARD)
    }

    /// Returns this path if it can address a value, or an error for wildcards.
    pub fn literal(&self) -> Result<&Self, PathError> {
        if self.is_wildcard() {
            Err(PathError::WildcardLiteral {
                path: self.to_string(),
            })
        } else {
            Ok(self)
        }
    }

    /// Returns the final segment, if any.
    pub fn last(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Returns the parent path, or `None` for the root.
    pub fn parent(&self) -> Option<Path> {
        if self.is_root() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Appends a single literal key.
    pub fn join(&self, key: &str) -> Result<Path, PathError> {
        self.literal()?;
        if key.is_empty() || key == WILDCARD || key.contains(SEPARATOR) {
            return Err(PathError::InvalidKey {
                key: key.to_owned(),
            });
        }
        Ok(self.child(key))
    }

    /// Appends a relative path. The result is a wildcard when `relative` is.
    pub fn join_path(&self, relative: &Path) -> Result<Path, PathError> {
        self.literal()?;
        let mut segments = self.segments.clone();
        segments.extend(relative.segments.iter().cloned());
        Ok(Self { segments })
    }

    /// Appends a key taken from a stored node without re-validating it.
    ///
    /// Node keys are checked when nodes are decoded, so this is the fast path
    /// for walking a tree.
    pub fn child(&self, key: &str) -> Path {
        let mut segments = self.segments.clone();
        segments.push(key.to_owned());
        Self { segments }
    }

    /// Returns the key-membership path `self/*`.
    pub fn wildcard(&self) -> Result<Path, PathError> {
        self.literal()?;
        Ok(self.child(WILDCARD))
    }

    /// Returns the literal prefix: the path itself, or the part before `*`.
    pub fn anchor(&self) -> Path {
        if self.is_wildcard() {
            self.parent().unwrap_or_default()
        } else {
            self.clone()
        }
    }

    /// Returns true if `self` is a strict ancestor of `other`.
    pub fn is_ancestor_of(&self, other: &Path) -> bool {
        self.depth() < other.depth() && other.segments.starts_with(&self.segments)
    }

    /// Returns true if `self` is a strict descendant of `other`.
    pub fn is_descendant_of(&self, other: &Path) -> bool {
        other.is_ancestor_of(self)
    }

    /// Returns true if `self` equals `other` or is an ancestor of it.
    pub fn covers(&self, other: &Path) -> bool {
        other.segments.starts_with(&self.segments)
    }

    /// Returns `self` relative to `base`, if `base` covers it.
    pub fn strip_prefix(&self, base: &Path) -> Option<Path> {
        if !base.covers(self) {
            return None;
        }
        Some(Self {
            segments: self.segments[base.depth()..].to_vec(),
        })
    }

    /// Returns every strict ancestor, nearest first.
    pub fn ancestors(&self) -> impl Iterator<Item = Path> + '_ {
        (0..self.depth()).rev().map(move |len| Self {
            segments: self.segments[..len].to_vec(),
        })
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Path({:?})", self.to_string())
    }
}

impl FromStr for Path {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Path {
    type Error = PathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl TryFrom<&str> for Path {
    type Error = PathError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<Path> for String {
    fn from(path: Path) -> Self {
        path.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    #[test]
    fn parse_normalizes_separators() {
        assert_eq!(p("/a//b/").to_string(), "a/b");
        assert_eq!(p("a/b").depth(), 2);
        assert!(p("").is_root());
        assert!(p("///").is_root());
    }

    #[test]
    fn wildcard_only_in_last_position() {
        assert!(p("players/*").is_wildcard());
        assert!(p("*").is_wildcard());
        assert!(matches!(
            Path::parse("a/*/b"),
            Err(PathError::MisplacedWildcard { .. })
        ));
    }

    #[test]
    fn literal_rejects_wildcards() {
        assert!(p("a/b").literal().is_ok());
        assert!(matches!(
            p("a/*").literal(),
            Err(PathError::WildcardLiteral { .. })
        ));
    }

    #[test]
    fn join_validates_keys() {
        assert_eq!(p("a").join("b").unwrap(), p("a/b"));
        assert!(p("a").join("*").is_err());
        assert!(p("a").join("").is_err());
        assert!(p("a").join("b/c").is_err());
        assert!(p("a/*").join("b").is_err());
    }

    #[test]
    fn ancestry() {
        assert!(p("a").is_ancestor_of(&p("a/b")));
        assert!(p("").is_ancestor_of(&p("a")));
        assert!(!p("a").is_ancestor_of(&p("a")));
        assert!(!p("a").is_ancestor_of(&p("ab/c")));
        assert!(p("a/b/c").is_descendant_of(&p("a")));
        assert!(p("a").covers(&p("a")));
        assert!(p("a").covers(&p("a/*")));
        assert!(!p("a/*").covers(&p("a/b")));
    }

    #[test]
    fn strip_prefix_and_ancestors() {
        assert_eq!(p("a/b/c").strip_prefix(&p("a")), Some(p("b/c")));
        assert_eq!(p("a").strip_prefix(&p("a")), Some(Path::root()));
        assert_eq!(p("a").strip_prefix(&p("b")), None);

        let ancestors: Vec<String> = p("a/b/c").ancestors().map(|a| a.to_string()).collect();
        assert_eq!(ancestors, vec!["a/b", "a", ""]);
    }

    #[test]
    fn anchor_and_wildcard() {
        assert_eq!(p("a/*").anchor(), p("a"));
        assert_eq!(p("*").anchor(), Path::root());
        assert_eq!(p("a").wildcard().unwrap(), p("a/*"));
        assert!(p("a/*").wildcard().is_err());
    }

    #[test]
    fn serde_uses_string_form() {
        let json = serde_json::to_string(&p("a/b")).unwrap();
        assert_eq!(json, "\"a/b\"");
        let back: Path = serde_json::from_str("\"/x/y/\"").unwrap();
        assert_eq!(back, p("x/y"));
        assert!(serde_json::from_str::<Path>("\"*/x\"").is_err());
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        fn raw_path() -> impl Strategy<Value = String> {
            prop::collection::vec(
                prop_oneof![Just(String::new()), "[a-z0-9]{1,4}"],
                0..6,
            )
            .prop_map(|parts| parts.join("/"))
        }

        proptest! {
            #[test]
            fn display_then_parse_is_identity(raw in raw_path()) {
                let path = Path::parse(&raw).unwrap();
                prop_assert_eq!(Path::parse(&path.to_string()).unwrap(), path.clone());
                prop_assert!(path.segments().iter().all(|s| !s.is_empty()));
            }

            #[test]
            fn ancestors_cover_their_path(raw in raw_path()) {
                let path = Path::parse(&raw).unwrap();
                for ancestor in path.ancestors() {
                    prop_assert!(ancestor.is_ancestor_of(&path));
                    prop_assert!(ancestor.covers(&path));
                }
            }
        }
    }
}
