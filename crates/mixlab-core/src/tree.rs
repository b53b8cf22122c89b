//! Nested-key access over dynamically shaped option trees.
//!
//! An option tree is a `serde_json::Value`: scalars, sequences and
//! mappings, with mapping keys kept in insertion order. Paths can be
//! written as delimited strings (`"nodes.0.args"`) or built from typed
//! segments; both forms resolve the same way.

use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

pub const DEFAULT_DELIMITER: char = '.';

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Key(String),
    Index(usize),
}

impl Segment {
    fn as_index(&self) -> Option<usize> {
        match self {
            Segment::Index(i) => Some(*i),
            Segment::Key(k) => k.parse().ok(),
        }
    }

    fn as_key(&self) -> String {
        match self {
            Segment::Key(k) => k.clone(),
            Segment::Index(i) => i.to_string(),
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Key(k) => f.write_str(k),
            Segment::Index(i) => write!(f, "{}", i),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TreePath(Vec<Segment>);

impl TreePath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn parse(raw: &str, delimiter: char) -> Self {
        if raw.is_empty() {
            return Self::root();
        }
        Self(
            raw.split(delimiter)
                .map(|s| Segment::Key(s.to_string()))
                .collect(),
        )
    }

    pub fn segments(&self) -> &[Segment] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn child(&self, segment: Segment) -> Self {
        let mut next = self.0.clone();
        next.push(segment);
        Self(next)
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.0.push(Segment::Key(key.into()));
        self
    }

    pub fn index(mut self, index: usize) -> Self {
        self.0.push(Segment::Index(index));
        self
    }
}

impl fmt::Display for TreePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|s| s.to_string()).collect();
        f.write_str(&parts.join(&DEFAULT_DELIMITER.to_string()))
    }
}

impl From<&str> for TreePath {
    fn from(raw: &str) -> Self {
        TreePath::parse(raw, DEFAULT_DELIMITER)
    }
}

impl From<String> for TreePath {
    fn from(raw: String) -> Self {
        TreePath::parse(&raw, DEFAULT_DELIMITER)
    }
}

impl From<&TreePath> for TreePath {
    fn from(path: &TreePath) -> Self {
        path.clone()
    }
}

impl From<Vec<Segment>> for TreePath {
    fn from(segments: Vec<Segment>) -> Self {
        Self(segments)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum TreeError {
    #[error("value already present at '{0}' (replace_leaf not set)")]
    LeafExists(TreePath),
    #[error("non-mapping node at '{0}' blocks the path (replace_nondict_stems not set)")]
    NonDictStem(TreePath),
    #[error("index {index} out of bounds at '{path}'")]
    IndexOutOfBounds { path: TreePath, index: usize },
    #[error("segment '{segment}' is not a valid index at '{path}'")]
    NotAnIndex { path: TreePath, segment: String },
}

/// Overwrite permissions for [`set`]. Both default to refusing.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetPolicy {
    pub replace_leaf: bool,
    pub replace_nondict_stems: bool,
}

impl SetPolicy {
    pub fn replace_all() -> Self {
        Self {
            replace_leaf: true,
            replace_nondict_stems: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitOrder {
    Pre,
    Post,
}

fn child<'a>(node: &'a Value, segment: &Segment) -> Option<&'a Value> {
    match node {
        Value::Array(items) => segment.as_index().and_then(|i| items.get(i)),
        Value::Object(map) => map.get(&segment.as_key()),
        _ => None,
    }
}

pub fn get<'a>(tree: &'a Value, path: impl Into<TreePath>) -> Option<&'a Value> {
    let path = path.into();
    let mut cur = tree;
    for segment in path.segments() {
        cur = child(cur, segment)?;
    }
    Some(cur)
}

pub fn get_or<'a>(tree: &'a Value, path: impl Into<TreePath>, default: &'a Value) -> &'a Value {
    get(tree, path).unwrap_or(default)
}

pub fn set(
    tree: &mut Value,
    path: impl Into<TreePath>,
    value: Value,
    policy: SetPolicy,
) -> Result<(), TreeError> {
    let path = path.into();
    let Some((last, stems)) = path.segments().split_last() else {
        if !policy.replace_leaf {
            return Err(TreeError::LeafExists(path));
        }
        *tree = value;
        return Ok(());
    };

    let mut cur = tree;
    let mut walked = TreePath::root();
    for segment in stems {
        walked = walked.child(segment.clone());
        cur = descend_mut(cur, segment, &walked, policy)?;
    }

    match cur {
        Value::Object(map) => {
            let key = last.as_key();
            if map.contains_key(&key) && !policy.replace_leaf {
                return Err(TreeError::LeafExists(path));
            }
            map.insert(key, value);
            Ok(())
        }
        Value::Array(items) => {
            let idx = last.as_index().ok_or_else(|| TreeError::NotAnIndex {
                path: walked.clone(),
                segment: last.to_string(),
            })?;
            if idx == items.len() {
                items.push(value);
                return Ok(());
            }
            let slot = items
                .get_mut(idx)
                .ok_or(TreeError::IndexOutOfBounds {
                    path: walked.clone(),
                    index: idx,
                })?;
            if !policy.replace_leaf {
                return Err(TreeError::LeafExists(path));
            }
            *slot = value;
            Ok(())
        }
        other => {
            if !policy.replace_nondict_stems {
                return Err(TreeError::NonDictStem(walked));
            }
            let mut map = Map::new();
            map.insert(last.as_key(), value);
            *other = Value::Object(map);
            Ok(())
        }
    }
}

fn descend_mut<'a>(
    node: &'a mut Value,
    segment: &Segment,
    walked: &TreePath,
    policy: SetPolicy,
) -> Result<&'a mut Value, TreeError> {
    if node.is_array() {
        if let Some(idx) = segment.as_index() {
            return node
                .as_array_mut()
                .and_then(|items| items.get_mut(idx))
                .ok_or(TreeError::IndexOutOfBounds {
                    path: walked.clone(),
                    index: idx,
                });
        }
    }
    if !node.is_object() {
        if !policy.replace_nondict_stems {
            return Err(TreeError::NonDictStem(walked.clone()));
        }
        *node = Value::Object(Map::new());
    }
    let map = node
        .as_object_mut()
        .ok_or_else(|| TreeError::NonDictStem(walked.clone()))?;
    let entry = map
        .entry(segment.as_key())
        .or_insert_with(|| Value::Object(Map::new()));
    if !entry.is_object() && !entry.is_array() {
        if !policy.replace_nondict_stems {
            return Err(TreeError::NonDictStem(walked.clone()));
        }
        *entry = Value::Object(Map::new());
    }
    Ok(entry)
}

pub fn visit<F>(tree: &Value, order: VisitOrder, mut f: F)
where
    F: FnMut(&TreePath, &Value),
{
    visit_inner(tree, &TreePath::root(), order, &mut f);
}

fn visit_inner<F>(node: &Value, path: &TreePath, order: VisitOrder, f: &mut F)
where
    F: FnMut(&TreePath, &Value),
{
    if order == VisitOrder::Pre {
        f(path, node);
    }
    match node {
        Value::Object(map) => {
            for (k, v) in map {
                visit_inner(v, &path.child(Segment::Key(k.clone())), order, f);
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                visit_inner(v, &path.child(Segment::Index(i)), order, f);
            }
        }
        _ => {}
    }
    if order == VisitOrder::Post {
        f(path, node);
    }
}

/// Maps every leaf through `f`, keeping the tree's shape. Leaves for which
/// `f` returns `None` are dropped from their parent.
pub fn apply<F>(tree: &Value, mut f: F) -> Value
where
    F: FnMut(&TreePath, &Value) -> Option<Value>,
{
    apply_inner(tree, &TreePath::root(), &mut f).unwrap_or(Value::Null)
}

fn apply_inner<F>(node: &Value, path: &TreePath, f: &mut F) -> Option<Value>
where
    F: FnMut(&TreePath, &Value) -> Option<Value>,
{
    match node {
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                if let Some(mapped) = apply_inner(v, &path.child(Segment::Key(k.clone())), f) {
                    out.insert(k.clone(), mapped);
                }
            }
            Some(Value::Object(out))
        }
        Value::Array(items) => Some(Value::Array(
            items
                .iter()
                .enumerate()
                .filter_map(|(i, v)| apply_inner(v, &path.child(Segment::Index(i)), f))
                .collect(),
        )),
        leaf => f(path, leaf),
    }
}

/// True when every key of `partial` is present in `complete` with an equal
/// value. Nested mappings are compared the same way.
pub fn partial_compare(complete: &Value, partial: &Value) -> bool {
    match (complete, partial) {
        (_, Value::Object(p)) if p.is_empty() => true,
        (Value::Object(c), Value::Object(p)) => p.iter().all(|(k, pv)| match c.get(k) {
            Some(cv) if pv.is_object() => partial_compare(cv, pv),
            Some(cv) => cv == pv,
            None => false,
        }),
        (c, p) => c == p,
    }
}

/// Fills keys missing from `target` with the values in `defaults`, recursing
/// into mappings present on both sides. Present values are never replaced.
pub fn merge_missing(target: &mut Value, defaults: &Value) {
    let (Value::Object(t), Value::Object(d)) = (target, defaults) else {
        return;
    };
    for (k, dv) in d {
        match t.get_mut(k) {
            Some(tv) => merge_missing(tv, dv),
            None => {
                t.insert(k.clone(), dv.clone());
            }
        }
    }
}
