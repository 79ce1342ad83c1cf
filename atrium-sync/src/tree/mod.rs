//! Conflict-free replicated storage tree.
//!
//! ```text
//!              root (Object, NodeId::ROOT)
//!              ├── "shape"  → Object { x, y }
//!              ├── "layers" → List  [ e1, e2, e3 ]   (ordered by Position)
//!              └── "meta"   → Map   { k → node }     (+ delete tombstones)
//! ```
//!
//! The tree is a pure state machine over sequenced [`StorageOp`]s. The same
//! type backs the server's authoritative copy and both halves (confirmed and
//! view) of a client [`Replica`](crate::replica::Replica).
//!
//! Persistence boundary: [`StorageTree::export`] / [`StorageTree::import`]
//! convert to and from a plain [`Value`]; snapshots keep the full tree
//! (ids, position tokens, tombstones) via serde.

pub mod node;
pub mod op;
pub mod path;
pub mod position;
pub mod value;

use serde::{Deserialize, Serialize};

use crate::protocol::Seq;

pub use node::{Item, ListNode, MapNode, Node, ObjectNode, Outcome, Stamp};
pub use op::StorageOp;
pub use path::{ElementId, NodeId, NodePath, NodeRef, PathSegment};
pub use position::{FracKey, Position};
pub use value::{Scalar, Seed, SeedItem, Value};

/// Storage tree errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TreeError {
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("document root must be an object")]
    RootNotObject,
}

/// Mutable view of a resolved container.
enum Target<'a> {
    Object(&'a mut ObjectNode),
    Map(&'a mut MapNode),
    List(&'a mut ListNode),
}

impl<'a> Target<'a> {
    fn from_node(node: &'a mut Node) -> Option<Self> {
        match node {
            Node::Object(o) => Some(Target::Object(o)),
            Node::Map(m) => Some(Target::Map(m)),
            Node::List(l) => Some(Target::List(l)),
            Node::Scalar(_) => None,
        }
    }

    fn id(&self) -> NodeId {
        match self {
            Target::Object(o) => o.id,
            Target::Map(m) => m.id,
            Target::List(l) => l.id,
        }
    }

    fn touch(&mut self, seq: Seq) {
        match self {
            Target::Object(o) => o.seq = o.seq.max(seq),
            Target::Map(m) => m.seq = m.seq.max(seq),
            Target::List(l) => l.seq = l.seq.max(seq),
        }
    }
}

/// One room's shared document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageTree {
    root: ObjectNode,
}

impl Default for StorageTree {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageTree {
    /// Empty document.
    pub fn new() -> Self {
        Self {
            root: ObjectNode::new(NodeId::ROOT),
        }
    }

    pub fn root(&self) -> &ObjectNode {
        &self.root
    }

    /// Apply a sequenced operation.
    ///
    /// Never fails: an operation whose target does not resolve to the
    /// expected node, or that loses to a concurrent write, leaves the tree
    /// unchanged and reports why.
    pub fn apply(&mut self, op: &StorageOp, stamp: Stamp) -> Outcome {
        let target = op.target();
        let Some(mut node) = self.resolve_mut(&target.path) else {
            return Outcome::Unresolved;
        };
        if node.id() != target.id {
            return Outcome::Unresolved;
        }

        let changed = match (op, &mut node) {
            (StorageOp::Set { key, value, .. }, Target::Object(o)) => o.set(key, value, stamp),
            (StorageOp::Set { key, value, .. }, Target::Map(m)) => m.set(key, value, stamp),
            (StorageOp::Update { fields, .. }, Target::Object(o)) => o.update(fields, stamp),
            (StorageOp::Delete { key, .. }, Target::Map(m)) => m.delete(key, stamp),
            (StorageOp::Insert { element, key, value, .. }, Target::List(l)) => {
                l.insert(*element, key, value, stamp)
            }
            (StorageOp::SetItem { element, value, .. }, Target::List(l)) => {
                l.set_item(element, value, stamp)
            }
            (StorageOp::Remove { element, .. }, Target::List(l)) => l.remove(element),
            (StorageOp::Move { element, key, .. }, Target::List(l)) => {
                l.move_item(element, key, stamp)
            }
            // Operation kind does not fit the node kind.
            _ => return Outcome::Unresolved,
        };
        node.touch(stamp.seq);
        Outcome::from_changed(changed)
    }

    /// Node at `path`, if it exists. The root itself is reached via [`root`](Self::root).
    pub fn get(&self, path: &NodePath) -> Option<&Node> {
        let mut segments = path.segments().iter();
        let first = match segments.next() {
            None => return None,
            Some(PathSegment::Key(k)) => self.root.get(k)?,
            Some(PathSegment::Element(_)) => return None,
        };
        segments.try_fold(first, |node, seg| match seg {
            PathSegment::Key(k) => node.child(k),
            PathSegment::Element(e) => node.element(e),
        })
    }

    /// Reference to the container at `path` (root for the empty path).
    pub fn node_ref(&self, path: &NodePath) -> Option<NodeRef> {
        let id = if path.is_root() {
            NodeId::ROOT
        } else {
            self.get(path)?.id()?
        };
        Some(NodeRef {
            path: path.clone(),
            id,
        })
    }

    fn resolve_mut(&mut self, path: &NodePath) -> Option<Target<'_>> {
        let mut segments = path.segments().iter();
        let mut node = match segments.next() {
            None => return Some(Target::Object(&mut self.root)),
            Some(PathSegment::Key(k)) => self.root.get_mut(k)?,
            Some(PathSegment::Element(_)) => return None,
        };
        for seg in segments {
            node = match seg {
                PathSegment::Key(k) => node.child_mut(k)?,
                PathSegment::Element(e) => node.element_mut(e)?,
            };
        }
        Target::from_node(node)
    }

    /// Plain document form.
    pub fn export(&self) -> Value {
        Value::Object(
            self.root
                .iter()
                .map(|(k, node)| (k.to_string(), node.to_value()))
                .collect(),
        )
    }

    /// Build a tree from a plain document. Identities are freshly assigned.
    pub fn import(value: &Value) -> Result<Self, TreeError> {
        let Value::Object(fields) = value else {
            return Err(TreeError::RootNotObject);
        };
        let mut tree = Self::new();
        let stamp = Stamp::new(0, 0);
        for (field, v) in fields {
            tree.root.set(field, &Seed::from_value(v), stamp);
        }
        Ok(tree)
    }

    /// Natural JSON rendering of [`export`](Self::export).
    pub fn to_json(&self) -> serde_json::Value {
        self.export().to_json()
    }

    /// Import natural JSON; JSON objects become object nodes.
    pub fn from_json(json: &serde_json::Value) -> Result<Self, TreeError> {
        Self::import(&Value::from_json(json))
    }
}
