//! Storage node types and their merge rules.
//!
//! Every mutation carries a [`Stamp`]: the server sequence number of the
//! operation and the base sequence its origin had observed. All rules below
//! compare stamps only, so applying the same operations in any causally
//! consistent order yields the same node.
//!
//! | Node   | Rule                                                        |
//! |--------|-------------------------------------------------------------|
//! | Object | field write wins when its seq is higher than the slot's     |
//! | Map    | same, plus delete tombstones newer than a write's base win  |
//! | List   | position token order, removal is permanent, moves are LWW   |

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::path::{ElementId, NodeId};
use super::position::{FracKey, Position};
use super::value::{Scalar, Seed, Value};
use crate::protocol::Seq;

/// Sequence number of an operation and the sequence its origin had seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stamp {
    pub seq: Seq,
    pub base: Seq,
}

impl Stamp {
    pub fn new(seq: Seq, base: Seq) -> Self {
        Self { seq, base }
    }
}

/// Result of applying one storage operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// The target path no longer resolves to the expected node.
    Unresolved,
    /// A newer write, a tombstone or a removal took precedence.
    Superseded,
}

impl Outcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Outcome::Applied)
    }

    pub(crate) fn from_changed(changed: bool) -> Self {
        if changed {
            Outcome::Applied
        } else {
            Outcome::Superseded
        }
    }
}

/// A storage node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Node {
    Scalar(Scalar),
    Object(ObjectNode),
    Map(MapNode),
    List(ListNode),
}

impl Node {
    /// Materialize a seed written by the operation stamped `stamp`.
    pub fn from_seed(seed: &Seed, stamp: Stamp) -> Node {
        match seed {
            Seed::Scalar(s) => Node::Scalar(s.clone()),
            Seed::Object { id, fields } => Node::Object(ObjectNode {
                id: *id,
                seq: stamp.seq,
                fields: fields
                    .iter()
                    .map(|(k, v)| {
                        let slot = Slot {
                            node: Node::from_seed(v, stamp),
                            seq: stamp.seq,
                        };
                        (k.clone(), slot)
                    })
                    .collect(),
            }),
            Seed::Map { id, entries } => Node::Map(MapNode {
                id: *id,
                seq: stamp.seq,
                entries: entries
                    .iter()
                    .map(|(k, v)| {
                        let entry = MapEntry {
                            node: Node::from_seed(v, stamp),
                            seq: stamp.seq,
                            base: stamp.base,
                        };
                        (k.clone(), entry)
                    })
                    .collect(),
                tombstones: BTreeMap::new(),
            }),
            Seed::List { id, items } => {
                let mut list = ListNode {
                    id: *id,
                    seq: stamp.seq,
                    items: items
                        .iter()
                        .map(|item| Item {
                            position: Position {
                                key: item.key.clone(),
                                seq: stamp.seq,
                                element: item.element,
                            },
                            node: Node::from_seed(&item.value, stamp),
                            value_seq: stamp.seq,
                        })
                        .collect(),
                    removed: BTreeSet::new(),
                };
                list.items.sort_by(|a, b| a.position.cmp(&b.position));
                Node::List(list)
            }
        }
    }

    /// Node id of a container; scalars have none.
    pub fn id(&self) -> Option<NodeId> {
        match self {
            Node::Scalar(_) => None,
            Node::Object(o) => Some(o.id),
            Node::Map(m) => Some(m.id),
            Node::List(l) => Some(l.id),
        }
    }

    pub fn as_scalar(&self) -> Option<&Scalar> {
        match self {
            Node::Scalar(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectNode> {
        match self {
            Node::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&MapNode> {
        match self {
            Node::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&ListNode> {
        match self {
            Node::List(l) => Some(l),
            _ => None,
        }
    }

    /// Plain value of this subtree.
    pub fn to_value(&self) -> Value {
        match self {
            Node::Scalar(s) => Value::from(s.clone()),
            Node::Object(o) => Value::Object(
                o.fields
                    .iter()
                    .map(|(k, slot)| (k.clone(), slot.node.to_value()))
                    .collect(),
            ),
            Node::Map(m) => Value::Map(
                m.entries
                    .iter()
                    .map(|(k, e)| (k.clone(), e.node.to_value()))
                    .collect(),
            ),
            Node::List(l) => Value::List(l.items.iter().map(|i| i.node.to_value()).collect()),
        }
    }

    /// Direct child reached by a field or map key.
    pub(crate) fn child(&self, key: &str) -> Option<&Node> {
        match self {
            Node::Object(o) => o.get(key),
            Node::Map(m) => m.get(key),
            _ => None,
        }
    }

    pub(crate) fn child_mut(&mut self, key: &str) -> Option<&mut Node> {
        match self {
            Node::Object(o) => o.get_mut(key),
            Node::Map(m) => m.entries.get_mut(key).map(|e| &mut e.node),
            _ => None,
        }
    }

    pub(crate) fn element(&self, element: &ElementId) -> Option<&Node> {
        match self {
            Node::List(l) => l.get_by_element(element),
            _ => None,
        }
    }

    pub(crate) fn element_mut(&mut self, element: &ElementId) -> Option<&mut Node> {
        match self {
            Node::List(l) => l
                .items
                .iter_mut()
                .find(|i| i.position.element == *element)
                .map(|i| &mut i.node),
            _ => None,
        }
    }

    pub(crate) fn touch(&mut self, seq: Seq) {
        match self {
            Node::Scalar(_) => {}
            Node::Object(o) => o.seq = o.seq.max(seq),
            Node::Map(m) => m.seq = m.seq.max(seq),
            Node::List(l) => l.seq = l.seq.max(seq),
        }
    }
}

// ─── Object ────────────────────────────────────────────────────────────

/// Field of an object: the value and the seq of the write that placed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slot {
    pub node: Node,
    pub seq: Seq,
}

/// Open set of named fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectNode {
    pub id: NodeId,
    /// Highest seq of any operation that touched this node.
    pub seq: Seq,
    fields: BTreeMap<String, Slot>,
}

impl ObjectNode {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            seq: 0,
            fields: BTreeMap::new(),
        }
    }

    pub fn get(&self, field: &str) -> Option<&Node> {
        self.fields.get(field).map(|s| &s.node)
    }

    pub(crate) fn get_mut(&mut self, field: &str) -> Option<&mut Node> {
        self.fields.get_mut(field).map(|s| &mut s.node)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.fields.iter().map(|(k, s)| (k.as_str(), &s.node))
    }

    /// Last-write-wins field write.
    pub(crate) fn set(&mut self, field: &str, seed: &Seed, stamp: Stamp) -> bool {
        if let Some(slot) = self.fields.get(field) {
            if slot.seq >= stamp.seq {
                return false;
            }
        }
        self.fields.insert(
            field.to_string(),
            Slot {
                node: Node::from_seed(seed, stamp),
                seq: stamp.seq,
            },
        );
        true
    }

    /// Batch of field writes under one stamp; each field resolves on its own.
    pub(crate) fn update(&mut self, fields: &[(String, Seed)], stamp: Stamp) -> bool {
        let mut changed = false;
        for (field, seed) in fields {
            changed |= self.set(field, seed, stamp);
        }
        changed
    }
}

// ─── Map ───────────────────────────────────────────────────────────────

/// Map entry: the value, the seq that wrote it and that write's base seq.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapEntry {
    pub node: Node,
    pub seq: Seq,
    pub base: Seq,
}

/// String-keyed collection with per-key delete tombstones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapNode {
    pub id: NodeId,
    pub seq: Seq,
    entries: BTreeMap<String, MapEntry>,
    /// Highest delete seq seen per key.
    ///
    /// Never collected: a resubmitted offline write keeps its original base,
    /// so any old tombstone may still be needed to suppress it. Grows with the
    /// number of distinct deleted keys over the node's lifetime; replacing the
    /// map through its parent drops them.
    tombstones: BTreeMap<String, Seq>,
}

impl MapNode {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            seq: 0,
            entries: BTreeMap::new(),
            tombstones: BTreeMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Node> {
        self.entries.get(key).map(|e| &e.node)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.entries.iter().map(|(k, e)| (k.as_str(), &e.node))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// A write loses to a higher-seq write and to any delete it had not seen.
    pub(crate) fn set(&mut self, key: &str, seed: &Seed, stamp: Stamp) -> bool {
        if let Some(tomb) = self.tombstones.get(key) {
            if *tomb > stamp.base {
                return false;
            }
        }
        if let Some(entry) = self.entries.get(key) {
            if entry.seq >= stamp.seq {
                return false;
            }
        }
        self.entries.insert(
            key.to_string(),
            MapEntry {
                node: Node::from_seed(seed, stamp),
                seq: stamp.seq,
                base: stamp.base,
            },
        );
        true
    }

    /// Removes an entry whose write had not seen this delete.
    pub(crate) fn delete(&mut self, key: &str, stamp: Stamp) -> bool {
        let tomb = self.tombstones.entry(key.to_string()).or_insert(0);
        *tomb = (*tomb).max(stamp.seq);
        match self.entries.get(key) {
            Some(entry) if entry.base < stamp.seq => {
                self.entries.remove(key);
                true
            }
            _ => false,
        }
    }
}

// ─── List ──────────────────────────────────────────────────────────────

/// List element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub position: Position,
    pub node: Node,
    /// Seq of the last value write (insert or element update).
    pub value_seq: Seq,
}

impl Item {
    pub fn element(&self) -> ElementId {
        self.position.element
    }
}

/// Ordered sequence of nodes, kept sorted by position token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListNode {
    pub id: NodeId,
    pub seq: Seq,
    items: Vec<Item>,
    /// Elements that have been removed; they never come back.
    ///
    /// Kept for the lifetime of the list, like map tombstones. One id per
    /// removal.
    removed: BTreeSet<ElementId>,
}

impl ListNode {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            seq: 0,
            items: Vec::new(),
            removed: BTreeSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Node> {
        self.items.get(index).map(|i| &i.node)
    }

    pub fn get_by_element(&self, element: &ElementId) -> Option<&Node> {
        self.items
            .iter()
            .find(|i| i.position.element == *element)
            .map(|i| &i.node)
    }

    pub fn element_at(&self, index: usize) -> Option<ElementId> {
        self.items.get(index).map(Item::element)
    }

    pub fn index_of(&self, element: &ElementId) -> Option<usize> {
        self.items.iter().position(|i| i.position.element == *element)
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.items.iter().map(|i| &i.node)
    }

    /// Key that places the new `element` at `index` (clamped to the length).
    pub fn key_for_insert(&self, index: usize, element: &ElementId) -> FracKey {
        let keys: Vec<&FracKey> = self.items.iter().map(|i| &i.position.key).collect();
        key_at(&keys, index, element)
    }

    /// Key that lands the element currently at `from` at index `to`.
    pub fn key_for_move(&self, from: usize, to: usize) -> FracKey {
        let element = self.element_at(from).unwrap_or_default();
        let keys: Vec<&FracKey> = self
            .items
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != from)
            .map(|(_, item)| &item.position.key)
            .collect();
        key_at(&keys, to, &element)
    }

    pub(crate) fn insert(
        &mut self,
        element: ElementId,
        key: &FracKey,
        seed: &Seed,
        stamp: Stamp,
    ) -> bool {
        if self.removed.contains(&element) || self.index_of(&element).is_some() {
            return false;
        }
        let item = Item {
            position: Position {
                key: key.clone(),
                seq: stamp.seq,
                element,
            },
            node: Node::from_seed(seed, stamp),
            value_seq: stamp.seq,
        };
        let at = self.items.partition_point(|i| i.position < item.position);
        self.items.insert(at, item);
        true
    }

    pub(crate) fn set_item(&mut self, element: &ElementId, seed: &Seed, stamp: Stamp) -> bool {
        match self.items.iter_mut().find(|i| i.position.element == *element) {
            Some(item) if item.value_seq < stamp.seq => {
                item.node = Node::from_seed(seed, stamp);
                item.value_seq = stamp.seq;
                true
            }
            _ => false,
        }
    }

    /// Permanent removal; removing twice is a no-op.
    pub(crate) fn remove(&mut self, element: &ElementId) -> bool {
        self.removed.insert(*element);
        match self.index_of(element) {
            Some(at) => {
                self.items.remove(at);
                true
            }
            None => false,
        }
    }

    /// Reposition an element; the move with the highest seq wins.
    pub(crate) fn move_item(&mut self, element: &ElementId, key: &FracKey, stamp: Stamp) -> bool {
        let Some(at) = self.index_of(element) else {
            return false;
        };
        if self.items[at].position.seq >= stamp.seq {
            return false;
        }
        let mut item = self.items.remove(at);
        item.position = Position {
            key: key.clone(),
            seq: stamp.seq,
            element: *element,
        };
        let to = self.items.partition_point(|i| i.position < item.position);
        self.items.insert(to, item);
        true
    }
}

/// Key for slot `index` among sorted `keys`: after the key on the left and
/// before the first key on the right that is strictly greater.
fn key_at(keys: &[&FracKey], index: usize, element: &ElementId) -> FracKey {
    let index = index.min(keys.len());
    let lo = if index > 0 { Some(keys[index - 1]) } else { None };
    let hi = keys[index..]
        .iter()
        .copied()
        .find(|k| lo.map_or(true, |l| *k > l));
    FracKey::between_for(lo, hi, element)
}
