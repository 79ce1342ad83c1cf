//! Plain values and node seeds.
//!
//! [`Value`] is the plain nested document: the input form of storage writes,
//! the durable export format of a tree, and the content of presence records
//! and event payloads. [`Seed`] is a value with identities already assigned,
//! which is what travels inside operations so every replica materializes the
//! same nodes.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use super::path::{ElementId, NodeId};
use super::position::FracKey;

/// Leaf value stored in the tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Scalar::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Scalar::Float(v) => Some(*v),
            Scalar::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Scalar::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

/// Plain nested document.
///
/// Objects and maps are kept apart so an export can be imported back into
/// the same node kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<Value>),
    Object(BTreeMap<String, Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn object<K: Into<String>>(fields: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Object(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn list(items: impl IntoIterator<Item = Value>) -> Self {
        Value::List(items.into_iter().collect())
    }

    pub fn empty_object() -> Self {
        Value::Object(BTreeMap::new())
    }

    pub fn empty_map() -> Self {
        Value::Map(BTreeMap::new())
    }

    pub fn empty_list() -> Self {
        Value::List(Vec::new())
    }

    /// Scalar form of a leaf value; `None` for containers.
    pub fn as_scalar(&self) -> Option<Scalar> {
        match self {
            Value::Null => Some(Scalar::Null),
            Value::Bool(b) => Some(Scalar::Bool(*b)),
            Value::Int(i) => Some(Scalar::Int(*i)),
            Value::Float(f) => Some(Scalar::Float(*f)),
            Value::Text(s) => Some(Scalar::Text(s.clone())),
            _ => None,
        }
    }

    /// Field of an object or entry of a map.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Object(m) | Value::Map(m) => m.get(key),
            _ => None,
        }
    }

    /// Render as natural JSON (objects and maps both become JSON objects).
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as J;
        match self {
            Value::Null => J::Null,
            Value::Bool(b) => J::Bool(*b),
            Value::Int(i) => J::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f).map(J::Number).unwrap_or(J::Null),
            Value::Text(s) => J::String(s.clone()),
            Value::List(items) => J::Array(items.iter().map(Value::to_json).collect()),
            Value::Object(m) | Value::Map(m) => {
                J::Object(m.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
            }
        }
    }

    /// Read natural JSON; JSON objects become [`Value::Object`].
    pub fn from_json(json: &serde_json::Value) -> Self {
        use serde_json::Value as J;
        match json {
            J::Null => Value::Null,
            J::Bool(b) => Value::Bool(*b),
            J::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(0.0)),
            },
            J::String(s) => Value::Text(s.clone()),
            J::Array(items) => Value::List(items.iter().map(Value::from_json).collect()),
            J::Object(m) => Value::Object(
                m.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl From<Scalar> for Value {
    fn from(s: Scalar) -> Self {
        match s {
            Scalar::Null => Value::Null,
            Scalar::Bool(b) => Value::Bool(b),
            Scalar::Int(i) => Value::Int(i),
            Scalar::Float(f) => Value::Float(f),
            Scalar::Text(t) => Value::Text(t),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

/// A list element inside a [`Seed`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedItem {
    pub element: ElementId,
    pub key: FracKey,
    pub value: Seed,
}

/// A value with node ids, element ids and position keys already assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Seed {
    Scalar(Scalar),
    Object { id: NodeId, fields: Vec<(String, Seed)> },
    Map { id: NodeId, entries: Vec<(String, Seed)> },
    List { id: NodeId, items: Vec<SeedItem> },
}

impl Seed {
    /// Assign fresh identities to a plain value.
    pub fn from_value(value: &Value) -> Seed {
        match value {
            Value::List(items) => {
                let mut prev: Option<FracKey> = None;
                let items = items
                    .iter()
                    .map(|v| {
                        let key = FracKey::between(prev.as_ref(), None);
                        prev = Some(key.clone());
                        SeedItem {
                            element: ElementId::new(),
                            key,
                            value: Seed::from_value(v),
                        }
                    })
                    .collect();
                Seed::List { id: NodeId::new(), items }
            }
            Value::Object(fields) => Seed::Object {
                id: NodeId::new(),
                fields: fields
                    .iter()
                    .map(|(k, v)| (k.clone(), Seed::from_value(v)))
                    .collect(),
            },
            Value::Map(entries) => Seed::Map {
                id: NodeId::new(),
                entries: entries
                    .iter()
                    .map(|(k, v)| (k.clone(), Seed::from_value(v)))
                    .collect(),
            },
            // Leaf variants always have a scalar form.
            leaf => Seed::Scalar(leaf.as_scalar().unwrap_or(Scalar::Null)),
        }
    }

    /// Node id of a container seed.
    pub fn node_id(&self) -> Option<NodeId> {
        match self {
            Seed::Scalar(_) => None,
            Seed::Object { id, .. } | Seed::Map { id, .. } | Seed::List { id, .. } => Some(*id),
        }
    }

    /// Structural checks run by the server before sequencing.
    ///
    /// Rejects the root id, duplicate node / element ids, duplicate keys
    /// and malformed position keys.
    pub fn validate(&self) -> Result<(), String> {
        let mut nodes = HashSet::new();
        let mut elements = HashSet::new();
        self.validate_into(&mut nodes, &mut elements)
    }

    fn validate_into(
        &self,
        nodes: &mut HashSet<NodeId>,
        elements: &mut HashSet<ElementId>,
    ) -> Result<(), String> {
        if let Some(id) = self.node_id() {
            if id.is_root() {
                return Err("seed reuses the root node id".into());
            }
            if !nodes.insert(id) {
                return Err(format!("duplicate node id {id}"));
            }
        }
        match self {
            Seed::Scalar(_) => Ok(()),
            Seed::Object { fields: pairs, .. } | Seed::Map { entries: pairs, .. } => {
                let mut keys = HashSet::new();
                for (k, v) in pairs {
                    if !keys.insert(k.as_str()) {
                        return Err(format!("duplicate key {k:?}"));
                    }
                    v.validate_into(nodes, elements)?;
                }
                Ok(())
            }
            Seed::List { items, .. } => {
                for item in items {
                    if !item.key.is_well_formed() {
                        return Err(format!("malformed position key {}", item.key));
                    }
                    if !elements.insert(item.element) {
                        return Err(format!("duplicate element id {}", item.element));
                    }
                    item.value.validate_into(nodes, elements)?;
                }
                Ok(())
            }
        }
    }
}

impl From<Value> for Seed {
    fn from(value: Value) -> Self {
        Seed::from_value(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_from_value_assigns_ordered_keys() {
        let seed = Seed::from_value(&Value::list(["a".into(), "b".into(), "c".into()]));
        match seed {
            Seed::List { items, .. } => {
                assert_eq!(items.len(), 3);
                assert!(items[0].key < items[1].key);
                assert!(items[1].key < items[2].key);
            }
            other => panic!("expected list seed, got {other:?}"),
        }
    }

    #[test]
    fn test_seed_validate_rejects_duplicate_ids() {
        let id = NodeId::new();
        let seed = Seed::Object {
            id,
            fields: vec![(
                "inner".into(),
                Seed::Map { id, entries: vec![] },
            )],
        };
        assert!(seed.validate().is_err());
    }

    #[test]
    fn test_seed_validate_rejects_root_id() {
        let seed = Seed::Object { id: NodeId::ROOT, fields: vec![] };
        assert!(seed.validate().is_err());
    }

    #[test]
    fn test_seed_validate_accepts_fresh_value() {
        let value = Value::object([
            ("title", Value::from("doc")),
            ("tags", Value::list([Value::from("x"), Value::from("y")])),
            ("meta", Value::map([("k", Value::from(1))])),
        ]);
        assert!(Seed::from_value(&value).validate().is_ok());
    }

    #[test]
    fn test_json_rendering() {
        let value = Value::object([
            ("x", Value::from(10)),
            ("name", Value::from("circle")),
            ("points", Value::list([Value::from(1.5)])),
        ]);
        let json = value.to_json();
        assert_eq!(json["x"], serde_json::json!(10));
        assert_eq!(json["name"], serde_json::json!("circle"));
        assert_eq!(json["points"][0], serde_json::json!(1.5));

        let back = Value::from_json(&json);
        assert_eq!(back, value);
    }
}
