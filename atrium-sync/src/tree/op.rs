//! Storage operations.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::path::{ElementId, NodeRef};
use super::position::FracKey;
use super::value::Seed;
use super::TreeError;

/// A mutation of one storage node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StorageOp {
    /// Write an object field or a map key.
    Set {
        target: NodeRef,
        key: String,
        value: Seed,
    },
    /// Write several object fields as one operation.
    Update {
        target: NodeRef,
        fields: Vec<(String, Seed)>,
    },
    /// Delete a map key.
    Delete { target: NodeRef, key: String },
    /// Insert a list element.
    Insert {
        target: NodeRef,
        element: ElementId,
        key: FracKey,
        value: Seed,
    },
    /// Replace the value of a list element.
    SetItem {
        target: NodeRef,
        element: ElementId,
        value: Seed,
    },
    /// Remove a list element.
    Remove { target: NodeRef, element: ElementId },
    /// Reposition a list element.
    Move {
        target: NodeRef,
        element: ElementId,
        key: FracKey,
    },
}

impl StorageOp {
    pub fn target(&self) -> &NodeRef {
        match self {
            StorageOp::Set { target, .. }
            | StorageOp::Update { target, .. }
            | StorageOp::Delete { target, .. }
            | StorageOp::Insert { target, .. }
            | StorageOp::SetItem { target, .. }
            | StorageOp::Remove { target, .. }
            | StorageOp::Move { target, .. } => target,
        }
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            StorageOp::Set { .. } => "set",
            StorageOp::Update { .. } => "update",
            StorageOp::Delete { .. } => "delete",
            StorageOp::Insert { .. } => "insert",
            StorageOp::SetItem { .. } => "set_item",
            StorageOp::Remove { .. } => "remove",
            StorageOp::Move { .. } => "move",
        }
    }

    /// Structural validation performed before an operation is sequenced.
    ///
    /// Whether the target still exists is not checked here: an operation
    /// whose target is gone is sequenced and resolves to a no-op.
    pub fn validate(&self) -> Result<(), TreeError> {
        let invalid = |msg: String| TreeError::InvalidOperation(msg);
        match self {
            StorageOp::Set { value, .. } | StorageOp::SetItem { value, .. } => {
                value.validate().map_err(invalid)
            }
            StorageOp::Update { fields, .. } => {
                if fields.is_empty() {
                    return Err(invalid("update without fields".into()));
                }
                let mut seen = HashSet::new();
                for (field, value) in fields {
                    if !seen.insert(field.as_str()) {
                        return Err(invalid(format!("field {field:?} written twice")));
                    }
                    value.validate().map_err(invalid)?;
                }
                Ok(())
            }
            StorageOp::Delete { .. } | StorageOp::Remove { .. } => Ok(()),
            StorageOp::Insert { key, value, .. } => {
                if !key.is_well_formed() {
                    return Err(invalid(format!("malformed position key {key}")));
                }
                value.validate().map_err(invalid)
            }
            StorageOp::Move { key, .. } => {
                if !key.is_well_formed() {
                    return Err(invalid(format!("malformed position key {key}")));
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::value::{Scalar, Value};

    #[test]
    fn test_validate_rejects_empty_update() {
        let op = StorageOp::Update { target: NodeRef::root(), fields: vec![] };
        assert!(op.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_repeated_field() {
        let v = Seed::Scalar(Scalar::Int(1));
        let op = StorageOp::Update {
            target: NodeRef::root(),
            fields: vec![("x".into(), v.clone()), ("x".into(), v)],
        };
        assert!(op.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_nested_set() {
        let op = StorageOp::Set {
            target: NodeRef::root(),
            key: "shape".into(),
            value: Seed::from_value(&Value::object([("x", Value::from(1))])),
        };
        assert!(op.validate().is_ok());
        assert_eq!(op.kind(), "set");
    }
}
