//! Client-submitted operation descriptors.
//!
//! These are what arrives over the wire. They are validated against the
//! addressed document's field and lowered to a [`TextOp`] before the merge
//! engine sees them.

use serde::{Deserialize, Serialize};

use crate::error::MergeError;
use crate::name::Field;
use crate::ot::{Component, TextOp};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Replace the whole field. `old_value` is the content the client saw.
    Replace {
        path: Option<String>,
        old_value: String,
        new_value: String,
    },
    Insert {
        path: Option<String>,
        position: Option<usize>,
        text: String,
    },
    /// `text` is the exact slice the client removed.
    Delete {
        path: Option<String>,
        position: Option<usize>,
        text: String,
    },
    /// General component form, used for edits that were transformed locally.
    Edit {
        path: Option<String>,
        ops: Vec<Component>,
    },
}

impl Operation {
    pub fn replace(field: Field, old_value: impl Into<String>, new_value: impl Into<String>) -> Self {
        Operation::Replace {
            path: Some(field.key().to_string()),
            old_value: old_value.into(),
            new_value: new_value.into(),
        }
    }

    pub fn insert(field: Field, position: usize, text: impl Into<String>) -> Self {
        Operation::Insert {
            path: Some(field.key().to_string()),
            position: Some(position),
            text: text.into(),
        }
    }

    pub fn delete(field: Field, position: usize, text: impl Into<String>) -> Self {
        Operation::Delete {
            path: Some(field.key().to_string()),
            position: Some(position),
            text: text.into(),
        }
    }

    pub fn edit(field: Field, op: &TextOp) -> Self {
        Operation::Edit {
            path: Some(field.key().to_string()),
            ops: op.components().to_vec(),
        }
    }

    pub fn path(&self) -> Option<&str> {
        match self {
            Operation::Replace { path, .. }
            | Operation::Insert { path, .. }
            | Operation::Delete { path, .. }
            | Operation::Edit { path, .. } => path.as_deref(),
        }
    }

    /// Validate against `field` and lower to a [`TextOp`].
    pub fn to_text_op(&self, field: Field) -> Result<TextOp, MergeError> {
        match self.path() {
            None | Some("") => {
                return Err(MergeError::Validation("operation has no path".into()));
            }
            Some(path) if path != field.key() => {
                return Err(MergeError::Validation(format!(
                    "path {path:?} does not address field {:?}",
                    field.key()
                )));
            }
            Some(_) => {}
        }

        match self {
            Operation::Replace {
                old_value,
                new_value,
                ..
            } => Ok(TextOp::edit(0, old_value, new_value)),
            Operation::Insert { position, text, .. } => {
                let position = position
                    .ok_or_else(|| MergeError::Validation("insert without position".into()))?;
                Ok(TextOp::insertion(position, text))
            }
            Operation::Delete { position, text, .. } => {
                let position = position
                    .ok_or_else(|| MergeError::Validation("delete without position".into()))?;
                Ok(TextOp::deletion(position, text))
            }
            Operation::Edit { ops, .. } => {
                if ops.iter().any(Component::is_empty) {
                    return Err(MergeError::Validation(
                        "edit contains an empty component".into(),
                    ));
                }
                Ok(TextOp::from(ops.clone()))
            }
        }
    }
}
