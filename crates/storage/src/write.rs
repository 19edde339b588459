//! Buffered writes and how they apply to a document body

use serde_json::Value;
use tally_core::{DocPath, Document};

/// How `set` treats an existing document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetMode {
    /// Replace the whole body
    Overwrite,
    /// Deep-merge maps into the existing body; other values replace
    Merge,
}

/// A single mutation
#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    /// Create or replace/merge a document
    Set {
        /// Target
        path: DocPath,
        /// Body or merge payload
        data: Document,
        /// Replace or merge
        mode: SetMode,
    },
    /// Remove a document (missing documents are fine)
    Delete {
        /// Target
        path: DocPath,
    },
    /// Append values not already present to an array field
    ArrayUnion {
        /// Target
        path: DocPath,
        /// Top-level array field
        field: String,
        /// Values to add
        values: Vec<Value>,
    },
    /// Remove every element equal to one of the values
    ArrayRemove {
        /// Target
        path: DocPath,
        /// Top-level array field
        field: String,
        /// Values to remove
        values: Vec<Value>,
    },
}

impl Write {
    /// Target path
    pub fn path(&self) -> &DocPath {
        match self {
            Write::Set { path, .. }
            | Write::Delete { path }
            | Write::ArrayUnion { path, .. }
            | Write::ArrayRemove { path, .. } => path,
        }
    }

    /// New body after applying this write to `current`.
    ///
    /// Array transforms create the document when it is missing and replace
    /// a non-array field.
    pub fn apply(&self, current: Option<Document>) -> Option<Document> {
        match self {
            Write::Set {
                data,
                mode: SetMode::Overwrite,
                ..
            } => Some(data.clone()),
            Write::Set {
                data,
                mode: SetMode::Merge,
                ..
            } => {
                let mut doc = current.unwrap_or_default();
                deep_merge(&mut doc, data);
                Some(doc)
            }
            Write::Delete { .. } => None,
            Write::ArrayUnion { field, values, .. } => {
                let mut doc = current.unwrap_or_default();
                let items = array_field(&mut doc, field);
                for value in values {
                    if !items.contains(value) {
                        items.push(value.clone());
                    }
                }
                Some(doc)
            }
            Write::ArrayRemove { field, values, .. } => {
                let mut doc = current.unwrap_or_default();
                let items = array_field(&mut doc, field);
                items.retain(|item| !values.contains(item));
                Some(doc)
            }
        }
    }
}

fn array_field<'a>(doc: &'a mut Document, field: &str) -> &'a mut Vec<Value> {
    let slot = doc
        .entry(field.to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    if !slot.is_array() {
        *slot = Value::Array(Vec::new());
    }
    match slot {
        Value::Array(items) => items,
        _ => unreachable!("slot was just made an array"),
    }
}

/// Merge `patch` into `target`: maps merge recursively, everything else
/// replaces.
pub fn deep_merge(target: &mut Document, patch: &Document) {
    for (key, value) in patch {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge(existing, incoming);
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}
