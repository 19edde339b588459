//! Partial documents
//!
//! A partial holds a list of update entries under `_updates_`. Each entry
//! is `{ "_id_": <unique id>, "_data_": <numeric delta> }`. Entries are
//! appended with array-union and removed by value, so concurrent appends
//! never need a transaction. The value a partial carries is the sum of all
//! its entries.

use crate::numeric::{Document, NumericUpdate};
use serde_json::{Map, Value};

/// Field holding the update entries of a partial
pub const UPDATES_FIELD: &str = "_updates_";

/// Entry id field
pub const ENTRY_ID_FIELD: &str = "_id_";

/// Entry delta field
pub const ENTRY_DATA_FIELD: &str = "_data_";

/// One appended delta of a partial
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateEntry {
    /// Unique id; keeps equal deltas distinct under array-union
    pub id: String,
    /// Numeric delta
    pub data: Document,
}

impl UpdateEntry {
    /// Create an entry.
    pub fn new(id: impl Into<String>, data: Document) -> Self {
        UpdateEntry {
            id: id.into(),
            data,
        }
    }

    /// Wire form stored in the `_updates_` array
    pub fn to_value(&self) -> Value {
        let mut entry = Map::new();
        entry.insert(ENTRY_ID_FIELD.to_string(), Value::String(self.id.clone()));
        entry.insert(ENTRY_DATA_FIELD.to_string(), Value::Object(self.data.clone()));
        Value::Object(entry)
    }

    /// Parse the wire form; entries without a map delta are skipped.
    pub fn from_value(value: &Value) -> Option<Self> {
        let entry = value.as_object()?;
        let data = entry.get(ENTRY_DATA_FIELD)?.as_object()?.clone();
        let id = entry
            .get(ENTRY_ID_FIELD)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Some(UpdateEntry { id, data })
    }
}

/// Raw `_updates_` array values of a document, in stored order.
pub fn raw_entries(doc: &Document) -> &[Value] {
    match doc.get(UPDATES_FIELD) {
        Some(Value::Array(items)) => items,
        _ => &[],
    }
}

/// Parsed update entries of a document.
pub fn entries(doc: &Document) -> Vec<UpdateEntry> {
    raw_entries(doc)
        .iter()
        .filter_map(UpdateEntry::from_value)
        .collect()
}

/// Sum of every entry of a partial.
pub fn fold_entries(doc: &Document) -> NumericUpdate {
    let mut update = NumericUpdate::new();
    for entry in raw_entries(doc) {
        if let Some(Value::Object(data)) = entry.get(ENTRY_DATA_FIELD) {
            update.merge_from(data);
        }
    }
    update
}

/// Whether a document is a partial that carries no value.
///
/// A document with no fields counts as empty. A document with any field
/// besides `_updates_` is not a partial at all. Entries are folded before
/// the check, and folding drops non-numeric leaves, so entries carrying
/// only strings or booleans leave the partial empty.
pub fn is_empty_partial(doc: &Document) -> bool {
    match doc.len() {
        0 => true,
        1 if doc.contains_key(UPDATES_FIELD) => fold_entries(doc).is_noop(),
        _ => false,
    }
}

/// Whether a partial has grown past `max_updates` entries.
pub fn contains_many_updates(doc: &Document, max_updates: usize) -> bool {
    raw_entries(doc).len() > max_updates
}

/// Document body of a compacted partial holding a single entry.
pub fn compacted_document(entry: &UpdateEntry) -> Document {
    let mut doc = Map::new();
    doc.insert(
        UPDATES_FIELD.to_string(),
        Value::Array(vec![entry.to_value()]),
    );
    doc
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn partial(deltas: Vec<Value>) -> Document {
        let entries: Vec<Value> = deltas
            .into_iter()
            .enumerate()
            .map(|(i, d)| json!({"_id_": format!("e{i}"), "_data_": d}))
            .collect();
        let mut doc = Map::new();
        doc.insert(UPDATES_FIELD.to_string(), Value::Array(entries));
        doc
    }

    #[test]
    fn test_entry_round_trip() {
        let entry = UpdateEntry::new("id-1", json!({"a": 1}).as_object().unwrap().clone());
        let parsed = UpdateEntry::from_value(&entry.to_value()).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn test_fold_entries() {
        let doc = partial(vec![json!({"a": 1}), json!({"a": 2, "b": {"c": 1}})]);
        assert_eq!(
            Value::Object(fold_entries(&doc).into_data()),
            json!({"a": 3, "b": {"c": 1}})
        );
    }

    #[test]
    fn test_is_empty_partial() {
        assert!(is_empty_partial(&Document::new()));
        assert!(is_empty_partial(&partial(vec![json!({"a": 1}), json!({"a": -1})])));
        assert!(!is_empty_partial(&partial(vec![json!({"a": 1})])));
        assert!(is_empty_partial(&partial(vec![json!({"label": "x", "flag": true})])));

        let mut with_extra = partial(vec![]);
        with_extra.insert("visits".to_string(), json!(0));
        assert!(!is_empty_partial(&with_extra));

        let plain = json!({"visits": 0}).as_object().unwrap().clone();
        assert!(!is_empty_partial(&plain));
    }

    #[test]
    fn test_contains_many_updates() {
        let doc = partial((0..11).map(|_| json!({"a": 1})).collect());
        assert!(contains_many_updates(&doc, 10));
        assert!(!contains_many_updates(&doc, 11));
        assert!(!contains_many_updates(&Document::new(), 0));
    }

    #[test]
    fn test_malformed_entries_are_skipped() {
        let mut doc = Map::new();
        doc.insert(
            UPDATES_FIELD.to_string(),
            json!([{"_id_": "x"}, 5, {"_id_": "y", "_data_": {"a": 2}}]),
        );
        assert_eq!(entries(&doc).len(), 1);
        assert_eq!(Value::Object(fold_entries(&doc).into_data()), json!({"a": 2}));
    }

    #[test]
    fn test_compacted_document() {
        let entry = UpdateEntry::new("c", json!({"a": 3}).as_object().unwrap().clone());
        let doc = compacted_document(&entry);
        assert_eq!(entries(&doc), vec![entry]);
    }
}
