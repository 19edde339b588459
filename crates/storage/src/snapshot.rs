//! Point-in-time views of documents and query results

use tally_core::{DocPath, Document, Timestamp};

/// A document as observed at one version
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSnapshot {
    /// Document path
    pub path: DocPath,
    /// Body, `None` if the document does not exist
    pub data: Option<Document>,
    /// Commit version of the last write; 0 for a missing document
    pub version: u64,
    /// Time of the last write; epoch for a missing document
    pub update_time: Timestamp,
}

impl DocumentSnapshot {
    /// Snapshot of a document that does not exist.
    pub fn missing(path: DocPath) -> Self {
        DocumentSnapshot {
            path,
            data: None,
            version: 0,
            update_time: Timestamp::EPOCH,
        }
    }

    /// Whether the document exists
    pub fn exists(&self) -> bool {
        self.data.is_some()
    }

    /// Body of the document, or an empty map when missing
    pub fn data_or_empty(&self) -> Document {
        self.data.clone().unwrap_or_default()
    }
}

/// Kind of change between two query results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Document entered the result
    Added,
    /// Document stayed in the result with a new version
    Modified,
    /// Document left the result (deleted or pushed out of range)
    Removed,
}

/// One change of a query result
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    /// What happened
    pub kind: ChangeKind,
    /// The document after the change (before it, for removals)
    pub doc: DocumentSnapshot,
}

/// Result of a range query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuerySnapshot {
    /// Matching documents in path order
    pub docs: Vec<DocumentSnapshot>,
    /// Changes relative to the previous snapshot of the same listener;
    /// every document is `Added` in a first snapshot or a one-shot query
    pub changes: Vec<DocumentChange>,
}

impl QuerySnapshot {
    /// Number of documents
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    /// Whether the result is empty
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Build a snapshot whose changes are computed against `previous`.
    pub fn diff(previous: &[DocumentSnapshot], docs: Vec<DocumentSnapshot>) -> Self {
        let mut changes = Vec::new();
        for doc in &docs {
            match previous.iter().find(|p| p.path == doc.path) {
                None => changes.push(DocumentChange {
                    kind: ChangeKind::Added,
                    doc: doc.clone(),
                }),
                Some(prev) if prev.version != doc.version => changes.push(DocumentChange {
                    kind: ChangeKind::Modified,
                    doc: doc.clone(),
                }),
                Some(_) => {}
            }
        }
        for prev in previous {
            if !docs.iter().any(|d| d.path == prev.path) {
                changes.push(DocumentChange {
                    kind: ChangeKind::Removed,
                    doc: prev.clone(),
                });
            }
        }
        QuerySnapshot { docs, changes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(path: &str, version: u64) -> DocumentSnapshot {
        DocumentSnapshot {
            path: DocPath::parse(path).unwrap(),
            data: Some(Document::new()),
            version,
            update_time: Timestamp::from_millis(version as i64),
        }
    }

    #[test]
    fn test_missing_snapshot() {
        let missing = DocumentSnapshot::missing(DocPath::parse("a/b").unwrap());
        assert!(!missing.exists());
        assert!(missing.data_or_empty().is_empty());
    }

    #[test]
    fn test_diff_classifies_changes() {
        let previous = vec![snap("c/a", 1), snap("c/b", 1)];
        let current = vec![snap("c/b", 2), snap("c/c", 3)];
        let result = QuerySnapshot::diff(&previous, current);

        let kinds: Vec<(ChangeKind, &str)> = result
            .changes
            .iter()
            .map(|c| (c.kind, c.doc.path.as_str()))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (ChangeKind::Modified, "c/b"),
                (ChangeKind::Added, "c/c"),
                (ChangeKind::Removed, "c/a"),
            ]
        );
    }

    #[test]
    fn test_diff_without_changes() {
        let docs = vec![snap("c/a", 1)];
        assert!(QuerySnapshot::diff(&docs, docs.clone()).changes.is_empty());
    }
}
