//! Commit-time validation of optimistic transactions
//!
//! Conflicts are detected on the READ set only:
//! - a document read at version V must still be at V
//! - a query must still return the same documents at the same versions
//!
//! Blind writes never conflict.

use crate::query::RangeQuery;
use std::collections::{BTreeMap, HashMap};
use tally_core::DocPath;

use crate::memory::{evaluate_query, StoredDoc};

/// Why a transaction could not commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictType {
    /// A document read by the transaction has been written since
    ReadWriteConflict {
        /// Document that changed
        path: DocPath,
        /// Version seen by the transaction (0 = missing)
        read_version: u64,
        /// Version at validation time (0 = missing)
        current_version: u64,
    },
    /// A query read by the transaction now returns different documents
    QueryResultChanged {
        /// The query whose result moved
        query: RangeQuery,
    },
}

/// Result of transaction validation
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// All conflicts detected
    pub conflicts: Vec<ConflictType>,
}

impl ValidationResult {
    /// No conflicts
    pub fn ok() -> Self {
        Self::default()
    }

    /// Whether the transaction may commit
    pub fn is_valid(&self) -> bool {
        self.conflicts.is_empty()
    }

    /// Append the conflicts of another phase
    pub fn merge(&mut self, other: ValidationResult) {
        self.conflicts.extend(other.conflicts);
    }

    /// Human-readable summary used in conflict errors
    pub fn describe(&self) -> String {
        match self.conflicts.first() {
            None => "no conflict".to_string(),
            Some(ConflictType::ReadWriteConflict {
                path,
                read_version,
                current_version,
            }) => format!(
                "{} changed from version {} to {} ({} conflict(s))",
                path,
                read_version,
                current_version,
                self.conflicts.len()
            ),
            Some(ConflictType::QueryResultChanged { .. }) => format!(
                "query result changed ({} conflict(s))",
                self.conflicts.len()
            ),
        }
    }
}

/// Check every recorded document version against the store.
pub(crate) fn validate_read_set(
    read_set: &HashMap<DocPath, u64>,
    docs: &BTreeMap<DocPath, StoredDoc>,
) -> ValidationResult {
    let mut result = ValidationResult::ok();
    for (path, read_version) in read_set {
        let current_version = docs.get(path).map(|d| d.version).unwrap_or(0);
        if current_version != *read_version {
            result.conflicts.push(ConflictType::ReadWriteConflict {
                path: path.clone(),
                read_version: *read_version,
                current_version,
            });
        }
    }
    result
}

/// Re-run every recorded query and compare (path, version) lists.
pub(crate) fn validate_query_set(
    query_set: &[(RangeQuery, Vec<(DocPath, u64)>)],
    docs: &BTreeMap<DocPath, StoredDoc>,
) -> ValidationResult {
    let mut result = ValidationResult::ok();
    for (query, seen) in query_set {
        let current: Vec<(DocPath, u64)> = evaluate_query(docs, query)
            .map(|(path, stored)| (path.clone(), stored.version))
            .collect();
        if current != *seen {
            result.conflicts.push(ConflictType::QueryResultChanged {
                query: query.clone(),
            });
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::{Document, Timestamp};

    fn stored(version: u64) -> StoredDoc {
        StoredDoc {
            data: Document::new(),
            version,
            update_time: Timestamp::EPOCH,
        }
    }

    fn path(p: &str) -> DocPath {
        DocPath::parse(p).unwrap()
    }

    #[test]
    fn test_unchanged_read_set_is_valid() {
        let mut docs = BTreeMap::new();
        docs.insert(path("c/a"), stored(3));
        let mut reads = HashMap::new();
        reads.insert(path("c/a"), 3);
        reads.insert(path("c/missing"), 0);
        assert!(validate_read_set(&reads, &docs).is_valid());
    }

    #[test]
    fn test_changed_version_conflicts() {
        let mut docs = BTreeMap::new();
        docs.insert(path("c/a"), stored(4));
        let mut reads = HashMap::new();
        reads.insert(path("c/a"), 3);
        let result = validate_read_set(&reads, &docs);
        assert_eq!(
            result.conflicts,
            vec![ConflictType::ReadWriteConflict {
                path: path("c/a"),
                read_version: 3,
                current_version: 4,
            }]
        );
        assert!(result.describe().contains("c/a"));
    }

    #[test]
    fn test_deleted_document_conflicts() {
        let docs = BTreeMap::new();
        let mut reads = HashMap::new();
        reads.insert(path("c/a"), 2);
        assert!(!validate_read_set(&reads, &docs).is_valid());
    }

    #[test]
    fn test_phantom_in_query_conflicts() {
        let mut docs = BTreeMap::new();
        docs.insert(path("c/a"), stored(1));
        let query = RangeQuery::collection_group("c");
        let seen = vec![(path("c/a"), 1)];
        assert!(validate_query_set(&[(query.clone(), seen.clone())], &docs).is_valid());

        docs.insert(path("c/b"), stored(2));
        let result = validate_query_set(&[(query, seen)], &docs);
        assert!(matches!(
            result.conflicts.as_slice(),
            [ConflictType::QueryResultChanged { .. }]
        ));
    }
}
