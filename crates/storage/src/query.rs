//! Range queries ordered by document path

use std::cmp::Ordering;
use tally_core::{compare_paths, CollectionPath, DocPath, Slice};

/// Which documents a query considers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryScope {
    /// Direct children of one collection
    Collection(CollectionPath),
    /// Every collection with this id, at any depth
    CollectionGroup(String),
}

/// Query over documents ordered by path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeQuery {
    /// Documents considered
    pub scope: QueryScope,
    /// Inclusive lower bound
    pub start_at: Option<String>,
    /// Exclusive upper bound
    pub end_before: Option<String>,
    /// Maximum number of results
    pub limit: Option<usize>,
}

impl RangeQuery {
    /// All documents of a collection.
    pub fn collection(collection: CollectionPath) -> Self {
        RangeQuery {
            scope: QueryScope::Collection(collection),
            start_at: None,
            end_before: None,
            limit: None,
        }
    }

    /// All documents of every collection named `collection_id`.
    pub fn collection_group(collection_id: impl Into<String>) -> Self {
        RangeQuery {
            scope: QueryScope::CollectionGroup(collection_id.into()),
            start_at: None,
            end_before: None,
            limit: None,
        }
    }

    /// Shards of a slice: collection-group query bounded by the slice,
    /// empty boundaries left open.
    pub fn slice(collection_id: &str, slice: &Slice, limit: usize) -> Self {
        let mut query = Self::collection_group(collection_id).limit(limit);
        if !slice.start.is_empty() {
            query = query.start_at(slice.start.clone());
        }
        if !slice.end.is_empty() {
            query = query.end_before(slice.end.clone());
        }
        query
    }

    /// Set the inclusive lower bound.
    pub fn start_at(mut self, path: impl Into<String>) -> Self {
        self.start_at = Some(path.into());
        self
    }

    /// Set the exclusive upper bound.
    pub fn end_before(mut self, path: impl Into<String>) -> Self {
        self.end_before = Some(path.into());
        self
    }

    /// Cap the number of results.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `path` belongs to the scope.
    pub fn in_scope(&self, path: &DocPath) -> bool {
        match &self.scope {
            QueryScope::Collection(collection) => path.parent() == *collection,
            QueryScope::CollectionGroup(id) => path.collection_id() == id,
        }
    }

    /// Whether `path` sorts before the lower bound.
    pub fn is_before_start(&self, path: &DocPath) -> bool {
        match &self.start_at {
            Some(start) => compare_paths(path.as_str(), start) == Ordering::Less,
            None => false,
        }
    }

    /// Whether `path` sorts at or after the upper bound.
    pub fn is_past_end(&self, path: &DocPath) -> bool {
        match &self.end_before {
            Some(end) => compare_paths(path.as_str(), end) != Ordering::Less,
            None => false,
        }
    }

    /// Whether `path` lies within the bounds (limit ignored).
    pub fn in_bounds(&self, path: &DocPath) -> bool {
        !self.is_before_start(path) && !self.is_past_end(path)
    }

    /// Whether a write to `path` can change this query's result.
    pub fn may_contain(&self, path: &DocPath) -> bool {
        self.in_scope(path) && self.in_bounds(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(path: &str) -> DocPath {
        DocPath::parse(path).unwrap()
    }

    #[test]
    fn test_collection_group_scope() {
        let query = RangeQuery::collection_group("_shards_");
        assert!(query.in_scope(&doc("c/a/_shards_/x")));
        assert!(query.in_scope(&doc("x/y/z/w/_shards_/x")));
        assert!(!query.in_scope(&doc("c/a/other/x")));
    }

    #[test]
    fn test_collection_scope_is_direct_children() {
        let coll = CollectionPath::parse("state/ctl/workers").unwrap();
        let query = RangeQuery::collection(coll);
        assert!(query.in_scope(&doc("state/ctl/workers/0001")));
        assert!(!query.in_scope(&doc("state/ctl/workers/0001/x/y")));
    }

    #[test]
    fn test_slice_bounds() {
        let slice = Slice::new("c/a/s/b", "c/a/s/d");
        let query = RangeQuery::slice("s", &slice, 10);
        assert_eq!(query.limit, Some(10));
        assert!(!query.in_bounds(&doc("c/a/s/a")));
        assert!(query.in_bounds(&doc("c/a/s/b")));
        assert!(!query.in_bounds(&doc("c/a/s/d")));
    }

    #[test]
    fn test_open_slice_has_no_bounds() {
        let query = RangeQuery::slice("s", &Slice::full(), 5);
        assert!(query.start_at.is_none());
        assert!(query.end_before.is_none());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn slice_bounds_follow_id_order(
                ids in prop::collection::btree_set("[a-z0-9]{1,5}", 1..40),
                start in "[a-z0-9]{0,3}",
                end in "[a-z0-9]{0,3}",
            ) {
                let bound = |id: &str| if id.is_empty() { String::new() } else { format!("c/a/s/{}", id) };
                let query = RangeQuery::slice("s", &Slice::new(bound(&start), bound(&end)), 100);
                for id in &ids {
                    let path = doc(&format!("c/a/s/{}", id));
                    let inside = (start.is_empty() || id.as_str() >= start.as_str())
                        && (end.is_empty() || id.as_str() < end.as_str());
                    prop_assert_eq!(query.in_bounds(&path), inside);
                }
            }
        }
    }
}
