//! Document and collection paths
//!
//! Paths are `/`-separated alternations of collection ids and document ids:
//! `counters/page-1` is a document, `counters/page-1/_counter_shards_` is a
//! collection. Ordering is segment-wise, which is the order range queries
//! and slice boundaries use. Plain string order is not the same thing:
//! `a-x/b` sorts before `a/b` as a string but after it segment-wise.

use crate::error::{Result, TallyError};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Compare two raw path strings segment by segment.
pub fn compare_paths(a: &str, b: &str) -> Ordering {
    a.split('/').cmp(b.split('/'))
}

fn validate(path: &str, want_even: bool) -> Result<()> {
    if path.is_empty() {
        return Err(TallyError::invalid_path(path, "path is empty"));
    }
    let mut count = 0usize;
    for segment in path.split('/') {
        if segment.is_empty() {
            return Err(TallyError::invalid_path(path, "empty segment"));
        }
        count += 1;
    }
    if (count % 2 == 0) != want_even {
        let reason = if want_even {
            "document paths need an even number of segments"
        } else {
            "collection paths need an odd number of segments"
        };
        return Err(TallyError::invalid_path(path, reason));
    }
    Ok(())
}

/// Path to a single document
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocPath(String);

impl DocPath {
    /// Parse and validate a document path.
    pub fn parse(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        validate(&path, true)?;
        Ok(DocPath(path))
    }

    /// The raw path string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last segment: the document id
    pub fn id(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Collection this document lives in
    pub fn parent(&self) -> CollectionPath {
        match self.0.rfind('/') {
            Some(idx) => CollectionPath(self.0[..idx].to_string()),
            None => CollectionPath(String::new()),
        }
    }

    /// Id of the collection this document lives in
    pub fn collection_id(&self) -> &str {
        let mut parts = self.0.rsplit('/');
        parts.next();
        parts.next().unwrap_or("")
    }

    /// The document owning this document's collection, if any.
    ///
    /// For a shard `counters/c1/_counter_shards_/abc` this is the counter
    /// `counters/c1`.
    pub fn parent_document(&self) -> Option<DocPath> {
        self.parent().parent()
    }

    /// Subcollection of this document
    pub fn collection(&self, id: &str) -> CollectionPath {
        CollectionPath(format!("{}/{}", self.0, id))
    }

    /// Number of segments in the path
    pub fn depth(&self) -> usize {
        self.0.split('/').count()
    }
}

impl Ord for DocPath {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_paths(&self.0, &other.0)
    }
}

impl PartialOrd for DocPath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for DocPath {
    type Error = TallyError;

    fn try_from(value: String) -> Result<Self> {
        DocPath::parse(value)
    }
}

impl From<DocPath> for String {
    fn from(path: DocPath) -> Self {
        path.0
    }
}

impl AsRef<str> for DocPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Path to a collection of documents
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionPath(String);

impl CollectionPath {
    /// Parse and validate a collection path.
    pub fn parse(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        validate(&path, false)?;
        Ok(CollectionPath(path))
    }

    /// The raw path string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last segment: the collection id
    pub fn id(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Document with the given id inside this collection
    pub fn doc(&self, id: &str) -> Result<DocPath> {
        DocPath::parse(format!("{}/{}", self.0, id))
    }

    /// Document owning this collection; `None` for root collections.
    pub fn parent(&self) -> Option<DocPath> {
        let idx = self.0.rfind('/')?;
        Some(DocPath(self.0[..idx].to_string()))
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_document_path() {
        let path = DocPath::parse("counters/page/_counter_shards_/abc").unwrap();
        assert_eq!(path.id(), "abc");
        assert_eq!(path.collection_id(), "_counter_shards_");
        assert_eq!(path.parent().as_str(), "counters/page/_counter_shards_");
        assert_eq!(path.parent_document().unwrap().as_str(), "counters/page");
        assert_eq!(path.depth(), 4);
    }

    #[test]
    fn test_reject_bad_paths() {
        assert!(DocPath::parse("").is_err());
        assert!(DocPath::parse("counters").is_err());
        assert!(DocPath::parse("counters//x").is_err());
        assert!(CollectionPath::parse("counters/page").is_err());
    }

    #[test]
    fn test_root_document_has_no_parent_document() {
        let path = DocPath::parse("counters/page").unwrap();
        assert!(path.parent_document().is_none());
    }

    #[test]
    fn test_segment_ordering_differs_from_string_ordering() {
        let a = DocPath::parse("a/b").unwrap();
        let b = DocPath::parse("a-x/b").unwrap();
        assert!("a-x/b" < "a/b");
        assert!(a < b);
    }

    #[test]
    fn test_tab_prefixed_ids_sort_first() {
        let partial = DocPath::parse("c/x/s/\t\t\tab").unwrap();
        let shard = DocPath::parse("c/x/s/0abc").unwrap();
        assert!(partial < shard);
    }

    #[test]
    fn test_collection_doc() {
        let coll = CollectionPath::parse("internal/controller/workers").unwrap();
        let doc = coll.doc("0001").unwrap();
        assert_eq!(doc.as_str(), "internal/controller/workers/0001");
        assert_eq!(coll.id(), "workers");
        assert_eq!(coll.parent().unwrap().as_str(), "internal/controller");
    }

    #[test]
    fn test_serde_round_trip_validates() {
        let path = DocPath::parse("a/b").unwrap();
        let json = serde_json::to_string(&path).unwrap();
        assert_eq!(json, "\"a/b\"");
        assert!(serde_json::from_str::<DocPath>("\"a\"").is_err());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn segment() -> impl Strategy<Value = String> {
            "[a-z0-9\t_-]{1,6}"
        }

        proptest! {
            #[test]
            fn ordering_matches_compare_paths(
                a in prop::collection::vec(segment(), 2..=2),
                b in prop::collection::vec(segment(), 2..=2),
            ) {
                let a = DocPath::parse(a.join("/")).unwrap();
                let b = DocPath::parse(b.join("/")).unwrap();
                prop_assert_eq!(a.cmp(&b), compare_paths(a.as_str(), b.as_str()));
                prop_assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
            }

            #[test]
            fn child_documents_sort_after_parent(
                parent in prop::collection::vec(segment(), 2..=2),
                collection in segment(),
                id in segment(),
            ) {
                let parent = DocPath::parse(parent.join("/")).unwrap();
                let child = parent.collection(&collection).doc(&id).unwrap();
                prop_assert!(parent < child);
                prop_assert_eq!(child.parent_document(), Some(parent));
            }
        }
    }
}
