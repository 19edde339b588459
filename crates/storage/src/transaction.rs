//! Optimistic transaction over `MemoryStore`

use crate::memory::StoreState;
use crate::query::RangeQuery;
use crate::snapshot::{DocumentSnapshot, QuerySnapshot};
use crate::traits::Transaction;
use crate::write::Write;
use std::collections::HashMap;
use std::sync::Arc;
use tally_core::{DocPath, Result, TallyError};

/// Read and write sets of one transaction attempt
pub struct MemoryTransaction {
    state: Arc<StoreState>,
    /// Version of every document read (0 = missing)
    pub(crate) read_set: HashMap<DocPath, u64>,
    /// Every query run with the (path, version) list it returned
    pub(crate) query_set: Vec<(RangeQuery, Vec<(DocPath, u64)>)>,
    /// Buffered writes in order
    pub(crate) writes: Vec<Write>,
}

impl MemoryTransaction {
    pub(crate) fn new(state: Arc<StoreState>) -> Self {
        MemoryTransaction {
            state,
            read_set: HashMap::new(),
            query_set: Vec::new(),
            writes: Vec::new(),
        }
    }

    /// Number of buffered writes
    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }

    fn ensure_reads_first(&self) -> Result<()> {
        if self.writes.is_empty() {
            Ok(())
        } else {
            Err(TallyError::InvalidOperation(
                "transaction reads must happen before writes".to_string(),
            ))
        }
    }
}

impl Transaction for MemoryTransaction {
    fn get(&mut self, path: &DocPath) -> Result<DocumentSnapshot> {
        self.ensure_reads_first()?;
        let snapshot = self.state.read_document(path)?;
        self.read_set
            .entry(path.clone())
            .or_insert(snapshot.version);
        Ok(snapshot)
    }

    fn query(&mut self, query: &RangeQuery) -> Result<QuerySnapshot> {
        self.ensure_reads_first()?;
        let snapshot = self.state.read_query(query)?;
        let seen = snapshot
            .docs
            .iter()
            .map(|doc| (doc.path.clone(), doc.version))
            .collect();
        self.query_set.push((query.clone(), seen));
        Ok(snapshot)
    }

    fn write(&mut self, write: Write) {
        self.writes.push(write);
    }
}
