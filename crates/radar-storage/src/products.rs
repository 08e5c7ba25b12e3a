use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use radar_core::{ProductFilter, ProductRecord};
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("stored row for {id} is unreadable: {reason}")]
    CorruptRow { id: String, reason: String },
    #[error("record {id} has parent {found:?}; expected a child of {expected}")]
    ParentMismatch {
        id: String,
        expected: String,
        found: Option<String>,
    },
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Keyed product persistence. Implementations serialize `upsert` and
/// `replace_children` so concurrent writers never leave a mixed state behind.
#[async_trait]
pub trait ProductStore: Send + Sync {
    /// Insert, or replace the whole record stored under `record.id`.
    async fn upsert(&self, record: ProductRecord) -> Result<(), StorageError>;

    async fn get(&self, id: &str) -> Result<Option<ProductRecord>, StorageError>;

    /// Records matching every set field of `filter`, in listing order.
    async fn search(&self, filter: &ProductFilter) -> Result<Vec<ProductRecord>, StorageError>;

    /// Every record in insertion order. Upserts keep a record's original position.
    async fn list_all(&self) -> Result<Vec<ProductRecord>, StorageError>;

    /// Drop every record whose `parent_id` is `parent_id`, then store `records`.
    /// All records must name `parent_id` as their parent; nothing is written otherwise.
    async fn replace_children(
        &self,
        parent_id: &str,
        records: Vec<ProductRecord>,
    ) -> Result<(), StorageError>;
}

pub(crate) fn check_children(parent_id: &str, records: &[ProductRecord]) -> Result<(), StorageError> {
    match records
        .iter()
        .find(|r| r.parent_id.as_deref() != Some(parent_id))
    {
        Some(bad) => Err(StorageError::ParentMismatch {
            id: bad.id.clone(),
            expected: parent_id.to_string(),
            found: bad.parent_id.clone(),
        }),
        None => Ok(()),
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    next_seq: u64,
    by_seq: BTreeMap<u64, ProductRecord>,
    seq_by_id: HashMap<String, u64>,
}

impl MemoryState {
    fn upsert(&mut self, record: ProductRecord) {
        match self.seq_by_id.get(&record.id) {
            Some(seq) => {
                self.by_seq.insert(*seq, record);
            }
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.seq_by_id.insert(record.id.clone(), seq);
                self.by_seq.insert(seq, record);
            }
        }
    }
}

/// Process-local store used by tests and `RADAR_STORE=memory`.
#[derive(Debug, Default)]
pub struct MemoryProductStore {
    state: RwLock<MemoryState>,
}

impl MemoryProductStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.by_seq.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl ProductStore for MemoryProductStore {
    async fn upsert(&self, record: ProductRecord) -> Result<(), StorageError> {
        self.state.write().await.upsert(record);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<ProductRecord>, StorageError> {
        let state = self.state.read().await;
        Ok(state
            .seq_by_id
            .get(id)
            .and_then(|seq| state.by_seq.get(seq))
            .cloned())
    }

    async fn search(&self, filter: &ProductFilter) -> Result<Vec<ProductRecord>, StorageError> {
        let state = self.state.read().await;
        Ok(state
            .by_seq
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<ProductRecord>, StorageError> {
        Ok(self.state.read().await.by_seq.values().cloned().collect())
    }

    async fn replace_children(
        &self,
        parent_id: &str,
        records: Vec<ProductRecord>,
    ) -> Result<(), StorageError> {
        check_children(parent_id, &records)?;
        let mut state = self.state.write().await;
        let stale = state
            .by_seq
            .iter()
            .filter(|(_, r)| r.parent_id.as_deref() == Some(parent_id))
            .map(|(seq, r)| (*seq, r.id.clone()))
            .collect::<Vec<_>>();
        for (seq, id) in stale {
            state.by_seq.remove(&seq);
            state.seq_by_id.remove(&id);
        }
        for record in records {
            state.upsert(record);
        }
        Ok(())
    }
}
