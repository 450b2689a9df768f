//! Backing store contract and an in-memory implementation
//!
//! [`KvBackend`] is the generic batch-get/query/index contract the retrieval
//! layer drives. [`InMemoryBackend`] serves tests and fixture-driven runs and
//! can inject scripted faults (partial results, throttling, outages).

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A stored record; the primary key lives under [`KEY_FIELD`]
pub type Record = serde_json::Value;

/// Field holding a record's primary key
pub const KEY_FIELD: &str = "id";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    #[error("resource in use: {0}")]
    ResourceInUse(String),

    #[error("throughput exceeded: {0}")]
    Throttled(String),

    #[error("transient backend failure: {0}")]
    Transient(String),

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl BackendError {
    /// Whether the same request may succeed after a backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BackendError::ResourceInUse(_) | BackendError::Throttled(_) | BackendError::Transient(_)
        )
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// One backend batch-get response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchGetOutput {
    /// Records found; absent keys are simply not present
    pub records: Vec<Record>,
    /// Keys the backend did not get to in this call
    pub unprocessed: Vec<String>,
}

/// A derived secondary index over one field of a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    pub table: String,
    pub field: String,
}

impl IndexDefinition {
    pub fn new(name: impl Into<String>, table: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            field: field.into(),
        }
    }

    /// Checkpoint step id
    pub fn step_id(&self) -> String {
        format!("{}.{}", self.table, self.name)
    }
}

/// Generic key-value store the retrieval layer reads from
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Fetch up to one chunk of keys from `table`.
    async fn batch_get(&self, table: &str, keys: &[String]) -> BackendResult<BatchGetOutput>;

    /// Records of `table` whose indexed field equals `value`.
    async fn query(&self, table: &str, index: &str, value: &str) -> BackendResult<Vec<Record>>;

    /// Create (or re-create) a secondary index. Must be idempotent.
    async fn create_index(&self, index: &IndexDefinition) -> BackendResult<()>;
}

/// Scripted fault consumed by the next backend call
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// Leave the last `n` requested keys unprocessed
    Unprocessed(usize),
    /// Process nothing
    UnprocessedAll,
    /// Fail the call outright
    Fail(BackendError),
}

/// In-memory [`KvBackend`] with fault injection
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    tables: RwLock<HashMap<String, BTreeMap<String, Record>>>,
    /// index name -> (table, field)
    indexes: RwLock<HashMap<String, (String, String)>>,
    faults: RwLock<VecDeque<Fault>>,
    /// Applied to every call once the scripted queue is empty
    persistent_fault: RwLock<Option<Fault>>,
    batch_calls: AtomicUsize,
    query_calls: AtomicUsize,
    index_calls: AtomicUsize,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record keyed by its [`KEY_FIELD`]. Records without a string
    /// key are ignored.
    pub fn insert(&self, table: &str, record: Record) {
        let Some(key) = record.get(KEY_FIELD).and_then(|v| v.as_str()).map(str::to_string) else {
            tracing::warn!(table, "Skipping record without string '{}' field", KEY_FIELD);
            return;
        };
        if let Ok(mut tables) = self.tables.write() {
            tables.entry(table.to_string()).or_default().insert(key, record);
        }
    }

    pub fn insert_all(&self, table: &str, records: impl IntoIterator<Item = Record>) {
        for record in records {
            self.insert(table, record);
        }
    }

    /// Queue faults for the next calls, in order
    pub fn push_fault(&self, fault: Fault) {
        if let Ok(mut faults) = self.faults.write() {
            faults.push_back(fault);
        }
    }

    /// Fault every call until cleared
    pub fn set_persistent_fault(&self, fault: Option<Fault>) {
        if let Ok(mut slot) = self.persistent_fault.write() {
            *slot = fault;
        }
    }

    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    pub fn query_calls(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }

    pub fn index_calls(&self) -> usize {
        self.index_calls.load(Ordering::SeqCst)
    }

    pub fn has_index(&self, name: &str) -> bool {
        self.indexes
            .read()
            .map(|indexes| indexes.contains_key(name))
            .unwrap_or(false)
    }

    fn next_fault(&self) -> Option<Fault> {
        let scripted = self.faults.write().ok().and_then(|mut faults| faults.pop_front());
        scripted.or_else(|| self.persistent_fault.read().ok().and_then(|f| f.clone()))
    }

    fn poisoned() -> BackendError {
        BackendError::Unavailable("in-memory store lock poisoned".into())
    }
}

#[async_trait]
impl KvBackend for InMemoryBackend {
    async fn batch_get(&self, table: &str, keys: &[String]) -> BackendResult<BatchGetOutput> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);

        let (to_process, unprocessed) = match self.next_fault() {
            Some(Fault::Fail(err)) => return Err(err),
            Some(Fault::UnprocessedAll) => (&keys[..0], keys.to_vec()),
            Some(Fault::Unprocessed(n)) => {
                let split = keys.len().saturating_sub(n);
                (&keys[..split], keys[split..].to_vec())
            }
            None => (keys, Vec::new()),
        };

        let tables = self.tables.read().map_err(|_| Self::poisoned())?;
        let records = match tables.get(table) {
            Some(rows) => to_process.iter().filter_map(|k| rows.get(k).cloned()).collect(),
            None => Vec::new(),
        };

        Ok(BatchGetOutput {
            records,
            unprocessed,
        })
    }

    async fn query(&self, table: &str, index: &str, value: &str) -> BackendResult<Vec<Record>> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);

        match self.next_fault() {
            Some(Fault::Fail(err)) => return Err(err),
            Some(Fault::Unprocessed(_)) | Some(Fault::UnprocessedAll) => {
                return Err(BackendError::Throttled(format!("query on {index} throttled")))
            }
            None => {}
        }

        let field = {
            let indexes = self.indexes.read().map_err(|_| Self::poisoned())?;
            match indexes.get(index) {
                Some((indexed_table, field)) if indexed_table == table => field.clone(),
                Some((indexed_table, _)) => {
                    return Err(BackendError::MalformedRequest(format!(
                        "index {index} belongs to table {indexed_table}, not {table}"
                    )))
                }
                None => {
                    return Err(BackendError::MalformedRequest(format!(
                        "index {index} does not exist on {table}"
                    )))
                }
            }
        };

        let tables = self.tables.read().map_err(|_| Self::poisoned())?;
        Ok(tables
            .get(table)
            .map(|rows| {
                rows.values()
                    .filter(|r| r.get(&field).and_then(|v| v.as_str()) == Some(value))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn create_index(&self, index: &IndexDefinition) -> BackendResult<()> {
        self.index_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(Fault::Fail(err)) = self.next_fault() {
            return Err(err);
        }

        let mut indexes = self.indexes.write().map_err(|_| Self::poisoned())?;
        indexes.insert(
            index.name.clone(),
            (index.table.clone(), index.field.clone()),
        );
        Ok(())
    }
}
