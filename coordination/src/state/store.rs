//! RocksDB-backed state store
//!
//! Persists backend records with their derived indexes, audit records and
//! async run status, each in its own column family. Index definitions are
//! bincode-encoded; records, audits and status reports hold free-form JSON and
//! are stored as JSON.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use rocksdb::{ColumnFamilyDescriptor, Options, WriteBatch, DB};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

use super::schema::{self, ALL_CFS};
use crate::orchestrator::{AuditError, AuditRecord, AuditResult, AuditSink, RunStatusReport};
use crate::retrieval::{BackendError, BackendResult, BatchGetOutput, IndexDefinition, KvBackend, Record, KEY_FIELD};

/// Error type for state store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Record has no string '{0}' field")]
    MissingKey(&'static str),

    #[error("Index not found: {0}")]
    IndexNotFound(String),

    #[error("Lock poisoned")]
    LockPoisoned,

    #[error("Column family not found: {0}")]
    ColumnFamilyNotFound(String),
}

impl From<StoreError> for BackendError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::IndexNotFound(_) | StoreError::MissingKey(_) => {
                BackendError::MalformedRequest(err.to_string())
            }
            _ => BackendError::Unavailable(err.to_string()),
        }
    }
}

/// Result type for state store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Shared reference to StateStore
pub type SharedStateStore = Arc<StateStore>;

/// RocksDB-backed persistent state store
pub struct StateStore {
    db: RwLock<DB>,
    path: PathBuf,
}

impl StateStore {
    /// Open or create a state store at the given path
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&opts, &path, cf_descriptors)?;
        info!(path = %path.display(), "Opened state store");

        Ok(Self {
            db: RwLock::new(db),
            path,
        })
    }

    /// Create a shared reference to this store
    pub fn shared(self) -> SharedStateStore {
        Arc::new(self)
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    // =========================================================================
    // Generic operations
    // =========================================================================

    fn put_bytes(&self, cf_name: &str, key: &str, bytes: &[u8]) -> StoreResult<()> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;
        db.put_cf(&cf, key.as_bytes(), bytes)?;
        Ok(())
    }

    fn get_bytes(&self, cf_name: &str, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;
        Ok(db.get_cf(&cf, key.as_bytes())?)
    }

    /// Store a bincode-encoded value
    fn put<T: Serialize>(&self, cf_name: &str, key: &str, value: &T) -> StoreResult<()> {
        let bytes = bincode::serde::encode_to_vec(value, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.put_bytes(cf_name, key, &bytes)
    }

    fn get<T: DeserializeOwned>(&self, cf_name: &str, key: &str) -> StoreResult<Option<T>> {
        match self.get_bytes(cf_name, key)? {
            Some(bytes) => {
                let (value, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                    .map_err(|e| StoreError::Deserialization(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn put_json<T: Serialize>(&self, cf_name: &str, key: &str, value: &T) -> StoreResult<()> {
        let bytes = serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.put_bytes(cf_name, key, &bytes)
    }

    fn get_json<T: DeserializeOwned>(&self, cf_name: &str, key: &str) -> StoreResult<Option<T>> {
        match self.get_bytes(cf_name, key)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Deserialization(e.to_string())),
            None => Ok(None),
        }
    }

    /// All (key, value) pairs with a prefix in a column family
    fn scan_prefix(&self, cf_name: &str, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;

        let mut entries = Vec::new();
        for result in db.prefix_iterator_cf(&cf, prefix.as_bytes()) {
            let (key, value) = result?;
            match String::from_utf8(key.to_vec()) {
                Ok(key_str) if key_str.starts_with(prefix) => entries.push((key_str, value.to_vec())),
                _ => break, // Prefix no longer matches
            }
        }
        Ok(entries)
    }

    // =========================================================================
    // Record operations
    // =========================================================================

    /// Store a record keyed by its [`KEY_FIELD`].
    pub fn put_record(&self, table: &str, record: &Record) -> StoreResult<()> {
        let id = record
            .get(KEY_FIELD)
            .and_then(|v| v.as_str())
            .ok_or(StoreError::MissingKey(KEY_FIELD))?;
        self.put_json(schema::CF_RECORDS, &schema::keys::record(table, id), record)
    }

    pub fn get_record(&self, table: &str, id: &str) -> StoreResult<Option<Record>> {
        self.get_json(schema::CF_RECORDS, &schema::keys::record(table, id))
    }

    pub fn list_records(&self, table: &str) -> StoreResult<Vec<Record>> {
        self.scan_prefix(schema::CF_RECORDS, &schema::keys::record_prefix(table))?
            .into_iter()
            .map(|(_, bytes)| {
                serde_json::from_slice(&bytes).map_err(|e| StoreError::Deserialization(e.to_string()))
            })
            .collect()
    }

    // =========================================================================
    // Index operations
    // =========================================================================

    pub fn get_index(&self, name: &str) -> StoreResult<Option<IndexDefinition>> {
        self.get(schema::CF_INDEXES, &schema::keys::index_definition(name))
    }

    /// Rebuild index `definition` from the current records of its table.
    pub fn build_index(&self, definition: &IndexDefinition) -> StoreResult<usize> {
        let records = self.list_records(&definition.table)?;
        let stale = self.scan_prefix(schema::CF_INDEXES, &schema::keys::index_prefix(&definition.name))?;

        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(schema::CF_INDEXES)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(schema::CF_INDEXES.to_string()))?;

        let mut batch = WriteBatch::default();
        for (key, _) in &stale {
            batch.delete_cf(&cf, key.as_bytes());
        }
        let mut entries = 0;
        for record in &records {
            let id = record.get(KEY_FIELD).and_then(|v| v.as_str());
            let value = record.get(&definition.field).and_then(|v| v.as_str());
            if let (Some(id), Some(value)) = (id, value) {
                batch.put_cf(&cf, schema::keys::index_entry(&definition.name, value, id).as_bytes(), b"");
                entries += 1;
            }
        }
        let encoded = bincode::serde::encode_to_vec(definition, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        batch.put_cf(&cf, schema::keys::index_definition(&definition.name).as_bytes(), encoded);
        db.write(batch)?;

        debug!(index = %definition.name, table = %definition.table, entries, "Built index");
        Ok(entries)
    }

    /// Records of `table` whose field indexed by `index` equals `value`.
    pub fn query_index(&self, table: &str, index: &str, value: &str) -> StoreResult<Vec<Record>> {
        let definition = self
            .get_index(index)?
            .filter(|d| d.table == table)
            .ok_or_else(|| StoreError::IndexNotFound(format!("{index} on {table}")))?;

        let mut records = Vec::new();
        for (key, _) in self.scan_prefix(
            schema::CF_INDEXES,
            &schema::keys::index_value_prefix(&definition.name, value),
        )? {
            if let Some(id) = schema::keys::parse_index_entry(&key) {
                if let Some(record) = self.get_record(table, id)? {
                    records.push(record);
                }
            }
        }
        Ok(records)
    }

    // =========================================================================
    // Audit and run status
    // =========================================================================

    pub fn put_audit(&self, record: &AuditRecord) -> StoreResult<()> {
        self.put_json(schema::CF_AUDIT, &schema::keys::audit(&record.run_id), record)
    }

    pub fn get_audit(&self, run_id: &str) -> StoreResult<Option<AuditRecord>> {
        self.get_json(schema::CF_AUDIT, &schema::keys::audit(run_id))
    }

    pub fn put_run_status(&self, request_id: &str, report: &RunStatusReport) -> StoreResult<()> {
        self.put_json(schema::CF_RUNS, &schema::keys::run(request_id), report)
    }

    pub fn get_run_status(&self, request_id: &str) -> StoreResult<Option<RunStatusReport>> {
        self.get_json(schema::CF_RUNS, &schema::keys::run(request_id))
    }
}

#[async_trait]
impl KvBackend for StateStore {
    async fn batch_get(&self, table: &str, keys: &[String]) -> BackendResult<BatchGetOutput> {
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(record) = self.get_record(table, key)? {
                records.push(record);
            }
        }
        Ok(BatchGetOutput {
            records,
            unprocessed: Vec::new(),
        })
    }

    async fn query(&self, table: &str, index: &str, value: &str) -> BackendResult<Vec<Record>> {
        Ok(self.query_index(table, index, value)?)
    }

    async fn create_index(&self, index: &IndexDefinition) -> BackendResult<()> {
        self.build_index(index)?;
        Ok(())
    }
}

impl AuditSink for StateStore {
    fn record_audit(&self, record: &AuditRecord) -> AuditResult<()> {
        self.put_audit(record)
            .map_err(|e| AuditError::Store(e.to_string()))
    }

    fn record_status(&self, request_id: &str, report: &RunStatusReport) -> AuditResult<()> {
        self.put_run_status(request_id, report)
            .map_err(|e| AuditError::Store(e.to_string()))
    }
}
