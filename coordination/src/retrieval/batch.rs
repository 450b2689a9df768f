//! Chunked, retrying batch retrieval
//!
//! Keys are split into chunks of at most `chunk_size`, chunks are fetched
//! concurrently, and each chunk retries unprocessed keys and retryable errors
//! along the backoff schedule. Keys still outstanding after the last attempt
//! are reported as missing rather than failing the call.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use tracing::{debug, warn, Instrument};

use super::backend::{BackendError, KvBackend, Record};
use crate::config::RetrievalConfig;
use crate::otel;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RetrievalError {
    /// The request itself was rejected; retrying cannot help
    #[error("malformed retrieval request: {0}")]
    Malformed(String),

    /// The store is down; surfaces as a run-level failure
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
}

pub type RetrievalResult<T> = Result<T, RetrievalError>;

impl From<BackendError> for RetrievalError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::MalformedRequest(msg) => RetrievalError::Malformed(msg),
            other => RetrievalError::StorageUnavailable(other.to_string()),
        }
    }
}

/// Result of one logical retrieval
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrievalOutcome {
    /// Records found, in chunk order
    pub records: Vec<Record>,
    /// Keys still unprocessed after the retry budget
    pub missing: Vec<String>,
    /// Distinct keys requested
    pub requested: usize,
    /// Backend calls issued, retries included
    pub calls: usize,
}

impl RetrievalOutcome {
    pub fn returned(&self) -> usize {
        self.records.len()
    }

    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

struct ChunkOutcome {
    records: Vec<Record>,
    missing: Vec<String>,
    calls: usize,
}

/// Retrieval front end over a [`KvBackend`]
#[derive(Clone)]
pub struct BatchRetriever {
    backend: Arc<dyn KvBackend>,
    config: RetrievalConfig,
}

impl BatchRetriever {
    pub fn new(backend: Arc<dyn KvBackend>, config: RetrievalConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Fetch `keys` from `table`.
    ///
    /// An empty key list returns immediately without touching the backend.
    pub async fn batch_get(&self, table: &str, keys: &[String]) -> RetrievalResult<RetrievalOutcome> {
        let unique = dedupe_keys(keys);
        if unique.is_empty() {
            return Ok(RetrievalOutcome::default());
        }

        let span = otel::retrieval_span(table, unique.len());
        let started = Instant::now();
        let chunk_size = self.config.chunk_size.max(1);

        let chunk_futures = unique
            .chunks(chunk_size)
            .map(|chunk| self.fetch_chunk(table, chunk.to_vec()));
        let results = join_all(chunk_futures).instrument(span.clone()).await;

        let mut outcome = RetrievalOutcome {
            requested: unique.len(),
            ..Default::default()
        };
        for result in results {
            let chunk = result?;
            outcome.records.extend(chunk.records);
            outcome.missing.extend(chunk.missing);
            outcome.calls += chunk.calls;
        }

        otel::record_retrieval_result(
            &span,
            outcome.missing.len(),
            started.elapsed().as_millis() as u64,
        );
        debug!(
            table,
            requested = outcome.requested,
            returned = outcome.returned(),
            missing = outcome.missing.len(),
            calls = outcome.calls,
            "Batch retrieval complete"
        );
        Ok(outcome)
    }

    /// Single-entity lookup through a secondary index, retried like a chunk.
    ///
    /// Exhausting the retry budget yields an empty outcome with `value` listed
    /// as missing.
    pub async fn query(&self, table: &str, index: &str, value: &str) -> RetrievalResult<RetrievalOutcome> {
        let max_attempts = self.config.max_attempts();
        let mut calls = 0;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.config.backoff(attempt - 1)).await;
            }
            calls += 1;
            match self.backend.query(table, index, value).await {
                Ok(records) => {
                    return Ok(RetrievalOutcome {
                        records,
                        missing: Vec::new(),
                        requested: 1,
                        calls,
                    })
                }
                Err(err) if err.is_retryable() => {
                    warn!(table, index, attempt = attempt + 1, error = %err, "Query failed, will retry");
                }
                Err(err) => return Err(err.into()),
            }
        }

        warn!(table, index, attempts = calls, "Query retry budget exhausted");
        Ok(RetrievalOutcome {
            records: Vec::new(),
            missing: vec![value.to_string()],
            requested: 1,
            calls,
        })
    }

    async fn fetch_chunk(&self, table: &str, chunk: Vec<String>) -> RetrievalResult<ChunkOutcome> {
        let max_attempts = self.config.max_attempts();
        let mut pending = chunk;
        let mut records = Vec::new();
        let mut calls = 0;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let delay = self.config.backoff(attempt - 1);
                debug!(table, attempt = attempt + 1, delay_secs = delay.as_secs(), pending = pending.len(), "Backing off before retry");
                tokio::time::sleep(delay).await;
            }
            calls += 1;

            match self.backend.batch_get(table, &pending).await {
                Ok(output) => {
                    records.extend(output.records);
                    pending = output.unprocessed;
                    if pending.is_empty() {
                        return Ok(ChunkOutcome {
                            records,
                            missing: Vec::new(),
                            calls,
                        });
                    }
                }
                Err(err) if err.is_retryable() => {
                    warn!(table, attempt = attempt + 1, error = %err, "Batch get failed, will retry");
                }
                Err(err) => return Err(err.into()),
            }
        }

        warn!(
            table,
            attempts = calls,
            missing = pending.len(),
            "Retry budget exhausted, reporting keys as missing"
        );
        Ok(ChunkOutcome {
            records,
            missing: pending,
            calls,
        })
    }
}

/// Distinct keys in first-seen order
fn dedupe_keys(keys: &[String]) -> Vec<String> {
    let mut seen: HashSet<&str> = HashSet::with_capacity(keys.len());
    keys.iter()
        .filter(|key| seen.insert(key.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::backend::{Fault, InMemoryBackend};
    use serde_json::json;

    fn keys(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("k{i:04}")).collect()
    }

    fn seeded(n: usize) -> Arc<InMemoryBackend> {
        let backend = Arc::new(InMemoryBackend::new());
        for key in keys(n) {
            backend.insert("t", json!({"id": key}));
        }
        backend
    }

    #[tokio::test]
    async fn test_empty_keys_touch_nothing() {
        let backend = seeded(3);
        let retriever = BatchRetriever::new(backend.clone(), RetrievalConfig::default());
        let outcome = retriever.batch_get("t", &[]).await.unwrap();
        assert_eq!(outcome, RetrievalOutcome::default());
        assert_eq!(backend.batch_calls(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_keys_requested_once() {
        let backend = seeded(2);
        let retriever = BatchRetriever::new(backend.clone(), RetrievalConfig::default());
        let request = vec!["k0000".to_string(), "k0000".to_string(), "k0001".to_string()];
        let outcome = retriever.batch_get("t", &request).await.unwrap();
        assert_eq!(outcome.requested, 2);
        assert_eq!(outcome.returned(), 2);
    }

    #[test]
    fn test_dedupe_keeps_first_seen_order() {
        let keys: Vec<String> = (0..100_000)
            .map(|i| format!("k{}", (i * 7) % 50_000))
            .collect();
        let unique = dedupe_keys(&keys);
        assert_eq!(unique.len(), 50_000);
        assert_eq!(&unique[..3], &["k0", "k7", "k14"]);

        let small = vec!["b".to_string(), "a".to_string(), "b".to_string()];
        assert_eq!(dedupe_keys(&small), vec!["b", "a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_results_are_retried() {
        let backend = seeded(10);
        backend.push_fault(Fault::Unprocessed(4));
        backend.push_fault(Fault::Unprocessed(1));
        let retriever = BatchRetriever::new(backend.clone(), RetrievalConfig::default());

        let outcome = retriever.batch_get("t", &keys(10)).await.unwrap();
        assert!(outcome.is_complete());
        assert_eq!(outcome.returned(), 10);
        assert_eq!(outcome.calls, 3);
    }

    #[tokio::test]
    async fn test_malformed_fails_fast() {
        let backend = seeded(1);
        backend.push_fault(Fault::Fail(BackendError::MalformedRequest("bad key".into())));
        let retriever = BatchRetriever::new(backend.clone(), RetrievalConfig::default());

        let err = retriever.batch_get("t", &keys(1)).await.unwrap_err();
        assert!(matches!(err, RetrievalError::Malformed(_)));
        assert_eq!(backend.batch_calls(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_is_not_retried() {
        let backend = seeded(1);
        backend.push_fault(Fault::Fail(BackendError::Unavailable("down".into())));
        let retriever = BatchRetriever::new(backend.clone(), RetrievalConfig::default());

        let err = retriever.batch_get("t", &keys(1)).await.unwrap_err();
        assert!(matches!(err, RetrievalError::StorageUnavailable(_)));
        assert_eq!(backend.batch_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_exhaustion_reports_missing() {
        let backend = seeded(1);
        backend.set_persistent_fault(Some(Fault::Fail(BackendError::Transient("blip".into()))));
        let retriever = BatchRetriever::new(backend.clone(), RetrievalConfig::default());

        let outcome = retriever.query("t", "by_x", "v").await.unwrap();
        assert!(outcome.records.is_empty());
        assert_eq!(outcome.missing, vec!["v".to_string()]);
        assert_eq!(outcome.calls, 6);
        assert_eq!(backend.query_calls(), 6);
    }
}
