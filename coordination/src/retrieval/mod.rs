//! Batch data retrieval for agent context assembly
//!
//! - [`backend`]: the [`KvBackend`] contract plus an in-memory implementation
//! - [`batch`]: chunked, concurrent, retrying batch-get and index queries
//! - [`checkpoint`]: atomic on-disk step checkpoint with resume planning
//! - [`index_build`]: resumable derived-index build driven by the checkpoint

pub mod backend;
pub mod batch;
pub mod checkpoint;
pub mod index_build;

pub use backend::{
    BackendError, BackendResult, BatchGetOutput, Fault, IndexDefinition, InMemoryBackend,
    KvBackend, Record, KEY_FIELD,
};
pub use batch::{BatchRetriever, RetrievalError, RetrievalOutcome, RetrievalResult};
pub use checkpoint::{
    plan_steps, CheckpointError, CheckpointResult, ResumeMode, StepCheckpoint, StepRecord,
    StepStatus,
};
pub use index_build::{IndexBuildReport, IndexBuildRunner};
