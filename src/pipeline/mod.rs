//! # Pipeline Module
//!
//! Modulo pipeline che separa le responsabilità in sottomoduli:
//! - `compression_pipeline`: Orchestratore principale per file e batch
//! - `worker_pool`: Esecuzione concorrente limitata dei job
//! - `progress_aggregator`: Stato di avanzamento condiviso thread-safe

pub mod compression_pipeline;
pub mod progress_aggregator;
pub mod worker_pool;

// Re-export delle struct principali
pub use compression_pipeline::{BatchReport, CompressionPipeline, FileReport, FileOutcome};
pub use progress_aggregator::{Phase, PhaseWeights, ProgressAggregator, ProgressSnapshot};
pub use worker_pool::{CancelToken, Job, JobStatus, WorkerPool, MAX_WORKERS_CEILING};
