//! # Safe Video Compressor Library
//!
//! Questo è il modulo principale della libreria che espone tutte le API pubbliche.
//!
//! ## Responsabilità:
//! - Definisce la struttura modulare dell'applicazione
//! - Espone i tipi e le funzioni principali tramite re-exports
//! - Fornisce un'interfaccia pulita per il main.rs e per altri consumatori
//!
//! ## Architettura dei moduli:
//! - `config`: Gestione configurazione e validazione parametri
//! - `error`: Tipi di errore custom per le diverse operazioni
//! - `media_tool`: Confine verso ffmpeg/ffprobe (probe, encode, template)
//! - `file_manager`: Operazioni sui file, hashing e discovery video
//! - `segmentation`: Piano di segmentazione, split e merge
//! - `safety`: Protocollo di sicurezza per-file (mai distruttivo prima
//!   delle verifiche)
//! - `pipeline`: Orchestratore, worker pool e aggregatore di progresso
//! - `progress`: Progress bar console
//! - `json_output`: Eventi JSON per wrapper esterni
//!
//! ## Utilizzo:
//! ```rust,no_run
//! use safe_video_compressor::{Config, CompressionPipeline};
//!
//! # async fn run() {
//! let config = Config::default();
//! let pipeline = CompressionPipeline::new(config);
//! let report = pipeline.process_file(std::path::Path::new("movie.mkv")).await;
//! # }
//! ```

pub mod config;
pub mod error;
pub mod file_manager;
pub mod json_output;
pub mod media_tool;
pub mod pipeline;
pub mod progress;
pub mod safety;
pub mod segmentation;

pub use config::Config;
pub use error::CompressError;
pub use media_tool::{MediaInfo, MediaTool};
pub use pipeline::{
    BatchReport, CancelToken, CompressionPipeline, FileOutcome, FileReport, ProgressAggregator,
    ProgressSnapshot,
};
pub use safety::{SafetyRecord, SafetyStage};
pub use segmentation::{SegmentPlan, SegmentationEngine};
