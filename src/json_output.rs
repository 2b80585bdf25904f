//! # JSON Output Module
//!
//! Questo modulo gestisce l'output strutturato in JSON per wrapper esterni
//! (launcher Python/Electron) che pilotano la compressione.
//!
//! ## Responsabilità:
//! - Emette messaggi JSON strutturati su stdout, uno per riga
//! - Converte snapshot di progresso e report del batch in eventi
//! - Fornisce interfaccia standardizzata per comunicazione inter-processo
//!
//! ## Tipi di messaggi:
//! - `start`: Inizio del batch
//! - `file_start`: Inizio elaborazione di un file
//! - `progress`: Avanzamento corrente (fase, worker, frazione totale)
//! - `file_complete`: Fine elaborazione di un file
//! - `complete`: Fine batch con statistiche finali
//! - `error`: Errore durante elaborazione

use crate::config::Config;
use crate::pipeline::compression_pipeline::{BatchReport, FileOutcome, FileReport};
use crate::pipeline::progress_aggregator::ProgressSnapshot;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Tipo di messaggio JSON
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum JsonMessage {
    /// Inizio del batch di compressione
    #[serde(rename = "start")]
    Start {
        total_files: usize,
        total_bytes: u64,
        config: JsonConfig,
    },

    /// Inizio elaborazione di un file specifico
    #[serde(rename = "file_start")]
    FileStart {
        path: PathBuf,
        size: u64,
        index: usize,
        total: usize,
    },

    /// Avanzamento corrente
    #[serde(rename = "progress")]
    Progress {
        overall: f64,
        phase: String,
        active_workers: usize,
        completed_jobs: usize,
        total_jobs: usize,
        message: Option<String>,
    },

    /// Fine elaborazione di un file
    #[serde(rename = "file_complete")]
    FileComplete {
        path: PathBuf,
        outcome: String,
        original_size: u64,
        compressed_size: Option<u64>,
        reduction_percent: Option<f64>,
        segments: usize,
        warnings: Vec<String>,
        failed_stage: Option<String>,
        error: Option<String>,
    },

    /// Batch completato
    #[serde(rename = "complete")]
    Complete {
        compressed: usize,
        failed: usize,
        cancelled: usize,
        dry_run: usize,
        total_original_bytes: u64,
        total_compressed_bytes: u64,
        overall_reduction: f64,
        duration_seconds: f64,
    },

    /// Errore generale
    #[serde(rename = "error")]
    Error {
        message: String,
        details: Option<String>,
    },
}

/// Configurazione riassunta per il messaggio di start
#[derive(Debug, Serialize, Deserialize)]
pub struct JsonConfig {
    pub video_codec: String,
    pub preset: String,
    pub crf: u8,
    pub workers: usize,
    pub segmentation_threshold_gb: f64,
    pub delete_original: bool,
    pub dry_run: bool,
}

impl JsonMessage {
    /// Emette il messaggio JSON su stdout
    pub fn emit(&self) {
        if let Ok(json) = serde_json::to_string(self) {
            println!("{}", json);
        }
    }

    pub fn start(total_files: usize, total_bytes: u64, config: &Config) -> Self {
        Self::Start {
            total_files,
            total_bytes,
            config: JsonConfig {
                video_codec: config.compression.video_codec.clone(),
                preset: config.compression.preset.clone(),
                crf: config.compression.crf,
                workers: config.parallel.max_workers,
                segmentation_threshold_gb: config.segmentation.segmentation_threshold_gb,
                delete_original: config.safety.delete_original_after_compression,
                dry_run: config.dry_run,
            },
        }
    }

    pub fn file_start(path: PathBuf, size: u64, index: usize, total: usize) -> Self {
        Self::FileStart {
            path,
            size,
            index,
            total,
        }
    }

    pub fn progress(snapshot: &ProgressSnapshot) -> Self {
        Self::Progress {
            overall: snapshot.overall,
            phase: snapshot.phase.to_string(),
            active_workers: snapshot.active_workers,
            completed_jobs: snapshot.completed_jobs,
            total_jobs: snapshot.total_jobs,
            message: snapshot.message.clone(),
        }
    }

    pub fn file_complete(report: &FileReport) -> Self {
        Self::FileComplete {
            path: report.source.clone(),
            outcome: outcome_label(report.outcome).to_string(),
            original_size: report.original_size,
            compressed_size: report.compressed_size,
            reduction_percent: report.reduction_percent,
            segments: report.segments,
            warnings: report.warnings.clone(),
            failed_stage: report.failed_stage.map(|s| s.to_string()),
            error: report.diagnostic.clone(),
        }
    }

    pub fn complete(report: &BatchReport) -> Self {
        Self::Complete {
            compressed: report.compressed,
            failed: report.failed,
            cancelled: report.cancelled,
            dry_run: report.dry_run,
            total_original_bytes: report.total_original_bytes,
            total_compressed_bytes: report.total_compressed_bytes,
            overall_reduction: report.overall_reduction(),
            duration_seconds: report.elapsed_seconds,
        }
    }

    pub fn error(message: String, details: Option<String>) -> Self {
        Self::Error { message, details }
    }
}

fn outcome_label(outcome: FileOutcome) -> &'static str {
    match outcome {
        FileOutcome::Compressed => "compressed",
        FileOutcome::DryRun => "dry_run",
        FileOutcome::Failed => "failed",
        FileOutcome::Cancelled => "cancelled",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_message_tag() {
        let message = JsonMessage::Progress {
            overall: 0.42,
            phase: "compression".to_string(),
            active_workers: 4,
            completed_jobs: 2,
            total_jobs: 8,
            message: None,
        };

        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains(r#""type":"progress""#));
        assert!(json.contains(r#""overall":0.42"#));
        assert!(json.contains(r#""phase":"compression""#));
    }

    #[test]
    fn test_file_complete_carries_failure_fields() {
        let mut report = FileReport::new(std::path::Path::new("clip.mp4"));
        report.outcome = FileOutcome::Failed;
        report.diagnostic = Some("probe failed".to_string());

        let json = serde_json::to_string(&JsonMessage::file_complete(&report)).unwrap();
        assert!(json.contains(r#""outcome":"failed""#));
        assert!(json.contains("probe failed"));
    }
}
