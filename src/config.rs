//! # Configuration Management Module
//!
//! Questo modulo gestisce tutta la configurazione della pipeline.
//!
//! ## Responsabilità:
//! - Definisce la struct `Config` con tutti i parametri di compressione
//! - Fornisce validazione robusta dei parametri di input
//! - Supporta caricamento/salvataggio configurazione da/verso file JSON
//! - Fornisce valori di default sensati per tutti i parametri
//!
//! ## Sezioni di configurazione:
//! - `tool`: Percorsi e timeout per ffmpeg/ffprobe
//! - `compression`: Codec, preset, CRF, preservazione metadata/10-bit
//! - `safety`: Spazio minimo, verifiche, retry, cancellazione originali
//! - `parallel`: Worker paralleli, limite massimo, fallback sequenziale
//! - `segmentation`: Soglie di segmentazione, durata segmenti, tolleranze
//!
//! ## Validazione:
//! - Controlla che crf sia 0-51
//! - Controlla che max_workers sia > 0
//! - Controlla che le soglie di segmentazione siano positive
//! - Controlla che sequential_fallback_threshold sia 0.0-1.0
//!
//! ## Esempio:
//! ```rust
//! # use safe_video_compressor::Config;
//! # fn main() -> anyhow::Result<()> {
//! let mut config = Config::default();
//! config.parallel.max_workers = 8;
//! config.validate()?;
//! # Ok(())
//! # }
//! ```

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// External tool paths and invocation timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSettings {
    /// Explicit ffmpeg path (None = resolve from PATH)
    pub ffmpeg_path: Option<PathBuf>,
    /// Explicit ffprobe path (None = resolve from PATH)
    pub ffprobe_path: Option<PathBuf>,
    /// Timeout for metadata probes in seconds
    pub probe_timeout_seconds: u64,
    /// Timeout for each playability decode test in seconds
    pub playability_timeout_seconds: u64,
    /// Timeout for each stream-copy segment extraction in seconds
    pub split_timeout_seconds: u64,
    /// Timeout for the concat merge invocation in seconds
    pub merge_timeout_seconds: u64,
}

/// Encoder parameters passed through to ffmpeg
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionSettings {
    /// Video codec (libx265, libx264, ...)
    pub video_codec: String,
    /// Encoder preset (ultrafast/fast/medium/slow)
    pub preset: String,
    /// CRF value (0-51, lower = better quality)
    pub crf: u8,
    /// Keep 10-bit pixel format when the source is 10-bit
    pub preserve_10bit: bool,
    /// Copy container metadata and enable faststart
    pub preserve_metadata: bool,
    /// Optional target bitrate as a fraction of the source bitrate
    pub bitrate_reduction: Option<f64>,
}

/// Everything guarding the original file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetySettings {
    /// Minimum free disk space in GB on top of the working estimate
    pub min_free_space_gb: f64,
    /// Run probe + playability verification on temp and final outputs
    pub verify_integrity: bool,
    /// Record a SHA-256 of produced artifacts (truncation guard)
    pub hash_artifacts: bool,
    /// Extra attempts after a failed tool invocation
    pub max_retries: u32,
    /// Delete the original once the final output is verified
    pub delete_original_after_compression: bool,
    /// Keep temp output of failed runs for inspection
    pub keep_failed_artifacts: bool,
}

/// Worker pool sizing and degradation behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelSettings {
    /// Requested number of parallel workers
    pub max_workers: usize,
    /// Upper bound applied to max_workers
    pub max_workers_limit: usize,
    /// Compress segments in parallel (false = one at a time)
    pub segment_parallel: bool,
    /// Failed fraction above which the failed subset is re-run sequentially
    pub sequential_fallback_threshold: f64,
}

/// Segmentation thresholds and drift tolerances
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentationSettings {
    /// Segment only files larger than this (GB)
    pub segmentation_threshold_gb: f64,
    /// Segment only files longer than this (minutes)
    pub duration_threshold_minutes: f64,
    /// Target duration of each segment in seconds
    pub segment_duration_seconds: f64,
    /// Warn when split output sizes drift from the source by more than this percent
    pub split_size_warn_percent: f64,
    /// Warn when the merged size drifts from the summed segments by more than this percent
    pub merge_size_warn_percent: f64,
    /// Warn when merged duration drifts from the source by more than this many seconds
    pub merge_duration_warn_seconds: f64,
}

/// Configuration for the compression pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// External tool settings
    pub tool: ToolSettings,
    /// Encoder settings
    pub compression: CompressionSettings,
    /// Safety protocol settings
    pub safety: SafetySettings,
    /// Concurrency settings
    pub parallel: ParallelSettings,
    /// Segmentation settings
    pub segmentation: SegmentationSettings,
    /// Minimum wall-clock interval between progress callback deliveries
    pub ui_callback_interval_seconds: f64,
    /// Directory for temp artifacts (None = alongside the source file)
    pub temp_dir: Option<PathBuf>,
    /// Dry run - analyze and plan without invoking any tool
    pub dry_run: bool,
    /// Output progress and status as JSON for programmatic use
    pub json_output: bool,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            ffprobe_path: None,
            probe_timeout_seconds: 30,
            playability_timeout_seconds: 30,
            split_timeout_seconds: 300,
            merge_timeout_seconds: 600,
        }
    }
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            video_codec: "libx265".to_string(),
            preset: "medium".to_string(),
            crf: 23,
            preserve_10bit: true,
            preserve_metadata: true,
            bitrate_reduction: None,
        }
    }
}

impl Default for SafetySettings {
    fn default() -> Self {
        Self {
            min_free_space_gb: 10.0,
            verify_integrity: true,
            hash_artifacts: true,
            max_retries: 2,
            delete_original_after_compression: true,
            keep_failed_artifacts: false,
        }
    }
}

impl Default for ParallelSettings {
    fn default() -> Self {
        Self {
            max_workers: 4,
            max_workers_limit: 8,
            segment_parallel: true,
            sequential_fallback_threshold: 0.5,
        }
    }
}

impl Default for SegmentationSettings {
    fn default() -> Self {
        Self {
            segmentation_threshold_gb: 10.0,
            duration_threshold_minutes: 60.0,
            segment_duration_seconds: 600.0,
            split_size_warn_percent: 10.0,
            merge_size_warn_percent: 20.0,
            merge_duration_warn_seconds: 2.0,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tool: ToolSettings::default(),
            compression: CompressionSettings::default(),
            safety: SafetySettings::default(),
            parallel: ParallelSettings::default(),
            segmentation: SegmentationSettings::default(),
            ui_callback_interval_seconds: 0.5,
            temp_dir: None,
            dry_run: false,
            json_output: false,
        }
    }
}

impl Config {
    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.compression.crf > 51 {
            return Err(anyhow::anyhow!("CRF must be between 0 and 51"));
        }

        if self.compression.video_codec.is_empty() {
            return Err(anyhow::anyhow!("Video codec must not be empty"));
        }

        if self.compression.preset.is_empty() {
            return Err(anyhow::anyhow!("Encoder preset must not be empty"));
        }

        if let Some(reduction) = self.compression.bitrate_reduction {
            if reduction <= 0.0 || reduction >= 1.0 {
                return Err(anyhow::anyhow!("Bitrate reduction must be between 0.0 and 1.0"));
            }
        }

        if self.parallel.max_workers == 0 {
            return Err(anyhow::anyhow!("Number of workers must be greater than 0"));
        }

        if self.parallel.max_workers_limit == 0 {
            return Err(anyhow::anyhow!("Worker limit must be greater than 0"));
        }

        let fallback = self.parallel.sequential_fallback_threshold;
        if !(0.0..=1.0).contains(&fallback) {
            return Err(anyhow::anyhow!("Sequential fallback threshold must be between 0.0 and 1.0"));
        }

        if self.segmentation.segmentation_threshold_gb <= 0.0 {
            return Err(anyhow::anyhow!("Segmentation size threshold must be positive"));
        }

        if self.segmentation.duration_threshold_minutes <= 0.0 {
            return Err(anyhow::anyhow!("Segmentation duration threshold must be positive"));
        }

        if self.segmentation.segment_duration_seconds < 10.0 {
            return Err(anyhow::anyhow!("Segment duration must be at least 10 seconds"));
        }

        if self.segmentation.split_size_warn_percent <= 0.0
            || self.segmentation.merge_size_warn_percent <= 0.0
        {
            return Err(anyhow::anyhow!("Size warning tolerances must be positive"));
        }

        if self.segmentation.merge_duration_warn_seconds <= 0.0 {
            return Err(anyhow::anyhow!("Merge duration tolerance must be positive"));
        }

        if self.safety.min_free_space_gb < 0.0 {
            return Err(anyhow::anyhow!("Minimum free space must not be negative"));
        }

        if self.ui_callback_interval_seconds <= 0.0 {
            return Err(anyhow::anyhow!("UI callback interval must be positive"));
        }

        // Validate temp directory if specified
        if let Some(ref temp_dir) = self.temp_dir {
            if !temp_dir.exists() {
                return Err(anyhow::anyhow!("Temp directory does not exist: {}", temp_dir.display()));
            }
            if !temp_dir.is_dir() {
                return Err(anyhow::anyhow!("Temp path is not a directory: {}", temp_dir.display()));
            }
        }

        Ok(())
    }

    /// Load configuration from file
    pub async fn from_file(path: &PathBuf) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path).await?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save_to_file(&self, path: &PathBuf) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.compression.crf = 52;
        assert!(config.validate().is_err());

        config.compression.crf = 23;
        config.parallel.max_workers = 0;
        assert!(config.validate().is_err());

        config.parallel.max_workers = 4;
        config.parallel.sequential_fallback_threshold = 1.5;
        assert!(config.validate().is_err());

        config.parallel.sequential_fallback_threshold = 0.5;
        config.segmentation.segment_duration_seconds = 1.0;
        assert!(config.validate().is_err());

        config.segmentation.segment_duration_seconds = 600.0;
        config.ui_callback_interval_seconds = 0.0;
        assert!(config.validate().is_err());

        config.ui_callback_interval_seconds = 0.5;
        config.segmentation.merge_duration_warn_seconds = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.compression.video_codec, "libx265");
        assert_eq!(config.compression.preset, "medium");
        assert_eq!(config.compression.crf, 23);
        assert_eq!(config.parallel.max_workers, 4);
        assert_eq!(config.parallel.max_workers_limit, 8);
        assert_eq!(config.segmentation.segmentation_threshold_gb, 10.0);
        assert_eq!(config.segmentation.duration_threshold_minutes, 60.0);
        assert!(config.safety.delete_original_after_compression);
        assert!(!config.dry_run);
    }

    #[tokio::test]
    async fn test_config_save_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.json");

        let mut original_config = Config::default();
        original_config.compression.crf = 25;
        original_config.parallel.max_workers = 8;
        original_config.safety.delete_original_after_compression = false;
        original_config.dry_run = true;

        // Save config
        original_config.save_to_file(&config_path).await.unwrap();

        // Load config
        let loaded_config = Config::from_file(&config_path).await.unwrap();

        assert_eq!(loaded_config.compression.crf, 25);
        assert_eq!(loaded_config.parallel.max_workers, 8);
        assert!(!loaded_config.safety.delete_original_after_compression);
        assert!(loaded_config.dry_run);
    }

    #[tokio::test]
    async fn test_config_missing_file_is_default() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nope.json");

        let config = Config::from_file(&config_path).await.unwrap();
        assert_eq!(config.compression.crf, Config::default().compression.crf);
    }
}
