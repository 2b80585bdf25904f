//! # Safe Video Compressor - Main Entry Point
//!
//! Questo è il punto di ingresso principale dell'applicazione.
//!
//! ## Responsabilità:
//! - Parsing degli argomenti della command line con `clap`
//! - Inizializzazione del sistema di logging con `tracing`
//! - Caricamento configurazione e override da CLI
//! - Discovery dei file video da input (file singoli o directory)
//! - Avvio della pipeline e gestione di Ctrl-C
//!
//! ## Flusso di esecuzione:
//! 1. Parsa gli argomenti CLI (input, codec, preset, workers, etc.)
//! 2. Configura il logging su stderr (INFO o DEBUG con --verbose)
//! 3. Carica il file di configurazione e applica gli override CLI
//! 4. Espande le directory in liste di file video
//! 5. Verifica che ffmpeg/ffprobe rispondano
//! 6. Avvia la pipeline con progress bar console o eventi JSON
//!
//! ## Esempio di utilizzo:
//! ```bash
//! video-compressor /media/movies --preset slow --crf 22 --workers 4
//! ```

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use safe_video_compressor::file_manager::FileManager;
use safe_video_compressor::json_output::JsonMessage;
use safe_video_compressor::progress::{self, ConsoleProgress};
use safe_video_compressor::{CompressionPipeline, Config};

#[derive(Parser)]
#[command(name = "video-compressor")]
#[command(about = "Safely compress large videos with segmentation and integrity checks")]
struct Args {
    /// Video files or directories to compress
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of parallel workers
    #[arg(short, long)]
    workers: Option<usize>,

    /// Video codec (libx265, libx264, ...)
    #[arg(long)]
    codec: Option<String>,

    /// Encoder preset (ultrafast, fast, medium, slow)
    #[arg(long)]
    preset: Option<String>,

    /// CRF value (0-51, lower = better quality)
    #[arg(long)]
    crf: Option<u8>,

    /// Keep originals after successful compression
    #[arg(long)]
    no_delete: bool,

    /// Analyze and plan without touching any file
    #[arg(long)]
    dry_run: bool,

    /// Emit machine-readable JSON events on stdout
    #[arg(long)]
    json: bool,

    /// Directory for temporary artifacts
    #[arg(long)]
    temp_dir: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs on stderr so stdout stays clean for JSON events
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(if args.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = match &args.config {
        Some(path) => Config::from_file(path).await?,
        None => Config::default(),
    };

    if let Some(workers) = args.workers {
        config.parallel.max_workers = workers;
    }
    if let Some(codec) = args.codec {
        config.compression.video_codec = codec;
    }
    if let Some(preset) = args.preset {
        config.compression.preset = preset;
    }
    if let Some(crf) = args.crf {
        config.compression.crf = crf;
    }
    if args.no_delete {
        config.safety.delete_original_after_compression = false;
    }
    if args.dry_run {
        config.dry_run = true;
    }
    if args.json {
        config.json_output = true;
    }
    if let Some(temp_dir) = args.temp_dir {
        config.temp_dir = Some(temp_dir);
    }

    config.validate()?;

    let files = discover_inputs(&args.inputs)?;
    if files.is_empty() {
        return Err(anyhow::anyhow!("No video files found in the given inputs"));
    }
    info!("🎬 Found {} video file(s) to compress", files.len());

    let json_mode = config.json_output;
    let interval = Duration::from_secs_f64(config.ui_callback_interval_seconds);
    let pipeline = CompressionPipeline::new(config);

    if let Err(e) = check_dependencies(&pipeline, json_mode).await {
        if json_mode {
            JsonMessage::error(e.to_string(), None).emit();
        }
        return Err(e.into());
    }

    // Ctrl-C cancels queued jobs and kills running encodes
    let cancel = pipeline.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling");
            cancel.cancel();
        }
    });

    let console = if json_mode {
        pipeline.aggregator().set_callback(
            |snapshot| {
                JsonMessage::progress(snapshot).emit();
                Ok(())
            },
            interval,
        );
        None
    } else {
        let console = ConsoleProgress::new();
        console.attach(&pipeline.aggregator(), interval);
        Some(console)
    };

    let report = pipeline.process_batch(&files).await;

    let summary = progress::format_summary(&report);
    if let Some(console) = console {
        if report.failed > 0 || report.cancelled > 0 {
            console.abandon(&summary);
        } else {
            console.finish(&summary);
        }
    }
    info!("{}", summary);

    if report.cancelled > 0 {
        return Err(anyhow::anyhow!("Cancelled with {} file(s) unfinished", report.cancelled));
    }
    if report.failed > 0 {
        return Err(anyhow::anyhow!("{} file(s) failed to compress", report.failed));
    }
    Ok(())
}

async fn check_dependencies(
    pipeline: &CompressionPipeline,
    json_mode: bool,
) -> safe_video_compressor::error::Result<()> {
    if json_mode {
        return pipeline.check_dependencies().await;
    }
    let spinner = ConsoleProgress::spinner("Checking ffmpeg/ffprobe");
    let result = pipeline.check_dependencies().await;
    spinner.finish_and_clear();
    result
}

/// Expand files and directories into a sorted list of video files
fn discover_inputs(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        if !input.exists() {
            return Err(anyhow::anyhow!("Input does not exist: {}", input.display()));
        }
        if input.is_dir() {
            files.extend(FileManager::find_video_files(input)?);
        } else if FileManager::is_video(input) {
            files.push(input.clone());
        } else {
            warn!("Skipping non-video input: {}", input.display());
        }
    }
    files.sort();
    files.dedup();
    Ok(files)
}
