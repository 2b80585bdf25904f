//! # Compression Pipeline Module
//!
//! Orchestratore principale: ciclo di vita completo di ogni file dalla
//! pre-verifica fino alla cancellazione sicura dell'originale.
//!
//! ## Responsabilità:
//! - Pre-flight: file leggibile, spazio disco sufficiente, output libero
//! - Analisi ffprobe e decisione segmentato / file intero
//! - Job di compressione attraverso il worker pool, con retry limitati
//! - Fallback sequenziale quando troppi job paralleli falliscono
//! - SafetyProtocol attorno a ogni artefatto prodotto
//! - Batch sequenziale di più file con pool e aggregatore condivisi
//!
//! Un file fallito non blocca mai i fratelli del batch.

use crate::config::{CompressionSettings, Config};
use crate::error::{CompressError, Result};
use crate::file_manager::FileManager;
use crate::json_output::JsonMessage;
use crate::media_tool::{encode_args, estimate_encode_seconds, MediaTool};
use crate::pipeline::progress_aggregator::{Phase, PhaseWeights, ProgressAggregator};
use crate::pipeline::worker_pool::{CancelToken, Job, JobStatus, WorkerPool};
use crate::safety::{SafetyProtocol, SafetyStage};
use crate::segmentation::{SegmentPlan, SegmentationEngine};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Disk needed to compress safely: source, temp artifact and slack
const DISK_HEADROOM_FACTOR: f64 = 2.5;

/// Encode timeouts get this margin over the wall-time estimate
const TIMEOUT_SAFETY_FACTOR: f64 = 3.0;

/// No encode timeout below this, however small the input
const MIN_JOB_TIMEOUT_SECONDS: f64 = 300.0;

const GIB: f64 = 1_073_741_824.0;

/// Terminal state of one processed file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOutcome {
    Compressed,
    DryRun,
    Failed,
    Cancelled,
}

/// Result of processing a single file
#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub source: PathBuf,
    pub output: Option<PathBuf>,
    pub outcome: FileOutcome,
    pub original_size: u64,
    pub compressed_size: Option<u64>,
    pub reduction_percent: Option<f64>,
    pub duration_seconds: f64,
    pub segments: usize,
    pub elapsed_seconds: f64,
    pub warnings: Vec<String>,
    pub failed_stage: Option<SafetyStage>,
    pub diagnostic: Option<String>,
}

impl FileReport {
    pub(crate) fn new(source: &Path) -> Self {
        Self {
            source: source.to_path_buf(),
            output: None,
            outcome: FileOutcome::Failed,
            original_size: 0,
            compressed_size: None,
            reduction_percent: None,
            duration_seconds: 0.0,
            segments: 0,
            elapsed_seconds: 0.0,
            warnings: Vec::new(),
            failed_stage: None,
            diagnostic: None,
        }
    }
}

/// Aggregate result of a batch run
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub files: Vec<FileReport>,
    pub compressed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub dry_run: usize,
    pub total_original_bytes: u64,
    pub total_compressed_bytes: u64,
    pub elapsed_seconds: f64,
}

impl BatchReport {
    fn from_reports(files: Vec<FileReport>, elapsed_seconds: f64) -> Self {
        let mut report = Self {
            compressed: 0,
            failed: 0,
            cancelled: 0,
            dry_run: 0,
            total_original_bytes: 0,
            total_compressed_bytes: 0,
            elapsed_seconds,
            files: Vec::new(),
        };
        for file in &files {
            match file.outcome {
                FileOutcome::Compressed => report.compressed += 1,
                FileOutcome::DryRun => report.dry_run += 1,
                FileOutcome::Failed => report.failed += 1,
                FileOutcome::Cancelled => report.cancelled += 1,
            }
            if file.outcome == FileOutcome::Compressed {
                report.total_original_bytes += file.original_size;
                report.total_compressed_bytes += file.compressed_size.unwrap_or(0);
            }
        }
        report.files = files;
        report
    }

    pub fn overall_reduction(&self) -> f64 {
        FileManager::calculate_reduction(self.total_original_bytes, self.total_compressed_bytes)
    }
}

/// Orchestrates analysis, segmentation, compression and safety for
/// one file or a batch. One pool and one aggregator serve the whole
/// batch so progress weighting stays consistent.
pub struct CompressionPipeline {
    config: Config,
    tool: MediaTool,
    segmentation: SegmentationEngine,
    safety: SafetyProtocol,
    pool: WorkerPool,
    aggregator: ProgressAggregator,
    cancel: CancelToken,
    next_job_id: AtomicU64,
}

impl CompressionPipeline {
    pub fn new(config: Config) -> Self {
        let tool = MediaTool::resolve(&config.tool);
        // segment_parallel=false forces one worker: segments still split,
        // but encode one at a time
        let workers = if config.parallel.segment_parallel {
            config.parallel.max_workers
        } else {
            1
        };
        let pool = WorkerPool::new(workers, config.parallel.max_workers_limit);
        let cancel = pool.cancel_token();
        Self {
            tool: tool.clone(),
            segmentation: SegmentationEngine::new(tool.clone(), &config),
            safety: SafetyProtocol::new(tool, &config),
            pool,
            aggregator: ProgressAggregator::new(PhaseWeights::default()),
            cancel,
            next_job_id: AtomicU64::new(0),
            config,
        }
    }

    /// Shared progress handle for registering consumers
    pub fn aggregator(&self) -> ProgressAggregator {
        self.aggregator.clone()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Stop everything: queued jobs cancel, running encodes are killed
    pub fn cancel(&self) {
        self.pool.cancel();
    }

    /// Verify that the external tools answer before any real work
    pub async fn check_dependencies(&self) -> Result<()> {
        self.tool.check_dependencies().await
    }

    /// Process one file through the complete lifecycle
    pub async fn process_file(&self, source: &Path) -> FileReport {
        let size = FileManager::file_size(source).await.unwrap_or(0);
        self.aggregator.register_file(0, size);
        self.process_registered_file(0, source).await
    }

    /// Process files sequentially, reusing this pipeline's pool and
    /// aggregator. Sizes are registered upfront so batch progress is
    /// weighted by relative file size from the first report.
    pub async fn process_batch(&self, sources: &[PathBuf]) -> BatchReport {
        let started = Instant::now();

        let mut sizes = Vec::with_capacity(sources.len());
        for (index, source) in sources.iter().enumerate() {
            let size = FileManager::file_size(source).await.unwrap_or(0);
            self.aggregator.register_file(index as u64, size);
            sizes.push(size);
        }

        if self.config.json_output {
            JsonMessage::start(sources.len(), sizes.iter().sum(), &self.config).emit();
        }

        let mut reports = Vec::with_capacity(sources.len());
        for (index, source) in sources.iter().enumerate() {
            if self.cancel.is_cancelled() {
                let mut report = FileReport::new(source);
                report.outcome = FileOutcome::Cancelled;
                self.aggregator.fail_file(index as u64);
                if self.config.json_output {
                    JsonMessage::file_complete(&report).emit();
                }
                reports.push(report);
                continue;
            }

            if self.config.json_output {
                JsonMessage::file_start(source.clone(), sizes[index], index, sources.len()).emit();
            }
            let report = self.process_registered_file(index as u64, source).await;
            if self.config.json_output {
                JsonMessage::file_complete(&report).emit();
            }
            reports.push(report);
        }

        let batch = BatchReport::from_reports(reports, started.elapsed().as_secs_f64());
        if self.config.json_output {
            JsonMessage::complete(&batch).emit();
        }
        batch
    }

    async fn process_registered_file(&self, file_id: u64, source: &Path) -> FileReport {
        let started = Instant::now();
        let mut report = FileReport::new(source);

        info!("🎬 Processing {}", source.display());
        if let Err(e) = self.run_file(file_id, source, &mut report).await {
            if matches!(e, CompressError::Cancelled) || self.cancel.is_cancelled() {
                report.outcome = FileOutcome::Cancelled;
            } else {
                report.outcome = FileOutcome::Failed;
            }
            if report.diagnostic.is_none() {
                report.diagnostic = Some(e.to_string());
            }
            warn!("❌ {}: {}", source.display(), e);
        }

        match report.outcome {
            FileOutcome::Compressed | FileOutcome::DryRun => {
                self.aggregator.complete_file(file_id)
            }
            FileOutcome::Failed | FileOutcome::Cancelled => self.aggregator.fail_file(file_id),
        }

        report.elapsed_seconds = started.elapsed().as_secs_f64();
        report
    }

    async fn run_file(&self, file_id: u64, source: &Path, report: &mut FileReport) -> Result<()> {
        // Pre-flight
        let size = FileManager::file_size(source).await?;
        report.original_size = size;
        tokio::fs::File::open(source).await.map_err(|e| {
            CompressError::Resource(format!("cannot read {}: {}", source.display(), e))
        })?;
        self.check_disk_space(source, size)?;

        let final_output = self.final_path_for(source);
        if tokio::fs::metadata(&final_output).await.is_ok() {
            return Err(CompressError::Resource(format!(
                "output already exists: {}",
                final_output.display()
            )));
        }

        // Analysis
        self.aggregator.begin_phase(file_id, Phase::Analysis, 1);
        self.aggregator
            .set_message(format!("analyzing {}", display_name(source)));
        let info = self.tool.probe(source, self.probe_timeout()).await?;
        report.duration_seconds = info.duration;
        self.aggregator.complete_phase(file_id);

        let plan = if self.segmentation.should_segment(size, info.duration) {
            Some(self.segmentation.plan(info.duration))
        } else {
            None
        };
        report.segments = plan.as_ref().map(|p| p.len()).unwrap_or(1);

        if self.config.dry_run {
            let estimate = estimate_encode_seconds(size, &self.config.compression.preset);
            let decision = dry_run_summary(plan.as_ref(), &self.config.compression, estimate);
            info!("🔎 {}: {}", display_name(source), decision);
            report.outcome = FileOutcome::DryRun;
            report.diagnostic = Some(decision);
            return Ok(());
        }

        let temp_output = self.temp_path_for(source);
        let mut work_warnings: Vec<String> = Vec::new();

        let record = {
            let warnings_slot = &mut work_warnings;
            let plan_ref = plan.as_ref();
            let temp_for_work = temp_output.clone();
            self.safety
                .run(source, &temp_output, &final_output, move || async move {
                    match plan_ref {
                        Some(plan) => {
                            self.compress_segmented(
                                file_id,
                                source,
                                &temp_for_work,
                                plan,
                                warnings_slot,
                            )
                            .await
                        }
                        None => {
                            self.compress_whole(file_id, source, &temp_for_work, size)
                                .await
                        }
                    }
                })
                .await
        };

        report.warnings.extend(work_warnings);
        report.warnings.extend(record.warnings.iter().cloned());

        if let Some(failure) = &record.failure {
            report.failed_stage = Some(failure.stage);
            report.diagnostic = Some(failure.reason.clone());
            if self.cancel.is_cancelled() {
                report.outcome = FileOutcome::Cancelled;
            } else {
                report.outcome = FileOutcome::Failed;
            }
            return Ok(());
        }

        let compressed = FileManager::file_size(&final_output).await?;
        report.compressed_size = Some(compressed);
        report.reduction_percent = Some(FileManager::calculate_reduction(size, compressed));
        report.output = Some(final_output);
        report.outcome = FileOutcome::Compressed;
        info!(
            "✅ {} compressed: {} -> {} ({:.1}% reduction)",
            display_name(source),
            FileManager::format_size(size),
            FileManager::format_size(compressed),
            report.reduction_percent.unwrap_or(0.0)
        );
        Ok(())
    }

    /// Split, compress each segment through the pool, merge
    async fn compress_segmented(
        &self,
        file_id: u64,
        source: &Path,
        temp_output: &Path,
        plan: &SegmentPlan,
        warnings: &mut Vec<String>,
    ) -> Result<()> {
        let work_dir = temp_output.with_extension("parts");
        let result = self
            .segmented_inner(file_id, source, temp_output, plan, &work_dir, warnings)
            .await;
        if result.is_ok() || !self.config.safety.keep_failed_artifacts {
            SegmentationEngine::cleanup(&work_dir).await;
        }
        result
    }

    async fn segmented_inner(
        &self,
        file_id: u64,
        source: &Path,
        temp_output: &Path,
        plan: &SegmentPlan,
        work_dir: &Path,
        warnings: &mut Vec<String>,
    ) -> Result<()> {
        // Split
        self.aggregator
            .begin_phase(file_id, Phase::Segmentation, plan.len());
        self.aggregator
            .set_message(format!("splitting into {} segments", plan.len()));
        let split_progress = {
            let aggregator = self.aggregator.clone();
            move |index: usize| aggregator.report(file_id, index, 1.0)
        };
        let split = self
            .segmentation
            .split(
                source,
                work_dir,
                plan,
                Some(&self.cancel),
                Some(&split_progress),
            )
            .await?;
        warnings.extend(split.warnings);
        self.aggregator.complete_phase(file_id);

        // Compress all segments
        self.aggregator
            .begin_phase(file_id, Phase::Compression, plan.len());
        self.aggregator
            .set_message(format!("compressing {} segments", plan.len()));
        let ext = temp_output
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("mkv")
            .to_string();

        let mut jobs = Vec::with_capacity(split.segments.len());
        let mut max_size: u64 = 0;
        for (index, segment) in split.segments.iter().enumerate() {
            let segment_size = FileManager::file_size(segment).await?;
            max_size = max_size.max(segment_size);
            let destination = work_dir.join(format!("compressed_{:03}.{}", index, ext));
            jobs.push(
                Job::new(
                    self.next_job_id.fetch_add(1, Ordering::SeqCst),
                    segment.clone(),
                    destination,
                    segment_size,
                )
                .with_segment(index, plan.len()),
            );
        }

        let envelope = self.pool_timeout(max_size);
        let runner = self.encode_runner(file_id);
        let results = self
            .pool
            .run_to_completion(jobs, envelope, runner.clone())
            .await;
        let results = self.fallback_pass(results, envelope, runner).await;

        let mut parts = Vec::with_capacity(results.len());
        for job in &results {
            let index = job.segment.map(|s| s.index).unwrap_or(0);
            match job.status {
                JobStatus::Succeeded => parts.push((index, job.destination.clone())),
                JobStatus::Cancelled => return Err(CompressError::Cancelled),
                _ => {
                    return Err(CompressError::Tool {
                        tool: "ffmpeg".to_string(),
                        message: format!(
                            "segment {} failed: {}",
                            index,
                            job.diagnostic.as_deref().unwrap_or("no diagnostic")
                        ),
                    })
                }
            }
        }
        self.aggregator.complete_phase(file_id);

        // Merge
        self.aggregator.begin_phase(file_id, Phase::Merge, 1);
        self.aggregator.set_message("merging segments");
        let merge_warnings = self
            .segmentation
            .merge(
                &parts,
                plan.len(),
                temp_output,
                plan.total_duration,
                Some(&self.cancel),
            )
            .await?;
        warnings.extend(merge_warnings);
        self.aggregator.complete_phase(file_id);
        Ok(())
    }

    /// One job for the whole file, no split or merge phase
    async fn compress_whole(
        &self,
        file_id: u64,
        source: &Path,
        temp_output: &Path,
        size: u64,
    ) -> Result<()> {
        self.aggregator.begin_phase(file_id, Phase::Compression, 1);
        self.aggregator
            .set_message(format!("compressing {}", display_name(source)));

        let job = Job::new(
            self.next_job_id.fetch_add(1, Ordering::SeqCst),
            source.to_path_buf(),
            temp_output.to_path_buf(),
            size,
        );
        let results = self
            .pool
            .run_to_completion(vec![job], self.pool_timeout(size), self.encode_runner(file_id))
            .await;

        let job = results
            .into_iter()
            .next()
            .ok_or_else(|| CompressError::Resource("worker pool returned no result".to_string()))?;
        match job.status {
            JobStatus::Succeeded => {
                self.aggregator.complete_phase(file_id);
                Ok(())
            }
            JobStatus::Cancelled => Err(CompressError::Cancelled),
            _ => Err(CompressError::Tool {
                tool: "ffmpeg".to_string(),
                message: job
                    .diagnostic
                    .unwrap_or_else(|| "compression failed".to_string()),
            }),
        }
    }

    /// Sequential re-run of the failed subset when parallel failures
    /// exceed the configured fraction. Contention is the usual culprit,
    /// so the second pass runs one job at a time.
    async fn fallback_pass<F, Fut>(&self, jobs: Vec<Job>, timeout: Duration, runner: F) -> Vec<Job>
    where
        F: Fn(Job) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        if self.pool.max_workers() <= 1 || self.cancel.is_cancelled() {
            return jobs;
        }
        let fraction = failed_fraction(&jobs);
        if fraction <= self.config.parallel.sequential_fallback_threshold {
            return jobs;
        }

        let retry = failed_subset(&jobs);
        warn!(
            "🔁 {:.0}% of parallel segment jobs failed, retrying {} sequentially",
            fraction * 100.0,
            retry.len()
        );
        let sequential = WorkerPool::with_token(1, 1, self.cancel.clone());
        let retried = sequential.run_to_completion(retry, timeout, runner).await;
        fold_retries(jobs, retried)
    }

    /// Per-call runner: probe the input, encode with bounded retries,
    /// stream progress into the aggregator.
    fn encode_runner(
        &self,
        file_id: u64,
    ) -> impl Fn(Job) -> BoxFuture<'static, Result<()>> + Clone + Send + 'static {
        let tool = self.tool.clone();
        let aggregator = self.aggregator.clone();
        let cancel = self.cancel.clone();
        let compression = self.config.compression.clone();
        let probe_timeout = self.probe_timeout();
        let max_retries = self.config.safety.max_retries;

        move |job: Job| {
            let tool = tool.clone();
            let aggregator = aggregator.clone();
            let cancel = cancel.clone();
            let compression = compression.clone();
            async move {
                let job_index = job.segment.map(|s| s.index).unwrap_or(0);
                aggregator.job_started(file_id, job_index);
                let result = encode_with_retries(
                    &tool,
                    &compression,
                    &job,
                    file_id,
                    job_index,
                    &aggregator,
                    &cancel,
                    probe_timeout,
                    max_retries,
                )
                .await;
                aggregator.job_finished(file_id, job_index, result.is_ok());
                result
            }
            .boxed()
        }
    }

    fn check_disk_space(&self, source: &Path, size: u64) -> Result<()> {
        let target = self
            .config
            .temp_dir
            .as_deref()
            .unwrap_or_else(|| source.parent().unwrap_or_else(|| Path::new(".")));
        let required = required_disk_bytes(size, self.config.safety.min_free_space_gb);

        match FileManager::available_space(target) {
            Some(available) if available < required => Err(CompressError::Resource(format!(
                "not enough disk space in {}: {} available, {} required",
                target.display(),
                FileManager::format_size(available),
                FileManager::format_size(required)
            ))),
            Some(_) => Ok(()),
            None => {
                warn!(
                    "Cannot determine free space for {}, continuing",
                    target.display()
                );
                Ok(())
            }
        }
    }

    fn temp_path_for(&self, source: &Path) -> PathBuf {
        let dir = self
            .config
            .temp_dir
            .clone()
            .unwrap_or_else(|| parent_dir(source));
        dir.join(format!(
            "{}.tmp.{}",
            file_stem(source),
            file_ext(source)
        ))
    }

    fn final_path_for(&self, source: &Path) -> PathBuf {
        parent_dir(source).join(format!(
            "{}_compressed.{}",
            file_stem(source),
            file_ext(source)
        ))
    }

    fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.config.tool.probe_timeout_seconds)
    }

    /// Pool envelope: one job's timeout times the attempts it may take
    fn pool_timeout(&self, max_job_size: u64) -> Duration {
        job_timeout(max_job_size, &self.config.compression.preset)
            * (self.config.safety.max_retries + 1)
    }
}

#[allow(clippy::too_many_arguments)]
async fn encode_with_retries(
    tool: &MediaTool,
    compression: &CompressionSettings,
    job: &Job,
    file_id: u64,
    job_index: usize,
    aggregator: &ProgressAggregator,
    cancel: &CancelToken,
    probe_timeout: Duration,
    max_retries: u32,
) -> Result<()> {
    let info = tool.probe(&job.source, probe_timeout).await?;
    let args = encode_args(&job.source, &job.destination, compression, &info);
    let timeout = job_timeout(job.size_bytes, &compression.preset);

    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let progress_sink = {
            let aggregator = aggregator.clone();
            move |fraction: f64| aggregator.report(file_id, job_index, fraction)
        };
        match tool
            .run_encode(&args, info.duration, timeout, cancel, &progress_sink)
            .await
        {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() && attempt <= max_retries && !cancel.is_cancelled() => {
                warn!(
                    "🔁 Job {} attempt {} failed: {}, retrying",
                    job.id, attempt, e
                );
            }
            Err(e) => return Err(e),
        }
    }
}

/// Bytes that must be free before compressing a file of `file_size`
fn required_disk_bytes(file_size: u64, min_free_gb: f64) -> u64 {
    (file_size as f64 * DISK_HEADROOM_FACTOR + min_free_gb * GIB) as u64
}

/// Encode timeout from the wall-time estimate, with margin and floor
fn job_timeout(size_bytes: u64, preset: &str) -> Duration {
    let estimate = estimate_encode_seconds(size_bytes, preset);
    Duration::from_secs_f64((estimate * TIMEOUT_SAFETY_FACTOR).max(MIN_JOB_TIMEOUT_SECONDS))
}

fn failed_fraction(jobs: &[Job]) -> f64 {
    if jobs.is_empty() {
        return 0.0;
    }
    let failed = jobs.iter().filter(|j| j.status.is_failure()).count();
    failed as f64 / jobs.len() as f64
}

/// Failed and timed-out jobs, requeued fresh. Cancelled jobs stay put.
fn failed_subset(jobs: &[Job]) -> Vec<Job> {
    jobs.iter()
        .filter(|j| j.status.is_failure())
        .map(|j| {
            let mut job = j.clone();
            job.reset_for_retry();
            job
        })
        .collect()
}

/// Replace first-pass results with their retried counterparts by id
fn fold_retries(mut jobs: Vec<Job>, retried: Vec<Job>) -> Vec<Job> {
    for retry in retried {
        if let Some(slot) = jobs.iter_mut().find(|j| j.id == retry.id) {
            *slot = retry;
        }
    }
    jobs
}

fn dry_run_summary(
    plan: Option<&SegmentPlan>,
    compression: &CompressionSettings,
    estimate_seconds: f64,
) -> String {
    let minutes = estimate_seconds / 60.0;
    match plan {
        Some(plan) => format!(
            "dry run: would split into {} segments and compress with {} preset {} (est. {:.0} min)",
            plan.len(),
            compression.video_codec,
            compression.preset,
            minutes
        ),
        None => format!(
            "dry run: would compress whole with {} preset {} (est. {:.0} min)",
            compression.video_codec, compression.preset, minutes
        ),
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

fn parent_dir(path: &Path) -> PathBuf {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".to_string())
}

fn file_ext(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_string())
        .unwrap_or_else(|| "mp4".to_string())
}
