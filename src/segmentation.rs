//! # Segmentation Module
//!
//! Suddivisione dei video grandi in segmenti e ricomposizione finale.
//!
//! ## Responsabilità:
//! - Decide quando un file va segmentato (soglia dimensione E durata)
//! - Pianifica i confini dei segmenti con coda minima garantita
//! - Estrae i segmenti con stream copy (nessuna ricodifica)
//! - Ricompone i segmenti compressi nell'ordine originale via concat demuxer
//! - Verifica di coerenza su dimensioni e durata dopo ogni fase
//!
//! Un'estrazione fallita o un segmento mancante alla ricomposizione è un
//! errore hard: un output incompleto non deve mai sembrare valido.

use crate::config::{Config, SegmentationSettings};
use crate::error::{CompressError, Result};
use crate::media_tool::{concat_args, extract_args, stderr_tail, MediaTool};
use crate::pipeline::CancelToken;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Planned tails shorter than this fold into the previous segment
pub const MIN_SEGMENT_SECONDS: f64 = 5.0;

/// One planned extraction boundary
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlannedSegment {
    pub index: usize,
    pub start: f64,
    pub duration: f64,
}

/// Full segmentation plan for a single source file
#[derive(Debug, Clone)]
pub struct SegmentPlan {
    pub segments: Vec<PlannedSegment>,
    pub total_duration: f64,
}

impl SegmentPlan {
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

/// Extracted segment paths plus any consistency warnings raised
#[derive(Debug, Clone)]
pub struct SplitOutcome {
    pub segments: Vec<PathBuf>,
    pub warnings: Vec<String>,
}

/// Splits oversized videos into segments and merges them back
pub struct SegmentationEngine {
    tool: MediaTool,
    settings: SegmentationSettings,
    split_timeout: Duration,
    merge_timeout: Duration,
    probe_timeout: Duration,
}

impl SegmentationEngine {
    pub fn new(tool: MediaTool, config: &Config) -> Self {
        Self {
            tool,
            settings: config.segmentation.clone(),
            split_timeout: Duration::from_secs(config.tool.split_timeout_seconds),
            merge_timeout: Duration::from_secs(config.tool.merge_timeout_seconds),
            probe_timeout: Duration::from_secs(config.tool.probe_timeout_seconds),
        }
    }

    /// Both thresholds must be exceeded: a long but small file compresses
    /// fine whole, and a huge but short file gains nothing from splitting.
    pub fn should_segment(&self, size_bytes: u64, duration_seconds: f64) -> bool {
        let size_gb = size_bytes as f64 / 1_073_741_824.0;
        size_gb > self.settings.segmentation_threshold_gb
            && duration_seconds > self.settings.duration_threshold_minutes * 60.0
    }

    pub fn plan(&self, duration_seconds: f64) -> SegmentPlan {
        plan_segments(duration_seconds, self.settings.segment_duration_seconds)
    }

    /// Extract every planned segment into `work_dir` with stream copy.
    ///
    /// Returns the segment paths in plan order. `on_progress` receives the
    /// index of each completed boundary.
    pub async fn split(
        &self,
        source: &Path,
        work_dir: &Path,
        plan: &SegmentPlan,
        cancel: Option<&CancelToken>,
        on_progress: Option<&(dyn Fn(usize) + Send + Sync)>,
    ) -> Result<SplitOutcome> {
        tokio::fs::create_dir_all(work_dir).await?;
        let ext = source.extension().and_then(|e| e.to_str()).unwrap_or("mkv");
        let source_size = tokio::fs::metadata(source).await?.len();

        info!(
            "✂️ Splitting {} into {} segments",
            source.display(),
            plan.len()
        );

        let mut outputs = Vec::with_capacity(plan.len());
        let mut total_bytes: u64 = 0;

        for segment in &plan.segments {
            let destination = work_dir.join(format!("segment_{:03}.{}", segment.index, ext));
            debug!(
                "Extracting segment {} [{:.1}s +{:.1}s]",
                segment.index, segment.start, segment.duration
            );

            let args = extract_args(source, segment.start, segment.duration, &destination);
            let output = self.tool.ffmpeg(&args, self.split_timeout, cancel).await?;
            if !output.success() {
                return Err(CompressError::Tool {
                    tool: "ffmpeg".to_string(),
                    message: format!(
                        "segment {} extraction failed: {}",
                        segment.index,
                        stderr_tail(&output.stderr)
                    ),
                });
            }

            let meta = tokio::fs::metadata(&destination).await.map_err(|_| {
                CompressError::Verification(format!(
                    "segment {} missing after extraction",
                    segment.index
                ))
            })?;
            if meta.len() == 0 {
                return Err(CompressError::Verification(format!(
                    "segment {} is empty after extraction",
                    segment.index
                )));
            }

            total_bytes += meta.len();
            if let Some(report) = on_progress {
                report(segment.index);
            }
            outputs.push(destination);
        }

        let mut warnings = Vec::new();
        let drift = size_drift_percent(total_bytes, source_size);
        if drift > self.settings.split_size_warn_percent {
            let message = format!(
                "segment total differs from source size by {:.1}%",
                drift
            );
            warn!("⚠️ {}", message);
            warnings.push(message);
        }

        Ok(SplitOutcome {
            segments: outputs,
            warnings,
        })
    }

    /// Reassemble compressed segments into `destination` in index order.
    ///
    /// `parts` may arrive in completion order. A missing index or a missing
    /// file is a hard failure; size and duration drift only produce the
    /// returned warnings.
    pub async fn merge(
        &self,
        parts: &[(usize, PathBuf)],
        expected_count: usize,
        destination: &Path,
        expected_duration: f64,
        cancel: Option<&CancelToken>,
    ) -> Result<Vec<String>> {
        let ordered = order_parts(parts, expected_count)?;

        let mut parts_bytes: u64 = 0;
        for (index, path) in ordered.iter().enumerate() {
            let meta = tokio::fs::metadata(path).await.map_err(|_| {
                CompressError::Verification(format!(
                    "compressed segment {} missing before merge",
                    index
                ))
            })?;
            if meta.len() == 0 {
                return Err(CompressError::Verification(format!(
                    "compressed segment {} is empty",
                    index
                )));
            }
            parts_bytes += meta.len();
        }

        let parent = destination.parent().unwrap_or_else(|| Path::new("."));
        let mut list = tempfile::Builder::new()
            .prefix("concat_")
            .suffix(".txt")
            .tempfile_in(parent)?;
        for path in &ordered {
            writeln!(list, "{}", concat_entry(path))?;
        }
        list.flush()?;

        info!("🔗 Merging {} segments into {}", ordered.len(), destination.display());
        let args = concat_args(list.path(), destination);
        let output = self.tool.ffmpeg(&args, self.merge_timeout, cancel).await?;
        if !output.success() {
            return Err(CompressError::Tool {
                tool: "ffmpeg".to_string(),
                message: format!("merge failed: {}", stderr_tail(&output.stderr)),
            });
        }

        let merged = tokio::fs::metadata(destination)
            .await
            .map_err(|_| CompressError::Verification("merged output missing".to_string()))?;
        if merged.len() == 0 {
            return Err(CompressError::Verification(
                "merged output is empty".to_string(),
            ));
        }

        let mut warnings = Vec::new();
        let size_drift = size_drift_percent(merged.len(), parts_bytes);
        if size_drift > self.settings.merge_size_warn_percent {
            let message = format!(
                "merged size differs from segment total by {:.1}%",
                size_drift
            );
            warn!("⚠️ {}", message);
            warnings.push(message);
        }

        let info = self.tool.probe(destination, self.probe_timeout).await?;
        let duration_drift = (info.duration - expected_duration).abs();
        if duration_drift > self.settings.merge_duration_warn_seconds {
            let message = format!(
                "merged duration differs from source by {:.2}s",
                duration_drift
            );
            warn!("⚠️ {}", message);
            warnings.push(message);
        }

        Ok(warnings)
    }

    /// Remove a segment working directory, tolerating absence
    pub async fn cleanup(work_dir: &Path) {
        if let Err(e) = tokio::fs::remove_dir_all(work_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", work_dir.display(), e);
            }
        }
    }
}

/// Cut `total` seconds into fixed-length segments, folding a too-short
/// tail into the previous segment. The last segment always ends exactly
/// at `total`.
fn plan_segments(total: f64, segment_duration: f64) -> SegmentPlan {
    if total <= 0.0 || segment_duration <= 0.0 {
        return SegmentPlan {
            segments: Vec::new(),
            total_duration: total.max(0.0),
        };
    }

    let mut segments = Vec::new();
    let mut start = 0.0;
    let mut index = 0;
    while start < total {
        let duration = (total - start).min(segment_duration);
        segments.push(PlannedSegment {
            index,
            start,
            duration,
        });
        start += duration;
        index += 1;
    }

    if segments.len() > 1 {
        let tail = segments[segments.len() - 1];
        if tail.duration < MIN_SEGMENT_SECONDS {
            segments.pop();
            if let Some(previous) = segments.last_mut() {
                previous.duration += tail.duration;
            }
        }
    }

    SegmentPlan {
        segments,
        total_duration: total,
    }
}

/// Sort completion-ordered parts by segment index, requiring a complete
/// contiguous set.
fn order_parts(parts: &[(usize, PathBuf)], expected_count: usize) -> Result<Vec<PathBuf>> {
    if parts.len() != expected_count {
        return Err(CompressError::Verification(format!(
            "expected {} compressed segments, got {}",
            expected_count,
            parts.len()
        )));
    }

    let mut sorted: Vec<(usize, PathBuf)> = parts.to_vec();
    sorted.sort_by_key(|(index, _)| *index);
    for (position, (index, _)) in sorted.iter().enumerate() {
        if *index != position {
            return Err(CompressError::Verification(format!(
                "segment index {} missing from merge set",
                position
            )));
        }
    }

    Ok(sorted.into_iter().map(|(_, path)| path).collect())
}

/// Concat demuxer entry with single-quote escaping
fn concat_entry(path: &Path) -> String {
    let escaped = path.display().to_string().replace('\'', r"'\''");
    format!("file '{}'", escaped)
}

fn size_drift_percent(actual: u64, expected: u64) -> f64 {
    if expected == 0 {
        return 0.0;
    }
    ((actual as f64 - expected as f64).abs() / expected as f64) * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolSettings;

    fn test_engine() -> SegmentationEngine {
        SegmentationEngine::new(MediaTool::resolve(&ToolSettings::default()), &Config::default())
    }

    #[test]
    fn test_should_segment_requires_both_thresholds() {
        let engine = test_engine();
        let gb = 1_073_741_824u64;

        // 12 GB, 2 hours: both exceeded
        assert!(engine.should_segment(12 * gb, 7200.0));
        // 12 GB but short
        assert!(!engine.should_segment(12 * gb, 1200.0));
        // Long but small
        assert!(!engine.should_segment(2 * gb, 7200.0));
        // Exactly at the thresholds does not trigger
        assert!(!engine.should_segment(10 * gb, 3600.0));
    }

    #[test]
    fn test_plan_exact_multiple() {
        let plan = plan_segments(1800.0, 600.0);
        assert_eq!(plan.len(), 3);
        assert_eq!(plan.segments[0].start, 0.0);
        assert_eq!(plan.segments[1].start, 600.0);
        assert_eq!(plan.segments[2].start, 1200.0);
        assert!(plan.segments.iter().all(|s| s.duration == 600.0));
    }

    #[test]
    fn test_plan_tail_folds_into_previous() {
        // 1804s leaves a 4s tail, below the floor
        let plan = plan_segments(1804.0, 600.0);
        assert_eq!(plan.len(), 3);
        assert_eq!(plan.segments[2].duration, 604.0);

        let covered: f64 = plan.segments.iter().map(|s| s.duration).sum();
        assert!((covered - 1804.0).abs() < 1e-9);
    }

    #[test]
    fn test_plan_tail_at_floor_stays_separate() {
        let plan = plan_segments(1805.0, 600.0);
        assert_eq!(plan.len(), 4);
        assert_eq!(plan.segments[3].start, 1800.0);
        assert_eq!(plan.segments[3].duration, 5.0);
    }

    #[test]
    fn test_plan_short_file_single_segment() {
        let plan = plan_segments(120.0, 600.0);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.segments[0].duration, 120.0);
    }

    #[test]
    fn test_plan_degenerate_durations() {
        assert!(plan_segments(0.0, 600.0).is_empty());
        assert!(plan_segments(-3.0, 600.0).is_empty());
        assert!(plan_segments(100.0, 0.0).is_empty());
    }

    #[test]
    fn test_plan_segments_are_contiguous() {
        let plan = plan_segments(3723.5, 600.0);
        let mut expected_start = 0.0;
        for segment in &plan.segments {
            assert!((segment.start - expected_start).abs() < 1e-9);
            expected_start += segment.duration;
        }
        assert!((expected_start - 3723.5).abs() < 1e-9);
    }

    #[test]
    fn test_order_parts_sorts_completion_order() {
        let parts = vec![
            (2, PathBuf::from("c.mkv")),
            (0, PathBuf::from("a.mkv")),
            (3, PathBuf::from("d.mkv")),
            (1, PathBuf::from("b.mkv")),
        ];
        let ordered = order_parts(&parts, 4).unwrap();
        assert_eq!(
            ordered,
            vec![
                PathBuf::from("a.mkv"),
                PathBuf::from("b.mkv"),
                PathBuf::from("c.mkv"),
                PathBuf::from("d.mkv"),
            ]
        );
    }

    #[test]
    fn test_order_parts_rejects_wrong_count() {
        let parts = vec![(0, PathBuf::from("a")), (1, PathBuf::from("b"))];
        let err = order_parts(&parts, 3).unwrap_err();
        assert!(err.to_string().contains("expected 3"));
    }

    #[test]
    fn test_order_parts_rejects_missing_index() {
        let parts = vec![
            (0, PathBuf::from("a")),
            (1, PathBuf::from("b")),
            (1, PathBuf::from("b2")),
            (3, PathBuf::from("d")),
        ];
        let err = order_parts(&parts, 4).unwrap_err();
        assert!(err.to_string().contains("index 2 missing"));
    }

    #[test]
    fn test_concat_entry_escapes_quotes() {
        assert_eq!(
            concat_entry(Path::new("/tmp/plain.mkv")),
            "file '/tmp/plain.mkv'"
        );
        assert_eq!(
            concat_entry(Path::new("/tmp/it's.mkv")),
            r"file '/tmp/it'\''s.mkv'"
        );
    }

    #[test]
    fn test_size_drift_percent() {
        assert_eq!(size_drift_percent(110, 100), 10.0);
        assert_eq!(size_drift_percent(90, 100), 10.0);
        assert_eq!(size_drift_percent(100, 100), 0.0);
        assert_eq!(size_drift_percent(5, 0), 0.0);
    }

    #[tokio::test]
    async fn test_merge_fails_on_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let present = dir.path().join("seg0.mkv");
        tokio::fs::write(&present, b"data").await.unwrap();

        let engine = test_engine();
        let parts = vec![
            (0, present),
            (1, dir.path().join("seg1.mkv")),
        ];
        let err = engine
            .merge(&parts, 2, &dir.path().join("out.mkv"), 100.0, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("segment 1 missing"));
    }
}
