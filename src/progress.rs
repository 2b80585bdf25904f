//! # Progress Display Module
//!
//! Questo modulo collega l'aggregatore di progresso alla console.
//!
//! ## Responsabilità:
//! - Progress bar visual con `indicatif` per feedback real-time
//! - Consumo degli snapshot dell'aggregatore (callback throttled)
//! - Riga di stato con fase corrente, worker attivi e job completati
//! - Riepilogo finale del batch con byte risparmiati
//! - Spinner per operazioni indeterminate
//!
//! ## Visual feedback:
//! ```text
//! ⠋ [00:02:15] [========================>---------------] 62% compression | 4 workers | 5/8 jobs
//! ```

use crate::file_manager::FileManager;
use crate::pipeline::{BatchReport, ProgressAggregator};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Bar resolution: overall fraction mapped onto this many ticks
const BAR_SCALE: u64 = 1000;

/// Console progress bar fed by aggregator snapshots
#[derive(Clone)]
pub struct ConsoleProgress {
    bar: ProgressBar,
}

impl ConsoleProgress {
    pub fn new() -> Self {
        let bar = ProgressBar::new(BAR_SCALE);

        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {percent}% {msg}")
                .unwrap()
                .progress_chars("=>-"),
        );

        bar.enable_steady_tick(Duration::from_millis(100));

        Self { bar }
    }

    /// Register this bar as the aggregator's consumer. Snapshot delivery
    /// is throttled by `min_interval` on the aggregator side.
    pub fn attach(&self, aggregator: &ProgressAggregator, min_interval: Duration) {
        let bar = self.bar.clone();
        aggregator.set_callback(
            move |snapshot| {
                bar.set_position((snapshot.overall * BAR_SCALE as f64) as u64);

                let mut status = format!(
                    "{} | {} workers | {}/{} jobs",
                    snapshot.phase,
                    snapshot.active_workers,
                    snapshot.completed_jobs,
                    snapshot.total_jobs
                );
                if let Some(message) = &snapshot.message {
                    status.push_str(" | ");
                    status.push_str(message);
                }
                bar.set_message(status);
                Ok(())
            },
            min_interval,
        );
    }

    /// Finish with a final message
    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }

    /// Leave the bar where it is, for aborted runs
    pub fn abandon(&self, message: &str) {
        self.bar.abandon_with_message(message.to_string());
    }

    /// Create a spinner for indeterminate operations
    pub fn spinner(message: &str) -> ProgressBar {
        let spinner = ProgressBar::new_spinner();

        spinner.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap(),
        );

        spinner.set_message(message.to_string());
        spinner.enable_steady_tick(Duration::from_millis(100));

        spinner
    }
}

impl Default for ConsoleProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// One-line batch summary for the end of a run
pub fn format_summary(report: &BatchReport) -> String {
    let saved = report
        .total_original_bytes
        .saturating_sub(report.total_compressed_bytes);
    let mut summary = format!(
        "Compressed: {} | Failed: {} | Cancelled: {} | Saved: {} ({:.1}%)",
        report.compressed,
        report.failed,
        report.cancelled,
        FileManager::format_size(saved),
        report.overall_reduction()
    );
    if report.dry_run > 0 {
        summary.push_str(&format!(" | Dry run: {}", report.dry_run));
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::compression_pipeline::FileReport;

    #[test]
    fn test_format_summary() {
        let report = BatchReport {
            files: Vec::<FileReport>::new(),
            compressed: 3,
            failed: 1,
            cancelled: 0,
            dry_run: 0,
            total_original_bytes: 10 * 1024 * 1024,
            total_compressed_bytes: 4 * 1024 * 1024,
            elapsed_seconds: 12.0,
        };

        let summary = format_summary(&report);
        assert!(summary.contains("Compressed: 3"));
        assert!(summary.contains("Failed: 1"));
        assert!(summary.contains("6.00 MB"));
        assert!(summary.contains("60.0%"));
        assert!(!summary.contains("Dry run"));
    }

    #[test]
    fn test_format_summary_mentions_dry_run() {
        let report = BatchReport {
            files: Vec::<FileReport>::new(),
            compressed: 0,
            failed: 0,
            cancelled: 0,
            dry_run: 2,
            total_original_bytes: 0,
            total_compressed_bytes: 0,
            elapsed_seconds: 0.1,
        };
        assert!(format_summary(&report).contains("Dry run: 2"));
    }
}
