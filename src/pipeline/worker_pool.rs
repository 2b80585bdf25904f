//! # Worker Pool Module
//!
//! Esecuzione concorrente e limitata dei job di compressione.
//!
//! ## Responsabilità:
//! - Esegue fino a `max_workers` job in parallelo (semaforo tokio)
//! - Ordine di partenza FIFO: i permit sono acquisiti in ordine di submit
//! - Timeout per-job con terminazione forzata del processo esterno
//! - Cancellazione pool-wide: i job in coda diventano Cancelled senza
//!   partire, quelli in esecuzione vengono interrotti
//! - Nessuna politica di retry qui: la decide l'orchestratore
//!
//! Il coordinatore attende i JoinHandle dei worker: nessun polling.

use crate::error::{CompressError, Result};
use serde::Serialize;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, warn};

/// Hard ceiling on concurrent workers, regardless of configuration
pub const MAX_WORKERS_CEILING: usize = 8;

/// Cooperative cancellation shared by the pool, its workers and the
/// external tool invocations they run.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolves once cancellation is requested
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before re-checking the flag to avoid a missed wakeup
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

pub type JobId = u64;

/// Position of a segment job within its file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SegmentRef {
    pub index: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::TimedOut)
    }
}

/// One compression unit: a whole file or a single segment
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub size_bytes: u64,
    pub segment: Option<SegmentRef>,
    pub status: JobStatus,
    pub attempt: u32,
    pub started_at: Option<SystemTime>,
    pub finished_at: Option<SystemTime>,
    pub progress: f64,
    pub diagnostic: Option<String>,
}

impl Job {
    pub fn new(id: JobId, source: PathBuf, destination: PathBuf, size_bytes: u64) -> Self {
        Self {
            id,
            source,
            destination,
            size_bytes,
            segment: None,
            status: JobStatus::Pending,
            attempt: 0,
            started_at: None,
            finished_at: None,
            progress: 0.0,
            diagnostic: None,
        }
    }

    pub fn with_segment(mut self, index: usize, total: usize) -> Self {
        self.segment = Some(SegmentRef { index, total });
        self
    }

    /// Requeue for another run: same id, fresh attempt counter
    pub fn reset_for_retry(&mut self) {
        self.status = JobStatus::Pending;
        self.attempt = 0;
        self.started_at = None;
        self.finished_at = None;
        self.progress = 0.0;
        self.diagnostic = None;
    }
}

/// Bounded concurrent executor for compression jobs
pub struct WorkerPool {
    max_workers: usize,
    semaphore: Arc<Semaphore>,
    cancel: CancelToken,
}

impl WorkerPool {
    /// Build a pool with the requested concurrency clamped to the
    /// configured limit and the crate ceiling, never below one worker.
    pub fn new(requested_workers: usize, limit: usize) -> Self {
        Self::with_token(requested_workers, limit, CancelToken::new())
    }

    /// Like `new`, sharing an existing cancellation token
    pub fn with_token(requested_workers: usize, limit: usize, cancel: CancelToken) -> Self {
        let max_workers = requested_workers.min(limit).clamp(1, MAX_WORKERS_CEILING);
        debug!("Worker pool sized to {} workers", max_workers);
        Self {
            max_workers,
            semaphore: Arc::new(Semaphore::new(max_workers)),
            cancel,
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Request cooperative cancellation of queued and running jobs
    pub fn cancel(&self) {
        warn!("Worker pool cancellation requested");
        self.cancel.cancel();
    }

    /// Run all jobs to a terminal status and return them in submission
    /// order. `run_job` performs one compression attempt; its error kind
    /// decides the terminal status. Cancelled runs drop the job future,
    /// which kills any external process it spawned.
    pub async fn run_to_completion<F, Fut>(
        &self,
        jobs: Vec<Job>,
        timeout_per_job: Duration,
        run_job: F,
    ) -> Vec<Job>
    where
        F: Fn(Job) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let mut results: Vec<Option<Job>> = jobs.iter().map(|_| None).collect();
        let mut handles: Vec<(usize, Job, tokio::task::JoinHandle<Job>)> = Vec::new();

        for (index, mut job) in jobs.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                job.status = JobStatus::Cancelled;
                results[index] = Some(job);
                continue;
            }

            // FIFO start order: the next job is not spawned until a
            // permit frees up for it
            let permit = tokio::select! {
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        job.status = JobStatus::Cancelled;
                        results[index] = Some(job);
                        continue;
                    }
                },
                _ = self.cancel.cancelled() => {
                    job.status = JobStatus::Cancelled;
                    results[index] = Some(job);
                    continue;
                }
            };

            let run = run_job.clone();
            let cancel = self.cancel.clone();
            let fallback = job.clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;

                if cancel.is_cancelled() {
                    job.status = JobStatus::Cancelled;
                    return job;
                }

                job.status = JobStatus::Running;
                job.started_at = Some(SystemTime::now());
                job.attempt += 1;
                debug!("Job {} started (attempt {})", job.id, job.attempt);

                let outcome = tokio::select! {
                    outcome = tokio::time::timeout(timeout_per_job, run(job.clone())) => outcome,
                    _ = cancel.cancelled() => {
                        job.status = JobStatus::Cancelled;
                        job.finished_at = Some(SystemTime::now());
                        return job;
                    }
                };

                job.finished_at = Some(SystemTime::now());
                match outcome {
                    Ok(Ok(())) => {
                        job.status = JobStatus::Succeeded;
                        job.progress = 1.0;
                    }
                    Ok(Err(CompressError::Cancelled)) => {
                        job.status = JobStatus::Cancelled;
                    }
                    Ok(Err(e @ CompressError::Timeout { .. })) => {
                        job.status = JobStatus::TimedOut;
                        job.diagnostic = Some(e.to_string());
                    }
                    Ok(Err(e)) => {
                        job.status = JobStatus::Failed;
                        job.diagnostic = Some(e.to_string());
                    }
                    Err(_) => {
                        job.status = JobStatus::TimedOut;
                        job.diagnostic =
                            Some(format!("job exceeded {}s", timeout_per_job.as_secs()));
                    }
                }
                job
            });

            handles.push((index, fallback, handle));
        }

        for (index, fallback, handle) in handles {
            let job = match handle.await {
                Ok(job) => job,
                Err(e) => {
                    // A panicked worker must still yield a terminal job
                    let mut job = fallback;
                    job.status = JobStatus::Failed;
                    job.finished_at = Some(SystemTime::now());
                    job.diagnostic = Some(format!("worker panicked: {}", e));
                    job
                }
            };
            results[index] = Some(job);
        }

        results
            .into_iter()
            .map(|job| job.expect("every job reaches a terminal status"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn test_jobs(n: usize) -> Vec<Job> {
        (0..n)
            .map(|i| {
                Job::new(
                    i as JobId,
                    PathBuf::from(format!("in_{}.mp4", i)),
                    PathBuf::from(format!("out_{}.mp4", i)),
                    1000,
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_all_jobs_succeed() {
        let pool = WorkerPool::new(4, 8);
        let jobs = test_jobs(6);

        let results = pool
            .run_to_completion(jobs, Duration::from_secs(5), |_job| async { Ok(()) })
            .await;

        assert_eq!(results.len(), 6);
        assert!(results.iter().all(|j| j.status == JobStatus::Succeeded));
        assert!(results.iter().all(|j| j.progress == 1.0));
        assert!(results.iter().all(|j| j.attempt == 1));
        // Submission order preserved in the result set
        let ids: Vec<JobId> = results.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let pool = WorkerPool::new(2, 8);
        let jobs = test_jobs(6);

        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let running_in = Arc::clone(&running);
        let peak_in = Arc::clone(&peak);
        let results = pool
            .run_to_completion(jobs, Duration::from_secs(5), move |_job| {
                let running = Arc::clone(&running_in);
                let peak = Arc::clone(&peak_in);
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        assert!(results.iter().all(|j| j.status == JobStatus::Succeeded));
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_fifo_start_order_single_worker() {
        let pool = WorkerPool::new(1, 8);
        let jobs = test_jobs(5);

        let order: Arc<Mutex<Vec<JobId>>> = Arc::new(Mutex::new(Vec::new()));
        let order_in = Arc::clone(&order);
        pool.run_to_completion(jobs, Duration::from_secs(5), move |job| {
            let order = Arc::clone(&order_in);
            async move {
                order.lock().unwrap().push(job.id);
                Ok(())
            }
        })
        .await;

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_timeout_marks_job_timed_out() {
        let pool = WorkerPool::new(2, 8);
        let jobs = test_jobs(1);

        let results = pool
            .run_to_completion(jobs, Duration::from_millis(50), |_job| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .await;

        assert_eq!(results[0].status, JobStatus::TimedOut);
        assert!(results[0].diagnostic.as_ref().unwrap().contains("exceeded"));
    }

    #[tokio::test]
    async fn test_failure_captures_diagnostic() {
        let pool = WorkerPool::new(2, 8);
        let jobs = test_jobs(2);

        let results = pool
            .run_to_completion(jobs, Duration::from_secs(5), |job| async move {
                if job.id == 0 {
                    Err(CompressError::Tool {
                        tool: "ffmpeg".to_string(),
                        message: "moov atom not found".to_string(),
                    })
                } else {
                    Ok(())
                }
            })
            .await;

        assert_eq!(results[0].status, JobStatus::Failed);
        assert!(results[0]
            .diagnostic
            .as_ref()
            .unwrap()
            .contains("moov atom not found"));
        assert_eq!(results[1].status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_cancel_mid_pool() {
        let pool = WorkerPool::new(2, 8);
        let jobs = test_jobs(5);
        let token = pool.cancel_token();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel();
        });

        let results = pool
            .run_to_completion(jobs, Duration::from_secs(30), |_job| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .await;

        assert_eq!(results.len(), 5);
        assert!(results.iter().all(|j| j.status.is_terminal()));
        assert!(results.iter().all(|j| j.status == JobStatus::Cancelled));

        // The two that had started were forcibly interrupted
        let started = results.iter().filter(|j| j.started_at.is_some()).count();
        let never_started = results.iter().filter(|j| j.started_at.is_none()).count();
        assert_eq!(started, 2);
        assert_eq!(never_started, 3);
        assert!(!results.iter().any(|j| j.status == JobStatus::Pending));
    }

    #[tokio::test]
    async fn test_worker_ceiling() {
        assert_eq!(WorkerPool::new(64, 64).max_workers(), MAX_WORKERS_CEILING);
        assert_eq!(WorkerPool::new(4, 2).max_workers(), 2);
        assert_eq!(WorkerPool::new(0, 8).max_workers(), 1);
    }

    #[test]
    fn test_reset_for_retry() {
        let mut job = Job::new(9, PathBuf::from("a"), PathBuf::from("b"), 1)
            .with_segment(2, 4);
        job.status = JobStatus::Failed;
        job.attempt = 1;
        job.progress = 0.7;
        job.diagnostic = Some("boom".to_string());

        job.reset_for_retry();

        assert_eq!(job.id, 9);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt, 0);
        assert_eq!(job.progress, 0.0);
        assert!(job.diagnostic.is_none());
        // Segment identity survives a requeue
        assert_eq!(job.segment.unwrap().index, 2);
    }
}
