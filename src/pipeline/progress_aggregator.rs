//! # Progress Aggregation Module
//!
//! Accumula i report di progresso di molti worker concorrenti in un unico
//! valore complessivo pesato per fase, con notifica esterna rate-limited.
//!
//! ## Responsabilità:
//! - Mappa job → frazione di completamento, protetta da un singolo lock
//! - Proiezione fase-locale → progresso complessivo tramite `PhaseWeights`
//! - Pesatura per dimensione file nei batch multi-file
//! - Throttling delle notifiche con bypass per eventi terminali
//! - Guard di rientranza: un callback che riporta progresso non causa
//!   ricorsione né deadlock
//! - Contatore osservabile dei fallimenti del callback
//!
//! ## Regole di consegna:
//! - `report()` registra sempre lo stato; consegna solo se è trascorso
//!   `min_interval` dall'ultima consegna
//! - Eventi terminali (job/fase/file completati) consegnano sempre:
//!   il consumer osserva sempre il 100%
//! - Se nessuna consegna avviene entro `STALENESS_FACTOR × min_interval`
//!   viene emesso un warning di notifier bloccato
//! - La frazione complessiva non regredisce mai (high-water clamp)
//!
//! Il lock non è mai tenuto durante l'invocazione del callback né
//! attraverso chiamate ai tool esterni.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};
use tracing::warn;

/// Forced-staleness multiplier: with no delivery inside
/// `STALENESS_FACTOR * min_interval` the notifier is considered stuck
pub const STALENESS_FACTOR: u32 = 4;

/// Processing phase of one file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Analysis,
    Segmentation,
    Compression,
    Merge,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Analysis => "analysis",
            Phase::Segmentation => "segmentation",
            Phase::Compression => "compression",
            Phase::Merge => "merge",
        };
        write!(f, "{}", name)
    }
}

/// Mapping phase → (start, end) slice of the overall progress scale
#[derive(Debug, Clone, Copy)]
pub struct PhaseWeights {
    pub analysis: (f64, f64),
    pub segmentation: (f64, f64),
    pub compression: (f64, f64),
    pub merge: (f64, f64),
}

impl Default for PhaseWeights {
    fn default() -> Self {
        Self {
            analysis: (0.0, 0.10),
            segmentation: (0.10, 0.25),
            compression: (0.25, 0.90),
            merge: (0.90, 1.0),
        }
    }
}

impl PhaseWeights {
    pub fn span(&self, phase: Phase) -> (f64, f64) {
        match phase {
            Phase::Analysis => self.analysis,
            Phase::Segmentation => self.segmentation,
            Phase::Compression => self.compression,
            Phase::Merge => self.merge,
        }
    }

    /// Intervals must be contiguous, non-overlapping and cover [0, 1]
    pub fn is_valid(&self) -> bool {
        let spans = [self.analysis, self.segmentation, self.compression, self.merge];
        let mut cursor = 0.0;
        for (start, end) in spans {
            if (start - cursor).abs() > f64::EPSILON || end <= start {
                return false;
            }
            cursor = end;
        }
        (cursor - 1.0).abs() < f64::EPSILON
    }
}

/// Immutable progress value handed to consumers
#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    /// Overall completion in [0, 1], monotonically non-decreasing
    pub overall: f64,
    /// Phase of the most recently updated file
    pub phase: Phase,
    /// Workers currently running a job
    pub active_workers: usize,
    /// Jobs finished so far
    pub completed_jobs: usize,
    /// Jobs registered so far
    pub total_jobs: usize,
    /// Human-readable status line
    pub message: Option<String>,
    /// Outward deliveries that returned an error
    pub callback_failures: u64,
    /// Milliseconds since the epoch at snapshot creation
    pub timestamp_ms: u64,
}

type CallbackFn = dyn Fn(&ProgressSnapshot) -> anyhow::Result<()> + Send + Sync;

#[derive(Debug)]
struct JobSlot {
    fraction: f64,
    finished: bool,
}

#[derive(Debug)]
struct FileProgress {
    size_bytes: u64,
    phase: Phase,
    jobs: Vec<JobSlot>,
    done: bool,
}

impl FileProgress {
    /// File-local completion projected through the phase weights
    fn fraction(&self, weights: &PhaseWeights) -> f64 {
        if self.done {
            return 1.0;
        }
        let (start, end) = weights.span(self.phase);
        if self.jobs.is_empty() {
            return start;
        }
        let sum: f64 = self.jobs.iter().map(|j| j.fraction).sum();
        let local = sum / self.jobs.len() as f64;
        start + (end - start) * local
    }
}

struct AggregatorInner {
    files: HashMap<u64, FileProgress>,
    current_phase: Phase,
    active_workers: usize,
    completed_jobs: usize,
    total_jobs: usize,
    message: Option<String>,
    high_water: f64,
    callback: Option<Arc<CallbackFn>>,
    min_interval: Duration,
    last_delivered: Option<Instant>,
    notifying: bool,
    callback_failures: u64,
    weights: PhaseWeights,
}

impl AggregatorInner {
    fn overall(&self) -> f64 {
        let total_size: u64 = self.files.values().map(|f| f.size_bytes).sum();
        if self.files.is_empty() {
            return 0.0;
        }
        let raw = if total_size == 0 {
            let sum: f64 = self
                .files
                .values()
                .map(|f| f.fraction(&self.weights))
                .sum();
            sum / self.files.len() as f64
        } else {
            self.files
                .values()
                .map(|f| {
                    let weight = f.size_bytes as f64 / total_size as f64;
                    weight * f.fraction(&self.weights)
                })
                .sum()
        };
        raw.clamp(0.0, 1.0)
    }

    fn snapshot(&mut self) -> ProgressSnapshot {
        let raw = self.overall();
        if raw > self.high_water {
            self.high_water = raw;
        }

        ProgressSnapshot {
            overall: self.high_water,
            phase: self.current_phase,
            active_workers: self.active_workers,
            completed_jobs: self.completed_jobs,
            total_jobs: self.total_jobs,
            message: self.message.clone(),
            callback_failures: self.callback_failures,
            timestamp_ms: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        }
    }

    fn delivery_due(&self, now: Instant) -> bool {
        match self.last_delivered {
            None => true,
            Some(last) => now.duration_since(last) >= self.min_interval,
        }
    }

    fn staleness_exceeded(&self, now: Instant) -> bool {
        match self.last_delivered {
            None => false,
            Some(last) => now.duration_since(last) >= self.min_interval * STALENESS_FACTOR,
        }
    }
}

/// Clears the notifying flag on every exit path, including callback panics
struct NotifyGuard {
    inner: Arc<Mutex<AggregatorInner>>,
}

impl Drop for NotifyGuard {
    fn drop(&mut self) {
        if let Ok(mut state) = self.inner.lock() {
            state.notifying = false;
        }
    }
}

/// Thread-safe, throttled progress aggregator shared across workers
#[derive(Clone)]
pub struct ProgressAggregator {
    inner: Arc<Mutex<AggregatorInner>>,
}

impl ProgressAggregator {
    pub fn new(weights: PhaseWeights) -> Self {
        debug_assert!(weights.is_valid());
        Self {
            inner: Arc::new(Mutex::new(AggregatorInner {
                files: HashMap::new(),
                current_phase: Phase::Analysis,
                active_workers: 0,
                completed_jobs: 0,
                total_jobs: 0,
                message: None,
                high_water: 0.0,
                callback: None,
                min_interval: Duration::from_millis(500),
                last_delivered: None,
                notifying: false,
                callback_failures: 0,
                weights,
            })),
        }
    }

    /// Register an outward consumer and the minimum delivery interval
    pub fn set_callback<F>(&self, callback: F, min_interval: Duration)
    where
        F: Fn(&ProgressSnapshot) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut state = self.inner.lock().unwrap();
        state.callback = Some(Arc::new(callback));
        state.min_interval = min_interval;
    }

    /// Register a file and its size weight. Files should be registered
    /// before any progress is reported so batch weights stay stable.
    pub fn register_file(&self, file_id: u64, size_bytes: u64) {
        let mut state = self.inner.lock().unwrap();
        state.files.insert(
            file_id,
            FileProgress {
                size_bytes,
                phase: Phase::Analysis,
                jobs: Vec::new(),
                done: false,
            },
        );
    }

    /// Enter a phase for a file, allocating `total_jobs` progress slots
    pub fn begin_phase(&self, file_id: u64, phase: Phase, total_jobs: usize) {
        let mut state = self.inner.lock().unwrap();
        state.current_phase = phase;
        state.total_jobs += total_jobs;
        if let Some(file) = state.files.get_mut(&file_id) {
            file.phase = phase;
            file.jobs = (0..total_jobs)
                .map(|_| JobSlot { fraction: 0.0, finished: false })
                .collect();
        }
        drop(state);
        self.deliver(false);
    }

    /// Fold one job's progress into the aggregate. Called from worker
    /// tasks; the critical section is a few map operations.
    pub fn report(&self, file_id: u64, job_index: usize, fraction: f64) {
        let fraction = fraction.clamp(0.0, 1.0);
        {
            let mut state = self.inner.lock().unwrap();
            if let Some(file) = state.files.get_mut(&file_id) {
                if let Some(slot) = file.jobs.get_mut(job_index) {
                    // Per-job progress never regresses while running
                    if fraction > slot.fraction {
                        slot.fraction = fraction;
                    }
                }
            }
        }
        self.deliver(false);
    }

    /// A worker picked up a job
    pub fn job_started(&self, _file_id: u64, _job_index: usize) {
        let mut state = self.inner.lock().unwrap();
        state.active_workers += 1;
    }

    /// A worker finished a job. Terminal event: bypasses throttling.
    pub fn job_finished(&self, file_id: u64, job_index: usize, success: bool) {
        {
            let mut state = self.inner.lock().unwrap();
            state.active_workers = state.active_workers.saturating_sub(1);
            let mut newly_finished = 0;
            if let Some(file) = state.files.get_mut(&file_id) {
                if let Some(slot) = file.jobs.get_mut(job_index) {
                    if !slot.finished {
                        slot.finished = true;
                        newly_finished = 1;
                    }
                    if success {
                        slot.fraction = 1.0;
                    }
                }
            }
            state.completed_jobs += newly_finished;
        }
        self.deliver(true);
    }

    /// All jobs of the file's current phase are done. Terminal event.
    pub fn complete_phase(&self, file_id: u64) {
        {
            let mut state = self.inner.lock().unwrap();
            let mut newly_finished = 0;
            if let Some(file) = state.files.get_mut(&file_id) {
                for slot in file.jobs.iter_mut() {
                    slot.fraction = 1.0;
                    if !slot.finished {
                        slot.finished = true;
                        newly_finished += 1;
                    }
                }
            }
            state.completed_jobs += newly_finished;
        }
        self.deliver(true);
    }

    /// The file reached a terminal state. Terminal event.
    pub fn complete_file(&self, file_id: u64) {
        {
            let mut state = self.inner.lock().unwrap();
            let mut newly_finished = 0;
            if let Some(file) = state.files.get_mut(&file_id) {
                file.done = true;
                for slot in file.jobs.iter_mut() {
                    if !slot.finished {
                        slot.finished = true;
                        newly_finished += 1;
                    }
                }
            }
            state.completed_jobs += newly_finished;
        }
        self.deliver(true);
    }

    /// The file failed; its contribution freezes where it is. Terminal
    /// event so consumers observe the final state promptly.
    pub fn fail_file(&self, file_id: u64) {
        {
            let mut state = self.inner.lock().unwrap();
            let mut newly_finished = 0;
            if let Some(file) = state.files.get_mut(&file_id) {
                for slot in file.jobs.iter_mut() {
                    if !slot.finished {
                        slot.finished = true;
                        newly_finished += 1;
                    }
                }
            }
            state.completed_jobs += newly_finished;
        }
        self.deliver(true);
    }

    /// Set the human-readable status line
    pub fn set_message(&self, message: impl Into<String>) {
        let mut state = self.inner.lock().unwrap();
        state.message = Some(message.into());
    }

    /// Current aggregate state. Same lock as report(), pure read for
    /// callers.
    pub fn snapshot(&self) -> ProgressSnapshot {
        let mut state = self.inner.lock().unwrap();
        state.snapshot()
    }

    /// Deliver a snapshot to the registered callback.
    ///
    /// Decides under the lock, invokes outside it. The notifying flag
    /// suppresses re-entrant delivery when the callback itself reports.
    fn deliver(&self, forced: bool) {
        let now = Instant::now();
        let (callback, snapshot) = {
            let mut state = self.inner.lock().unwrap();
            if state.notifying {
                if state.staleness_exceeded(now) {
                    warn!(
                        "Progress notifier stuck: no delivery in {}x min_interval",
                        STALENESS_FACTOR
                    );
                }
                return;
            }
            let callback = match &state.callback {
                Some(cb) => Arc::clone(cb),
                None => return,
            };
            if !forced && !state.delivery_due(now) {
                return;
            }
            state.notifying = true;
            (callback, state.snapshot())
        };

        let guard = NotifyGuard { inner: Arc::clone(&self.inner) };
        let result = callback(&snapshot);
        drop(guard);

        let mut state = self.inner.lock().unwrap();
        state.last_delivered = Some(Instant::now());
        if let Err(e) = result {
            state.callback_failures += 1;
            warn!("Progress callback failed: {}", e);
        }
    }
}
