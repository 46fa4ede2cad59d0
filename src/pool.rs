//! The concurrent segment download pipeline.
//
// A bounded task queue feeds a fixed set of worker tasks, each running segments through
// fetch -> decrypt -> spool with bounded retries. Completion order is irrelevant: the spool
// file name encodes the track and segment index, and the final assembly reads segments in
// declared order. Progress reporting is advisory; events are dropped rather than ever blocking
// a worker on a slow consumer.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use crate::checkpoint::segment_file_name;
use crate::client::{fetch_bytes, RateLimiter};
use crate::decrypt::{DecryptionStrategy, Decryptor};
use crate::{Result, Segment, VodlError};

/// Attempts per segment, counting the first.
const MAX_ATTEMPTS: u32 = 5;
/// Base delay of the exponential backoff between attempts.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
/// Fraction of failed segments tolerated before the whole pool run is declared failed.
const FAILURE_TOLERANCE: f64 = 0.01;
/// Queue slots per worker.
const QUEUE_DEPTH_PER_WORKER: usize = 4;
/// Capacity of the advisory progress channel.
const PROGRESS_CAPACITY: usize = 100;

/// One record per segment attempt outcome, emitted on the progress channel.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub track_id: String,
    pub segment_index: i64,
    /// Bytes transferred on this attempt.
    pub bytes: u64,
    pub completed: bool,
    pub error: Option<String>,
}

/// A unit of work for the pool: one segment of one track.
pub struct SegmentTask {
    pub track_id: String,
    pub segment: Segment,
    /// The track's initialization segment payload, needed by sample-level decryption.
    pub init_payload: Option<Arc<Vec<u8>>>,
    pub strategy: DecryptionStrategy,
}

#[derive(Default)]
struct PoolStats {
    completed: AtomicU64,
    failed: AtomicU64,
    total_bytes: AtomicU64,
}

type SegmentDoneFn = dyn Fn(&str, i64) + Send + Sync;

struct PoolShared {
    client: reqwest::Client,
    headers: HashMap<String, String>,
    limiter: Option<Arc<RateLimiter>>,
    decryptor: Arc<Decryptor>,
    /// Spool directory; when unset, payloads are kept in memory (test mode).
    spool_dir: Option<PathBuf>,
    cancel: CancellationToken,
    progress_tx: Option<tokio::sync::mpsc::Sender<ProgressEvent>>,
    stats: PoolStats,
    errors: Mutex<Vec<VodlError>>,
    on_segment_done: Option<Box<SegmentDoneFn>>,
}

/// Worker pool for concurrent segment downloads. Single producer (the orchestrator submits
/// tasks), multiple consumers; the queue is closed by [`WorkerPool::wait`], which then acts as
/// the completion barrier.
pub struct WorkerPool {
    workers: usize,
    shared: Arc<PoolShared>,
    task_tx: Option<kanal::AsyncSender<SegmentTask>>,
    task_rx: kanal::AsyncReceiver<SegmentTask>,
    handles: Vec<JoinHandle<()>>,
}

/// Configuration for a pool run; everything the workers share.
pub struct PoolConfig {
    pub workers: usize,
    pub client: reqwest::Client,
    pub headers: HashMap<String, String>,
    pub limiter: Option<Arc<RateLimiter>>,
    pub decryptor: Arc<Decryptor>,
    pub spool_dir: Option<PathBuf>,
    pub cancel: CancellationToken,
    /// Advisory progress stream; events are dropped when the consumer lags.
    pub progress_tx: Option<tokio::sync::mpsc::Sender<ProgressEvent>>,
    pub on_segment_done: Option<Box<SegmentDoneFn>>,
}

/// Create a progress channel of the bounded capacity the pool expects.
pub fn progress_channel() -> (
    tokio::sync::mpsc::Sender<ProgressEvent>,
    tokio::sync::mpsc::Receiver<ProgressEvent>,
) {
    tokio::sync::mpsc::channel(PROGRESS_CAPACITY)
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> WorkerPool {
        let workers = config.workers.clamp(1, 128);
        let (task_tx, task_rx) = kanal::bounded_async(workers * QUEUE_DEPTH_PER_WORKER);
        WorkerPool {
            workers,
            shared: Arc::new(PoolShared {
                client: config.client,
                headers: config.headers,
                limiter: config.limiter,
                decryptor: config.decryptor,
                spool_dir: config.spool_dir,
                cancel: config.cancel,
                progress_tx: config.progress_tx,
                stats: PoolStats::default(),
                errors: Mutex::new(Vec::new()),
                on_segment_done: config.on_segment_done,
            }),
            task_tx: Some(task_tx),
            task_rx,
            handles: Vec::new(),
        }
    }

    /// Launch the worker tasks.
    pub fn start(&mut self) {
        for worker_id in 0..self.workers {
            let shared = Arc::clone(&self.shared);
            let rx = self.task_rx.clone();
            self.handles.push(tokio::spawn(async move {
                worker_loop(worker_id, shared, rx).await;
            }));
        }
        debug!("started {} download workers", self.workers);
    }

    /// Enqueue a task. Blocks when the bounded queue is full.
    pub async fn submit(&self, task: SegmentTask) -> Result<()> {
        let Some(tx) = &self.task_tx else {
            return Err(VodlError::Cancelled);
        };
        tokio::select! {
            _ = self.shared.cancel.cancelled() => Err(VodlError::Cancelled),
            sent = tx.send(task) => sent.map_err(|_| VodlError::Cancelled),
        }
    }

    /// Close the queue and wait for every worker to drain. Returns an error when the failure
    /// ratio exceeds the tolerated fraction.
    pub async fn wait(&mut self) -> Result<()> {
        self.task_tx.take(); // close the queue; workers exit once it is drained
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        if self.shared.cancel.is_cancelled() {
            return Err(VodlError::Cancelled);
        }
        let failed = self.shared.stats.failed.load(Ordering::Relaxed);
        let completed = self.shared.stats.completed.load(Ordering::Relaxed);
        let total = failed + completed;
        if failed > 0 && total > 0 {
            let ratio = failed as f64 / total as f64;
            if ratio > FAILURE_TOLERANCE {
                return Err(VodlError::TooManyFailures {
                    failed,
                    total,
                    percent: ratio * 100.0,
                });
            }
            warn!("{failed} segments failed ({:.2}% fail rate), continuing", ratio * 100.0);
        }
        Ok(())
    }

    /// Signal cancellation to all workers and in-flight requests.
    pub fn stop(&self) {
        self.shared.cancel.cancel();
    }

    /// Current counters: (completed, failed, total bytes).
    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.shared.stats.completed.load(Ordering::Relaxed),
            self.shared.stats.failed.load(Ordering::Relaxed),
            self.shared.stats.total_bytes.load(Ordering::Relaxed),
        )
    }

    /// Errors recorded for tasks that exhausted their attempts.
    pub fn errors(&self) -> Vec<String> {
        self.shared.errors.lock().expect("pool errors lock")
            .iter().map(|e| e.to_string()).collect()
    }
}

async fn worker_loop(
    worker_id: usize,
    shared: Arc<PoolShared>,
    rx: kanal::AsyncReceiver<SegmentTask>,
) {
    loop {
        let task = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            task = rx.recv() => match task {
                Ok(task) => task,
                Err(_) => break, // queue closed and drained
            },
        };
        process_task(&shared, task).await;
    }
    debug!("worker {worker_id} exiting");
}

async fn process_task(shared: &PoolShared, mut task: SegmentTask) {
    let mut last_error = VodlError::Cancelled;
    for attempt in 1..=MAX_ATTEMPTS {
        if attempt > 1 {
            let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 2);
            tokio::select! {
                _ = shared.cancel.cancelled() => {
                    emit_progress(shared, &task, 0, Some(&VodlError::Cancelled));
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
        match attempt_segment(shared, &mut task).await {
            Ok(bytes) => {
                shared.stats.completed.fetch_add(1, Ordering::Relaxed);
                shared.stats.total_bytes.fetch_add(bytes, Ordering::Relaxed);
                emit_progress(shared, &task, bytes, None);
                if let Some(on_done) = &shared.on_segment_done {
                    on_done(&task.track_id, task.segment.index);
                }
                return;
            }
            Err(e) if e.is_terminal() => {
                emit_progress(shared, &task, 0, Some(&e));
                return;
            }
            Err(e) => {
                debug!(
                    "segment {}/{} attempt {attempt} failed: {e}",
                    task.track_id, task.segment.index
                );
                last_error = e;
            }
        }
    }
    shared.stats.failed.fetch_add(1, Ordering::Relaxed);
    emit_progress(shared, &task, 0, Some(&last_error));
    shared.errors.lock().expect("pool errors lock").push(last_error);
}

// One fetch -> decrypt -> spool cycle. Returns the number of bytes transferred.
async fn attempt_segment(shared: &PoolShared, task: &mut SegmentTask) -> Result<u64> {
    let payload = fetch_bytes(
        &shared.client,
        &task.segment.url,
        &shared.headers,
        task.segment.byte_range.as_ref(),
        shared.limiter.as_deref(),
        &shared.cancel,
    )
    .await?;
    let transferred = payload.len() as u64;

    let init = task.init_payload.as_ref().map(|b| b.as_slice());
    let payload = shared
        .decryptor
        .apply(&task.strategy, init, payload, task.segment.index, &shared.cancel)
        .await?;

    if let Some(dir) = &shared.spool_dir {
        let final_path = dir.join(segment_file_name(&task.track_id, task.segment.index));
        let tmp_path = final_path.with_extension("seg.tmp");
        tokio::fs::write(&tmp_path, &payload)
            .await
            .map_err(|e| VodlError::Io(e, String::from("writing segment spool file")))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = tokio::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o644))
                .await;
        }
        // The segment only ever appears at its final path complete; a crash leaves at most a
        // stale .tmp file behind.
        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .map_err(|e| VodlError::Io(e, String::from("renaming segment spool file")))?;
        task.segment.payload = None;
        task.segment.file_path = Some(final_path);
    } else {
        task.segment.payload = Some(payload);
    }
    Ok(transferred)
}

fn emit_progress(shared: &PoolShared, task: &SegmentTask, bytes: u64, error: Option<&VodlError>) {
    let event = ProgressEvent {
        track_id: task.track_id.clone(),
        segment_index: task.segment.index,
        bytes,
        completed: error.is_none(),
        error: error.map(|e| e.to_string()),
    };
    // Advisory only: when the consumer is slow the event is dropped instead of blocking.
    if let Some(tx) = &shared.progress_tx {
        let _ = tx.try_send(event);
    }
}
