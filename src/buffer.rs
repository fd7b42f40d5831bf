use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use influx_line::{BatchConfig, BatchError, BatchPoints, Point, PointError, Precision};
use metrics::{counter, histogram};
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::sink::Sink;
use crate::source::Fields;

/// Amount of expected flow a full batch holds.
pub const FLUSH_HORIZON: Duration = Duration::from_secs(10);

/// Number of samples arriving within `horizon` at `rate` samples per second.
///
/// Never less than one, so a batch always fills eventually.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn iterations_in(horizon: Duration, rate: f64) -> usize {
    let expected = rate.abs() * horizon.as_secs_f64();
    // Absorb representation error so 2.3/s over 10s is 23, not 22.
    let expected = (expected + expected * 1e-9).floor();

    match expected.is_finite() && expected >= 1.0 {
        true => expected as usize,
        false => 1,
    }
}

/// Coarsest timestamp precision that still resolves `expected_flow`.
#[must_use]
pub fn precision_for_flow(expected_flow: f64) -> Precision {
    let flow = expected_flow.abs();
    if flow > 1000.0 {
        Precision::Nanoseconds
    } else if flow > 1.0 {
        Precision::Milliseconds
    } else if flow > 1.0 / 60.0 {
        Precision::Seconds
    } else if flow > 1.0 / 3600.0 {
        Precision::Minutes
    } else {
        Precision::Hours
    }
}

/// Possible failure while saving a point; the buffer is left untouched.
#[derive(Debug, Error)]
pub enum SaveError {
    #[error("Create batch; err={0}")]
    BatchCreation(#[from] BatchError),
    #[error("Construct point; err={0}")]
    PointConstruction(#[from] PointError),
}

#[derive(Debug, Clone)]
pub struct BufferConfig {
    pub database: String,
    pub retention_policy: Option<String>,
    /// Samples per second the buffer should size itself for.
    pub expected_flow: f64,
}

/// Outcome of a single [`BatchBuffer::flush`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub written: usize,
    pub failed: usize,
    pub dropped_points: usize,
}

/// Groups points into capacity-bounded batches and writes full batches to a
/// [`Sink`] in the background.
///
/// Cloning is cheap; clones share the same batches.
#[derive(Clone)]
pub struct BatchBuffer {
    inner: Arc<Inner>,
}

struct Inner {
    sink: Arc<dyn Sink>,
    template: BatchConfig,
    capacity: usize,

    batches: RwLock<Batches>,
    flush_lane: Mutex<()>,
    flushes: TaskTracker,
    /// Background flushes scheduled but not yet finished.
    pending_flushes: watch::Sender<usize>,
}

/// Batches oldest first; only the tail may be open.
#[derive(Default)]
struct Batches {
    queue: VecDeque<Arc<StoreBatch>>,
    next_id: u64,
}

struct StoreBatch {
    id: u64,
    state: Mutex<BatchState>,
}

struct BatchState {
    /// `None` once a flush has taken the points for writing.
    points: Option<BatchPoints>,
    flushing: bool,
}

impl StoreBatch {
    async fn is_open(&self) -> bool {
        !self.state.lock().await.flushing
    }

    async fn seal(&self) {
        self.state.lock().await.flushing = true;
    }

    /// Claims the points for writing; `None` if another flush already did.
    async fn take(&self) -> Option<BatchPoints> {
        let mut state = self.state.lock().await;
        state.flushing = true;

        state.points.take()
    }
}

impl BatchBuffer {
    #[must_use]
    pub fn new(sink: Arc<dyn Sink>, config: BufferConfig) -> Self {
        let BufferConfig { database, retention_policy, expected_flow } = config;
        let capacity = iterations_in(FLUSH_HORIZON, expected_flow);
        let precision = precision_for_flow(expected_flow);
        debug!(capacity, %precision, "Sized batch buffer");

        BatchBuffer {
            inner: Arc::new(Inner {
                sink,
                template: BatchConfig { database, retention_policy, precision },
                capacity,
                batches: RwLock::new(Batches::default()),
                flush_lane: Mutex::new(()),
                flushes: TaskTracker::new(),
                pending_flushes: watch::Sender::new(0),
            }),
        }
    }

    /// Points a batch holds before it is flushed.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    #[must_use]
    pub fn precision(&self) -> Precision {
        self.inner.template.precision
    }

    /// Appends a point to the open batch, flushing it in the background once
    /// it reaches capacity.
    ///
    /// # Errors
    ///
    /// Errors if the point is invalid or a new batch cannot be created.
    pub async fn save_point(
        &self,
        name: &str,
        tags: BTreeMap<String, String>,
        fields: Fields,
        timestamp: SystemTime,
    ) -> Result<(), SaveError> {
        let point = Point::new(name, tags, fields, timestamp)?;

        loop {
            let batch = self.open_batch().await?;
            let mut state = batch.state.lock().await;
            // Sealed between resolving the tail and locking it.
            if state.flushing {
                continue;
            }
            let Some(points) = state.points.as_mut() else {
                continue;
            };

            points.add_point(point);
            let full = points.len() >= self.inner.capacity;
            if full {
                state.flushing = true;
            }
            drop(state);

            counter!("forwarder.points_saved").increment(1);
            if full {
                debug!(batch = batch.id, "Batch full, scheduling flush");
                self.schedule_flush();
            }

            return Ok(());
        }
    }

    /// Writes every batch present when the flush begins, oldest first.
    ///
    /// Write failures are logged and the affected batch is dropped; nothing is
    /// retried. Concurrent flushes run one after another.
    pub async fn flush(&self) -> FlushSummary {
        let _lane = self.inner.flush_lane.lock().await;

        let snapshot: Vec<_> = self.inner.batches.read().await.queue.iter().cloned().collect();
        let Some(last_id) = snapshot.last().map(|batch| batch.id) else {
            return FlushSummary::default();
        };
        for batch in &snapshot {
            batch.seal().await;
        }

        let mut summary = FlushSummary::default();
        for batch in &snapshot {
            let Some(points) = batch.take().await else {
                continue;
            };
            if points.is_empty() {
                continue;
            }

            let start = quanta::Instant::now();
            match self.inner.sink.write(&points).await {
                Ok(()) => {
                    info!(batch = batch.id, points = points.len(), "Batch successfully written");
                    counter!("forwarder.batches_written").increment(1);
                    summary.written = summary.written.saturating_add(1);
                }
                Err(err) => {
                    warn!(batch = batch.id, points = points.len(), %err, "Batch failed to write");
                    counter!("forwarder.batches_failed").increment(1);
                    counter!("forwarder.points_dropped").increment(points.len() as u64);
                    summary.failed = summary.failed.saturating_add(1);
                    summary.dropped_points = summary.dropped_points.saturating_add(points.len());
                }
            }
            histogram!("forwarder.flush_duration_seconds").record(start.elapsed().as_secs_f64());
        }

        let mut batches = self.inner.batches.write().await;
        while batches.queue.front().is_some_and(|batch| batch.id <= last_id) {
            batches.queue.pop_front();
        }

        summary
    }

    /// Waits until no background flush is pending.
    pub async fn settle(&self) {
        let mut pending = self.inner.pending_flushes.subscribe();
        // The sender is owned by `inner`, which outlives this call.
        let _ = pending.wait_for(|pending| *pending == 0).await;
    }

    /// Flushes whatever is buffered and waits for in-flight flushes.
    pub async fn shutdown(&self) -> FlushSummary {
        self.inner.flushes.close();
        let summary = self.flush().await;
        self.inner.flushes.wait().await;

        summary
    }

    /// Number of batches not yet removed by a flush.
    pub async fn batch_count(&self) -> usize {
        self.inner.batches.read().await.queue.len()
    }

    /// Points held by batches no flush has claimed yet.
    pub async fn pending_points(&self) -> usize {
        let queue: Vec<_> = self.inner.batches.read().await.queue.iter().cloned().collect();
        let mut pending = 0_usize;
        for batch in queue {
            if let Some(points) = &batch.state.lock().await.points {
                pending = pending.saturating_add(points.len());
            }
        }

        pending
    }

    async fn open_batch(&self) -> Result<Arc<StoreBatch>, BatchError> {
        if let Some(tail) = self.inner.batches.read().await.queue.back() {
            if tail.is_open().await {
                return Ok(Arc::clone(tail));
            }
        }

        let mut batches = self.inner.batches.write().await;
        // Another writer may have opened a batch while we waited.
        if let Some(tail) = batches.queue.back() {
            if tail.is_open().await {
                return Ok(Arc::clone(tail));
            }
        }

        let points = BatchPoints::new(self.inner.template.clone())?;
        let id = batches.next_id;
        batches.next_id = id.wrapping_add(1);
        let batch = Arc::new(StoreBatch {
            id,
            state: Mutex::new(BatchState { points: Some(points), flushing: false }),
        });
        batches.queue.push_back(Arc::clone(&batch));
        debug!(batch = id, "Opened batch");

        Ok(batch)
    }

    fn schedule_flush(&self) {
        self.inner.pending_flushes.send_modify(|pending| *pending = pending.saturating_add(1));
        let pending = PendingFlush(self.clone());
        self.inner.flushes.spawn(async move {
            pending.0.flush().await;
        });
    }

    #[cfg(test)]
    async fn open_batches(&self) -> usize {
        let queue: Vec<_> = self.inner.batches.read().await.queue.iter().cloned().collect();
        let mut open = 0_usize;
        for batch in queue {
            if batch.is_open().await {
                open += 1;
            }
        }

        open
    }
}

/// Counts a background flush as pending until dropped.
struct PendingFlush(BatchBuffer);

impl Drop for PendingFlush {
    fn drop(&mut self) {
        self.0
            .inner
            .pending_flushes
            .send_modify(|pending| *pending = pending.saturating_sub(1));
    }
}
