//! Parallel execution of a per-segment task.
//!
//! Segments are dispatched in ascending index order from the calling thread onto a
//! dedicated rayon pool. The number of segments dispatched but not yet released by the
//! consumer is capped, which bounds the memory held ahead of an ordered flush frontier.
//! Completed values are handed to a [`SegmentConsumer`] on the calling thread, one at a
//! time, in completion order.
//!
//! On the first failure, from a task or from the consumer, the pool stops dispatching,
//! lets already running segments finish (queued ones see the cancel flag and bail out),
//! discards whatever they produced and returns that first failure.
use crossbeam_channel::unbounded;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::num::NonZeroUsize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::errors::{EngineError, EngineResult};
use crate::metrics::EngineMetrics;
use crate::segment::Segment;

/// Cooperative cancellation flag shared by one run's tasks
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Counter shared by every worker of a pool.
///
/// This is the one piece of mutable state user functions may share across segments; all
/// other per-segment state should live in the closure or the segment's own result.
#[derive(Debug, Clone, Default)]
pub struct SharedCounter(Arc<AtomicU64>);

impl SharedCounter {
    /// Adds `n` and returns the previous value
    pub fn add(&self, n: u64) -> u64 {
        self.0.fetch_add(n, Ordering::Relaxed)
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn reset(&self) -> u64 {
        self.0.swap(0, Ordering::Relaxed)
    }
}

/// Receives completed segment values on the dispatching thread
pub trait SegmentConsumer<T> {
    /// Takes ownership of the value produced for segment `index`
    fn accept(&mut self, index: usize, value: T) -> EngineResult<()>;

    /// Values accepted but not yet released; they count against the dispatch window
    fn held(&self) -> usize {
        0
    }
}

/// Fixed-size pool of worker threads
pub struct WorkerPool {
    pool: ThreadPool,
    worker_count: usize,
    counter: SharedCounter,
    metrics: EngineMetrics,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("worker_count", &self.worker_count)
            .field("counter", &self.counter.get())
            .finish()
    }
}

impl WorkerPool {
    pub fn new(worker_count: NonZeroUsize, metrics: EngineMetrics) -> EngineResult<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(worker_count.get())
            .thread_name(|i| format!("chunkmill-worker-{}", i))
            .build()
            .map_err(|e| EngineError::config_error(format!("failed to start worker pool: {}", e)))?;
        debug!("Started worker pool with {} threads", worker_count);

        Ok(Self {
            pool,
            worker_count: worker_count.get(),
            counter: SharedCounter::default(),
            metrics,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Counter shared by all workers of this pool
    pub fn shared_counter(&self) -> &SharedCounter {
        &self.counter
    }

    /// Runs `op` inside the pool, so rayon parallel iterators use its threads
    pub fn install<R: Send>(&self, op: impl FnOnce() -> R + Send) -> R {
        self.pool.install(op)
    }

    /// Executes `task` for every segment and feeds the results to `consumer`.
    ///
    /// At most `max_in_flight` segments are running or held by the consumer at once.
    pub fn run<T, F, C>(
        &self,
        segments: &[Segment],
        max_in_flight: usize,
        task: F,
        consumer: &mut C,
    ) -> EngineResult<()>
    where
        T: Send,
        F: Fn(&Segment, &CancelFlag) -> EngineResult<T> + Sync,
        C: SegmentConsumer<T>,
    {
        let max_in_flight = max_in_flight.max(1);
        let cancel = CancelFlag::default();
        let (tx, rx) = unbounded::<(usize, EngineResult<T>)>();
        let mut first_error: Option<EngineError> = None;

        let task = &task;
        let cancel_ref = &cancel;
        let metrics = &self.metrics;

        self.pool.in_place_scope(|scope| {
            let mut next = 0;
            let mut in_flight = 0;

            loop {
                while first_error.is_none()
                    && next < segments.len()
                    && in_flight + consumer.held() < max_in_flight
                {
                    let segment = &segments[next];
                    let tx = tx.clone();
                    trace!("Dispatching segment {}", segment.index);
                    scope.spawn(move |_| {
                        let outcome = execute(segment, cancel_ref, task, metrics);
                        // The receiver lives until every dispatched segment has reported
                        let _ = tx.send((segment.index, outcome));
                    });
                    next += 1;
                    in_flight += 1;
                }

                if in_flight == 0 {
                    break;
                }

                let Ok((index, outcome)) = rx.recv() else {
                    break;
                };
                in_flight -= 1;

                match outcome {
                    Ok(value) if first_error.is_none() => {
                        if let Err(e) = consumer.accept(index, value) {
                            warn!("Consumer failed on segment {}: {}", index, e);
                            cancel.cancel();
                            first_error = Some(e);
                        }
                    }
                    Ok(_) => trace!("Discarding segment {} after failure", index),
                    Err(e) => {
                        cancel.cancel();
                        record_failure(&mut first_error, e);
                    }
                }
            }

            if first_error.is_some() {
                debug!(
                    "Run aborted after dispatching {} of {} segments",
                    next,
                    segments.len()
                );
            }
        });

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Runs one segment's task, turning panics into failures of that segment
fn execute<T, F>(
    segment: &Segment,
    cancel: &CancelFlag,
    task: &F,
    metrics: &EngineMetrics,
) -> EngineResult<T>
where
    F: Fn(&Segment, &CancelFlag) -> EngineResult<T>,
{
    if cancel.is_cancelled() {
        metrics.record_segment_skipped();
        return Err(EngineError::Cancelled);
    }

    trace!("Processing segment {} ({:?})", segment.index, segment.byte_range);
    let outcome = match catch_unwind(AssertUnwindSafe(|| task(segment, cancel))) {
        Ok(outcome) => outcome,
        Err(payload) => Err(EngineError::user_function_failed(
            segment.index,
            segment.span(),
            panic_message(payload.as_ref()),
        )),
    };

    match &outcome {
        Ok(_) => metrics.record_segment_processed(),
        Err(EngineError::Cancelled) => metrics.record_segment_skipped(),
        Err(e) => warn!("Segment {} failed: {}", segment.index, e),
    }
    outcome
}

/// Keeps the first real failure; a cancellation never displaces a cause
fn record_failure(first_error: &mut Option<EngineError>, err: EngineError) {
    match first_error {
        None => *first_error = Some(err),
        Some(existing) if existing.is_cancellation() && !err.is_cancellation() => {
            *first_error = Some(err)
        }
        Some(_) => {}
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panicked: {}", msg)
    } else {
        "panicked".to_string()
    }
}
