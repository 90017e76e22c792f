use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Tracks resource usage and progress of engine runs
#[derive(Debug, Clone)]
pub struct EngineMetrics {
    // Input metrics
    mmap_allocated: Arc<AtomicU64>,
    buffered_allocated: Arc<AtomicU64>,
    inputs_released: Arc<AtomicU64>,

    // Segment metrics
    segments_planned: Arc<AtomicU64>,
    segments_processed: Arc<AtomicU64>,
    segments_skipped: Arc<AtomicU64>,

    // Output metrics
    records_transformed: Arc<AtomicU64>,
    segments_flushed: Arc<AtomicU64>,
    peak_held: Arc<AtomicU64>,
}

impl EngineMetrics {
    /// Creates a new EngineMetrics instance
    pub fn new() -> Self {
        Self {
            mmap_allocated: Arc::new(AtomicU64::new(0)),
            buffered_allocated: Arc::new(AtomicU64::new(0)),
            inputs_released: Arc::new(AtomicU64::new(0)),
            segments_planned: Arc::new(AtomicU64::new(0)),
            segments_processed: Arc::new(AtomicU64::new(0)),
            segments_skipped: Arc::new(AtomicU64::new(0)),
            records_transformed: Arc::new(AtomicU64::new(0)),
            segments_flushed: Arc::new(AtomicU64::new(0)),
            peak_held: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Records memory mapped input
    pub fn record_mmap(&self, bytes: u64) {
        let total = self.mmap_allocated.fetch_add(bytes, Ordering::Relaxed) + bytes;
        debug!(
            "Memory mapped: {} bytes, total mapped: {} bytes",
            bytes, total
        );
    }

    /// Records unmapping of input
    pub fn record_munmap(&self, bytes: u64) {
        let total = self.mmap_allocated.fetch_sub(bytes, Ordering::Relaxed) - bytes;
        debug!(
            "Memory unmapped: {} bytes, total mapped: {} bytes",
            bytes, total
        );
    }

    /// Records input read into an owned buffer
    pub fn record_buffered(&self, bytes: u64) {
        self.buffered_allocated.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records release of a buffered input
    pub fn record_buffer_release(&self, bytes: u64) {
        self.buffered_allocated.fetch_sub(bytes, Ordering::Relaxed);
    }

    /// Records that an engine handle released its resources
    pub fn record_release(&self) {
        self.inputs_released.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_segments_planned(&self, count: usize) {
        self.segments_planned
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_segment_processed(&self) {
        self.segments_processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a dispatched segment abandoned because the run was cancelled
    pub fn record_segment_skipped(&self) {
        self.segments_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_records_transformed(&self, count: usize) {
        self.records_transformed
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_segment_flushed(&self) {
        self.segments_flushed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the number of outputs currently held ahead of the flush frontier
    pub fn record_held(&self, held: usize) {
        self.peak_held.fetch_max(held as u64, Ordering::Relaxed);
    }

    /// Gets current statistics
    pub fn get_stats(&self) -> EngineStats {
        EngineStats {
            mmap_allocated: self.mmap_allocated.load(Ordering::Relaxed),
            buffered_allocated: self.buffered_allocated.load(Ordering::Relaxed),
            inputs_released: self.inputs_released.load(Ordering::Relaxed),
            segments_planned: self.segments_planned.load(Ordering::Relaxed),
            segments_processed: self.segments_processed.load(Ordering::Relaxed),
            segments_skipped: self.segments_skipped.load(Ordering::Relaxed),
            records_transformed: self.records_transformed.load(Ordering::Relaxed),
            segments_flushed: self.segments_flushed.load(Ordering::Relaxed),
            peak_held: self.peak_held.load(Ordering::Relaxed),
        }
    }

    /// Logs current statistics
    pub fn log_stats(&self) {
        let stats = self.get_stats();
        info!(
            "Engine stats:\n\
             Memory mapped: {} bytes\n\
             Buffered: {} bytes\n\
             Inputs released: {}\n\
             Segments (planned/processed/skipped): {}/{}/{}\n\
             Records transformed: {}\n\
             Segments flushed: {}\n\
             Peak held outputs: {}",
            stats.mmap_allocated,
            stats.buffered_allocated,
            stats.inputs_released,
            stats.segments_planned,
            stats.segments_processed,
            stats.segments_skipped,
            stats.records_transformed,
            stats.segments_flushed,
            stats.peak_held
        );
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of engine statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    pub mmap_allocated: u64,
    pub buffered_allocated: u64,
    pub inputs_released: u64,
    pub segments_planned: u64,
    pub segments_processed: u64,
    pub segments_skipped: u64,
    pub records_transformed: u64,
    pub segments_flushed: u64,
    pub peak_held: u64,
}
