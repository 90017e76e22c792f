use std::io::Write;
use tracing::debug;

use crate::metrics::EngineMetrics;
use crate::source::InputSource;

/// Owns the input and output of one engine run.
///
/// Input bytes are only lent out through [`EngineHandle::with_io`], so every borrow of the
/// mapping ends before the handle can be dropped. Dropping the handle releases the mapping
/// (or buffer) and the output exactly once, whichever path the run exits through.
#[derive(Debug)]
pub struct EngineHandle<W: Write> {
    input: InputSource,
    output: W,
    metrics: EngineMetrics,
}

impl<W: Write> EngineHandle<W> {
    pub fn new(input: InputSource, output: W, metrics: EngineMetrics) -> Self {
        let len = input.len() as u64;
        if input.is_mapped() {
            metrics.record_mmap(len);
        } else {
            metrics.record_buffered(len);
        }
        Self {
            input,
            output,
            metrics,
        }
    }

    pub fn input_len(&self) -> usize {
        self.input.len()
    }

    /// Runs `f` with the input bytes and exclusive access to the output
    pub fn with_io<R>(&mut self, f: impl FnOnce(&[u8], &mut W) -> R) -> R {
        f(self.input.as_bytes(), &mut self.output)
    }

    /// Runs `f` with the input bytes only
    pub fn with_input<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(self.input.as_bytes())
    }
}

impl<W: Write> Drop for EngineHandle<W> {
    fn drop(&mut self) {
        let len = self.input.len() as u64;
        if self.input.is_mapped() {
            self.metrics.record_munmap(len);
        } else {
            self.metrics.record_buffer_release(len);
        }
        self.metrics.record_release();
        debug!("Released engine handle ({} input bytes)", len);
    }
}
