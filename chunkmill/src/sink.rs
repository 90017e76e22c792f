use std::collections::BTreeMap;
use std::io::Write;
use tracing::{debug, trace};

use crate::errors::{EngineError, EngineResult};
use crate::metrics::EngineMetrics;
use crate::pool::SegmentConsumer;
use crate::segment::Delimiter;

/// Records produced for one segment, in the segment's input order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentOutput {
    pub index: usize,
    pub records: Vec<String>,
}

impl SegmentOutput {
    pub fn new(index: usize, records: Vec<String>) -> Self {
        Self { index, records }
    }

    /// Serialized size, one delimiter per record
    fn encoded_len(&self) -> usize {
        self.records.iter().map(|r| r.len() + 1).sum()
    }
}

/// Writes segment outputs in ascending index order regardless of arrival order.
///
/// Outputs that arrive ahead of the flush frontier are held until every earlier segment
/// has been written. The output therefore only ever contains a contiguous prefix of
/// segments, even when a run is aborted.
#[derive(Debug)]
pub struct OrderedSink<'w, W: Write> {
    writer: &'w mut W,
    delimiter: Delimiter,
    next_to_flush: usize,
    held: BTreeMap<usize, SegmentOutput>,
    metrics: EngineMetrics,
    buffer: Vec<u8>,
}

impl<'w, W: Write> OrderedSink<'w, W> {
    pub fn new(writer: &'w mut W, delimiter: Delimiter, metrics: EngineMetrics) -> Self {
        Self {
            writer,
            delimiter,
            next_to_flush: 0,
            held: BTreeMap::new(),
            metrics,
            buffer: Vec::new(),
        }
    }

    /// Number of segments written so far
    pub fn flushed(&self) -> usize {
        self.next_to_flush
    }

    /// Stores `output` and writes every segment that is now contiguous with the frontier
    pub fn push(&mut self, output: SegmentOutput) -> EngineResult<()> {
        self.held.insert(output.index, output);
        self.metrics.record_held(self.held.len());

        while let Some(output) = self.held.remove(&self.next_to_flush) {
            if let Err(e) = self.write_segment(&output) {
                self.held.clear();
                return Err(e);
            }
            trace!("Flushed segment {}", output.index);
            self.next_to_flush += 1;
            self.metrics.record_segment_flushed();
        }
        Ok(())
    }

    fn write_segment(&mut self, output: &SegmentOutput) -> EngineResult<()> {
        self.buffer.clear();
        self.buffer.reserve(output.encoded_len());
        for record in &output.records {
            self.buffer.extend_from_slice(record.as_bytes());
            self.buffer.push(self.delimiter.byte());
        }
        self.writer
            .write_all(&self.buffer)
            .map_err(EngineError::output_write_failed)
    }

    /// Flushes the writer; fails if any segment is still waiting for a predecessor
    pub fn finish(self) -> EngineResult<usize> {
        if let Some(index) = self.held.keys().next() {
            return Err(EngineError::config_error(format!(
                "segment {} was never flushed: segment {} is missing",
                index, self.next_to_flush
            )));
        }
        self.writer
            .flush()
            .map_err(EngineError::output_write_failed)?;
        debug!("Sink finished after {} segments", self.next_to_flush);
        Ok(self.next_to_flush)
    }
}

impl<W: Write> SegmentConsumer<SegmentOutput> for OrderedSink<'_, W> {
    fn accept(&mut self, index: usize, value: SegmentOutput) -> EngineResult<()> {
        debug_assert_eq!(index, value.index);
        self.push(value)
    }

    fn held(&self) -> usize {
        self.held.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn output(index: usize, records: &[&str]) -> SegmentOutput {
        SegmentOutput::new(index, records.iter().map(|r| r.to_string()).collect())
    }

    #[test]
    fn test_out_of_order_arrival_is_written_in_order() {
        let mut out = Vec::new();
        let mut sink = OrderedSink::new(&mut out, Delimiter::NEWLINE, EngineMetrics::new());

        sink.push(output(2, &["e"])).unwrap();
        assert_eq!(sink.flushed(), 0);
        sink.push(output(1, &["c", "d"])).unwrap();
        assert_eq!(sink.held(), 2);
        sink.push(output(0, &["a", "b"])).unwrap();
        assert_eq!(sink.flushed(), 3);
        assert_eq!(sink.finish().unwrap(), 3);

        assert_eq!(out, b"a\nb\nc\nd\ne\n");
    }

    #[test]
    fn test_custom_delimiter_and_empty_segments() {
        let mut out = Vec::new();
        let mut sink = OrderedSink::new(&mut out, Delimiter::new(b';'), EngineMetrics::new());

        sink.push(output(1, &[])).unwrap();
        sink.push(output(0, &["x"])).unwrap();
        sink.push(output(2, &["y", "z"])).unwrap();
        sink.finish().unwrap();

        assert_eq!(out, b"x;y;z;");
    }

    #[test]
    fn test_finish_detects_gap() {
        let mut out = Vec::new();
        let mut sink = OrderedSink::new(&mut out, Delimiter::NEWLINE, EngineMetrics::new());
        sink.push(output(1, &["late"])).unwrap();
        assert!(sink.finish().is_err());
        assert!(out.is_empty());
    }

    #[test]
    fn test_peak_held_recorded() {
        let metrics = EngineMetrics::new();
        let mut out = Vec::new();
        let mut sink = OrderedSink::new(&mut out, Delimiter::NEWLINE, metrics.clone());

        sink.push(output(3, &["d"])).unwrap();
        sink.push(output(2, &["c"])).unwrap();
        sink.push(output(1, &["b"])).unwrap();
        sink.push(output(0, &["a"])).unwrap();
        sink.finish().unwrap();

        let stats = metrics.get_stats();
        assert_eq!(stats.peak_held, 4);
        assert_eq!(stats.segments_flushed, 4);
    }

    /// Writer that accepts a fixed number of writes and then fails
    struct FailingWriter {
        written: Vec<u8>,
        writes_left: usize,
    }

    impl Write for FailingWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.writes_left == 0 {
                return Err(io::Error::other("disk full"));
            }
            self.writes_left -= 1;
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_failure_discards_held_outputs() {
        let mut writer = FailingWriter {
            written: Vec::new(),
            writes_left: 1,
        };
        let mut sink = OrderedSink::new(&mut writer, Delimiter::NEWLINE, EngineMetrics::new());

        sink.push(output(2, &["c"])).unwrap();
        sink.push(output(0, &["a"])).unwrap();
        let err = sink.push(output(1, &["b"])).unwrap_err();

        assert!(matches!(err, EngineError::OutputWriteFailed(_)));
        assert_eq!(sink.held(), 0);
        assert_eq!(sink.flushed(), 1);
        drop(sink);
        assert_eq!(writer.written, b"a\n");
    }
}
