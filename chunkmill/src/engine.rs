use std::borrow::Cow;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::num::NonZeroUsize;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::combine::Combiner;
use crate::config::{EncodingMode, EngineConfig};
use crate::errors::{BoxError, EngineError, EngineResult};
use crate::handle::EngineHandle;
use crate::metrics::EngineMetrics;
use crate::ops::{Aggregate, RecordTransform};
use crate::pool::{CancelFlag, SharedCounter, WorkerPool};
use crate::segment::{plan_segments, Delimiter, Records, Segment, SegmentView};
use crate::sink::{OrderedSink, SegmentOutput};
use crate::source::InputSource;

/// Records transformed between two checks of the cancel flag
const CANCEL_CHECK_INTERVAL: usize = 1024;

const OUTPUT_BUFFER_CAPACITY: usize = 65536;

/// Parallel chunked file processor.
///
/// One engine owns one worker pool and can serve any number of runs. Every run takes
/// ownership of its input; the input is released when the run returns.
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    pool: WorkerPool,
    metrics: EngineMetrics,
}

impl Engine {
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        let metrics = EngineMetrics::new();
        let pool = WorkerPool::new(config.worker_count, metrics.clone())?;
        Ok(Self {
            config,
            pool,
            metrics,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    /// Counter user functions may share across segments
    pub fn shared_counter(&self) -> &SharedCounter {
        self.pool.shared_counter()
    }

    /// Opens a file using the configured mmap threshold
    pub fn open(&self, path: impl AsRef<Path>) -> EngineResult<InputSource> {
        InputSource::open(path, self.config.mmap_threshold)
    }

    fn plan(&self, bytes: &[u8]) -> EngineResult<Vec<Segment>> {
        let segments = plan_segments(
            bytes,
            self.config.segment_count_for(bytes.len()),
            self.config.delimiter,
            self.config.max_record_len,
        )?;
        self.metrics.record_segments_planned(segments.len());
        Ok(segments)
    }

    /// Folds the input: `map_fn` summarizes each segment, `combine_fn` merges summaries.
    ///
    /// `combine_fn` must be associative and `identity` neutral for it. An empty input
    /// returns `identity` untouched.
    pub fn fold<A, E, M, C>(
        &self,
        input: InputSource,
        map_fn: M,
        combine_fn: C,
        identity: A,
    ) -> EngineResult<A>
    where
        A: Send,
        E: Into<BoxError>,
        M: Fn(SegmentView<'_>) -> Result<A, E> + Sync,
        C: Fn(A, A) -> A + Sync,
    {
        self.run_fold(
            input,
            |view| map_fn(view).map_err(Into::into),
            |left, right| Ok(combine_fn(left, right)),
            identity,
        )
    }

    /// Folds the input record by record.
    ///
    /// Each segment starts from a clone of `identity` and combines the mapped value of each
    /// of its records in order; segment results are then combined as in [`Engine::fold`].
    pub fn fold_lines<A, E, M, C>(
        &self,
        input: InputSource,
        map_fn: M,
        combine_fn: C,
        identity: A,
    ) -> EngineResult<A>
    where
        A: Clone + Send + Sync,
        E: Into<BoxError>,
        M: Fn(&str) -> Result<A, E> + Sync,
        C: Fn(A, A) -> A + Sync,
    {
        let seed = identity.clone();
        self.run_fold(
            input,
            |view| {
                let mut acc = seed.clone();
                for line in view.lines() {
                    let value = map_fn(&line?).map_err(Into::<BoxError>::into)?;
                    acc = combine_fn(acc, value);
                }
                Ok(acc)
            },
            |left, right| Ok(combine_fn(left, right)),
            identity,
        )
    }

    /// Folds the input with an [`Aggregate`] implementation
    pub fn fold_with<G: Aggregate>(&self, input: InputSource, aggregate: &G) -> EngineResult<G::Output> {
        self.run_fold(
            input,
            |view| aggregate.map_segment(view).map_err(Into::into),
            |left, right| aggregate.combine(left, right).map_err(Into::into),
            aggregate.identity(),
        )
    }

    fn run_fold<A, M, C>(&self, input: InputSource, map: M, combine: C, identity: A) -> EngineResult<A>
    where
        A: Send,
        M: Fn(SegmentView<'_>) -> Result<A, BoxError> + Sync,
        C: Fn(A, A) -> Result<A, BoxError> + Sync,
    {
        let handle = EngineHandle::new(input, io::sink(), self.metrics.clone());
        info!(
            "Starting fold over {} bytes with {} workers",
            handle.input_len(),
            self.pool.worker_count()
        );

        let delimiter = self.config.delimiter;
        let encoding_mode = self.config.encoding_mode;
        let result = handle.with_input(|bytes| -> EngineResult<A> {
            let segments = self.plan(bytes)?;
            let mut combiner = Combiner::new(&segments);

            self.pool.run(
                &segments,
                self.config.effective_max_in_flight(),
                |segment, _cancel| {
                    let view = SegmentView::new(segment, bytes, delimiter, encoding_mode);
                    map(view).map_err(|e| attribute(segment, e))
                },
                &mut combiner,
            )?;

            combiner.finish(&self.pool, &combine, identity)
        });
        drop(handle);

        self.finish_run("Fold", &result);
        result
    }

    /// Transforms every record and writes the results to `output` in input order.
    ///
    /// Each output record is followed by the delimiter. On failure `output` holds at most a
    /// contiguous prefix of the transformed segments.
    pub fn transform<W, T>(&self, input: InputSource, output: W, transform: &T) -> EngineResult<()>
    where
        W: Write,
        T: RecordTransform,
    {
        let encoding_mode = self.config.encoding_mode;
        let delimiter = self.config.delimiter;
        let metrics = &self.metrics;

        self.run_transform(input, output, |segment, bytes, cancel| {
            transform_records(segment, bytes, cancel, delimiter, encoding_mode, transform, metrics)
        })
    }

    /// Transforms whole segments: `map_fn` returns every output record of its segment.
    pub fn transform_segments<W, E, M>(&self, input: InputSource, output: W, map_fn: M) -> EngineResult<()>
    where
        W: Write,
        E: Into<BoxError>,
        M: Fn(SegmentView<'_>) -> Result<Vec<String>, E> + Sync,
    {
        let encoding_mode = self.config.encoding_mode;
        let delimiter = self.config.delimiter;

        self.run_transform(input, output, |segment, bytes, _cancel| {
            let view = SegmentView::new(segment, bytes, delimiter, encoding_mode);
            let records = map_fn(view).map_err(|e| attribute(segment, e.into()))?;
            self.metrics.record_records_transformed(records.len());
            Ok(records)
        })
    }

    /// Transforms `input_path` into a newly created `output_path`
    pub fn transform_file<T: RecordTransform>(
        &self,
        input_path: impl AsRef<Path>,
        output_path: impl AsRef<Path>,
        transform: &T,
    ) -> EngineResult<()> {
        let input = self.open(input_path)?;
        let file = File::create(output_path.as_ref()).map_err(EngineError::output_write_failed)?;
        let output = BufWriter::with_capacity(OUTPUT_BUFFER_CAPACITY, file);
        self.transform(input, output, transform)
    }

    fn run_transform<W, F>(&self, input: InputSource, output: W, produce: F) -> EngineResult<()>
    where
        W: Write,
        F: Fn(&Segment, &[u8], &CancelFlag) -> EngineResult<Vec<String>> + Sync,
    {
        let mut handle = EngineHandle::new(input, output, self.metrics.clone());
        info!(
            "Starting transform over {} bytes with {} workers",
            handle.input_len(),
            self.pool.worker_count()
        );

        let delimiter = self.config.delimiter;
        let result = handle.with_io(|bytes, writer| -> EngineResult<()> {
            let segments = self.plan(bytes)?;
            let mut sink = OrderedSink::new(writer, delimiter, self.metrics.clone());

            self.pool.run(
                &segments,
                self.config.effective_max_in_flight(),
                |segment, cancel| {
                    let records = produce(segment, bytes, cancel)?;
                    Ok(SegmentOutput::new(segment.index, records))
                },
                &mut sink,
            )?;

            let flushed = sink.finish()?;
            debug!("Wrote {} of {} segments", flushed, segments.len());
            Ok(())
        });
        drop(handle);

        self.finish_run("Transform", &result);
        result
    }

    fn finish_run<T>(&self, mode: &str, result: &EngineResult<T>) {
        match result {
            Ok(_) => info!("{} complete", mode),
            Err(e) => warn!("{} aborted: {}", mode, e),
        }
        self.metrics.log_stats();
    }
}

/// Turns a boxed user error into the engine error for `segment`.
///
/// `InvalidEncoding` raised by [`SegmentView::lines`] inside user code is passed through
/// unchanged; every other error, engine errors included, is wrapped as a user failure.
fn attribute(segment: &Segment, err: BoxError) -> EngineError {
    match err.downcast::<EngineError>() {
        Ok(engine_error) => match *engine_error {
            invalid @ EngineError::InvalidEncoding { .. } => invalid,
            other => EngineError::user_function_failed(segment.index, segment.span(), other),
        },
        Err(err) => EngineError::user_function_failed(segment.index, segment.span(), err),
    }
}

fn transform_records<T: RecordTransform>(
    segment: &Segment,
    input: &[u8],
    cancel: &CancelFlag,
    delimiter: Delimiter,
    encoding_mode: EncodingMode,
    transform: &T,
    metrics: &EngineMetrics,
) -> EngineResult<Vec<String>> {
    let bytes = &input[segment.byte_range.clone()];
    let mut records = Vec::with_capacity(segment.record_count);
    let mut replaced = false;

    for (n, record) in Records::new(bytes, segment.byte_range.start as u64, delimiter).enumerate() {
        if n % CANCEL_CHECK_INTERVAL == 0 && n > 0 && cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let text = record
            .decode(encoding_mode)
            .ok_or_else(|| EngineError::invalid_encoding(segment.index, record.offset))?;
        if let Cow::Owned(_) = text {
            replaced = true;
        }

        let produced = transform
            .apply(&text)
            .map_err(|e| attribute(segment, e.into()))?;
        records.push(produced);
    }

    if replaced {
        warn!("Invalid UTF-8 replaced in segment {}", segment.index);
    }
    metrics.record_records_transformed(records.len());
    Ok(records)
}

fn engine_for(delimiter: Delimiter, worker_count: Option<NonZeroUsize>) -> EngineResult<Engine> {
    let mut config = EngineConfig::default().with_delimiter(delimiter);
    if let Some(worker_count) = worker_count {
        config = config.with_worker_count(worker_count);
    }
    Engine::new(config)
}

/// Folds the file at `input` with a one-off engine.
///
/// `worker_count` defaults to the number of CPUs; the segment count follows it.
pub fn fold<A, E, M, C>(
    input: impl AsRef<Path>,
    delimiter: Delimiter,
    map_fn: M,
    combine_fn: C,
    identity: A,
    worker_count: Option<NonZeroUsize>,
) -> EngineResult<A>
where
    A: Send,
    E: Into<BoxError>,
    M: Fn(SegmentView<'_>) -> Result<A, E> + Sync,
    C: Fn(A, A) -> A + Sync,
{
    let engine = engine_for(delimiter, worker_count)?;
    let input = engine.open(input)?;
    engine.fold(input, map_fn, combine_fn, identity)
}

/// Transforms the file at `input` into `output` with a one-off engine
pub fn transform<W, T>(
    input: impl AsRef<Path>,
    output: W,
    delimiter: Delimiter,
    map_fn: T,
    worker_count: Option<NonZeroUsize>,
) -> EngineResult<()>
where
    W: Write,
    T: RecordTransform,
{
    let engine = engine_for(delimiter, worker_count)?;
    let input = engine.open(input)?;
    engine.transform(input, output, &map_fn)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(workers: usize, segments: usize) -> Engine {
        Engine::new(
            EngineConfig::default()
                .with_worker_count(NonZeroUsize::new(workers).unwrap())
                .with_segment_count(NonZeroUsize::new(segments).unwrap()),
        )
        .unwrap()
    }

    fn numbers(count: usize) -> String {
        (1..=count).map(|i| format!("{}\n", i)).collect()
    }

    fn sum_segment(view: SegmentView<'_>) -> Result<u64, BoxError> {
        let mut sum = 0;
        for line in view.lines() {
            sum += line?.parse::<u64>()?;
        }
        Ok(sum)
    }

    #[test]
    fn test_fold_sum() {
        let engine = engine(2, 3);
        let input = InputSource::from_bytes("1\n2\n3\n4\n");
        let total = engine.fold(input, sum_segment, |a, b| a + b, 0).unwrap();
        assert_eq!(total, 10);
    }

    #[test]
    fn test_fold_empty_input_returns_identity() {
        let engine = engine(4, 4);
        let total = engine
            .fold(InputSource::from_bytes(""), sum_segment, |a, b| a + b, 7)
            .unwrap();
        assert_eq!(total, 7);
    }

    #[test]
    fn test_fold_lines() {
        let engine = engine(3, 5);
        let input = InputSource::from_bytes(numbers(100));
        let total = engine
            .fold_lines(input, |line| line.parse::<u64>(), |a, b| a + b, 0)
            .unwrap();
        assert_eq!(total, 5050);
    }

    #[test]
    fn test_fold_parse_failure_names_segment() {
        let engine = engine(2, 4);
        let mut content = numbers(40);
        content.push_str("not a number\n");
        let input = InputSource::from_bytes(content);

        let err = engine.fold(input, sum_segment, |a, b| a + b, 0).unwrap_err();
        match err {
            EngineError::UserFunctionFailed { segment, .. } => assert_eq!(segment, 3),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_fold_invalid_utf8_passes_through() {
        let engine = engine(1, 1);
        let input = InputSource::from_bytes(b"1\n\xff\n".to_vec());
        let err = engine.fold(input, sum_segment, |a, b| a + b, 0).unwrap_err();
        assert!(matches!(err, EngineError::InvalidEncoding { segment: 0, offset: 2 }));
    }

    #[test]
    fn test_transform_identity() {
        let engine = engine(2, 2);
        let mut out = Vec::new();
        engine
            .transform(
                InputSource::from_bytes("a\nb\nc\nd\ne"),
                &mut out,
                &|line: &str| -> Result<String, BoxError> { Ok(line.to_string()) },
            )
            .unwrap();
        assert_eq!(out, b"a\nb\nc\nd\ne\n");
    }

    #[test]
    fn test_transform_lossy_decoding() {
        let engine = Engine::new(
            EngineConfig::default()
                .with_worker_count(NonZeroUsize::new(1).unwrap())
                .with_encoding_mode(EncodingMode::Lossy),
        )
        .unwrap();
        let mut out = Vec::new();
        engine
            .transform(
                InputSource::from_bytes(b"ok\n\xffbad\n".to_vec()),
                &mut out,
                &|line: &str| -> Result<String, BoxError> { Ok(line.len().to_string()) },
            )
            .unwrap();
        assert_eq!(out, b"2\n6\n");
    }

    #[test]
    fn test_transform_segments() {
        let engine = engine(2, 3);
        let mut out = Vec::new();
        engine
            .transform_segments(
                InputSource::from_bytes(numbers(9)),
                &mut out,
                |view| -> Result<Vec<String>, BoxError> {
                    let count = view.records().count();
                    Ok(vec![format!("{}:{}", view.index(), count)])
                },
            )
            .unwrap();

        let text = String::from_utf8(out).unwrap();
        let total: usize = text
            .lines()
            .map(|l| l.split(':').nth(1).unwrap().parse::<usize>().unwrap())
            .sum();
        assert_eq!(total, 9);
        assert!(text.starts_with("0:"));
    }

    #[test]
    fn test_handle_released_after_each_run() {
        let engine = engine(2, 2);
        engine
            .fold(InputSource::from_bytes("1\n"), sum_segment, |a, b| a + b, 0)
            .unwrap();
        let _ = engine.fold(InputSource::from_bytes("x\n"), sum_segment, |a, b| a + b, 0);

        let stats = engine.metrics().get_stats();
        assert_eq!(stats.inputs_released, 2);
        assert_eq!(stats.buffered_allocated, 0);
    }

    #[test]
    fn test_record_too_large_from_config() {
        let engine = Engine::new(
            EngineConfig::default()
                .with_worker_count(NonZeroUsize::new(2).unwrap())
                .with_max_record_len(8),
        )
        .unwrap();
        let mut content = "y".repeat(4096);
        content.push_str("\nshort\n");

        let err = engine
            .fold(InputSource::from_bytes(content), |v| -> Result<usize, BoxError> { Ok(v.bytes().len()) }, |a, b| a + b, 0)
            .unwrap_err();
        assert!(matches!(err, EngineError::RecordTooLarge { limit: 8, .. }));
    }

    #[test]
    fn test_large_input_is_split_by_segment_size() {
        let engine = Engine::new(
            EngineConfig::default()
                .with_worker_count(NonZeroUsize::new(2).unwrap())
                .with_max_segment_bytes(64),
        )
        .unwrap();

        let small = numbers(10);
        engine
            .fold(InputSource::from_bytes(small.clone()), sum_segment, |a, b| a + b, 0)
            .unwrap();
        let planned_small = engine.metrics().get_stats().segments_planned;
        assert_eq!(planned_small, 2);

        let large = numbers(1000);
        let total = engine
            .fold(InputSource::from_bytes(large.clone()), sum_segment, |a, b| a + b, 0)
            .unwrap();
        assert_eq!(total, 500_500);
        let planned_large = engine.metrics().get_stats().segments_planned - planned_small;
        assert!(planned_large >= (large.len() / 64) as u64);

        let mut out = Vec::new();
        engine
            .transform(
                InputSource::from_bytes(large.clone()),
                &mut out,
                &|line: &str| -> Result<String, BoxError> { Ok(line.to_string()) },
            )
            .unwrap();
        assert_eq!(out, large.as_bytes());
        let window = engine.config().effective_max_in_flight() as u64;
        assert!(engine.metrics().get_stats().peak_held <= window);
    }

    #[test]
    fn test_combine_panic_is_reported_as_failure() {
        let engine = engine(2, 4);
        let err = engine
            .fold(
                InputSource::from_bytes(numbers(40)),
                sum_segment,
                |a, b| {
                    if b > 0 && a > 0 {
                        panic!("combine exploded");
                    }
                    a + b
                },
                0,
            )
            .unwrap_err();

        match err {
            EngineError::UserFunctionFailed { source, .. } => {
                assert!(source.to_string().contains("combine exploded"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(engine.metrics().get_stats().inputs_released, 1);
    }

    #[test]
    fn test_engine_errors_from_user_code_are_wrapped() {
        let engine = engine(2, 2);
        let err = engine
            .fold(
                InputSource::from_bytes("1\n2\n"),
                |_view| -> Result<u64, BoxError> { Err(EngineError::Cancelled.into()) },
                |a, b| a + b,
                0,
            )
            .unwrap_err();

        match err {
            EngineError::UserFunctionFailed { source, .. } => {
                let inner = source.downcast_ref::<EngineError>();
                assert!(matches!(inner, Some(EngineError::Cancelled)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
