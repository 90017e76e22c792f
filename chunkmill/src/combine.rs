use rayon::prelude::*;
use std::ops::Range;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, trace};

use crate::errors::{BoxError, EngineError, EngineResult};
use crate::pool::{panic_message, SegmentConsumer, WorkerPool};
use crate::segment::Segment;

/// A partial result together with the segments it summarizes
#[derive(Debug)]
struct Partial<A> {
    first: usize,
    span: Range<u64>,
    value: A,
}

/// Collects per-segment partial results and merges them with a balanced pairwise tree.
///
/// Partials are slotted by segment index, so the reduction sees them in input order no
/// matter when they completed. Each level merges adjacent pairs in parallel, keeping the
/// critical path at `O(log N)` combines.
#[derive(Debug)]
pub struct Combiner<'a, A> {
    segments: &'a [Segment],
    slots: Vec<Option<A>>,
}

impl<'a, A: Send> Combiner<'a, A> {
    pub fn new(segments: &'a [Segment]) -> Self {
        let mut slots = Vec::with_capacity(segments.len());
        slots.resize_with(segments.len(), || None);
        Self { segments, slots }
    }

    /// Reduces all collected partials, or returns `identity` when there are none
    pub fn finish<C>(self, pool: &WorkerPool, combine: &C, identity: A) -> EngineResult<A>
    where
        C: Fn(A, A) -> Result<A, BoxError> + Sync,
    {
        let mut level: Vec<Partial<A>> = self
            .slots
            .into_iter()
            .zip(self.segments)
            .filter_map(|(slot, segment)| {
                slot.map(|value| Partial {
                    first: segment.index,
                    span: segment.span(),
                    value,
                })
            })
            .collect();

        if level.is_empty() {
            debug!("No partial results, returning identity");
            return Ok(identity);
        }

        let mut depth = 0;
        while level.len() > 1 {
            trace!("Combining level {} with {} partials", depth, level.len());
            level = pool.install(|| {
                level
                    .into_par_iter()
                    .chunks(2)
                    .map(|pair| merge_pair(pair, combine))
                    .collect::<EngineResult<Vec<_>>>()
            })?;
            depth += 1;
        }
        debug!("Combined partials in {} levels", depth);

        level
            .pop()
            .map(|partial| partial.value)
            .ok_or_else(|| EngineError::config_error("combiner lost its final partial"))
    }
}

impl<A> SegmentConsumer<A> for Combiner<'_, A> {
    fn accept(&mut self, index: usize, value: A) -> EngineResult<()> {
        self.slots[index] = Some(value);
        Ok(())
    }
}

fn merge_pair<A, C>(pair: Vec<Partial<A>>, combine: &C) -> EngineResult<Partial<A>>
where
    C: Fn(A, A) -> Result<A, BoxError>,
{
    let mut pair = pair.into_iter();
    let (Some(left), right) = (pair.next(), pair.next()) else {
        return Err(EngineError::config_error("empty combine chunk"));
    };
    let Some(right) = right else {
        return Ok(left);
    };

    let span = left.span.start..right.span.end;
    let outcome = match catch_unwind(AssertUnwindSafe(|| combine(left.value, right.value))) {
        Ok(outcome) => outcome,
        Err(payload) => Err(panic_message(payload.as_ref()).into()),
    };
    let value =
        outcome.map_err(|e| EngineError::user_function_failed(right.first, span.clone(), e))?;
    Ok(Partial {
        first: left.first,
        span,
        value,
    })
}
