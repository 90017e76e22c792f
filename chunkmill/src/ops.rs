//! Capability interfaces for the two engine modes.
//!
//! Any type that knows its identity, how to summarize a segment and how to merge two
//! summaries can be folded; any type that maps one record to another can be used as a
//! transform. Plain closures implement [`RecordTransform`] directly.
use crate::errors::BoxError;
use crate::segment::SegmentView;

/// An associative aggregation over segments.
///
/// `combine` must be associative; it is always called with operands in input order, so it
/// does not need to be commutative. `identity` must be a neutral element for `combine`.
pub trait Aggregate: Sync {
    type Output: Send;
    type Error: Into<BoxError>;

    fn identity(&self) -> Self::Output;

    /// Summarizes one segment
    fn map_segment(&self, segment: SegmentView<'_>) -> Result<Self::Output, Self::Error>;

    /// Merges the summaries of two adjacent spans, `left` preceding `right`
    fn combine(
        &self,
        left: Self::Output,
        right: Self::Output,
    ) -> Result<Self::Output, Self::Error>;
}

/// A per-record transform; output records keep the input order
pub trait RecordTransform: Sync {
    type Error: Into<BoxError>;

    fn apply(&self, record: &str) -> Result<String, Self::Error>;
}

impl<F, E> RecordTransform for F
where
    F: Fn(&str) -> Result<String, E> + Sync,
    E: Into<BoxError>,
{
    type Error = E;

    fn apply(&self, record: &str) -> Result<String, E> {
        self(record)
    }
}
