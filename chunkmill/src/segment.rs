//! Record-aligned segmentation of an input buffer.
//!
//! The input is cut into `N` roughly equal byte ranges and every interior cut is pushed
//! forward to just past the next delimiter, so a record never straddles two segments.
use memchr::{memchr, memchr_iter};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::borrow::Cow;
use std::fmt;
use std::ops::Range;
use tracing::{debug, trace};

use crate::config::EncodingMode;
use crate::errors::{EngineError, EngineResult};

/// Bytes sampled from the head of the input to estimate the average record length
const RECORD_SAMPLE_BYTES: usize = 64 * 1024;

/// Single byte terminating each record
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Delimiter(u8);

impl Delimiter {
    pub const NEWLINE: Delimiter = Delimiter(b'\n');

    pub const fn new(byte: u8) -> Self {
        Self(byte)
    }

    pub const fn byte(self) -> u8 {
        self.0
    }
}

impl Default for Delimiter {
    fn default() -> Self {
        Self::NEWLINE
    }
}

impl fmt::Debug for Delimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Delimiter({:?})", self.0 as char)
    }
}

impl From<u8> for Delimiter {
    fn from(byte: u8) -> Self {
        Self(byte)
    }
}

impl Serialize for Delimiter {
    /// ASCII delimiters serialize as a one-character string, any other byte as its number
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.0.is_ascii() {
            serializer.serialize_str(&(self.0 as char).to_string())
        } else {
            serializer.serialize_u8(self.0)
        }
    }
}

struct DelimiterVisitor;

impl<'de> Visitor<'de> for DelimiterVisitor {
    type Value = Delimiter;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a single-byte string or a byte value 0-255")
    }

    fn visit_str<E: de::Error>(self, text: &str) -> Result<Delimiter, E> {
        match text.as_bytes() {
            [byte] => Ok(Delimiter(*byte)),
            _ => Err(E::custom(format!(
                "delimiter must be a single byte, got {:?}",
                text
            ))),
        }
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> Result<Delimiter, E> {
        u8::try_from(value)
            .map(Delimiter)
            .map_err(|_| E::custom(format!("delimiter byte out of range: {}", value)))
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> Result<Delimiter, E> {
        u8::try_from(value)
            .map(Delimiter)
            .map_err(|_| E::custom(format!("delimiter byte out of range: {}", value)))
    }
}

impl<'de> Deserialize<'de> for Delimiter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(DelimiterVisitor)
    }
}

/// A contiguous, record-aligned byte range of the input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Ordinal position, 0-based and contiguous
    pub index: usize,
    /// Byte range `[start, end)` within the input
    pub byte_range: Range<usize>,
    /// Estimated number of records in the range
    pub record_count: usize,
}

impl Segment {
    pub fn len(&self) -> usize {
        self.byte_range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.byte_range.is_empty()
    }

    /// Byte range widened to `u64` for error reporting
    pub fn span(&self) -> Range<u64> {
        self.byte_range.start as u64..self.byte_range.end as u64
    }
}

/// Plans record-aligned segments over `bytes`.
///
/// Returns at most `target_count` segments that partition `bytes` exactly. A tail without
/// any delimiter is absorbed by the preceding cut, so a file with no delimiter at all is a
/// single segment. When `max_record_len` is set, a boundary scan that runs further than that
/// without meeting a delimiter fails with `RecordTooLarge`.
pub fn plan_segments(
    bytes: &[u8],
    target_count: usize,
    delimiter: Delimiter,
    max_record_len: Option<usize>,
) -> EngineResult<Vec<Segment>> {
    let len = bytes.len();
    if len == 0 {
        debug!("Empty input, no segments planned");
        return Ok(Vec::new());
    }

    let target_count = target_count.clamp(1, len);
    let avg_record_len = average_record_len(bytes, delimiter);

    let mut cuts = Vec::with_capacity(target_count + 1);
    cuts.push(0usize);

    for i in 1..target_count {
        let naive = naive_cut(i, len, target_count);
        let prev = *cuts.last().unwrap_or(&0);
        if naive <= prev {
            continue;
        }
        match next_boundary(bytes, naive, delimiter, max_record_len)? {
            Some(cut) if cut > prev && cut < len => cuts.push(cut),
            Some(_) => {}
            // No delimiter past this point; the remainder belongs to the last segment
            None => break,
        }
    }
    cuts.push(len);

    let segments: Vec<Segment> = cuts
        .windows(2)
        .enumerate()
        .map(|(index, pair)| {
            let byte_range = pair[0]..pair[1];
            let record_count = byte_range.len().div_ceil(avg_record_len);
            trace!("Planned segment {} covering {:?}", index, byte_range);
            Segment {
                index,
                byte_range,
                record_count,
            }
        })
        .collect();

    debug!(
        "Planned {} segments over {} bytes (requested {})",
        segments.len(),
        len,
        target_count
    );
    Ok(segments)
}

/// Evenly spaced cut `i` of `n` over `len` bytes, computed without overflow
fn naive_cut(i: usize, len: usize, n: usize) -> usize {
    (i as u128 * len as u128 / n as u128) as usize
}

/// Finds the first cut at or after `naive` that lands right after a delimiter.
///
/// Returns `None` when no delimiter follows `naive` and the scan is unbounded.
fn next_boundary(
    bytes: &[u8],
    naive: usize,
    delimiter: Delimiter,
    max_record_len: Option<usize>,
) -> EngineResult<Option<usize>> {
    if bytes[naive - 1] == delimiter.byte() {
        return Ok(Some(naive));
    }

    let window = match max_record_len {
        Some(limit) => &bytes[naive..bytes.len().min(naive.saturating_add(limit))],
        None => &bytes[naive..],
    };

    match memchr(delimiter.byte(), window) {
        Some(pos) => Ok(Some(naive + pos + 1)),
        None => match max_record_len {
            Some(limit) if naive + window.len() < bytes.len() => {
                Err(EngineError::record_too_large(naive as u64, limit))
            }
            _ => Ok(None),
        },
    }
}

/// Average record length over a bounded sample at the head of the input
fn average_record_len(bytes: &[u8], delimiter: Delimiter) -> usize {
    let sample = &bytes[..bytes.len().min(RECORD_SAMPLE_BYTES)];
    let records = memchr_iter(delimiter.byte(), sample).count();
    if records == 0 {
        sample.len().max(1)
    } else {
        (sample.len() / records).max(1)
    }
}

/// One delimiter-terminated unit of the input, delimiter removed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record<'a> {
    /// Record bytes without the delimiter
    pub bytes: &'a [u8],
    /// Absolute byte offset of the record within the input
    pub offset: u64,
}

impl<'a> Record<'a> {
    /// Decodes the record as UTF-8 according to `mode`
    pub fn decode(&self, mode: EncodingMode) -> Option<Cow<'a, str>> {
        match mode {
            EncodingMode::FailFast => std::str::from_utf8(self.bytes).ok().map(Cow::Borrowed),
            EncodingMode::Lossy => Some(String::from_utf8_lossy(self.bytes)),
        }
    }
}

/// Iterator over the records of a byte slice
#[derive(Debug, Clone)]
pub struct Records<'a> {
    bytes: &'a [u8],
    base: u64,
    pos: usize,
    delimiter: Delimiter,
}

impl<'a> Records<'a> {
    pub fn new(bytes: &'a [u8], base: u64, delimiter: Delimiter) -> Self {
        Self {
            bytes,
            base,
            pos: 0,
            delimiter,
        }
    }
}

impl<'a> Iterator for Records<'a> {
    type Item = Record<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.bytes.len() {
            return None;
        }
        let rest = &self.bytes[self.pos..];
        let (mut record, consumed) = match memchr(self.delimiter.byte(), rest) {
            Some(end) => (&rest[..end], end + 1),
            None => (rest, rest.len()),
        };
        // CRLF input under the newline delimiter
        if self.delimiter == Delimiter::NEWLINE {
            if let Some(stripped) = record.strip_suffix(b"\r") {
                record = stripped;
            }
        }
        let offset = self.base + self.pos as u64;
        self.pos += consumed;
        Some(Record {
            bytes: record,
            offset,
        })
    }
}

/// Borrowed view of one segment handed to fold map functions.
///
/// The view borrows the engine's input; nothing derived from it can outlive the run.
#[derive(Debug, Clone, Copy)]
pub struct SegmentView<'a> {
    segment: &'a Segment,
    bytes: &'a [u8],
    delimiter: Delimiter,
    encoding_mode: EncodingMode,
}

impl<'a> SegmentView<'a> {
    pub(crate) fn new(
        segment: &'a Segment,
        input: &'a [u8],
        delimiter: Delimiter,
        encoding_mode: EncodingMode,
    ) -> Self {
        Self {
            segment,
            bytes: &input[segment.byte_range.clone()],
            delimiter,
            encoding_mode,
        }
    }

    pub fn index(&self) -> usize {
        self.segment.index
    }

    pub fn segment(&self) -> &'a Segment {
        self.segment
    }

    /// Raw bytes of the segment, delimiters included
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Records of the segment in input order
    pub fn records(&self) -> Records<'a> {
        Records::new(
            self.bytes,
            self.segment.byte_range.start as u64,
            self.delimiter,
        )
    }

    /// Decoded text of every record, honoring the configured encoding mode
    pub fn lines(&self) -> impl Iterator<Item = EngineResult<Cow<'a, str>>> + 'a {
        let index = self.segment.index;
        let mode = self.encoding_mode;
        self.records().map(move |record| {
            record
                .decode(mode)
                .ok_or_else(|| EngineError::invalid_encoding(index, record.offset))
        })
    }
}
