/// Error types for the processing engine.
///
/// Every entry point returns a single [`EngineResult`]: either the whole input was
/// processed or the call reports exactly one failure kind. Failures inside user code are
/// boxed and kept as the error source, tagged with the segment that raised them so a caller
/// can retry the whole run or isolate the bad byte range.
///
/// ```rust,ignore
/// match engine.fold(&input, count_lines, |a, b| a + b, 0u64) {
///     Ok(total) => println!("{total}"),
///     Err(EngineError::UserFunctionFailed { segment, byte_range, .. }) => {
///         eprintln!("segment {segment} ({byte_range:?}) failed")
///     }
///     Err(e) => eprintln!("{e}"),
/// }
/// ```
use std::ops::Range;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Boxed error raised by user-supplied map, combine or transform functions
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur while planning, processing or writing a run
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Input unavailable: {path}: {source}")]
    IoUnavailable {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Record at byte {offset} exceeds the {limit} byte scan window")]
    RecordTooLarge { offset: u64, limit: usize },
    #[error("User function failed on segment {segment} (bytes {byte_range:?}): {source}")]
    UserFunctionFailed {
        segment: usize,
        byte_range: Range<u64>,
        source: BoxError,
    },
    #[error("Invalid UTF-8 in segment {segment} at byte {offset}")]
    InvalidEncoding { segment: usize, offset: u64 },
    #[error("Output write failed: {0}")]
    OutputWriteFailed(#[source] std::io::Error),
    #[error("Operation cancelled after an earlier failure")]
    Cancelled,
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl EngineError {
    pub fn io_unavailable(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::IoUnavailable {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn record_too_large(offset: u64, limit: usize) -> Self {
        Self::RecordTooLarge { offset, limit }
    }

    pub fn user_function_failed(
        segment: usize,
        byte_range: Range<u64>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::UserFunctionFailed {
            segment,
            byte_range,
            source: source.into(),
        }
    }

    pub fn invalid_encoding(segment: usize, offset: u64) -> Self {
        Self::InvalidEncoding { segment, offset }
    }

    pub fn output_write_failed(source: std::io::Error) -> Self {
        Self::OutputWriteFailed(source)
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    /// Whether this error only reports that work was abandoned because of another failure
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Index of the segment the failure is attributed to, if any
    pub fn segment(&self) -> Option<usize> {
        match self {
            Self::UserFunctionFailed { segment, .. } | Self::InvalidEncoding { segment, .. } => {
                Some(*segment)
            }
            _ => None,
        }
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        Self::ConfigError(err.to_string())
    }
}
