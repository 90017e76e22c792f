use config::{Config as ConfigBuilder, File};
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use crate::errors::{EngineError, EngineResult};
use crate::segment::Delimiter;

/// Files at least this large are memory mapped; smaller ones are read into memory
pub const DEFAULT_MMAP_THRESHOLD: u64 = 10 * 1024 * 1024; // 10MB

/// Largest planned segment; larger inputs are cut into more segments
pub const DEFAULT_MAX_SEGMENT_BYTES: usize = 64 * 1024 * 1024; // 64MB

/// How record bytes are decoded into text before reaching a transform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodingMode {
    /// Invalid UTF-8 aborts the run with `InvalidEncoding`
    #[default]
    FailFast,
    /// Invalid sequences are replaced with U+FFFD and a warning is logged
    Lossy,
}

/// Configuration for an engine instance.
///
/// # Configuration Locations
///
/// Loaded from, in order of precedence (later wins):
/// 1. Global `$HOME/.config/chunkmill/config.yaml`
/// 2. Local `.chunkmill.yaml` in the current directory
/// 3. A file passed explicitly to [`EngineConfig::load_from`]
///
/// # Configuration Format
///
/// ```yaml
/// # Worker threads (default: CPU cores)
/// worker_count: 8
///
/// # Segments to cut the input into (default: worker_count)
/// segment_count: 32
///
/// # Upper bound on segment size in bytes; big inputs get more segments (default: 64MB)
/// max_segment_bytes: 16777216
///
/// # Record delimiter: a one-character string, or a byte value 0-255
/// delimiter: "\n"
///
/// # Fail with RecordTooLarge if a boundary scan runs past this many bytes
/// max_record_len: 1048576
///
/// # Segments dispatched but not yet released (default: 2 * worker_count)
/// max_in_flight: 16
///
/// # fail_fast or lossy
/// encoding_mode: lossy
///
/// # Log level (trace, debug, info, warn, error)
/// log_level: "info"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of worker threads
    #[serde(default = "default_worker_count")]
    pub worker_count: NonZeroUsize,

    /// Number of segments to plan; defaults to the worker count
    #[serde(default)]
    pub segment_count: Option<NonZeroUsize>,

    /// Upper bound on the bytes covered by one segment
    #[serde(default = "default_max_segment_bytes")]
    pub max_segment_bytes: usize,

    /// Byte terminating each record
    #[serde(default)]
    pub delimiter: Delimiter,

    /// Upper bound on the forward scan for a record boundary.
    /// None scans as far as needed, folding a delimiter-free tail into the last segment.
    #[serde(default)]
    pub max_record_len: Option<usize>,

    /// Segments dispatched but not yet released to the caller
    #[serde(default)]
    pub max_in_flight: Option<NonZeroUsize>,

    /// How records are decoded before reaching a transform
    #[serde(default)]
    pub encoding_mode: EncodingMode,

    /// Inputs at least this large are memory mapped
    #[serde(default = "default_mmap_threshold")]
    pub mmap_threshold: u64,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_worker_count() -> NonZeroUsize {
    NonZeroUsize::new(num_cpus::get()).unwrap_or(NonZeroUsize::MIN)
}

fn default_max_segment_bytes() -> usize {
    DEFAULT_MAX_SEGMENT_BYTES
}

fn default_mmap_threshold() -> u64 {
    DEFAULT_MMAP_THRESHOLD
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            segment_count: None,
            max_segment_bytes: default_max_segment_bytes(),
            delimiter: Delimiter::default(),
            max_record_len: None,
            max_in_flight: None,
            encoding_mode: EncodingMode::default(),
            mmap_threshold: default_mmap_threshold(),
            log_level: default_log_level(),
        }
    }
}

impl EngineConfig {
    /// Loads configuration from the default locations
    pub fn load() -> EngineResult<Self> {
        Self::load_from(None)
    }

    /// Loads configuration from the default locations plus an optional explicit file
    pub fn load_from(config_path: Option<&Path>) -> EngineResult<Self> {
        let mut builder = ConfigBuilder::builder();

        let config_files = [
            dirs::config_dir().map(|p| p.join("chunkmill/config.yaml")),
            Some(PathBuf::from(".chunkmill.yaml")),
        ];

        for path in config_files.iter().flatten() {
            if path.exists() {
                builder = builder.add_source(File::from(path.as_path()));
            }
        }

        // An explicit file must exist
        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path).required(true));
        }

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Overrides the worker count
    pub fn with_worker_count(mut self, worker_count: NonZeroUsize) -> Self {
        self.worker_count = worker_count;
        self
    }

    /// Overrides the planned segment count
    pub fn with_segment_count(mut self, segment_count: NonZeroUsize) -> Self {
        self.segment_count = Some(segment_count);
        self
    }

    /// Caps the bytes covered by one segment
    pub fn with_max_segment_bytes(mut self, max_segment_bytes: usize) -> Self {
        self.max_segment_bytes = max_segment_bytes;
        self
    }

    /// Overrides the record delimiter
    pub fn with_delimiter(mut self, delimiter: Delimiter) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Bounds the record boundary scan
    pub fn with_max_record_len(mut self, max_record_len: usize) -> Self {
        self.max_record_len = Some(max_record_len);
        self
    }

    /// Overrides the dispatch window
    pub fn with_max_in_flight(mut self, max_in_flight: NonZeroUsize) -> Self {
        self.max_in_flight = Some(max_in_flight);
        self
    }

    pub fn with_encoding_mode(mut self, encoding_mode: EncodingMode) -> Self {
        self.encoding_mode = encoding_mode;
        self
    }

    pub fn with_mmap_threshold(mut self, mmap_threshold: u64) -> Self {
        self.mmap_threshold = mmap_threshold;
        self
    }

    /// Segment count actually planned for a run
    pub fn effective_segment_count(&self) -> usize {
        self.segment_count.unwrap_or(self.worker_count).get()
    }

    /// Segment count for an input of `input_len` bytes.
    ///
    /// Never below [`effective_segment_count`](Self::effective_segment_count), and high
    /// enough that no segment exceeds `max_segment_bytes` before boundary snapping.
    pub fn segment_count_for(&self, input_len: usize) -> usize {
        let by_size = input_len.div_ceil(self.max_segment_bytes.max(1));
        self.effective_segment_count().max(by_size)
    }

    /// Dispatch window actually used for a run
    pub fn effective_max_in_flight(&self) -> usize {
        self.max_in_flight
            .map(NonZeroUsize::get)
            .unwrap_or_else(|| self.worker_count.get().saturating_mul(2))
    }

    /// Rejects settings that cannot produce a valid run
    pub fn validate(&self) -> EngineResult<()> {
        if self.max_record_len == Some(0) {
            return Err(EngineError::config_error(
                "max_record_len must be at least 1 byte",
            ));
        }
        if self.max_segment_bytes == 0 {
            return Err(EngineError::config_error(
                "max_segment_bytes must be at least 1 byte",
            ));
        }
        if self.log_level.parse::<tracing::Level>().is_err() {
            return Err(EngineError::config_error(format!(
                "unknown log level: {}",
                self.log_level
            )));
        }
        Ok(())
    }
}
