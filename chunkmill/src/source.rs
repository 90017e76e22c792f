use memmap2::Mmap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::trace;

use crate::errors::{EngineError, EngineResult};

const BUFFER_CAPACITY: usize = 65536;

/// Label used in errors for inputs that do not come from a file
const STREAM_LABEL: &str = "<stream>";

/// Bytes of one engine input.
///
/// Large files are memory mapped and shared read-only across workers; small files and
/// streams are read into an owned buffer. Either way the bytes are only reachable through
/// a borrow of the source, so they cannot outlive it.
#[derive(Debug)]
pub enum InputSource {
    /// Zero-length input; nothing to map
    Empty,
    /// Input read fully into memory
    Buffered(Vec<u8>),
    /// Memory mapped file
    Mapped(Mmap),
}

impl InputSource {
    /// Opens `path`, memory mapping it when it is at least `mmap_threshold` bytes
    pub fn open(path: impl AsRef<Path>, mmap_threshold: u64) -> EngineResult<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| EngineError::io_unavailable(path, e))?;
        let size = file
            .metadata()
            .map_err(|e| EngineError::io_unavailable(path, e))?
            .len();

        if size == 0 {
            trace!("Empty input: {}", path.display());
            Ok(Self::Empty)
        } else if size >= mmap_threshold {
            trace!("Memory mapping {} ({} bytes)", path.display(), size);
            // SAFETY: the mapping is read-only; callers must not truncate the file mid-run
            let mmap = unsafe { Mmap::map(&file) }.map_err(|e| EngineError::io_unavailable(path, e))?;
            Ok(Self::Mapped(mmap))
        } else {
            trace!("Buffering {} ({} bytes)", path.display(), size);
            let mut reader = BufReader::with_capacity(BUFFER_CAPACITY, file);
            let mut bytes = Vec::with_capacity(size as usize);
            reader
                .read_to_end(&mut bytes)
                .map_err(|e| EngineError::io_unavailable(path, e))?;
            Ok(Self::from_bytes(bytes))
        }
    }

    /// Wraps bytes already in memory
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        let bytes = bytes.into();
        if bytes.is_empty() {
            Self::Empty
        } else {
            Self::Buffered(bytes)
        }
    }

    /// Drains a byte stream into memory
    pub fn from_reader(reader: impl Read) -> EngineResult<Self> {
        let mut reader = BufReader::with_capacity(BUFFER_CAPACITY, reader);
        let mut bytes = Vec::new();
        reader
            .read_to_end(&mut bytes)
            .map_err(|e| EngineError::io_unavailable(PathBuf::from(STREAM_LABEL), e))?;
        Ok(Self::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Empty => &[],
            Self::Buffered(bytes) => bytes,
            Self::Mapped(mmap) => mmap,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self, Self::Mapped(_))
    }
}
