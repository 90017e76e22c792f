pub mod combine;
pub mod config;
pub mod engine;
pub mod errors;
pub mod handle;
pub mod logging;
pub mod metrics;
pub mod ops;
pub mod pool;
pub mod segment;
pub mod sink;
pub mod source;

pub use config::{EncodingMode, EngineConfig};
pub use engine::{fold, transform, Engine};
pub use errors::{BoxError, EngineError, EngineResult};
pub use ops::{Aggregate, RecordTransform};
pub use pool::SharedCounter;
pub use segment::{plan_segments, Delimiter, Record, Segment, SegmentView};
pub use sink::SegmentOutput;
pub use source::InputSource;
