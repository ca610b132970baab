//! Media inspection and transcoder planning.

pub mod plan;
pub mod probe;

pub use plan::{EncodingPlan, PipelineMode};
pub use probe::{FfprobeProber, MediaCodecs, MediaProber, StreamKind, detect_version};
