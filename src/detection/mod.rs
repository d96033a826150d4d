//! Rate-limited vehicle detection over the latest captured frame.

pub mod backend;
pub mod dedup;
pub mod engine;
pub mod gate;
pub mod result;

pub use backend::{CommandBackend, InferenceBackend};
pub use engine::{DetectionEngine, DetectionState, DetectionStats, DetectionStatus};
pub use result::{DetectionListener, DetectionResult, RawCandidate};
