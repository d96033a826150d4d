//! Position tracking: serial NMEA ingestion, fix smoothing and the latest
//! published fix.

pub mod fix;
pub mod nmea;
pub mod serial;
pub mod smoothing;
pub mod tracker;

pub use fix::{FixListener, FixQuality, PositionFix};
pub use serial::{PortOpener, SentenceSource, SerialPortOpener};
pub use tracker::{PositionTracker, TrackerState, TrackerStats, TrackerStatus};
