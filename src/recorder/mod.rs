mod camera;
mod controller;
mod encoder;
mod overlay;
mod segment;
mod session;

pub use camera::{CameraOpener, CameraSpec, FfmpegCameraOpener, FrameSource};
pub use controller::{offer_interval, RecorderStatus, SegmentRecorder};
pub use encoder::{
    choose_encoder, encoder_args, probe_encoder, EncoderChoice, EncoderLauncher, EncoderSink,
    FfmpegLauncher,
};
pub use overlay::{overlay_lines, OverlayRenderer};
pub use segment::{Segment, SegmentLedger, SegmentNamer, SharedLedger};
pub use session::{CaptureSession, FrameOutcome, RecorderState, RecorderStats, SegmentOutput};
