use std::sync::Arc;

use chrono::{DateTime, Utc};
use image::RgbImage;
use tokio::sync::watch;

/// One decoded capture frame in packed RGB24.
#[derive(Debug, Clone)]
pub struct Frame {
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
    pub image: RgbImage,
}

impl Frame {
    pub fn new(sequence: u64, captured_at: DateTime<Utc>, image: RgbImage) -> Self {
        Self {
            sequence,
            captured_at,
            image,
        }
    }

    /// Build from a raw RGB24 buffer; `None` when the buffer size does not
    /// match the dimensions.
    pub fn from_raw(
        sequence: u64,
        captured_at: DateTime<Utc>,
        width: u32,
        height: u32,
        bytes: Vec<u8>,
    ) -> Option<Self> {
        RgbImage::from_raw(width, height, bytes).map(|image| Self::new(sequence, captured_at, image))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.image.as_raw()
    }
}

/// Latest-value slot the capture loop publishes into. Readers only ever see
/// the newest frame; nothing queues behind a slow reader.
pub type FrameSender = watch::Sender<Option<Arc<Frame>>>;
pub type FrameReceiver = watch::Receiver<Option<Arc<Frame>>>;

pub fn frame_slot() -> (FrameSender, FrameReceiver) {
    watch::channel(None)
}
