use chrono::{DateTime, Duration, Utc};
use image::{imageops, DynamicImage};
use image_hasher::{HashAlg, HasherConfig, ImageHash};

use crate::frame::Frame;

const THUMBNAIL_WIDTH: u32 = 64;
const THUMBNAIL_HEIGHT: u32 = 36;

/// Perceptual hash of a frame, computed on a thumbnail so a full-resolution
/// frame never has to be copied.
pub fn compute_frame_hash(frame: &Frame) -> ImageHash {
    let thumbnail = imageops::thumbnail(&frame.image, THUMBNAIL_WIDTH, THUMBNAIL_HEIGHT);
    let hasher = HasherConfig::new()
        .hash_alg(HashAlg::DoubleGradient)
        .hash_size(8, 8)
        .to_hasher();
    hasher.hash_image(&DynamicImage::ImageRgb8(thumbnail))
}

/// Skips inference on frames that look like the last inferred one until the
/// cooldown elapses. A parked car produces one sample per cooldown, not one
/// per tick.
#[derive(Debug)]
pub struct StaticFrameGate {
    min_distance: u32,
    cooldown: Duration,
    last_hash: Option<ImageHash>,
    last_inferred_at: Option<DateTime<Utc>>,
}

impl StaticFrameGate {
    pub fn new(min_distance: u32, cooldown: Duration) -> Self {
        Self {
            min_distance,
            cooldown,
            last_hash: None,
            last_inferred_at: None,
        }
    }

    pub fn admit(&self, hash: &ImageHash, now: DateTime<Utc>) -> bool {
        let Some(previous) = &self.last_hash else {
            return true;
        };
        if hash.dist(previous) >= self.min_distance {
            return true;
        }
        self.last_inferred_at
            .map(|at| now - at >= self.cooldown)
            .unwrap_or(true)
    }

    pub fn mark_inferred(&mut self, hash: ImageHash, now: DateTime<Utc>) {
        self.last_hash = Some(hash);
        self.last_inferred_at = Some(now);
    }
}
