use std::{fs, path::PathBuf};

use ab_glyph::{FontVec, PxScale};
use chrono::{DateTime, Duration, Utc};
use image::{Rgb, RgbImage};
use imageproc::{
    drawing::{draw_filled_rect_mut, draw_text_mut},
    rect::Rect,
};
use log::{info, warn};

use crate::{detection::DetectionResult, position::PositionFix};

const TEXT_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const BACKDROP_COLOR: Rgb<u8> = Rgb([0, 0, 0]);

/// Overlay text for one frame: time, then position, then the most recent
/// detection while it is within its hold time.
pub fn overlay_lines(
    now: DateTime<Utc>,
    fix: Option<&PositionFix>,
    fix_max_age: Duration,
    min_satellites: u32,
    detection: Option<&DetectionResult>,
    detection_hold: Duration,
) -> Vec<String> {
    let mut lines = vec![format!("Time: {}", now.format("%Y-%m-%d %H:%M:%S UTC"))];

    match fix.filter(|fix| fix.is_usable(min_satellites) && fix.age(now) <= fix_max_age) {
        Some(fix) => lines.push(format!(
            "GPS: {:.6}, {:.6} ({} sats)",
            fix.latitude, fix.longitude, fix.satellite_count
        )),
        None => lines.push("GPS: No Fix".to_string()),
    }

    if let Some(detection) = detection {
        let age = now - detection.captured_at;
        if age >= Duration::zero() && age <= detection_hold {
            lines.push(format!("Vehicle: {}", detection.summary()));
        }
    }

    lines
}

/// Draws overlay text onto frames. Without a loadable font it draws nothing.
pub struct OverlayRenderer {
    font: Option<FontVec>,
    scale: PxScale,
    line_height: i32,
}

impl OverlayRenderer {
    pub fn load(font_paths: &[PathBuf], frame_height: u32) -> Self {
        let size = (frame_height as f32 / 36.0).clamp(12.0, 48.0);
        let font = font_paths.iter().find_map(|path| {
            let bytes = fs::read(path).ok()?;
            match FontVec::try_from_vec(bytes) {
                Ok(font) => {
                    info!("Overlay font loaded from {}", path.display());
                    Some(font)
                }
                Err(err) => {
                    warn!("invalid overlay font {}: {err}", path.display());
                    None
                }
            }
        });
        if font.is_none() {
            warn!("no overlay font found; frames are recorded without overlay text");
        }

        Self {
            font,
            scale: PxScale::from(size),
            line_height: (size * 1.3) as i32,
        }
    }

    pub fn without_font() -> Self {
        Self {
            font: None,
            scale: PxScale::from(16.0),
            line_height: 20,
        }
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    pub fn render(&self, image: &mut RgbImage, lines: &[String]) {
        let Some(font) = &self.font else {
            return;
        };
        if lines.is_empty() {
            return;
        }

        let margin = 8;
        let longest = lines.iter().map(|line| line.chars().count()).max().unwrap_or(0);
        let backdrop_width = ((longest as f32 * self.scale.x * 0.6) as u32 + 2 * margin as u32)
            .min(image.width());
        let backdrop_height = (lines.len() as u32 * self.line_height as u32 + margin as u32)
            .min(image.height());
        if backdrop_width > 0 && backdrop_height > 0 {
            draw_filled_rect_mut(
                image,
                Rect::at(0, 0).of_size(backdrop_width, backdrop_height),
                BACKDROP_COLOR,
            );
        }

        for (index, line) in lines.iter().enumerate() {
            let y = margin / 2 + index as i32 * self.line_height;
            draw_text_mut(image, TEXT_COLOR, margin, y, self.scale, font, line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::FixQuality;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 21, 6, 30, 0).unwrap()
    }

    fn fix(age_seconds: i64, satellites: u32) -> PositionFix {
        PositionFix {
            latitude: 40.712776,
            longitude: -74.005974,
            fix_quality: FixQuality::Fix3D,
            satellite_count: satellites,
            captured_at: now() - Duration::seconds(age_seconds),
        }
    }

    fn detection(age_seconds: i64) -> DetectionResult {
        DetectionResult {
            captured_at: now() - Duration::seconds(age_seconds),
            plate_text: Some("ABC123".into()),
            description: Some("red Honda".into()),
            confidence: 0.9,
        }
    }

    #[test]
    fn fresh_fix_and_recent_detection_are_shown() {
        let lines = overlay_lines(
            now(),
            Some(&fix(1, 8)),
            Duration::seconds(5),
            4,
            Some(&detection(2)),
            Duration::seconds(3),
        );
        assert_eq!(lines[0], "Time: 2026-08-21 06:30:00 UTC");
        assert_eq!(lines[1], "GPS: 40.712776, -74.005974 (8 sats)");
        assert_eq!(lines[2], "Vehicle: ABC123 red Honda (90%)");
    }

    #[test]
    fn stale_or_weak_fix_reads_no_fix() {
        for candidate in [fix(10, 8), fix(0, 2)] {
            let lines = overlay_lines(
                now(),
                Some(&candidate),
                Duration::seconds(5),
                4,
                None,
                Duration::seconds(3),
            );
            assert_eq!(lines, vec!["Time: 2026-08-21 06:30:00 UTC".to_string(), "GPS: No Fix".to_string()]);
        }
    }

    #[test]
    fn detection_expires_after_hold_time() {
        let lines = overlay_lines(
            now(),
            None,
            Duration::seconds(5),
            4,
            Some(&detection(4)),
            Duration::seconds(3),
        );
        assert_eq!(lines.len(), 2);
    }

    #[test]
    fn renderer_without_font_leaves_frame_untouched() {
        let renderer = OverlayRenderer::without_font();
        let mut image = RgbImage::new(8, 8);
        renderer.render(&mut image, &["Time".to_string()]);
        assert!(image.pixels().all(|pixel| pixel.0 == [0, 0, 0]));
        assert!(!renderer.has_font());
    }
}
