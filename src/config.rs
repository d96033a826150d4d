use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

/// Encoder and capture options. Field names follow the recognised invocation
/// options (`captureWidth`, `captureFPS`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CaptureConfig {
    pub capture_width: u32,
    pub capture_height: u32,
    #[serde(rename = "captureFPS", alias = "captureFps")]
    pub capture_fps: u32,
    pub segment_duration_seconds: u64,
    pub use_hardware_encoder: bool,
    /// Capture devices in priority order.
    pub camera_devices: Vec<String>,
    pub encoder_grace_seconds: u64,
    pub ffmpeg_path: String,
    pub hardware_codec: String,
    pub software_codec: String,
    pub bitrate_kbps: u32,
    pub max_encoder_crashes: u32,
    pub encoder_crash_window_seconds: u64,
    pub max_frame_read_failures: u32,
    /// A read that yields no frame within this long counts as failed.
    pub frame_read_timeout_ms: u64,
    pub frame_retry_base_ms: u64,
    pub frame_retry_max_ms: u64,
    pub overlay_font_paths: Vec<PathBuf>,
    pub overlay_fix_max_age_seconds: u64,
    pub overlay_detection_hold_seconds: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            capture_width: 1920,
            capture_height: 1080,
            capture_fps: 30,
            segment_duration_seconds: 300,
            use_hardware_encoder: true,
            camera_devices: (0..4).map(|index| format!("/dev/video{index}")).collect(),
            encoder_grace_seconds: 5,
            ffmpeg_path: "ffmpeg".into(),
            hardware_codec: "h264_nvenc".into(),
            software_codec: "libx264".into(),
            bitrate_kbps: 5000,
            max_encoder_crashes: 5,
            encoder_crash_window_seconds: 60,
            max_frame_read_failures: 30,
            frame_read_timeout_ms: 2000,
            frame_retry_base_ms: 50,
            frame_retry_max_ms: 1000,
            overlay_font_paths: vec![
                PathBuf::from("/usr/share/fonts/truetype/dejavu/DejaVuSansMono.ttf"),
                PathBuf::from("/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf"),
                PathBuf::from("/usr/share/fonts/TTF/DejaVuSans.ttf"),
            ],
            overlay_fix_max_age_seconds: 5,
            overlay_detection_hold_seconds: 3,
        }
    }
}

impl CaptureConfig {
    pub fn segment_duration(&self) -> Duration {
        Duration::from_secs(self.segment_duration_seconds)
    }

    pub fn encoder_grace(&self) -> Duration {
        Duration::from_secs(self.encoder_grace_seconds)
    }

    /// Never shorter than two frame periods.
    pub fn frame_read_timeout(&self) -> Duration {
        let period = Duration::from_secs(1) / self.capture_fps.max(1);
        Duration::from_millis(self.frame_read_timeout_ms).max(period * 2)
    }

    pub fn frame_bytes(&self) -> usize {
        self.capture_width as usize * self.capture_height as usize * 3
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GpsConfig {
    /// Serial ports in probe order.
    pub ports: Vec<String>,
    pub baud_rate: u32,
    pub probe_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub window_size: usize,
    pub staleness_seconds: u64,
    pub min_satellites: u32,
    pub max_consecutive_failures: u32,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
}

impl Default for GpsConfig {
    fn default() -> Self {
        Self {
            ports: vec![
                "/dev/ttyUSB0".into(),
                "/dev/ttyUSB1".into(),
                "/dev/ttyACM0".into(),
                "/dev/serial0".into(),
            ],
            baud_rate: 4800,
            probe_timeout_ms: 3000,
            read_timeout_ms: 1000,
            window_size: 5,
            staleness_seconds: 3,
            min_satellites: 4,
            max_consecutive_failures: 5,
            reconnect_base_ms: 250,
            reconnect_max_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DetectionConfig {
    pub inference_fps: f64,
    pub confidence_threshold: f64,
    pub dedup_window_seconds: u64,
    /// External recognizer invocation, program first. `None` disables detection.
    pub recognizer_command: Option<Vec<String>>,
    pub recognizer_timeout_ms: u64,
    pub skip_static_frames: bool,
    pub static_frame_distance: u32,
    pub static_frame_cooldown_seconds: u64,
    pub queue_capacity: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            inference_fps: 5.0,
            confidence_threshold: 0.5,
            dedup_window_seconds: 5,
            recognizer_command: Some(vec!["alpr".into(), "-j".into(), "-".into()]),
            recognizer_timeout_ms: 2000,
            skip_static_frames: true,
            static_frame_distance: 4,
            static_frame_cooldown_seconds: 10,
            queue_capacity: 64,
        }
    }
}

/// What to do when free space stays below the threshold after a cleanup.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum LowSpacePolicy {
    #[default]
    KeepRecording,
    PauseRecording,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetentionPolicy {
    pub min_free_percent: f64,
    pub retention_days: u32,
    pub check_interval_seconds: u64,
    pub low_space_policy: LowSpacePolicy,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            min_free_percent: 10.0,
            retention_days: 30,
            check_interval_seconds: 300,
            low_space_policy: LowSpacePolicy::KeepRecording,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    pub video_dir: PathBuf,
    pub db_path: PathBuf,
    pub segment_prefix: String,
    pub segment_extension: String,
    pub capture: CaptureConfig,
    pub gps: GpsConfig,
    pub detection: DetectionConfig,
    pub retention: RetentionPolicy,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            video_dir: PathBuf::from("/videos"),
            db_path: PathBuf::from("/var/lib/dashcam/events.sqlite3"),
            segment_prefix: "dashcam".into(),
            segment_extension: "mp4".into(),
            capture: CaptureConfig::default(),
            gps: GpsConfig::default(),
            detection: DetectionConfig::default(),
            retention: RetentionPolicy::default(),
        }
    }
}

impl AppConfig {
    /// Read the config once at startup. A missing file means defaults; a
    /// malformed one is an error rather than a silent fallback.
    pub fn load(path: &Path) -> Result<Self> {
        let config: AppConfig = if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config {}", path.display()))?
        } else {
            AppConfig::default()
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let capture = &self.capture;
        if capture.capture_width == 0 || capture.capture_height == 0 {
            bail!("capture resolution must be non-zero");
        }
        if capture.capture_fps == 0 {
            bail!("captureFPS must be greater than zero");
        }
        if capture.segment_duration_seconds == 0 {
            bail!("segmentDurationSeconds must be greater than zero");
        }
        if capture.frame_read_timeout_ms == 0 {
            bail!("frameReadTimeoutMs must be greater than zero");
        }
        if capture.camera_devices.is_empty() {
            bail!("at least one camera device is required");
        }
        if self.detection.inference_fps <= 0.0 {
            bail!("inferenceFps must be greater than zero");
        }
        if !(0.0..=1.0).contains(&self.detection.confidence_threshold) {
            bail!("confidenceThreshold must be within [0, 1]");
        }
        if self.detection.queue_capacity == 0 {
            bail!("queueCapacity must be greater than zero");
        }
        if self.gps.window_size == 0 {
            bail!("gps windowSize must be greater than zero");
        }
        if !(0.0..=100.0).contains(&self.retention.min_free_percent) {
            bail!("minFreePercent must be within [0, 100]");
        }
        if self.segment_prefix.is_empty() || self.segment_prefix.contains('/') {
            bail!("segmentPrefix must be a non-empty file name fragment");
        }
        Ok(())
    }
}
