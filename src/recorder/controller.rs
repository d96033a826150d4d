use std::{
    sync::{atomic::Ordering, Arc},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use log::{error, info, warn};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::{
    config::CaptureConfig,
    detection::DetectionResult,
    error::FaultKind,
    frame::{Frame, FrameSender},
    position::PositionFix,
    utils::{exponential_backoff, sleep_cancellable, Clock},
};

use super::{
    camera::{open_first, CameraOpener, CameraSpec, FramePump},
    encoder::{EncoderChoice, EncoderLauncher, FfmpegLauncher},
    overlay::{overlay_lines, OverlayRenderer},
    segment::{Segment, SegmentLedger, SharedLedger},
    session::{
        CaptureSession, RecorderCounters, RecorderState, RecorderStats, SegmentOutput,
        SessionHandles,
    },
};

const CAMERA_RETRY_INTERVAL: Duration = Duration::from_secs(5);
const CLOSED_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecorderStatus {
    pub state: RecorderState,
    pub device: Option<String>,
    pub encoder: Option<EncoderChoice>,
    pub current_segment: Option<Segment>,
    pub closed_segments: usize,
    pub stats: RecorderStats,
}

/// Frames offered to detection: one in every `n`.
pub fn offer_interval(capture_fps: u32, inference_fps: f64) -> u64 {
    if inference_fps <= 0.0 || !inference_fps.is_finite() {
        return 1;
    }
    ((capture_fps as f64 / inference_fps).round() as u64).max(1)
}

struct CaptureContext {
    config: CaptureConfig,
    output: SegmentOutput,
    camera: Arc<dyn CameraOpener>,
    launcher: Option<Arc<dyn EncoderLauncher>>,
    clock: Arc<dyn Clock>,
    handles: SessionHandles,
    device_tx: Arc<watch::Sender<Option<String>>>,
    encoder_tx: Arc<watch::Sender<Option<EncoderChoice>>>,
    min_satellites: u32,
    fix_rx: Option<watch::Receiver<Option<PositionFix>>>,
    detection_rx: Option<watch::Receiver<Option<DetectionResult>>>,
    frame_tx: Option<Arc<FrameSender>>,
    offer_every: u64,
    pause_rx: Option<watch::Receiver<bool>>,
}

/// Owns the camera and the encoder. Capture and encoding run on one
/// dedicated thread; everything else reads the ledger or the watch slots.
pub struct SegmentRecorder {
    config: CaptureConfig,
    output: SegmentOutput,
    camera: Arc<dyn CameraOpener>,
    launcher: Option<Arc<dyn EncoderLauncher>>,
    clock: Arc<dyn Clock>,
    handles: SessionHandles,
    device_tx: Arc<watch::Sender<Option<String>>>,
    encoder_tx: Arc<watch::Sender<Option<EncoderChoice>>>,
    min_satellites: u32,
    fix_rx: Option<watch::Receiver<Option<PositionFix>>>,
    detection_rx: Option<watch::Receiver<Option<DetectionResult>>>,
    frame_tx: Option<Arc<FrameSender>>,
    offer_every: u64,
    pause_rx: Option<watch::Receiver<bool>>,
    worker: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
}

impl SegmentRecorder {
    /// Adopts segment files already present in the output directory.
    pub fn new(
        config: CaptureConfig,
        output: SegmentOutput,
        camera: Arc<dyn CameraOpener>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let ledger = SegmentLedger::scan(&output.dir, &output.namer)?;
        if !ledger.closed().is_empty() {
            info!(
                "Adopted {} segments from earlier runs in {}",
                ledger.closed().len(),
                output.dir.display()
            );
        }

        let (closed_tx, _) = broadcast::channel(CLOSED_CHANNEL_CAPACITY);
        let (state_tx, _) = watch::channel(RecorderState::Idle);
        let (device_tx, _) = watch::channel(None);
        let (encoder_tx, _) = watch::channel(None);

        Ok(Self {
            config,
            output,
            camera,
            launcher: None,
            clock,
            handles: SessionHandles {
                ledger: SharedLedger::new(ledger),
                closed_tx,
                state_tx: Arc::new(state_tx),
                counters: Arc::new(RecorderCounters::default()),
            },
            device_tx: Arc::new(device_tx),
            encoder_tx: Arc::new(encoder_tx),
            min_satellites: 0,
            fix_rx: None,
            detection_rx: None,
            frame_tx: None,
            offer_every: 1,
            pause_rx: None,
            worker: None,
            cancel_token: None,
        })
    }

    /// Without a launcher the encoder is probed on the capture thread.
    pub fn with_launcher(mut self, launcher: Arc<dyn EncoderLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn with_fix_source(
        mut self,
        fix_rx: watch::Receiver<Option<PositionFix>>,
        min_satellites: u32,
    ) -> Self {
        self.fix_rx = Some(fix_rx);
        self.min_satellites = min_satellites;
        self
    }

    pub fn with_detection_source(mut self, detection_rx: watch::Receiver<Option<DetectionResult>>) -> Self {
        self.detection_rx = Some(detection_rx);
        self
    }

    pub fn with_frame_sink(mut self, frame_tx: FrameSender, inference_fps: f64) -> Self {
        self.frame_tx = Some(Arc::new(frame_tx));
        self.offer_every = offer_interval(self.config.capture_fps, inference_fps);
        self
    }

    /// `true` on the signal stops frames from reaching the encoder.
    pub fn with_pause_signal(mut self, pause_rx: watch::Receiver<bool>) -> Self {
        self.pause_rx = Some(pause_rx);
        self
    }

    pub fn start(&mut self, camera_spec: CameraSpec) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }

        let context = CaptureContext {
            config: self.config.clone(),
            output: self.output.clone(),
            camera: Arc::clone(&self.camera),
            launcher: self.launcher.clone(),
            clock: Arc::clone(&self.clock),
            handles: self.handles.clone(),
            device_tx: Arc::clone(&self.device_tx),
            encoder_tx: Arc::clone(&self.encoder_tx),
            min_satellites: self.min_satellites,
            fix_rx: self.fix_rx.clone(),
            detection_rx: self.detection_rx.clone(),
            frame_tx: self.frame_tx.clone(),
            offer_every: self.offer_every,
            pause_rx: self.pause_rx.clone(),
        };

        let cancel_token = CancellationToken::new();
        let token_clone = cancel_token.clone();
        let worker = thread::Builder::new()
            .name("dashcam-capture".into())
            .spawn(move || capture_loop(context, camera_spec, token_clone))
            .context("failed to spawn capture thread")?;

        self.worker = Some(worker);
        self.cancel_token = Some(cancel_token);
        Ok(())
    }

    /// Waits for the capture thread to close the open segment. Camera reads
    /// are bounded by the frame deadline, so the wait covers one read plus the
    /// encoder grace. A thread still running after that is detached and the
    /// failure reported.
    pub fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }

        let Some(handle) = self.worker.take() else {
            return Ok(());
        };

        let deadline = Instant::now()
            + self.config.frame_read_timeout()
            + self.config.encoder_grace()
            + Duration::from_secs(5);
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }

        if handle.is_finished() {
            if handle.join().is_err() {
                error!("capture thread panicked");
            }
            info!("Segment recorder stopped");
            Ok(())
        } else {
            anyhow::bail!("capture thread did not stop in time; detached")
        }
    }

    pub fn current_segment(&self) -> Option<Segment> {
        self.handles.ledger.current()
    }

    pub fn closed_segments(&self) -> Vec<Segment> {
        self.handles.ledger.closed()
    }

    pub fn subscribe_closed(&self) -> broadcast::Receiver<Segment> {
        self.handles.closed_tx.subscribe()
    }

    pub fn ledger(&self) -> SharedLedger {
        self.handles.ledger.clone()
    }

    pub fn state(&self) -> RecorderState {
        *self.handles.state_tx.borrow()
    }

    pub fn stats(&self) -> RecorderStats {
        self.handles.counters.snapshot()
    }

    pub fn status(&self) -> RecorderStatus {
        let ledger = self.handles.ledger.lock();
        RecorderStatus {
            state: self.state(),
            device: self.device_tx.borrow().clone(),
            encoder: self.encoder_tx.borrow().clone(),
            current_segment: ledger.open_segment().cloned(),
            closed_segments: ledger.closed().len(),
            stats: self.stats(),
        }
    }
}

impl Drop for SegmentRecorder {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!("{err:#}");
        }
    }
}

fn capture_loop(context: CaptureContext, camera_spec: CameraSpec, cancel_token: CancellationToken) {
    let config = &context.config;
    let handles = &context.handles;

    let launcher = match &context.launcher {
        Some(launcher) => Arc::clone(launcher),
        None => Arc::new(FfmpegLauncher::probe(config.clone())) as Arc<dyn EncoderLauncher>,
    };
    context.encoder_tx.send_replace(launcher.choice());

    let mut session = CaptureSession::new(config, context.output.clone(), launcher, handles.clone());
    let overlay = OverlayRenderer::load(&config.overlay_font_paths, config.capture_height);
    let mut sequence: u64 = 0;
    let mut announced_missing = false;

    while !cancel_token.is_cancelled() {
        let Some((device, source)) = open_first(context.camera.as_ref(), &camera_spec, config) else {
            if !announced_missing {
                warn!(
                    "{}",
                    FaultKind::DeviceUnavailable(format!(
                        "no camera opened from {:?}",
                        camera_spec.devices
                    ))
                );
                announced_missing = true;
            }
            handles.state_tx.send_replace(RecorderState::NoDevice);
            if !sleep_cancellable(CAMERA_RETRY_INTERVAL, &cancel_token) {
                break;
            }
            continue;
        };

        announced_missing = false;
        let pump = match FramePump::spawn(&device, source) {
            Ok(pump) => pump,
            Err(err) => {
                error!("failed to start camera reader for {device}: {err}");
                if !sleep_cancellable(CAMERA_RETRY_INTERVAL, &cancel_token) {
                    break;
                }
                continue;
            }
        };
        context.device_tx.send_replace(Some(device.clone()));
        handles.state_tx.send_replace(RecorderState::Capturing);

        run_device(
            &context,
            &device,
            &pump,
            &mut session,
            &overlay,
            &mut sequence,
            &cancel_token,
        );
        drop(pump);
        context.device_tx.send_replace(None);
    }

    handles.state_tx.send_replace(RecorderState::ShuttingDown);
    session.suspend(context.clock.now());
    handles.state_tx.send_replace(RecorderState::Idle);
}

/// Capture from one opened device until cancelled or the device fails too
/// many reads in a row. A read that yields nothing within the frame deadline
/// counts as a failure; each failure backs off before the next read.
fn run_device(
    context: &CaptureContext,
    device: &str,
    pump: &FramePump,
    session: &mut CaptureSession,
    overlay: &OverlayRenderer,
    sequence: &mut u64,
    cancel_token: &CancellationToken,
) {
    let config = &context.config;
    let handles = &context.handles;
    let fix_max_age = ChronoDuration::seconds(config.overlay_fix_max_age_seconds as i64);
    let detection_hold = ChronoDuration::seconds(config.overlay_detection_hold_seconds as i64);
    let read_timeout = config.frame_read_timeout();
    let retry_base = Duration::from_millis(config.frame_retry_base_ms);
    let retry_max = Duration::from_millis(config.frame_retry_max_ms);
    let mut failures: u32 = 0;
    let mut paused = false;
    let mut unavailable = false;

    while !cancel_token.is_cancelled() {
        let mut image = match pump.next_frame(read_timeout) {
            Ok(image) => {
                failures = 0;
                image
            }
            Err(err) => {
                failures = failures.saturating_add(1);
                handles.counters.read_failures.fetch_add(1, Ordering::Relaxed);
                if failures >= config.max_frame_read_failures {
                    warn!(
                        "{}",
                        FaultKind::DeviceUnavailable(format!(
                            "camera {device} failed {failures} consecutive reads: {err}"
                        ))
                    );
                    session.suspend(context.clock.now());
                    handles.state_tx.send_replace(RecorderState::NoDevice);
                    return;
                }
                if failures == 1 {
                    warn!("{}", FaultKind::TransientIo(format!("camera {device}: {err}")));
                }
                if !sleep_cancellable(exponential_backoff(retry_base, retry_max, failures), cancel_token) {
                    return;
                }
                continue;
            }
        };

        handles.counters.frames_captured.fetch_add(1, Ordering::Relaxed);
        let captured_at = context.clock.now();
        let this_sequence = *sequence;
        *sequence += 1;

        if let Some(frame_tx) = &context.frame_tx {
            if this_sequence % context.offer_every == 0 {
                let frame = Frame::new(this_sequence, captured_at, image.clone());
                frame_tx.send_replace(Some(Arc::new(frame)));
            }
        }

        let pause_requested = context.pause_rx.as_ref().is_some_and(|rx| *rx.borrow());
        if pause_requested {
            if !paused {
                warn!("Recording paused: disk space below threshold");
                session.suspend(captured_at);
                handles.state_tx.send_replace(RecorderState::Paused);
                paused = true;
            }
            handles.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        if paused {
            info!("Recording resumed");
            paused = false;
            handles.state_tx.send_replace(RecorderState::Capturing);
        }

        let fix = context.fix_rx.as_ref().and_then(|rx| *rx.borrow());
        let detection = context.detection_rx.as_ref().and_then(|rx| rx.borrow().clone());
        let lines = overlay_lines(
            captured_at,
            fix.as_ref(),
            fix_max_age,
            context.min_satellites,
            detection.as_ref(),
            detection_hold,
        );
        overlay.render(&mut image, &lines);

        session.write_frame(captured_at, image.as_raw());
        if session.is_unavailable() != unavailable {
            unavailable = session.is_unavailable();
            if !unavailable {
                info!("Encoder available again");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        frame::frame_slot,
        recorder::{segment::SegmentNamer, session::tests::FakeLauncher, FrameSource},
        utils::ManualClock,
    };
    use anyhow::bail;
    use chrono::{DateTime, TimeZone, Utc};
    use image::RgbImage;
    use std::{
        io,
        path::Path,
        sync::{atomic::AtomicU32, Mutex},
    };

    fn start_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 8, 0, 0).unwrap()
    }

    /// Yields `frames` frames half a second apart on the manual clock, then
    /// reports would-block forever.
    struct ScriptedCamera {
        clock: ManualClock,
        frames: u32,
        opened: Mutex<u32>,
    }

    struct ScriptedSource {
        clock: ManualClock,
        remaining: u32,
        index: i64,
    }

    impl FrameSource for ScriptedSource {
        fn read_frame(&mut self) -> io::Result<RgbImage> {
            if self.remaining == 0 {
                thread::sleep(Duration::from_millis(5));
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "no frame"));
            }
            self.remaining -= 1;
            self.clock
                .set(start_time() + ChronoDuration::milliseconds(self.index * 500));
            self.index += 1;
            Ok(RgbImage::new(4, 4))
        }
    }

    impl CameraOpener for ScriptedCamera {
        fn open(&self, device: &str, _config: &CaptureConfig) -> Result<Box<dyn FrameSource>> {
            let mut opened = self.opened.lock().unwrap();
            if device != "/dev/video1" || *opened > 0 {
                bail!("no such device");
            }
            *opened += 1;
            Ok(Box::new(ScriptedSource {
                clock: self.clock.clone(),
                remaining: self.frames,
                index: 0,
            }))
        }
    }

    fn test_config() -> CaptureConfig {
        CaptureConfig {
            capture_width: 4,
            capture_height: 4,
            capture_fps: 2,
            segment_duration_seconds: 2,
            max_frame_read_failures: u32::MAX,
            frame_read_timeout_ms: 200,
            overlay_font_paths: Vec::new(),
            ..CaptureConfig::default()
        }
    }

    /// Hands out one prepared source; every later open fails.
    struct OnceCamera {
        source: Mutex<Option<Box<dyn FrameSource>>>,
    }

    impl OnceCamera {
        fn new(source: impl FrameSource + 'static) -> Arc<Self> {
            Arc::new(Self {
                source: Mutex::new(Some(Box::new(source))),
            })
        }
    }

    impl CameraOpener for OnceCamera {
        fn open(&self, _device: &str, _config: &CaptureConfig) -> Result<Box<dyn FrameSource>> {
            match self.source.lock().unwrap().take() {
                Some(source) => Ok(source),
                None => bail!("camera gone"),
            }
        }
    }

    /// Yields `remaining` frames 50 ms apart, then blocks without end.
    struct StallingSource {
        clock: ManualClock,
        remaining: u32,
        index: i64,
    }

    impl FrameSource for StallingSource {
        fn read_frame(&mut self) -> io::Result<RgbImage> {
            if self.remaining == 0 {
                thread::sleep(Duration::from_secs(3600));
                return Err(io::Error::new(io::ErrorKind::TimedOut, "stalled"));
            }
            self.remaining -= 1;
            self.clock
                .set(start_time() + ChronoDuration::milliseconds(self.index * 50));
            self.index += 1;
            Ok(RgbImage::new(4, 4))
        }
    }

    struct FailingSource {
        reads: Arc<AtomicU32>,
    }

    impl FrameSource for FailingSource {
        fn read_frame(&mut self) -> io::Result<RgbImage> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::new(io::ErrorKind::Other, "select timeout"))
        }
    }

    fn stall_config() -> CaptureConfig {
        CaptureConfig {
            capture_fps: 20,
            frame_read_timeout_ms: 100,
            frame_retry_base_ms: 20,
            ..test_config()
        }
    }

    fn output(dir: &Path) -> SegmentOutput {
        SegmentOutput {
            dir: dir.to_path_buf(),
            namer: SegmentNamer::new("dashcam", "mp4"),
        }
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn records_rotates_and_closes_on_stop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = ManualClock::new(start_time());
        let camera = Arc::new(ScriptedCamera {
            clock: clock.clone(),
            frames: 14,
            opened: Mutex::new(0),
        });
        let launcher = Arc::new(FakeLauncher::default());
        let (frame_tx, frame_rx) = frame_slot();

        let mut recorder = SegmentRecorder::new(test_config(), output(dir.path()), camera, Arc::new(clock))
            .expect("recorder")
            .with_launcher(launcher.clone())
            .with_frame_sink(frame_tx, 2.0);
        let mut closed_rx = recorder.subscribe_closed();

        recorder
            .start(CameraSpec {
                devices: vec!["/dev/video0".into(), "/dev/video1".into()],
            })
            .expect("start");

        assert!(wait_for(|| recorder.stats().frames_written == 14));
        let status = recorder.status();
        assert_eq!(status.device.as_deref(), Some("/dev/video1"));
        assert_eq!(status.closed_segments, 3);
        assert!(status.current_segment.is_some_and(|segment| segment.is_open()));
        assert_eq!(frame_rx.borrow().as_ref().map(|frame| frame.sequence), Some(13));

        recorder.stop().expect("stop");
        assert_eq!(recorder.state(), RecorderState::Idle);
        assert!(recorder.current_segment().is_none());
        assert_eq!(recorder.closed_segments().len(), 4);

        let mut notified = 0;
        while closed_rx.try_recv().is_ok() {
            notified += 1;
        }
        assert_eq!(notified, 4);
    }

    #[test]
    fn stop_during_a_stalled_read_closes_the_segment() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = ManualClock::new(start_time());
        let camera = OnceCamera::new(StallingSource {
            clock: clock.clone(),
            remaining: 3,
            index: 0,
        });

        let mut recorder = SegmentRecorder::new(stall_config(), output(dir.path()), camera, Arc::new(clock))
            .expect("recorder")
            .with_launcher(Arc::new(FakeLauncher::default()));
        recorder
            .start(CameraSpec {
                devices: vec!["/dev/video0".into()],
            })
            .expect("start");

        assert!(wait_for(|| recorder.stats().frames_written == 3));
        assert!(wait_for(|| recorder.stats().read_failures >= 1));

        let started = Instant::now();
        recorder.stop().expect("stop");
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(recorder.state(), RecorderState::Idle);
        assert!(recorder.current_segment().is_none());
        assert_eq!(recorder.closed_segments().len(), 1);
    }

    #[test]
    fn stalled_camera_is_given_up_after_repeated_timeouts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = ManualClock::new(start_time());
        let camera = OnceCamera::new(StallingSource {
            clock: clock.clone(),
            remaining: 3,
            index: 0,
        });
        let config = CaptureConfig {
            max_frame_read_failures: 2,
            ..stall_config()
        };

        let mut recorder = SegmentRecorder::new(config, output(dir.path()), camera, Arc::new(clock))
            .expect("recorder")
            .with_launcher(Arc::new(FakeLauncher::default()));
        recorder
            .start(CameraSpec {
                devices: vec!["/dev/video0".into()],
            })
            .expect("start");

        assert!(wait_for(|| recorder.state() == RecorderState::NoDevice));
        assert!(recorder.current_segment().is_none());
        assert_eq!(recorder.closed_segments().len(), 1);
        assert_eq!(recorder.stats().read_failures, 2);
        recorder.stop().expect("stop");
    }

    #[test]
    fn failed_reads_back_off_before_retrying() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = ManualClock::new(start_time());
        let reads = Arc::new(AtomicU32::new(0));
        let camera = OnceCamera::new(FailingSource {
            reads: Arc::clone(&reads),
        });
        let config = CaptureConfig {
            frame_retry_base_ms: 50,
            frame_retry_max_ms: 1000,
            ..test_config()
        };

        let mut recorder = SegmentRecorder::new(config, output(dir.path()), camera, Arc::new(clock))
            .expect("recorder")
            .with_launcher(Arc::new(FakeLauncher::default()));
        recorder
            .start(CameraSpec {
                devices: vec!["/dev/video0".into()],
            })
            .expect("start");

        thread::sleep(Duration::from_millis(500));
        recorder.stop().expect("stop");

        // 50 + 100 + 200 ms of backoff fit in the window; a spinning loop
        // would read thousands of times.
        let failures = recorder.stats().read_failures;
        assert!((2..=6).contains(&failures), "{failures} failed reads");
        assert!(reads.load(Ordering::SeqCst) <= failures as u32 + 2);
        assert_eq!(recorder.stats().frames_written, 0);
    }

    #[test]
    fn missing_camera_degrades_to_no_device() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = ManualClock::new(start_time());
        let camera = Arc::new(ScriptedCamera {
            clock: clock.clone(),
            frames: 0,
            opened: Mutex::new(0),
        });

        let mut recorder = SegmentRecorder::new(test_config(), output(dir.path()), camera, Arc::new(clock))
            .expect("recorder")
            .with_launcher(Arc::new(FakeLauncher::default()));
        recorder
            .start(CameraSpec {
                devices: vec!["/dev/video0".into()],
            })
            .expect("start");

        assert!(wait_for(|| recorder.state() == RecorderState::NoDevice));
        assert!(recorder.current_segment().is_none());
        recorder.stop().expect("stop");
        assert_eq!(recorder.state(), RecorderState::Idle);
    }

    #[test]
    fn adopts_existing_segments() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("dashcam-20260430-230000.mp4"), b"old").expect("write");
        let clock = ManualClock::new(start_time());
        let camera = Arc::new(ScriptedCamera {
            clock: clock.clone(),
            frames: 0,
            opened: Mutex::new(0),
        });

        let recorder =
            SegmentRecorder::new(test_config(), output(dir.path()), camera, Arc::new(clock)).expect("recorder");
        assert_eq!(recorder.closed_segments().len(), 1);
        assert_eq!(recorder.status().state, RecorderState::Idle);
    }

    #[test]
    fn offers_every_nth_frame() {
        assert_eq!(offer_interval(30, 5.0), 6);
        assert_eq!(offer_interval(30, 60.0), 1);
        assert_eq!(offer_interval(30, 0.0), 1);
        assert_eq!(offer_interval(25, 2.0), 13);
    }
}
