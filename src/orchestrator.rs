use std::{
    fs,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::{
    runtime::{Handle, RuntimeFlavor},
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::AppConfig,
    db::{EventStore, RecordOutcome, VehicleEvent},
    detection::{
        CommandBackend, DetectionEngine, DetectionListener, DetectionResult, DetectionStatus,
        InferenceBackend,
    },
    frame::frame_slot,
    position::{PortOpener, PositionFix, PositionTracker, SerialPortOpener, TrackerStatus},
    recorder::{
        CameraOpener, CameraSpec, EncoderLauncher, FfmpegCameraOpener, RecorderStatus,
        SegmentNamer, SegmentOutput, SegmentRecorder, SharedLedger,
    },
    retention::{CleanupReport, RetentionManager, SpaceProbe, SysinfoSpaceProbe},
    utils::{Clock, MonotonicClock, SystemClock},
};

/// Device and process seams. `system()` wires the real ones.
pub struct Collaborators<B: InferenceBackend> {
    pub port_opener: Arc<dyn PortOpener>,
    pub camera: Arc<dyn CameraOpener>,
    /// `None` probes `ffmpeg` on the capture thread.
    pub launcher: Option<Arc<dyn EncoderLauncher>>,
    pub backend: Option<B>,
    pub space_probe: Arc<dyn SpaceProbe>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators<CommandBackend> {
    pub fn system(config: &AppConfig) -> Self {
        Self {
            port_opener: Arc::new(SerialPortOpener),
            camera: Arc::new(FfmpegCameraOpener),
            launcher: None,
            backend: CommandBackend::from_config(&config.detection),
            space_probe: Arc::new(SysinfoSpaceProbe::new()),
            clock: Arc::new(MonotonicClock::new(Arc::new(SystemClock))),
        }
    }
}

#[derive(Debug, Default)]
struct PersistenceCounters {
    queued: AtomicU64,
    dropped: AtomicU64,
    recorded: AtomicU64,
    duplicates: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PersistenceStats {
    pub queued: u64,
    /// Detections dropped because the queue was full.
    pub dropped: u64,
    pub recorded: u64,
    pub duplicates: u64,
    pub failed: u64,
}

impl PersistenceCounters {
    fn snapshot(&self) -> PersistenceStats {
        PersistenceStats {
            queued: self.queued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            recorded: self.recorded.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub tracker: TrackerStatus,
    pub recorder: RecorderStatus,
    pub detection: DetectionStatus,
    pub persistence: PersistenceStats,
    pub free_space_percent: Option<f64>,
}

/// Detection listener: hands results to the persistence task without ever
/// waiting. A full queue drops the detection and counts it.
struct DetectionQueue {
    tx: mpsc::Sender<DetectionResult>,
    counters: Arc<PersistenceCounters>,
}

impl DetectionListener for DetectionQueue {
    fn on_detection(&self, detection: &DetectionResult) {
        match self.tx.try_send(detection.clone()) {
            Ok(()) => {
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    warn!("detection queue full; {dropped} detections dropped so far");
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("persistence stopped; detection discarded");
            }
        }
    }
}

/// Output directory must exist and accept writes.
pub fn ensure_output_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create output directory {}", dir.display()))?;
    let probe = dir.join(".dashcam-write-test");
    fs::write(&probe, b"ok")
        .with_context(|| format!("output directory {} is not writable", dir.display()))?;
    fs::remove_file(&probe)
        .with_context(|| format!("failed to clean up {}", probe.display()))?;
    Ok(())
}

/// Wires the components, starts them leaves first and stops them in reverse.
pub struct Orchestrator<B: InferenceBackend = CommandBackend> {
    config: Arc<AppConfig>,
    store: EventStore,
    tracker: PositionTracker,
    detection: DetectionEngine<B>,
    recorder: SegmentRecorder,
    retention: RetentionManager,
    counters: Arc<PersistenceCounters>,
    pending: Option<PendingStart>,
    persistence: Option<JoinHandle<()>>,
    persistence_token: Option<CancellationToken>,
    stopped: bool,
}

/// Channel ends consumed by `start`.
struct PendingStart {
    detection_rx: mpsc::Receiver<DetectionResult>,
    frame_rx: crate::frame::FrameReceiver,
}

impl Orchestrator<CommandBackend> {
    pub fn new(config: AppConfig) -> Result<Self> {
        let collaborators = Collaborators::system(&config);
        Self::with_collaborators(config, collaborators)
    }
}

impl<B: InferenceBackend> Orchestrator<B> {
    pub fn with_collaborators(config: AppConfig, parts: Collaborators<B>) -> Result<Self> {
        config.validate()?;
        ensure_output_dir(&config.video_dir)?;

        let config = Arc::new(config);
        let clock = parts.clock;
        let counters = Arc::new(PersistenceCounters::default());

        let store = EventStore::open(config.db_path.clone())?;

        let tracker = PositionTracker::new(config.gps.clone(), parts.port_opener, Arc::clone(&clock));

        let (detection_tx, detection_rx) = mpsc::channel(config.detection.queue_capacity);
        let detection = DetectionEngine::new(config.detection.clone(), parts.backend, Arc::clone(&clock))
            .on_detection(Arc::new(DetectionQueue {
                tx: detection_tx,
                counters: Arc::clone(&counters),
            }));

        let (frame_tx, frame_rx) = frame_slot();
        let (pause_tx, pause_rx) = watch::channel(false);
        let output = SegmentOutput {
            dir: config.video_dir.clone(),
            namer: SegmentNamer::new(config.segment_prefix.clone(), config.segment_extension.clone()),
        };
        let mut recorder =
            SegmentRecorder::new(config.capture.clone(), output, parts.camera, Arc::clone(&clock))?
                .with_fix_source(tracker.subscribe(), config.gps.min_satellites)
                .with_detection_source(detection.subscribe_latest())
                .with_frame_sink(frame_tx, config.detection.inference_fps)
                .with_pause_signal(pause_rx);
        if let Some(launcher) = parts.launcher {
            recorder = recorder.with_launcher(launcher);
        }

        let retention = RetentionManager::new(
            config.video_dir.clone(),
            recorder.ledger(),
            parts.space_probe,
            Arc::clone(&clock),
        )
        .with_event_store(store.clone())
        .with_pause_signal(pause_tx)
        .on_segment_closed(recorder.subscribe_closed());

        Ok(Self {
            config,
            store,
            tracker,
            detection,
            recorder,
            retention,
            counters,
            pending: Some(PendingStart {
                detection_rx,
                frame_rx,
            }),
            persistence: None,
            persistence_token: None,
            stopped: false,
        })
    }

    /// Only the output directory and the database are fatal; both were
    /// checked at construction.
    pub async fn start(&mut self) -> Result<()> {
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };
        info!("Dashcam starting; recording to {}", self.config.video_dir.display());

        if let Err(err) = self.tracker.start() {
            warn!("position tracker failed to start: {err:#}");
        }

        let token = CancellationToken::new();
        self.persistence = Some(tokio::spawn(persistence_loop(
            pending.detection_rx,
            self.store.clone(),
            self.tracker.subscribe(),
            ChronoDuration::seconds(self.config.gps.staleness_seconds as i64),
            self.recorder.ledger(),
            Arc::clone(&self.counters),
            token.clone(),
        )));
        self.persistence_token = Some(token);

        if let Err(err) = self.detection.start(pending.frame_rx).await {
            warn!("detection engine failed to start: {err:#}");
        }

        if let Err(err) = self.recorder.start(CameraSpec::from_config(&self.config.capture)) {
            warn!("segment recorder failed to start: {err:#}");
        }

        if let Err(err) = self.retention.start(self.config.retention.clone()).await {
            warn!("retention manager failed to start: {err:#}");
        }

        info!("Dashcam started");
        Ok(())
    }

    /// Stop every component, reverse of start. Every stop runs; failures are
    /// collected and reported together.
    pub async fn shutdown(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        info!("Dashcam shutting down");

        let mut failures: Vec<String> = Vec::new();

        if let Err(err) = self.retention.stop().await {
            failures.push(format!("retention: {err:#}"));
        }
        if let Err(err) = self.detection.stop().await {
            failures.push(format!("detection: {err:#}"));
        }
        if let Some(token) = self.persistence_token.take() {
            token.cancel();
        }
        if let Some(handle) = self.persistence.take() {
            if let Err(err) = handle.await {
                failures.push(format!("persistence: {err}"));
            }
        }
        if let Err(err) = blocking_stop(|| self.recorder.stop()) {
            failures.push(format!("recorder: {err:#}"));
        }
        if let Err(err) = blocking_stop(|| self.tracker.stop()) {
            failures.push(format!("position tracker: {err:#}"));
        }

        if failures.is_empty() {
            info!("Dashcam stopped");
            Ok(())
        } else {
            for failure in &failures {
                error!("shutdown: {failure}");
            }
            Err(anyhow!("shutdown finished with errors: {}", failures.join("; ")))
        }
    }

    /// Start, wait for SIGINT or SIGTERM, then shut down.
    pub async fn run_until_signal(&mut self) -> Result<()> {
        self.start().await?;
        wait_for_signal().await;
        self.shutdown().await
    }

    pub fn status(&self) -> SystemStatus {
        SystemStatus {
            tracker: self.tracker.status(),
            recorder: self.recorder.status(),
            detection: self.detection.status(),
            persistence: self.counters.snapshot(),
            free_space_percent: self.retention.free_space_percent(),
        }
    }

    pub fn event_store(&self) -> &EventStore {
        &self.store
    }

    /// Manual retention trigger, optionally with a stricter free-space target.
    pub async fn run_retention(&self, target_override: Option<f64>) -> Result<CleanupReport> {
        self.retention.run_cleanup_cycle(target_override).await
    }
}

/// Thread joins during shutdown. On a multi-thread runtime the worker hands
/// its other tasks off first, so they keep running while the join waits.
fn blocking_stop<T>(stop: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(stop)
        }
        _ => stop(),
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
                _ = terminate.recv() => info!("SIGTERM received"),
            }
        }
        Err(err) => {
            warn!("SIGTERM handler unavailable: {err}");
            let _ = tokio::signal::ctrl_c().await;
            info!("SIGINT received");
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Interrupt received");
}

async fn persistence_loop(
    mut detection_rx: mpsc::Receiver<DetectionResult>,
    store: EventStore,
    fix_rx: watch::Receiver<Option<PositionFix>>,
    fix_max_age: ChronoDuration,
    ledger: SharedLedger,
    counters: Arc<PersistenceCounters>,
    cancel_token: CancellationToken,
) {
    loop {
        let detection = tokio::select! {
            _ = cancel_token.cancelled() => break,
            received = detection_rx.recv() => match received {
                Some(detection) => detection,
                None => return,
            },
        };
        persist(&store, &fix_rx, fix_max_age, &ledger, &counters, detection).await;
    }

    // Detection has already stopped; record what is still queued.
    detection_rx.close();
    while let Ok(detection) = detection_rx.try_recv() {
        persist(&store, &fix_rx, fix_max_age, &ledger, &counters, detection).await;
    }
}

async fn persist(
    store: &EventStore,
    fix_rx: &watch::Receiver<Option<PositionFix>>,
    fix_max_age: ChronoDuration,
    ledger: &SharedLedger,
    counters: &PersistenceCounters,
    detection: DetectionResult,
) {
    let fix = *fix_rx.borrow();
    let event = build_event(
        &detection,
        fix,
        fix_max_age,
        &segment_covering(ledger, detection.captured_at),
    );

    match store.record(&event).await {
        Ok(RecordOutcome::Inserted) => {
            counters.recorded.fetch_add(1, Ordering::Relaxed);
            info!(
                "Detection recorded: {} in {}",
                detection.summary(),
                event.segment_filename
            );
        }
        Ok(RecordOutcome::DuplicateIgnored) => {
            counters.duplicates.fetch_add(1, Ordering::Relaxed);
        }
        Err(err) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!("failed to record detection: {err:#}");
        }
    }
}

/// Geotag with the latest published fix and tag with the segment filename.
/// A fix more than `fix_max_age` older than the detection is not used.
pub fn build_event(
    detection: &DetectionResult,
    fix: Option<PositionFix>,
    fix_max_age: ChronoDuration,
    segment_filename: &str,
) -> VehicleEvent {
    let mut event = VehicleEvent::new(detection.captured_at, segment_filename, detection.confidence);
    match fix {
        Some(fix) if detection.captured_at - fix.captured_at <= fix_max_age => {
            event = event.with_position(fix.latitude, fix.longitude);
        }
        Some(fix) => debug!("fix from {} too old to geotag detection", fix.captured_at),
        None => {}
    }
    if let Some(plate) = &detection.plate_text {
        event = event.with_plate(plate.clone());
    }
    if let Some(description) = &detection.description {
        event = event.with_description(description.clone());
    }
    event
}

/// The segment recording at `at`: the open one if it had started, otherwise
/// the closed one spanning `at`. Empty when none did.
fn segment_covering(ledger: &SharedLedger, at: DateTime<Utc>) -> String {
    let ledger = ledger.lock();
    if let Some(open) = ledger.open_segment().filter(|open| open.started_at <= at) {
        return open.filename.clone();
    }
    ledger
        .closed()
        .iter()
        .rev()
        .find(|segment| {
            segment.started_at <= at && segment.ended_at.is_some_and(|ended| at <= ended)
        })
        .map(|segment| segment.filename.clone())
        .unwrap_or_else(|| {
            debug!("no segment covers detection at {at}");
            String::new()
        })
}
