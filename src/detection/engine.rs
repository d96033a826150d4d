use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use image_hasher::ImageHash;
use log::{debug, info};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    config::DetectionConfig,
    error::FaultKind,
    frame::{Frame, FrameReceiver},
    utils::Clock,
};

use super::{
    backend::InferenceBackend,
    dedup::{identity_key, Deduper},
    gate::{compute_frame_hash, StaticFrameGate},
    result::{DetectionListener, DetectionResult, RawCandidate},
};

// Set to false to silence per-sample logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DetectionState {
    Idle,
    Running,
    /// No usable backend; the engine never emits.
    Degraded,
}

#[derive(Debug, Default)]
struct DetectionCounters {
    frames_sampled: AtomicU64,
    static_frames_skipped: AtomicU64,
    below_threshold: AtomicU64,
    duplicates_coalesced: AtomicU64,
    detections_emitted: AtomicU64,
    corrupt_payloads: AtomicU64,
    backend_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DetectionStats {
    pub frames_sampled: u64,
    pub static_frames_skipped: u64,
    pub below_threshold: u64,
    pub duplicates_coalesced: u64,
    pub detections_emitted: u64,
    pub corrupt_payloads: u64,
    pub backend_failures: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionStatus {
    pub state: DetectionState,
    pub backend: Option<String>,
    pub stats: DetectionStats,
}

/// Outcome of filtering one sample's candidates.
#[derive(Debug, Default, PartialEq)]
pub struct FilterOutcome {
    pub emitted: Vec<DetectionResult>,
    pub below_threshold: u64,
    pub coalesced: u64,
}

/// Per-sample state: which frame was last inferred, the static-frame gate,
/// the confidence threshold and the dedup window.
pub struct DetectionPipeline {
    confidence_threshold: f64,
    deduper: Deduper,
    gate: Option<StaticFrameGate>,
    last_sequence: Option<u64>,
}

impl DetectionPipeline {
    pub fn new(config: &DetectionConfig) -> Self {
        let gate = config.skip_static_frames.then(|| {
            StaticFrameGate::new(
                config.static_frame_distance,
                chrono::Duration::seconds(config.static_frame_cooldown_seconds as i64),
            )
        });
        Self {
            confidence_threshold: config.confidence_threshold,
            deduper: Deduper::new(chrono::Duration::seconds(config.dedup_window_seconds as i64)),
            gate,
            last_sequence: None,
        }
    }

    /// False when this frame was already inferred.
    pub fn is_new_frame(&self, sequence: u64) -> bool {
        self.last_sequence != Some(sequence)
    }

    pub fn gates_static_frames(&self) -> bool {
        self.gate.is_some()
    }

    pub fn admit_hash(&self, hash: &ImageHash, now: DateTime<Utc>) -> bool {
        self.gate
            .as_ref()
            .map(|gate| gate.admit(hash, now))
            .unwrap_or(true)
    }

    pub fn mark_inferred(&mut self, sequence: u64, hash: Option<ImageHash>, now: DateTime<Utc>) {
        self.last_sequence = Some(sequence);
        if let (Some(gate), Some(hash)) = (self.gate.as_mut(), hash) {
            gate.mark_inferred(hash, now);
        }
    }

    pub fn filter(&mut self, candidates: Vec<RawCandidate>, captured_at: DateTime<Utc>) -> FilterOutcome {
        let mut outcome = FilterOutcome::default();
        for candidate in candidates {
            if candidate.confidence < self.confidence_threshold {
                outcome.below_threshold += 1;
                continue;
            }

            let description = candidate.description();
            let Some(key) = identity_key(candidate.plate_text.as_deref(), description.as_deref())
            else {
                // Nothing to identify or record.
                continue;
            };

            if !self.deduper.admit(&key, captured_at) {
                outcome.coalesced += 1;
                continue;
            }

            outcome.emitted.push(DetectionResult {
                captured_at,
                plate_text: candidate.plate_text,
                description,
                confidence: candidate.confidence,
            });
        }
        outcome
    }
}

struct EngineShared {
    counters: DetectionCounters,
    state_tx: watch::Sender<DetectionState>,
    latest_tx: watch::Sender<Option<DetectionResult>>,
}

pub struct DetectionEngine<B: InferenceBackend> {
    config: DetectionConfig,
    backend: Option<Arc<B>>,
    clock: Arc<dyn Clock>,
    listeners: Vec<Arc<dyn DetectionListener>>,
    shared: Arc<EngineShared>,
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
}

impl<B: InferenceBackend> DetectionEngine<B> {
    /// A `None` backend leaves the engine in degraded no-op mode.
    pub fn new(config: DetectionConfig, backend: Option<B>, clock: Arc<dyn Clock>) -> Self {
        let (state_tx, _) = watch::channel(DetectionState::Idle);
        let (latest_tx, _) = watch::channel(None);
        Self {
            config,
            backend: backend.map(Arc::new),
            clock,
            listeners: Vec::new(),
            shared: Arc::new(EngineShared {
                counters: DetectionCounters::default(),
                state_tx,
                latest_tx,
            }),
            handle: None,
            cancel_token: None,
        }
    }

    pub fn on_detection(mut self, listener: Arc<dyn DetectionListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Most recent emitted detection, for the overlay.
    pub fn subscribe_latest(&self) -> watch::Receiver<Option<DetectionResult>> {
        self.shared.latest_tx.subscribe()
    }

    pub async fn start(&mut self, frames: FrameReceiver) -> Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }

        let Some(backend) = self.backend.clone() else {
            if *self.shared.state_tx.borrow() != DetectionState::Degraded {
                log_warn!(
                    "{}; detection disabled",
                    FaultKind::DeviceUnavailable("no inference backend".into())
                );
            }
            self.shared.state_tx.send_replace(DetectionState::Degraded);
            return Ok(());
        };

        info!(
            "Detection engine sampling at {:.1} fps via {}",
            self.config.inference_fps,
            backend.name()
        );

        let cancel_token = CancellationToken::new();
        let token_clone = cancel_token.clone();
        let listeners: Arc<[Arc<dyn DetectionListener>]> = self.listeners.clone().into();

        self.shared.state_tx.send_replace(DetectionState::Running);
        let handle = tokio::spawn(detection_loop(
            backend,
            self.config.clone(),
            Arc::clone(&self.clock),
            listeners,
            Arc::clone(&self.shared),
            frames,
            token_clone,
        ));

        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }

        let joined = match self.handle.take() {
            Some(handle) => handle.await.context("detection loop task failed to join"),
            None => Ok(()),
        };

        if *self.shared.state_tx.borrow() == DetectionState::Running {
            self.shared.state_tx.send_replace(DetectionState::Idle);
        }
        joined
    }

    pub fn state(&self) -> DetectionState {
        *self.shared.state_tx.borrow()
    }

    pub fn stats(&self) -> DetectionStats {
        let counters = &self.shared.counters;
        DetectionStats {
            frames_sampled: counters.frames_sampled.load(Ordering::Relaxed),
            static_frames_skipped: counters.static_frames_skipped.load(Ordering::Relaxed),
            below_threshold: counters.below_threshold.load(Ordering::Relaxed),
            duplicates_coalesced: counters.duplicates_coalesced.load(Ordering::Relaxed),
            detections_emitted: counters.detections_emitted.load(Ordering::Relaxed),
            corrupt_payloads: counters.corrupt_payloads.load(Ordering::Relaxed),
            backend_failures: counters.backend_failures.load(Ordering::Relaxed),
        }
    }

    pub fn status(&self) -> DetectionStatus {
        DetectionStatus {
            state: self.state(),
            backend: self.backend.as_ref().map(|backend| backend.name().to_string()),
            stats: self.stats(),
        }
    }
}

async fn detection_loop<B: InferenceBackend>(
    backend: Arc<B>,
    config: DetectionConfig,
    clock: Arc<dyn Clock>,
    listeners: Arc<[Arc<dyn DetectionListener>]>,
    shared: Arc<EngineShared>,
    frames: FrameReceiver,
    cancel_token: CancellationToken,
) {
    let period = Duration::from_secs_f64(1.0 / config.inference_fps);
    let mut ticker = tokio::time::interval(period);
    // A slow inference must not cause a burst of catch-up samples.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut pipeline = DetectionPipeline::new(&config);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let latest = frames.borrow().clone();
                let Some(frame) = latest else {
                    continue;
                };
                sample_frame(&*backend, &mut pipeline, frame, &*clock, &shared, &listeners).await;
            }
            _ = cancel_token.cancelled() => {
                log_info!("detection loop shutting down");
                break;
            }
        }
    }
}

async fn sample_frame<B: InferenceBackend>(
    backend: &B,
    pipeline: &mut DetectionPipeline,
    frame: Arc<Frame>,
    clock: &dyn Clock,
    shared: &EngineShared,
    listeners: &[Arc<dyn DetectionListener>],
) {
    let counters = &shared.counters;
    if !pipeline.is_new_frame(frame.sequence) {
        return;
    }

    let now = clock.now();
    let hash = if pipeline.gates_static_frames() {
        let for_hash = Arc::clone(&frame);
        match tokio::task::spawn_blocking(move || compute_frame_hash(&for_hash)).await {
            Ok(hash) => Some(hash),
            Err(err) => {
                debug!("frame hash worker failed: {err}");
                None
            }
        }
    } else {
        None
    };

    if let Some(hash) = &hash {
        if !pipeline.admit_hash(hash, now) {
            counters.static_frames_skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }
    }

    counters.frames_sampled.fetch_add(1, Ordering::Relaxed);
    let candidates = match backend.infer(Arc::clone(&frame)).await {
        Ok(candidates) => candidates,
        Err(err) => {
            match err.downcast_ref::<FaultKind>() {
                Some(fault) if fault.is_corrupt_input() => {
                    counters.corrupt_payloads.fetch_add(1, Ordering::Relaxed);
                    debug!("discarded detection payload: {fault}");
                }
                _ => {
                    counters.backend_failures.fetch_add(1, Ordering::Relaxed);
                    log_warn!("inference failed on frame {}: {err:#}", frame.sequence);
                }
            }
            // The frame still counts as seen; a broken backend is not retried per tick.
            pipeline.mark_inferred(frame.sequence, hash, now);
            return;
        }
    };
    pipeline.mark_inferred(frame.sequence, hash, now);

    let outcome = pipeline.filter(candidates, frame.captured_at);
    counters
        .below_threshold
        .fetch_add(outcome.below_threshold, Ordering::Relaxed);
    counters
        .duplicates_coalesced
        .fetch_add(outcome.coalesced, Ordering::Relaxed);

    for detection in outcome.emitted {
        counters.detections_emitted.fetch_add(1, Ordering::Relaxed);
        log_info!("detection: {}", detection.summary());
        for listener in listeners {
            listener.on_detection(&detection);
        }
        shared.latest_tx.send_replace(Some(detection));
    }
}
