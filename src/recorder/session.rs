use std::{
    collections::VecDeque,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration as StdDuration,
};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch};

use crate::{config::CaptureConfig, error::FaultKind, log_error, log_info, log_warn};

use super::{
    encoder::{EncoderLauncher, EncoderSink},
    segment::{Segment, SegmentNamer, SharedLedger},
};

const ENABLE_LOGS: bool = true;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RecorderState {
    Idle,
    Capturing,
    Rotating,
    ShuttingDown,
    NoDevice,
    EncoderUnavailable,
    Paused,
}

#[derive(Debug, Default)]
pub(crate) struct RecorderCounters {
    pub frames_captured: AtomicU64,
    pub frames_written: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub read_failures: AtomicU64,
    pub encoder_crashes: AtomicU64,
    pub segments_closed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RecorderStats {
    pub frames_captured: u64,
    pub frames_written: u64,
    pub frames_dropped: u64,
    /// Camera reads that failed or produced nothing within the deadline.
    pub read_failures: u64,
    pub encoder_crashes: u64,
    pub segments_closed: u64,
}

impl RecorderCounters {
    pub fn snapshot(&self) -> RecorderStats {
        RecorderStats {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_written: self.frames_written.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            read_failures: self.read_failures.load(Ordering::Relaxed),
            encoder_crashes: self.encoder_crashes.load(Ordering::Relaxed),
            segments_closed: self.segments_closed.load(Ordering::Relaxed),
        }
    }
}

/// Where segments land and how they are named.
#[derive(Debug, Clone)]
pub struct SegmentOutput {
    pub dir: PathBuf,
    pub namer: SegmentNamer,
}

/// Handles shared between a session and the recorder that owns it.
#[derive(Clone)]
pub(crate) struct SessionHandles {
    pub ledger: SharedLedger,
    pub closed_tx: broadcast::Sender<Segment>,
    pub state_tx: Arc<watch::Sender<RecorderState>>,
    pub counters: Arc<RecorderCounters>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Written,
    /// Not written: encoder unavailable or the write failed twice.
    Dropped,
}

/// Encoder supervision for the capture thread. One encoder per open segment;
/// rotation and crash recovery both go through `close_segment`.
pub struct CaptureSession {
    output: SegmentOutput,
    launcher: Arc<dyn EncoderLauncher>,
    handles: SessionHandles,
    segment_duration: Duration,
    grace: StdDuration,
    max_crashes: usize,
    crash_window: Duration,
    encoder: Option<Box<dyn EncoderSink>>,
    last_written: Option<DateTime<Utc>>,
    crashes: VecDeque<DateTime<Utc>>,
    unavailable_since: Option<DateTime<Utc>>,
}

impl CaptureSession {
    pub(crate) fn new(
        config: &CaptureConfig,
        output: SegmentOutput,
        launcher: Arc<dyn EncoderLauncher>,
        handles: SessionHandles,
    ) -> Self {
        Self {
            output,
            launcher,
            handles,
            segment_duration: Duration::seconds(config.segment_duration_seconds as i64),
            grace: config.encoder_grace(),
            max_crashes: config.max_encoder_crashes as usize,
            crash_window: Duration::seconds(config.encoder_crash_window_seconds as i64),
            encoder: None,
            last_written: None,
            crashes: VecDeque::new(),
            unavailable_since: None,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        self.unavailable_since.is_some()
    }

    pub fn has_open_segment(&self) -> bool {
        self.encoder.is_some()
    }

    /// Write one composed frame. Opens, rotates and restarts segments as
    /// needed; `at` is the frame's capture time.
    pub fn write_frame(&mut self, at: DateTime<Utc>, bytes: &[u8]) -> FrameOutcome {
        if let Some(since) = self.unavailable_since {
            if at - since < self.crash_window {
                return self.dropped();
            }
            log_info!("Retrying encoder after {}s unavailable", (at - since).num_seconds());
            self.unavailable_since = None;
            self.crashes.clear();
        }

        if self.rotation_due(at) {
            self.rotate(at);
        }

        // One restart per frame; a second failure drops the frame.
        for _ in 0..2 {
            if self.encoder.is_none() && !self.open_segment(at) {
                if self.is_unavailable() {
                    break;
                }
                continue;
            }

            if let Some(reason) = self.encoder.as_mut().and_then(|encoder| encoder.exited()) {
                self.crashed(at, format!("encoder exited: {reason}"));
                continue;
            }

            let result = match self.encoder.as_mut() {
                Some(encoder) => encoder.write_frame(bytes),
                None => continue,
            };
            match result {
                Ok(()) => {
                    self.last_written = Some(at);
                    self.handles
                        .counters
                        .frames_written
                        .fetch_add(1, Ordering::Relaxed);
                    return FrameOutcome::Written;
                }
                Err(err) => self.crashed(at, format!("write failed: {err}")),
            }

            if self.is_unavailable() {
                break;
            }
        }

        self.dropped()
    }

    /// Close the open segment without starting a new one (pause, shutdown,
    /// camera loss). The next written frame opens a fresh segment.
    pub fn suspend(&mut self, at: DateTime<Utc>) -> Option<Segment> {
        let encoder = self.encoder.take()?;
        if let Err(err) = encoder.finish(self.grace) {
            log_warn!("encoder did not finish cleanly: {err:#}");
        }
        let ended_at = self.last_written.unwrap_or(at);
        self.close_segment(ended_at)
    }

    fn rotation_due(&self, at: DateTime<Utc>) -> bool {
        self.encoder.is_some()
            && self
                .handles
                .ledger
                .current()
                .is_some_and(|open| at - open.started_at >= self.segment_duration)
    }

    fn rotate(&mut self, at: DateTime<Utc>) {
        self.handles.state_tx.send_replace(RecorderState::Rotating);
        if let Some(encoder) = self.encoder.take() {
            if let Err(err) = encoder.finish(self.grace) {
                log_warn!("encoder did not finish cleanly during rotation: {err:#}");
            }
        }
        self.close_segment(at);
        self.open_segment(at);
    }

    fn open_segment(&mut self, at: DateTime<Utc>) -> bool {
        let (filename, path) = {
            let ledger = self.handles.ledger.lock();
            self.output
                .namer
                .next_available(&self.output.dir, at, |name| ledger.contains(name))
        };

        match self.launcher.launch(&path) {
            Ok(encoder) => {
                self.encoder = Some(encoder);
                self.last_written = None;
                self.handles.ledger.lock().begin(Segment {
                    filename: filename.clone(),
                    path,
                    started_at: at,
                    ended_at: None,
                });
                self.handles.state_tx.send_replace(RecorderState::Capturing);
                log_info!("Recording segment {filename}");
                true
            }
            Err(err) => {
                self.record_crash(at, format!("encoder launch failed: {err:#}"));
                false
            }
        }
    }

    /// The segment ends at the last frame the encoder accepted.
    fn crashed(&mut self, at: DateTime<Utc>, reason: String) {
        // Dropping the sink kills and reaps the process.
        drop(self.encoder.take());
        let ended_at = self.last_written.unwrap_or(at);
        self.close_segment(ended_at);
        self.record_crash(at, reason);
    }

    fn record_crash(&mut self, at: DateTime<Utc>, reason: String) {
        self.handles
            .counters
            .encoder_crashes
            .fetch_add(1, Ordering::Relaxed);
        log_warn!("{}", FaultKind::ProcessCrash(reason));

        self.crashes.push_back(at);
        while self
            .crashes
            .front()
            .is_some_and(|first| at - *first > self.crash_window)
        {
            self.crashes.pop_front();
        }

        if self.crashes.len() > self.max_crashes {
            log_error!(
                "{}",
                FaultKind::DeviceUnavailable(format!(
                    "encoder crashed {} times within {}s",
                    self.crashes.len(),
                    self.crash_window.num_seconds()
                ))
            );
            self.unavailable_since = Some(at);
            self.handles
                .state_tx
                .send_replace(RecorderState::EncoderUnavailable);
        }
    }

    fn close_segment(&mut self, ended_at: DateTime<Utc>) -> Option<Segment> {
        let closed = self.handles.ledger.lock().close_open(ended_at)?;
        self.handles
            .counters
            .segments_closed
            .fetch_add(1, Ordering::Relaxed);
        log_info!("Closed segment {}", closed.filename);
        // No subscribers is fine.
        let _ = self.handles.closed_tx.send(closed.clone());
        Some(closed)
    }

    fn dropped(&self) -> FrameOutcome {
        self.handles
            .counters
            .frames_dropped
            .fetch_add(1, Ordering::Relaxed);
        FrameOutcome::Dropped
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        let opened_at = self.handles.ledger.current().map(|open| open.started_at);
        if let Some(at) = self.last_written.or(opened_at) {
            self.suspend(at);
        }
    }
}
