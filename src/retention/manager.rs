use std::{
    io::ErrorKind,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::{
    sync::{
        broadcast::{self, error::RecvError},
        watch,
    },
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{LowSpacePolicy, RetentionPolicy},
    db::EventStore,
    error::FaultKind,
    recorder::{Segment, SharedLedger},
    utils::{format_bytes, Clock},
};

use super::disk::SpaceProbe;

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    /// File names removed, oldest first.
    pub deleted: Vec<String>,
    pub freed_bytes: u64,
    /// Of `deleted`, those removed for exceeding the retention age.
    pub expired: usize,
    pub pruned_events: u64,
    pub free_percent_before: Option<f64>,
    pub free_percent_after: Option<f64>,
    pub target_percent: f64,
    /// Free space still below target once nothing was left to delete.
    pub shortfall: bool,
}

struct RetentionShared {
    video_dir: PathBuf,
    ledger: SharedLedger,
    store: Option<EventStore>,
    probe: Arc<dyn SpaceProbe>,
    clock: Arc<dyn Clock>,
    policy: Mutex<RetentionPolicy>,
    pause_tx: Option<watch::Sender<bool>>,
    // Timer, notifications and manual triggers never overlap.
    cycle_lock: tokio::sync::Mutex<()>,
}

/// Keeps the video directory within its age and free-space budget. Only
/// closed segments from the recorder's ledger are ever deleted.
pub struct RetentionManager {
    shared: Arc<RetentionShared>,
    closed_rx: Option<broadcast::Receiver<Segment>>,
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
}

impl RetentionManager {
    pub fn new(
        video_dir: PathBuf,
        ledger: SharedLedger,
        probe: Arc<dyn SpaceProbe>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            shared: Arc::new(RetentionShared {
                video_dir,
                ledger,
                store: None,
                probe,
                clock,
                policy: Mutex::new(RetentionPolicy::default()),
                pause_tx: None,
                cycle_lock: tokio::sync::Mutex::new(()),
            }),
            closed_rx: None,
            handle: None,
            cancel_token: None,
        }
    }

    /// Event rows older than the retention age are pruned after each cycle.
    pub fn with_event_store(mut self, store: EventStore) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.store = Some(store);
        }
        self
    }

    /// Receives `true` while recording should pause for lack of space.
    pub fn with_pause_signal(mut self, pause_tx: watch::Sender<bool>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.pause_tx = Some(pause_tx);
        }
        self
    }

    /// Run a cycle whenever a segment closes, in addition to the timer.
    pub fn on_segment_closed(mut self, closed_rx: broadcast::Receiver<Segment>) -> Self {
        self.closed_rx = Some(closed_rx);
        self
    }

    pub async fn start(&mut self, policy: RetentionPolicy) -> Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }

        info!(
            "Retention: keep {}% free, {} days, check every {}s, {:?}",
            policy.min_free_percent,
            policy.retention_days,
            policy.check_interval_seconds,
            policy.low_space_policy
        );
        *lock_policy(&self.shared) = policy;

        let cancel_token = CancellationToken::new();
        let token_clone = cancel_token.clone();
        let shared = Arc::clone(&self.shared);
        let closed_rx = self.closed_rx.as_ref().map(|rx| rx.resubscribe());

        let handle = tokio::spawn(retention_loop(shared, closed_rx, token_clone));
        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }

        if let Some(handle) = self.handle.take() {
            handle
                .await
                .context("retention loop task failed to join")?;
            info!("Retention manager stopped");
        }
        Ok(())
    }

    /// One cleanup pass. `target_override` replaces the policy's minimum
    /// free percentage for this cycle only.
    pub async fn run_cleanup_cycle(&self, target_override: Option<f64>) -> Result<CleanupReport> {
        run_cycle(&self.shared, target_override).await
    }

    pub fn free_space_percent(&self) -> Option<f64> {
        free_percent(&self.shared)
    }

    pub fn policy(&self) -> RetentionPolicy {
        lock_policy(&self.shared).clone()
    }
}

fn lock_policy(shared: &RetentionShared) -> std::sync::MutexGuard<'_, RetentionPolicy> {
    match shared.policy.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn free_percent(shared: &RetentionShared) -> Option<f64> {
    match shared.probe.usage(&shared.video_dir) {
        Ok(usage) => Some(usage.free_percent()),
        Err(err) => {
            debug!("free space probe failed: {err:#}");
            None
        }
    }
}

async fn retention_loop(
    shared: Arc<RetentionShared>,
    mut closed_rx: Option<broadcast::Receiver<Segment>>,
    cancel_token: CancellationToken,
) {
    let interval = Duration::from_secs(lock_policy(&shared).check_interval_seconds.max(1));
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let notified = tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = ticker.tick() => None,
            closed = next_closed(&mut closed_rx) => Some(closed),
        };

        match notified {
            Some(Ok(segment)) => debug!("segment {} closed; running retention", segment.filename),
            Some(Err(RecvError::Lagged(skipped))) => debug!("missed {skipped} segment notifications"),
            Some(Err(RecvError::Closed)) => {
                closed_rx = None;
                continue;
            }
            None => {}
        }

        if let Err(err) = run_cycle(&shared, None).await {
            warn!("retention cycle failed: {err:#}");
        }
    }
}

async fn next_closed(rx: &mut Option<broadcast::Receiver<Segment>>) -> Result<Segment, RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn run_cycle(shared: &RetentionShared, target_override: Option<f64>) -> Result<CleanupReport> {
    let _guard = shared.cycle_lock.lock().await;
    let policy = lock_policy(shared).clone();
    let target = target_override
        .unwrap_or(policy.min_free_percent)
        .clamp(0.0, 100.0);
    let now = shared.clock.now();

    let mut report = CleanupReport {
        target_percent: target,
        free_percent_before: free_percent(shared),
        ..CleanupReport::default()
    };

    // Age pass. Zero days means no age limit.
    let cutoff = (policy.retention_days > 0)
        .then(|| now - ChronoDuration::days(policy.retention_days as i64));
    if let Some(cutoff) = cutoff {
        let expired: Vec<Segment> = shared
            .ledger
            .closed()
            .into_iter()
            .filter(|segment| segment.started_at < cutoff)
            .collect();
        for segment in expired {
            if delete_segment(shared, &segment, &mut report).await {
                report.expired += 1;
            }
        }
    }

    // Space pass, oldest first.
    let mut free = free_percent(shared);
    if free.is_some_and(|free| free < target) {
        for segment in shared.ledger.closed() {
            if free.map_or(true, |free| free >= target) {
                break;
            }
            delete_segment(shared, &segment, &mut report).await;
            free = free_percent(shared);
        }
    }
    report.free_percent_after = free;

    match free {
        Some(free) if free < target => {
            report.shortfall = true;
            warn!(
                "{}",
                FaultKind::ResourceExhausted {
                    free_percent: free,
                    target_percent: target,
                }
            );
            if policy.low_space_policy == LowSpacePolicy::PauseRecording {
                set_paused(shared, true);
            }
        }
        Some(_) => set_paused(shared, false),
        None => {}
    }

    if let (Some(store), Some(cutoff)) = (&shared.store, cutoff) {
        match store.prune_before(cutoff).await {
            Ok(pruned) => report.pruned_events = pruned,
            Err(err) => warn!("event pruning failed: {err:#}"),
        }
    }

    if !report.deleted.is_empty() || report.pruned_events > 0 {
        info!(
            "Retention removed {} segments ({}) and {} events; free space {}",
            report.deleted.len(),
            format_bytes(report.freed_bytes),
            report.pruned_events,
            report
                .free_percent_after
                .map_or_else(|| "unknown".to_string(), |free| format!("{free:.1}%"))
        );
    }
    Ok(report)
}

/// Remove one closed segment's file and forget it. A file already gone still
/// leaves the ledger.
async fn delete_segment(shared: &RetentionShared, segment: &Segment, report: &mut CleanupReport) -> bool {
    if shared
        .ledger
        .current()
        .is_some_and(|open| open.filename == segment.filename)
    {
        return false;
    }

    let size = tokio::fs::metadata(&segment.path)
        .await
        .map(|meta| meta.len())
        .unwrap_or(0);

    match tokio::fs::remove_file(&segment.path).await {
        Ok(()) => {
            debug!("deleted segment {} ({})", segment.filename, format_bytes(size));
            report.freed_bytes += size;
        }
        Err(err) if err.kind() == ErrorKind::NotFound => {
            debug!("segment {} already removed", segment.filename);
        }
        Err(err) => {
            warn!("failed to delete segment {}: {err}", segment.filename);
            return false;
        }
    }

    shared.ledger.remove_closed(&segment.filename);
    report.deleted.push(segment.filename.clone());
    true
}

fn set_paused(shared: &RetentionShared, paused: bool) {
    let Some(pause_tx) = &shared.pause_tx else {
        return;
    };
    let previous = pause_tx.send_replace(paused);
    if previous != paused {
        if paused {
            warn!("Pausing recording until free space recovers");
        } else {
            info!("Free space recovered; recording may resume");
        }
    }
}
