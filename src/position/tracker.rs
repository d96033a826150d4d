use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use rand::Rng;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
    config::GpsConfig,
    error::FaultKind,
    utils::{exponential_backoff, sleep_cancellable, Clock},
};

use super::{
    fix::{FixListener, FixQuality, PositionFix},
    nmea::{parse_sentence, Sentence},
    serial::{PortOpener, SentenceSource},
    smoothing::FixSmoother,
};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TrackerState {
    Idle,
    Probing,
    Tracking,
    NoDevice,
}

#[derive(Debug, Default)]
struct TrackerCounters {
    sentences_accepted: AtomicU64,
    sentences_discarded: AtomicU64,
    fixes_published: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TrackerStats {
    pub sentences_accepted: u64,
    pub sentences_discarded: u64,
    pub fixes_published: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerStatus {
    pub state: TrackerState,
    pub port: Option<String>,
    pub latest_fix: Option<PositionFix>,
    pub stats: TrackerStats,
}

/// What happened to one line of input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Ingest {
    /// Malformed or checksum-failing; counted, never propagated.
    Discarded,
    /// Valid sentence of a kind the tracker does not use.
    Ignored,
    /// Valid GGA/RMC. Carries the new smoothed fix if the window changed.
    Accepted(Option<PositionFix>),
    /// Valid sentence reporting no fix (GGA quality 0 or RMC `V`). The
    /// window is cleared.
    FixLost,
}

/// Turns raw sentences into smoothed fixes. Pure state machine; the tracker
/// thread owns one.
pub struct SentenceProcessor {
    smoother: FixSmoother,
    last_quality: FixQuality,
    last_satellites: u32,
    last_gga_time: Option<String>,
}

impl SentenceProcessor {
    pub fn new(config: &GpsConfig) -> Self {
        Self {
            smoother: FixSmoother::new(
                config.window_size,
                chrono::Duration::seconds(config.staleness_seconds as i64),
                config.min_satellites,
            ),
            last_quality: FixQuality::NoFix,
            last_satellites: 0,
            last_gga_time: None,
        }
    }

    pub fn ingest(&mut self, line: &str, at: DateTime<Utc>) -> Ingest {
        let sentence = match parse_sentence(line) {
            Ok(sentence) => sentence,
            Err(err) => {
                debug!("{}", FaultKind::CorruptInput(format!("{err}: {line}")));
                return Ingest::Discarded;
            }
        };

        match sentence {
            Sentence::Other(_) => Ingest::Ignored,
            Sentence::Gga(gga) => {
                if self.smoother.note_sentence(at) {
                    debug!("position gap exceeded staleness threshold; smoothing window cleared");
                }
                self.last_quality = gga.quality;
                self.last_satellites = gga.satellites;
                self.last_gga_time = Some(gga.utc_time);

                if gga.quality == FixQuality::NoFix || gga.position.is_none() {
                    self.smoother.clear();
                    return Ingest::FixLost;
                }

                let smoothed = gga.position.and_then(|(latitude, longitude)| {
                    self.smoother.push(PositionFix {
                        latitude,
                        longitude,
                        fix_quality: gga.quality,
                        satellite_count: gga.satellites,
                        captured_at: at,
                    })
                });
                Ingest::Accepted(smoothed)
            }
            Sentence::Rmc(rmc) => {
                if self.smoother.note_sentence(at) {
                    debug!("position gap exceeded staleness threshold; smoothing window cleared");
                }
                if !rmc.active {
                    self.last_quality = FixQuality::NoFix;
                    self.smoother.clear();
                    return Ingest::FixLost;
                }
                // The GGA of the same epoch already contributed this position.
                if self.last_gga_time.as_deref() == Some(rmc.utc_time.as_str()) {
                    return Ingest::Accepted(None);
                }

                let smoothed = rmc.position.and_then(|(latitude, longitude)| {
                    self.smoother.push(PositionFix {
                        latitude,
                        longitude,
                        fix_quality: self.last_quality,
                        satellite_count: self.last_satellites,
                        captured_at: at,
                    })
                });
                Ingest::Accepted(smoothed)
            }
        }
    }

    /// Discards the smoothed fix once sentences stop arriving.
    pub fn expire(&mut self, now: DateTime<Utc>) -> bool {
        self.smoother.expire(now)
    }

    pub fn current(&self) -> Option<PositionFix> {
        self.smoother.current()
    }
}

struct TrackerShared {
    config: GpsConfig,
    opener: Arc<dyn PortOpener>,
    clock: Arc<dyn Clock>,
    listeners: Vec<Arc<dyn FixListener>>,
    fix_tx: watch::Sender<Option<PositionFix>>,
    state_tx: watch::Sender<TrackerState>,
    port_tx: watch::Sender<Option<String>>,
    counters: TrackerCounters,
}

pub struct PositionTracker {
    shared: Arc<TrackerShared>,
    worker: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
}

impl PositionTracker {
    pub fn new(config: GpsConfig, opener: Arc<dyn PortOpener>, clock: Arc<dyn Clock>) -> Self {
        let (fix_tx, _) = watch::channel(None);
        let (state_tx, _) = watch::channel(TrackerState::Idle);
        let (port_tx, _) = watch::channel(None);
        Self {
            shared: Arc::new(TrackerShared {
                config,
                opener,
                clock,
                listeners: Vec::new(),
                fix_tx,
                state_tx,
                port_tx,
                counters: TrackerCounters::default(),
            }),
            worker: None,
            cancel_token: None,
        }
    }

    /// Register a listener. Listeners are fixed once the tracker starts.
    pub fn on_fix(mut self, listener: Arc<dyn FixListener>) -> Self {
        match Arc::get_mut(&mut self.shared) {
            Some(shared) => shared.listeners.push(listener),
            None => warn!("fix listener registered after the tracker started; ignored"),
        }
        self
    }

    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }

        let cancel_token = CancellationToken::new();
        let token_clone = cancel_token.clone();
        let shared = Arc::clone(&self.shared);

        let worker = thread::Builder::new()
            .name("dashcam-gps".into())
            .spawn(move || tracker_loop(shared, token_clone))
            .context("failed to spawn position tracker thread")?;

        self.worker = Some(worker);
        self.cancel_token = Some(cancel_token);
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }

        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                error!("position tracker thread panicked");
            }
            info!("Position tracker stopped");
        }
        Ok(())
    }

    pub fn latest_fix(&self) -> Option<PositionFix> {
        *self.shared.fix_tx.borrow()
    }

    /// Latest-value slot for readers on other loops.
    pub fn subscribe(&self) -> watch::Receiver<Option<PositionFix>> {
        self.shared.fix_tx.subscribe()
    }

    pub fn state(&self) -> TrackerState {
        *self.shared.state_tx.borrow()
    }

    pub fn stats(&self) -> TrackerStats {
        let counters = &self.shared.counters;
        TrackerStats {
            sentences_accepted: counters.sentences_accepted.load(Ordering::Relaxed),
            sentences_discarded: counters.sentences_discarded.load(Ordering::Relaxed),
            fixes_published: counters.fixes_published.load(Ordering::Relaxed),
        }
    }

    pub fn status(&self) -> TrackerStatus {
        TrackerStatus {
            state: self.state(),
            port: self.shared.port_tx.borrow().clone(),
            latest_fix: self.latest_fix(),
            stats: self.stats(),
        }
    }
}

impl Drop for PositionTracker {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn tracker_loop(shared: Arc<TrackerShared>, cancel_token: CancellationToken) {
    let config = &shared.config;
    let read_timeout = Duration::from_millis(config.read_timeout_ms);

    shared.state_tx.send_replace(TrackerState::Probing);
    let Some((port_name, mut source, first_line)) = probe_ports(&shared, &cancel_token) else {
        if !cancel_token.is_cancelled() {
            warn!(
                "{}",
                FaultKind::DeviceUnavailable(format!(
                    "no position device answered on {:?}",
                    config.ports
                ))
            );
            clear_fix(&shared, "no position device");
            shared.state_tx.send_replace(TrackerState::NoDevice);
        } else {
            shared.state_tx.send_replace(TrackerState::Idle);
        }
        return;
    };

    info!("Position device adopted on {port_name} at {} baud", config.baud_rate);
    shared.port_tx.send_replace(Some(port_name.clone()));
    shared.state_tx.send_replace(TrackerState::Tracking);

    let mut processor = SentenceProcessor::new(config);
    handle_line(&shared, &mut processor, &first_line);

    let mut failures: u32 = 0;
    while !cancel_token.is_cancelled() {
        match source.read_line() {
            Ok(Some(line)) => {
                failures = 0;
                handle_line(&shared, &mut processor, &line);
            }
            Ok(None) => {
                if processor.expire(shared.clock.now()) {
                    clear_fix(&shared, "no sentences within the staleness threshold");
                }
            }
            Err(err) => {
                failures += 1;
                warn!(
                    "{} (failure {failures}/{})",
                    FaultKind::TransientIo(format!("position read on {port_name}: {err}")),
                    config.max_consecutive_failures
                );

                match reconnect(&shared, &port_name, read_timeout, &mut failures, &cancel_token) {
                    Some(reopened) => source = reopened,
                    None => break,
                }
            }
        }
    }

    if cancel_token.is_cancelled() {
        shared.state_tx.send_replace(TrackerState::Idle);
    } else {
        warn!(
            "{}",
            FaultKind::DeviceUnavailable(format!(
                "position device {port_name} failed {} consecutive times",
                config.max_consecutive_failures
            ))
        );
        shared.port_tx.send_replace(None);
        clear_fix(&shared, "position device lost");
        shared.state_tx.send_replace(TrackerState::NoDevice);
    }
}

/// Empty the published slot so readers never geotag with a fix the tracker
/// no longer holds.
fn clear_fix(shared: &TrackerShared, reason: &str) {
    if shared.fix_tx.send_if_modified(|slot| slot.take().is_some()) {
        info!("Position fix withdrawn: {reason}");
    }
}

/// First port to produce a syntactically valid sentence within the probe
/// timeout wins. Returns the port name, the open source and that sentence.
fn probe_ports(
    shared: &TrackerShared,
    cancel_token: &CancellationToken,
) -> Option<(String, Box<dyn SentenceSource>, String)> {
    let config = &shared.config;
    let read_timeout = Duration::from_millis(config.read_timeout_ms);
    let probe_timeout = Duration::from_millis(config.probe_timeout_ms);

    for port in &config.ports {
        if cancel_token.is_cancelled() {
            return None;
        }

        let mut source = match shared.opener.open(port, config.baud_rate, read_timeout) {
            Ok(source) => source,
            Err(err) => {
                debug!("position port {port} unavailable: {err}");
                continue;
            }
        };

        let deadline = Instant::now() + probe_timeout;
        while Instant::now() < deadline && !cancel_token.is_cancelled() {
            match source.read_line() {
                Ok(Some(line)) => {
                    if parse_sentence(&line).is_ok() {
                        return Some((port.clone(), source, line));
                    }
                    shared
                        .counters
                        .sentences_discarded
                        .fetch_add(1, Ordering::Relaxed);
                }
                Ok(None) => {}
                Err(err) => {
                    debug!("position port {port} failed during probe: {err}");
                    break;
                }
            }
        }
        debug!("position port {port} produced no valid sentence; closing");
    }

    None
}

/// Reopen the adopted port with exponential backoff. `None` once the failure
/// budget is spent or shutdown was requested.
fn reconnect(
    shared: &TrackerShared,
    port_name: &str,
    read_timeout: Duration,
    failures: &mut u32,
    cancel_token: &CancellationToken,
) -> Option<Box<dyn SentenceSource>> {
    let config = &shared.config;
    loop {
        if *failures >= config.max_consecutive_failures {
            return None;
        }
        if !sleep_cancellable(backoff_delay(config, *failures), cancel_token) {
            return None;
        }

        match shared.opener.open(port_name, config.baud_rate, read_timeout) {
            Ok(source) => {
                info!("Position device {port_name} reopened");
                return Some(source);
            }
            Err(err) => {
                *failures += 1;
                warn!("reopening position device {port_name} failed: {err}");
            }
        }
    }
}

fn backoff_delay(config: &GpsConfig, failures: u32) -> Duration {
    let delay = exponential_backoff(
        Duration::from_millis(config.reconnect_base_ms),
        Duration::from_millis(config.reconnect_max_ms),
        failures,
    );
    let jitter: f64 = rand::thread_rng().gen_range(0.8..1.2);
    delay.mul_f64(jitter)
}

fn handle_line(shared: &TrackerShared, processor: &mut SentenceProcessor, line: &str) {
    let counters = &shared.counters;
    match processor.ingest(line, shared.clock.now()) {
        Ingest::Discarded => {
            counters.sentences_discarded.fetch_add(1, Ordering::Relaxed);
        }
        Ingest::Ignored => {}
        Ingest::FixLost => {
            clear_fix(shared, "receiver reports no fix");
            counters.sentences_accepted.fetch_add(1, Ordering::Relaxed);
        }
        Ingest::Accepted(smoothed) => {
            counters.sentences_accepted.fetch_add(1, Ordering::Relaxed);
            if let Some(fix) = smoothed {
                shared.fix_tx.send_replace(Some(fix));
                counters.fixes_published.fetch_add(1, Ordering::Relaxed);
                for listener in &shared.listeners {
                    listener.on_fix(&fix);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::nmea::with_checksum;
    use crate::utils::SystemClock;
    use chrono::TimeZone;
    use std::{
        collections::{HashMap, VecDeque},
        io,
        sync::Mutex,
    };

    fn gps_config() -> GpsConfig {
        GpsConfig {
            ports: vec!["/dev/ttyFAKE0".into(), "/dev/ttyFAKE1".into()],
            probe_timeout_ms: 100,
            read_timeout_ms: 10,
            reconnect_base_ms: 5,
            reconnect_max_ms: 20,
            max_consecutive_failures: 3,
            ..GpsConfig::default()
        }
    }

    fn gga(time: &str, lat_minutes: f64, quality: u8, satellites: u32) -> String {
        with_checksum(&format!(
            "GPGGA,{time},48{lat_minutes:06.3},N,01131.000,E,{quality},{satellites:02},0.9,545.4,M,46.9,M,,"
        ))
    }

    #[test]
    fn smoothed_fix_is_mean_of_usable_window() {
        let config = gps_config();
        let mut processor = SentenceProcessor::new(&config);
        let start = Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).unwrap();

        let mut after_ninth = None;
        for index in 1..=12u32 {
            let usable = (5..=9).contains(&index);
            let line = gga(
                &format!("0900{:02}", index),
                index as f64,
                if usable { 2 } else { 0 },
                if usable { 6 } else { 2 },
            );
            let at = start + chrono::Duration::seconds(index as i64);
            let outcome = processor.ingest(&line, at);
            if usable {
                assert!(matches!(outcome, Ingest::Accepted(Some(_))));
            } else {
                assert_eq!(outcome, Ingest::FixLost);
            }
            if index == 9 {
                after_ninth = processor.current();
            }
        }

        let fix = after_ninth.expect("fix after sentence 9");
        let expected_lat = (5..=9).map(|i| 48.0 + i as f64 / 60.0).sum::<f64>() / 5.0;
        assert!((fix.latitude - expected_lat).abs() < 1e-9);
        assert!((fix.longitude - (11.0 + 31.0 / 60.0)).abs() < 1e-9);
        assert_eq!(fix.fix_quality, FixQuality::Fix3D);
        assert_eq!(fix.satellite_count, 6);
    }

    #[test]
    fn low_quality_stream_never_yields_a_fix() {
        let config = gps_config();
        let mut processor = SentenceProcessor::new(&config);
        let start = Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).unwrap();
        for index in 0..50u32 {
            let quality = (index % 2) as u8;
            let satellites = if quality == 0 { 12 } else { 3 };
            let line = gga("090000", 1.0, quality, satellites);
            processor.ingest(&line, start + chrono::Duration::seconds(index as i64));
            assert!(processor.current().is_none());
        }
    }

    #[test]
    fn rmc_of_same_epoch_is_not_double_counted() {
        let config = gps_config();
        let mut processor = SentenceProcessor::new(&config);
        let at = Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).unwrap();

        processor.ingest(&gga("090000", 1.0, 1, 8), at);
        let rmc = with_checksum("GPRMC,090000,A,4801.000,N,01131.000,E,0.0,0.0,010626,,");
        assert_eq!(processor.ingest(&rmc, at), Ingest::Accepted(None));

        let rmc_next = with_checksum("GPRMC,090001,A,4803.000,N,01131.000,E,0.0,0.0,010626,,");
        let Ingest::Accepted(Some(fix)) = processor.ingest(&rmc_next, at) else {
            panic!("expected smoothed fix");
        };
        assert!((fix.latitude - (48.0 + 2.0 / 60.0)).abs() < 1e-9);
        assert_eq!(fix.fix_quality, FixQuality::Fix2D);
    }

    #[test]
    fn receiver_reporting_no_fix_clears_the_window() {
        let config = gps_config();
        let mut processor = SentenceProcessor::new(&config);
        let at = Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).unwrap();

        assert!(matches!(processor.ingest(&gga("090000", 1.0, 1, 8), at), Ingest::Accepted(Some(_))));
        let void = with_checksum("GPRMC,090001,V,,,,,,,010626,,");
        assert_eq!(processor.ingest(&void, at), Ingest::FixLost);
        assert!(processor.current().is_none());

        assert!(matches!(processor.ingest(&gga("090002", 2.0, 1, 8), at), Ingest::Accepted(Some(_))));
        assert_eq!(processor.ingest(&gga("090003", 2.0, 0, 0), at), Ingest::FixLost);
        assert!(processor.current().is_none());
    }

    #[test]
    fn silence_past_the_staleness_threshold_expires_the_fix() {
        let config = gps_config();
        let mut processor = SentenceProcessor::new(&config);
        let at = Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).unwrap();

        processor.ingest(&gga("090000", 1.0, 1, 8), at);
        assert!(!processor.expire(at + chrono::Duration::seconds(2)));
        assert!(processor.current().is_some());
        assert!(processor.expire(at + chrono::Duration::seconds(4)));
        assert!(processor.current().is_none());
    }

    #[test]
    fn corrupt_and_foreign_sentences_are_classified() {
        let config = gps_config();
        let mut processor = SentenceProcessor::new(&config);
        let at = Utc::now();
        assert_eq!(processor.ingest("garbage", at), Ingest::Discarded);
        assert_eq!(
            processor.ingest("$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*00", at),
            Ingest::Discarded
        );
        assert_eq!(
            processor.ingest(&with_checksum("GPGSA,A,3,04,05,,,,,,,,,,,2.5,1.3,2.1"), at),
            Ingest::Ignored
        );
    }

    /// Serves scripted lines per port; an exhausted script yields timeouts.
    struct ScriptedOpener {
        scripts: Mutex<HashMap<String, VecDeque<io::Result<Option<String>>>>>,
    }

    struct ScriptedSource {
        lines: VecDeque<io::Result<Option<String>>>,
    }

    impl SentenceSource for ScriptedSource {
        fn read_line(&mut self) -> io::Result<Option<String>> {
            match self.lines.pop_front() {
                Some(next) => next,
                None => {
                    thread::sleep(Duration::from_millis(2));
                    Ok(None)
                }
            }
        }
    }

    impl PortOpener for ScriptedOpener {
        fn open(
            &self,
            port: &str,
            _baud_rate: u32,
            _read_timeout: Duration,
        ) -> io::Result<Box<dyn SentenceSource>> {
            let mut scripts = self.scripts.lock().unwrap();
            match scripts.remove(port) {
                Some(lines) => Ok(Box::new(ScriptedSource { lines })),
                None => Err(io::Error::new(io::ErrorKind::NotFound, "no such port")),
            }
        }
    }

    fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn tracker_without_device_enters_no_device() {
        let opener = Arc::new(ScriptedOpener {
            scripts: Mutex::new(HashMap::new()),
        });
        let mut tracker = PositionTracker::new(gps_config(), opener, Arc::new(SystemClock));
        tracker.start().expect("start");

        assert!(wait_for(|| tracker.state() == TrackerState::NoDevice));
        assert!(tracker.latest_fix().is_none());
        tracker.stop().expect("stop");
        tracker.stop().expect("second stop is a no-op");
    }

    #[test]
    fn tracker_adopts_second_port_and_notifies_listeners() {
        let mut scripts = HashMap::new();
        scripts.insert(
            "/dev/ttyFAKE0".to_string(),
            VecDeque::from(vec![Ok(Some("noise".to_string()))]),
        );
        let lines: VecDeque<io::Result<Option<String>>> = (0..5)
            .map(|i| Ok(Some(gga(&format!("10000{i}"), 1.0, 1, 9))))
            .collect();
        scripts.insert("/dev/ttyFAKE1".to_string(), lines);
        let opener = Arc::new(ScriptedOpener {
            scripts: Mutex::new(scripts),
        });

        let seen = Arc::new(AtomicU64::new(0));
        let seen_clone = Arc::clone(&seen);
        let listener: Arc<dyn FixListener> = Arc::new(move |_fix: &PositionFix| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        let mut tracker = PositionTracker::new(gps_config(), opener, Arc::new(SystemClock))
            .on_fix(listener);
        tracker.start().expect("start");

        assert!(wait_for(|| seen.load(Ordering::SeqCst) == 5));
        let status = tracker.status();
        assert_eq!(status.state, TrackerState::Tracking);
        assert_eq!(status.port.as_deref(), Some("/dev/ttyFAKE1"));
        assert!(status.stats.sentences_discarded >= 1);
        assert_eq!(status.stats.fixes_published, 5);
        assert!(tracker.latest_fix().is_some());
        tracker.stop().expect("stop");
        assert_eq!(tracker.state(), TrackerState::Idle);
    }

    #[test]
    fn repeated_read_failures_return_to_no_device() {
        let mut scripts = HashMap::new();
        scripts.insert(
            "/dev/ttyFAKE0".to_string(),
            VecDeque::from(vec![
                Ok(Some(gga("100000", 1.0, 1, 9))),
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged")),
            ]),
        );
        let opener = Arc::new(ScriptedOpener {
            scripts: Mutex::new(scripts),
        });
        let mut tracker = PositionTracker::new(gps_config(), opener, Arc::new(SystemClock));
        tracker.start().expect("start");

        assert!(wait_for(|| tracker.state() == TrackerState::NoDevice));
        tracker.stop().expect("stop");
    }

    fn counting_listener() -> (Arc<AtomicU64>, Arc<dyn FixListener>) {
        let seen = Arc::new(AtomicU64::new(0));
        let seen_clone = Arc::clone(&seen);
        let listener: Arc<dyn FixListener> = Arc::new(move |_fix: &PositionFix| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });
        (seen, listener)
    }

    fn opener_with(lines: Vec<io::Result<Option<String>>>) -> Arc<ScriptedOpener> {
        let mut scripts = HashMap::new();
        scripts.insert("/dev/ttyFAKE0".to_string(), VecDeque::from(lines));
        Arc::new(ScriptedOpener {
            scripts: Mutex::new(scripts),
        })
    }

    #[test]
    fn losing_the_device_withdraws_the_fix() {
        let opener = opener_with(vec![
            Ok(Some(gga("100000", 1.0, 1, 9))),
            Ok(Some(gga("100001", 1.0, 1, 9))),
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged")),
        ]);
        let (seen, listener) = counting_listener();
        let mut tracker = PositionTracker::new(gps_config(), opener, Arc::new(SystemClock)).on_fix(listener);
        let fix_rx = tracker.subscribe();
        tracker.start().expect("start");

        assert!(wait_for(|| tracker.state() == TrackerState::NoDevice));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert!(tracker.latest_fix().is_none());
        assert!(fix_rx.borrow().is_none());
        tracker.stop().expect("stop");
    }

    #[test]
    fn receiver_losing_its_fix_withdraws_the_published_fix() {
        let opener = opener_with(vec![
            Ok(Some(gga("100000", 1.0, 1, 9))),
            Ok(Some(gga("100001", 1.0, 1, 9))),
            Ok(Some(gga("100002", 1.0, 0, 0))),
        ]);
        let (seen, listener) = counting_listener();
        let mut tracker = PositionTracker::new(gps_config(), opener, Arc::new(SystemClock)).on_fix(listener);
        tracker.start().expect("start");

        assert!(wait_for(|| tracker.stats().sentences_accepted == 3));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.state(), TrackerState::Tracking);
        assert!(tracker.latest_fix().is_none());
        tracker.stop().expect("stop");
    }

    #[test]
    fn silent_receiver_has_its_fix_expired() {
        let start = Utc.with_ymd_and_hms(2026, 6, 1, 10, 0, 0).unwrap();
        let clock = crate::utils::ManualClock::new(start);
        let opener = opener_with(vec![
            Ok(Some(gga("100000", 1.0, 1, 9))),
            Ok(Some(gga("100001", 1.0, 1, 9))),
        ]);
        let mut tracker = PositionTracker::new(gps_config(), opener, Arc::new(clock.clone()));
        tracker.start().expect("start");

        assert!(wait_for(|| tracker.stats().fixes_published == 2));
        assert!(tracker.latest_fix().is_some());

        clock.set(start + chrono::Duration::seconds(10));
        assert!(wait_for(|| tracker.latest_fix().is_none()));
        assert_eq!(tracker.state(), TrackerState::Tracking);
        tracker.stop().expect("stop");
    }
}
