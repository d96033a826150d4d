use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};

use super::fix::PositionFix;

/// Sliding-window mean over the most recent usable fixes.
///
/// A gap between sentences longer than `staleness` clears the window, so a
/// position from before a dropout is never blended into the new one.
#[derive(Debug)]
pub struct FixSmoother {
    window: VecDeque<PositionFix>,
    capacity: usize,
    staleness: Duration,
    min_satellites: u32,
    last_sentence_at: Option<DateTime<Utc>>,
}

impl FixSmoother {
    pub fn new(capacity: usize, staleness: Duration, min_satellites: u32) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            staleness,
            min_satellites,
            last_sentence_at: None,
        }
    }

    /// Record that a sentence arrived at `at`. Returns true when the gap since
    /// the previous sentence exceeded the staleness threshold and the window
    /// was cleared.
    pub fn note_sentence(&mut self, at: DateTime<Utc>) -> bool {
        let stale = matches!(self.last_sentence_at, Some(prev) if at - prev > self.staleness);
        self.last_sentence_at = Some(at);
        if stale && !self.window.is_empty() {
            self.window.clear();
            return true;
        }
        false
    }

    /// Add a fix. Unusable fixes are not admitted. Returns the smoothed fix
    /// when the window changed.
    pub fn push(&mut self, fix: PositionFix) -> Option<PositionFix> {
        if !fix.is_usable(self.min_satellites) {
            return None;
        }
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(fix);
        self.current()
    }

    /// Drop the window. Used when the receiver reports it has lost its fix.
    pub fn clear(&mut self) {
        self.window.clear();
    }

    /// Clear the window if no sentence arrived within the staleness
    /// threshold before `now`. Returns true when a fix was discarded.
    pub fn expire(&mut self, now: DateTime<Utc>) -> bool {
        let stale = matches!(self.last_sentence_at, Some(prev) if now - prev > self.staleness);
        if stale && !self.window.is_empty() {
            self.window.clear();
            return true;
        }
        false
    }

    pub fn current(&self) -> Option<PositionFix> {
        let latest = self.window.back()?;
        let count = self.window.len() as f64;
        let (lat_sum, lon_sum) = self
            .window
            .iter()
            .fold((0.0, 0.0), |(lat, lon), fix| (lat + fix.latitude, lon + fix.longitude));

        Some(PositionFix {
            latitude: lat_sum / count,
            longitude: lon_sum / count,
            ..*latest
        })
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }
}
