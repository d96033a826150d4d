use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

/// Coalesces repeated sightings of one identity. The window is measured
/// from the most recent sighting, so a vehicle lingering in frame yields a
/// single emission and only a reappearance after a quiet window re-emits.
#[derive(Debug)]
pub struct Deduper {
    window: Duration,
    last_seen: HashMap<String, DateTime<Utc>>,
}

impl Deduper {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_seen: HashMap::new(),
        }
    }

    /// Returns true when a sighting of `key` at `at` should be emitted.
    pub fn admit(&mut self, key: &str, at: DateTime<Utc>) -> bool {
        let emit = match self.last_seen.get(key) {
            Some(previous) => at - *previous > self.window,
            None => true,
        };
        self.last_seen.insert(key.to_string(), at);
        self.evict_expired(at);
        emit
    }

    fn evict_expired(&mut self, now: DateTime<Utc>) {
        let window = self.window;
        self.last_seen.retain(|_, seen| now - *seen <= window);
    }

    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }
}

/// Identity used for dedup: the normalised plate, or the description for
/// plate-less sightings.
pub fn identity_key(plate_text: Option<&str>, description: Option<&str>) -> Option<String> {
    if let Some(plate) = plate_text.map(str::trim).filter(|plate| !plate.is_empty()) {
        return Some(format!("plate:{}", plate.to_uppercase()));
    }
    description
        .map(str::trim)
        .filter(|description| !description.is_empty())
        .map(|description| format!("desc:{}", description.to_lowercase()))
}
