use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "camelCase")]
pub enum FixQuality {
    NoFix,
    Fix2D,
    Fix3D,
}

impl FixQuality {
    /// GGA quality indicator. Estimated, manual and simulated fixes are not
    /// trusted for geotagging.
    pub fn from_gga_indicator(indicator: u8) -> Self {
        match indicator {
            1 => FixQuality::Fix2D,
            2..=5 => FixQuality::Fix3D,
            _ => FixQuality::NoFix,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PositionFix {
    pub latitude: f64,
    pub longitude: f64,
    pub fix_quality: FixQuality,
    pub satellite_count: u32,
    pub captured_at: DateTime<Utc>,
}

impl PositionFix {
    pub fn is_usable(&self, min_satellites: u32) -> bool {
        self.fix_quality >= FixQuality::Fix2D && self.satellite_count >= min_satellites
    }

    /// Age relative to `now`; clock skew never yields a negative age.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.captured_at).max(chrono::Duration::zero())
    }
}

/// Receives every smoothed fix, synchronously on the tracker thread.
pub trait FixListener: Send + Sync {
    fn on_fix(&self, fix: &PositionFix);
}

impl<F> FixListener for F
where
    F: Fn(&PositionFix) + Send + Sync,
{
    fn on_fix(&self, fix: &PositionFix) {
        self(fix)
    }
}
