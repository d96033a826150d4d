use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One persisted detection. `(timestamp, segment_filename, plate_text)` is
/// unique; re-recording the same triple is absorbed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VehicleEvent {
    /// Row id; `None` until stored.
    pub id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub segment_filename: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub plate_text: Option<String>,
    pub description: Option<String>,
    pub confidence: f64,
    /// Set by the store on insert.
    pub inserted_at: Option<DateTime<Utc>>,
}

impl VehicleEvent {
    pub fn new(timestamp: DateTime<Utc>, segment_filename: impl Into<String>, confidence: f64) -> Self {
        Self {
            id: None,
            timestamp,
            segment_filename: segment_filename.into(),
            latitude: None,
            longitude: None,
            plate_text: None,
            description: None,
            confidence,
            inserted_at: None,
        }
    }

    pub fn with_position(mut self, latitude: f64, longitude: f64) -> Self {
        self.latitude = Some(latitude);
        self.longitude = Some(longitude);
        self
    }

    pub fn with_plate(mut self, plate_text: impl Into<String>) -> Self {
        self.plate_text = Some(plate_text.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RecordOutcome {
    Inserted,
    DuplicateIgnored,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SortOrder {
    #[default]
    Newest,
    Oldest,
}

impl SortOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Newest => "DESC",
            SortOrder::Oldest => "ASC",
        }
    }
}

/// Filters are optional and AND-composed. Text filters are substring matches;
/// color, make and model each match against the description.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub plate: Option<String>,
    pub color: Option<String>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub segment_filename: Option<String>,
    pub order: SortOrder,
    pub limit: Option<usize>,
}

impl EventQuery {
    pub const DEFAULT_LIMIT: usize = 100;
    pub const MAX_LIMIT: usize = 10_000;

    pub fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(Self::DEFAULT_LIMIT)
            .min(Self::MAX_LIMIT)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPage {
    pub events: Vec<VehicleEvent>,
    /// Rows matching the filters, ignoring the limit.
    pub total: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventStats {
    pub total_events: u64,
    pub today_events: u64,
    pub unique_plates: u64,
    pub latest_event: Option<DateTime<Utc>>,
}
