use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One candidate as reported by the inference backend, before filtering.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCandidate {
    pub plate_text: Option<String>,
    pub color: Option<String>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub vehicle_type: Option<String>,
    /// Normalised to [0, 1].
    pub confidence: f64,
}

impl RawCandidate {
    /// Free-text vehicle description, e.g. `red Honda Civic sedan`.
    pub fn description(&self) -> Option<String> {
        let parts: Vec<&str> = [&self.color, &self.make, &self.model, &self.vehicle_type]
            .into_iter()
            .filter_map(|part| part.as_deref().map(str::trim))
            .filter(|part| !part.is_empty())
            .collect();
        (!parts.is_empty()).then(|| parts.join(" "))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionResult {
    pub captured_at: DateTime<Utc>,
    pub plate_text: Option<String>,
    pub description: Option<String>,
    pub confidence: f64,
}

impl DetectionResult {
    /// Short overlay line.
    pub fn summary(&self) -> String {
        let label = match (&self.plate_text, &self.description) {
            (Some(plate), Some(description)) => format!("{plate} {description}"),
            (Some(plate), None) => plate.clone(),
            (None, Some(description)) => description.clone(),
            (None, None) => "vehicle".to_string(),
        };
        format!("{label} ({:.0}%)", self.confidence * 100.0)
    }
}

/// Receives each emitted detection on the detection task.
pub trait DetectionListener: Send + Sync {
    fn on_detection(&self, detection: &DetectionResult);
}

impl<F> DetectionListener for F
where
    F: Fn(&DetectionResult) + Send + Sync,
{
    fn on_detection(&self, detection: &DetectionResult) {
        self(detection)
    }
}
