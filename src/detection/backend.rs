use std::{
    env,
    future::Future,
    io::Cursor,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use image::ImageFormat;
use serde::Deserialize;
use tokio::{io::AsyncWriteExt, process::Command};

use crate::{config::DetectionConfig, error::FaultKind, frame::Frame};

use super::result::RawCandidate;

/// Black-box producer of candidates for one frame.
pub trait InferenceBackend: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn infer(&self, frame: Arc<Frame>) -> impl Future<Output = Result<Vec<RawCandidate>>> + Send;
}

/// Runs an external recognizer once per sample: the frame goes to stdin as
/// JPEG, candidates come back as JSON on stdout.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandBackend {
    /// `None` when no command is configured or its binary cannot be found.
    pub fn from_config(config: &DetectionConfig) -> Option<Self> {
        let command = config.recognizer_command.as_ref()?;
        let (program, args) = command.split_first()?;
        let program = resolve_program(program)?;
        Some(Self {
            program,
            args: args.to_vec(),
            timeout: Duration::from_millis(config.recognizer_timeout_ms),
        })
    }

    pub fn new(program: PathBuf, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program,
            args,
            timeout,
        }
    }
}

impl InferenceBackend for CommandBackend {
    fn name(&self) -> &str {
        self.program
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("recognizer")
    }

    async fn infer(&self, frame: Arc<Frame>) -> Result<Vec<RawCandidate>> {
        let jpeg = tokio::task::spawn_blocking(move || encode_jpeg(&frame))
            .await
            .context("jpeg encode worker join failed")??;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.program.display()))?;

        // On timeout the child is dropped and killed.
        let run = async move {
            if let Some(mut stdin) = child.stdin.take() {
                // The recognizer may close stdin early; its output still decides.
                let _ = stdin.write_all(&jpeg).await;
                drop(stdin);
            }
            child.wait_with_output().await
        };

        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| {
                anyhow!(FaultKind::TransientIo(format!(
                    "recognizer exceeded {}ms",
                    self.timeout.as_millis()
                )))
            })?
            .context("recognizer wait failed")?;

        if !output.status.success() {
            return Err(anyhow!(FaultKind::TransientIo(format!(
                "recognizer exited with {}",
                output.status
            ))));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_recognizer_output(stdout.trim()).map_err(anyhow::Error::from)
    }
}

fn encode_jpeg(frame: &Frame) -> Result<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    frame
        .image
        .write_to(&mut buffer, ImageFormat::Jpeg)
        .context("failed to encode frame as JPEG")?;
    Ok(buffer.into_inner())
}

fn resolve_program(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|path| path.is_file())
}

#[derive(Debug, Deserialize)]
struct RecognizerOutput {
    #[serde(default)]
    results: Vec<RecognizerResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecognizerResult {
    #[serde(default)]
    plate: Option<String>,
    confidence: f64,
    #[serde(default)]
    color: Option<String>,
    #[serde(default)]
    make: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default, alias = "vehicle_type")]
    vehicle_type: Option<String>,
}

/// Parse recognizer JSON. Confidence on a 0-100 scale is normalised; anything
/// that cannot be read as a candidate list is corrupt input.
pub fn parse_recognizer_output(payload: &str) -> Result<Vec<RawCandidate>, FaultKind> {
    if payload.is_empty() {
        return Ok(Vec::new());
    }

    let output: RecognizerOutput = serde_json::from_str(payload)
        .map_err(|err| FaultKind::CorruptInput(format!("recognizer payload: {err}")))?;

    output
        .results
        .into_iter()
        .map(|result| {
            let confidence = normalise_confidence(result.confidence).ok_or_else(|| {
                FaultKind::CorruptInput(format!("confidence {} out of range", result.confidence))
            })?;
            Ok(RawCandidate {
                plate_text: result
                    .plate
                    .map(|plate| plate.trim().to_uppercase())
                    .filter(|plate| !plate.is_empty()),
                color: result.color,
                make: result.make,
                model: result.model,
                vehicle_type: result.vehicle_type,
                confidence,
            })
        })
        .collect()
}

fn normalise_confidence(raw: f64) -> Option<f64> {
    if !raw.is_finite() || raw < 0.0 {
        return None;
    }
    match raw {
        value if value <= 1.0 => Some(value),
        value if value <= 100.0 => Some(value / 100.0),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_percent_confidence_and_attributes() {
        let payload = r#"{"version":2,"results":[
            {"plate":"abc123","confidence":91.5,"color":"red","make":"Honda","model":"Civic"},
            {"plate":"XYZ789","confidence":0.42,"vehicleType":"van"}]}"#;
        let candidates = parse_recognizer_output(payload).expect("parse");
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].plate_text.as_deref(), Some("ABC123"));
        assert!((candidates[0].confidence - 0.915).abs() < 1e-9);
        assert_eq!(candidates[0].description().as_deref(), Some("red Honda Civic"));
        assert!((candidates[1].confidence - 0.42).abs() < 1e-9);
        assert_eq!(candidates[1].vehicle_type.as_deref(), Some("van"));
    }

    #[test]
    fn empty_output_means_no_candidates() {
        assert!(parse_recognizer_output("").expect("empty").is_empty());
        assert!(parse_recognizer_output(r#"{"results":[]}"#).expect("none").is_empty());
    }

    #[test]
    fn garbage_is_corrupt_input() {
        let err = parse_recognizer_output("not json").expect_err("corrupt");
        assert!(err.is_corrupt_input());
        let err = parse_recognizer_output(r#"{"results":[{"plate":"A","confidence":250}]}"#)
            .expect_err("range");
        assert!(err.is_corrupt_input());
    }

    #[test]
    fn unconfigured_command_yields_no_backend() {
        let config = DetectionConfig {
            recognizer_command: None,
            ..DetectionConfig::default()
        };
        assert!(CommandBackend::from_config(&config).is_none());

        let config = DetectionConfig {
            recognizer_command: Some(vec!["/nonexistent/recognizer-binary".into()]),
            ..DetectionConfig::default()
        };
        assert!(CommandBackend::from_config(&config).is_none());
    }
}
