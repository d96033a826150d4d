use std::{
    io::{self, Write},
    path::Path,
    process::{Child, ChildStdin, Command, Stdio},
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use log::{info, warn};
use serde::Serialize;

use crate::config::CaptureConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "codec")]
pub enum EncoderChoice {
    Hardware(String),
    Software(String),
}

impl EncoderChoice {
    pub fn codec(&self) -> &str {
        match self {
            EncoderChoice::Hardware(codec) | EncoderChoice::Software(codec) => codec,
        }
    }
}

/// Pick the codec from an `ffmpeg -encoders` listing.
pub fn choose_encoder(config: &CaptureConfig, listing: &str) -> EncoderChoice {
    let hardware_listed = listing
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|name| name == config.hardware_codec);

    if config.use_hardware_encoder && hardware_listed {
        EncoderChoice::Hardware(config.hardware_codec.clone())
    } else {
        EncoderChoice::Software(config.software_codec.clone())
    }
}

/// Probe once at start. A failed probe falls back to the software codec.
pub fn probe_encoder(config: &CaptureConfig) -> EncoderChoice {
    if !config.use_hardware_encoder {
        return EncoderChoice::Software(config.software_codec.clone());
    }

    let listing = Command::new(&config.ffmpeg_path)
        .args(["-hide_banner", "-encoders"])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output();

    match listing {
        Ok(output) => choose_encoder(config, &String::from_utf8_lossy(&output.stdout)),
        Err(err) => {
            warn!("encoder probe via {} failed: {err}", config.ffmpeg_path);
            EncoderChoice::Software(config.software_codec.clone())
        }
    }
}

/// ffmpeg arguments: raw RGB24 frames on stdin, one output file.
pub fn encoder_args(config: &CaptureConfig, choice: &EncoderChoice, output: &Path) -> Vec<String> {
    let mut args: Vec<String> = [
        "-hide_banner",
        "-loglevel",
        "error",
        "-f",
        "rawvideo",
        "-pixel_format",
        "rgb24",
        "-video_size",
    ]
    .iter()
    .map(|arg| arg.to_string())
    .collect();

    args.push(format!("{}x{}", config.capture_width, config.capture_height));
    args.extend(["-framerate".to_string(), config.capture_fps.to_string()]);
    args.extend(["-i".to_string(), "-".to_string()]);
    args.extend(["-c:v".to_string(), choice.codec().to_string()]);

    match choice {
        EncoderChoice::Hardware(_) => {
            args.extend(["-preset", "default", "-rc:v", "vbr"].map(String::from));
        }
        EncoderChoice::Software(_) => {
            args.extend(["-preset", "fast", "-crf", "23"].map(String::from));
        }
    }

    args.extend(["-b:v".to_string(), format!("{}k", config.bitrate_kbps)]);
    args.extend(["-pix_fmt", "yuv420p", "-f", "mp4", "-y"].map(String::from));
    args.push(output.to_string_lossy().into_owned());
    args
}

/// Write side of one running encoder.
pub trait EncoderSink: Send {
    fn write_frame(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// `Some(description)` once the process has exited on its own.
    fn exited(&mut self) -> Option<String>;

    /// Close input and wait up to `grace` for a clean exit, then kill.
    fn finish(self: Box<Self>, grace: Duration) -> Result<()>;
}

/// Starts one encoder per segment.
pub trait EncoderLauncher: Send + Sync {
    fn launch(&self, output: &Path) -> Result<Box<dyn EncoderSink>>;

    fn choice(&self) -> Option<EncoderChoice> {
        None
    }
}

pub struct FfmpegLauncher {
    config: CaptureConfig,
    choice: EncoderChoice,
}

impl FfmpegLauncher {
    pub fn new(config: CaptureConfig, choice: EncoderChoice) -> Self {
        info!("Encoder selected: {:?}", choice);
        Self { config, choice }
    }

    pub fn probe(config: CaptureConfig) -> Self {
        let choice = probe_encoder(&config);
        Self::new(config, choice)
    }
}

impl EncoderLauncher for FfmpegLauncher {
    fn launch(&self, output: &Path) -> Result<Box<dyn EncoderSink>> {
        let args = encoder_args(&self.config, &self.choice, output);
        let mut child = Command::new(&self.config.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to spawn encoder for {}", output.display()))?;

        Ok(Box::new(FfmpegEncoder::from_child(child)))
    }

    fn choice(&self) -> Option<EncoderChoice> {
        Some(self.choice.clone())
    }
}

/// Scoped encoder process: killed and reaped on every exit path.
pub struct FfmpegEncoder {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
}

impl FfmpegEncoder {
    /// Takes over a spawned process whose stdin is piped.
    pub fn from_child(mut child: Child) -> Self {
        let stdin = child.stdin.take();
        Self {
            child: Some(child),
            stdin,
        }
    }
}

impl EncoderSink for FfmpegEncoder {
    fn write_frame(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self.stdin.as_mut() {
            Some(stdin) => stdin.write_all(bytes),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "encoder input closed")),
        }
    }

    fn exited(&mut self) -> Option<String> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(err) => Some(format!("wait failed: {err}")),
        }
    }

    fn finish(mut self: Box<Self>, grace: Duration) -> Result<()> {
        // Closing stdin is the end-of-stream signal.
        drop(self.stdin.take());

        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        let deadline = Instant::now() + grace;
        loop {
            if let Some(status) = child.try_wait().context("failed to poll encoder")? {
                if !status.success() {
                    warn!("encoder exited with {status} while finishing");
                }
                return Ok(());
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }

        warn!("encoder did not exit within {:?}; killing", grace);
        child.kill().context("failed to kill encoder")?;
        child.wait().context("failed to reap encoder")?;
        Ok(())
    }
}

impl Drop for FfmpegEncoder {
    fn drop(&mut self) {
        drop(self.stdin.take());
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
