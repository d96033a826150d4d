use std::{
    io::{self, Read},
    path::Path,
    process::{Child, ChildStdout, Command, Stdio},
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError, SyncSender},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Context, Result};
use image::RgbImage;
use log::{debug, info};

use crate::config::CaptureConfig;

const FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(5);
const READER_JOIN_GRACE: Duration = Duration::from_millis(200);

/// Candidate capture devices in priority order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraSpec {
    pub devices: Vec<String>,
}

impl CameraSpec {
    pub fn from_config(config: &CaptureConfig) -> Self {
        Self {
            devices: config.camera_devices.clone(),
        }
    }
}

/// Unblocks a pending `read_frame` from another thread.
pub type Interrupt = Box<dyn Fn() + Send + Sync>;

/// Blocking source of decoded frames, paced by the device.
pub trait FrameSource: Send {
    fn read_frame(&mut self) -> io::Result<RgbImage>;

    /// Sources whose reads can block indefinitely hand out a way to abort
    /// them. Without one a stalled read is abandoned with its thread.
    fn interrupter(&self) -> Option<Interrupt> {
        None
    }
}

pub trait CameraOpener: Send + Sync {
    fn open(&self, device: &str, config: &CaptureConfig) -> Result<Box<dyn FrameSource>>;
}

/// Fall through the candidates; the first device that opens wins.
pub fn open_first(
    opener: &dyn CameraOpener,
    spec: &CameraSpec,
    config: &CaptureConfig,
) -> Option<(String, Box<dyn FrameSource>)> {
    for device in &spec.devices {
        match opener.open(device, config) {
            Ok(source) => {
                info!("Opened camera {device}");
                return Some((device.clone(), source));
            }
            Err(err) => debug!("camera {device} not available: {err:#}"),
        }
    }
    None
}

/// Reads a source on its own thread so every frame can be awaited with a
/// deadline. Dropping the pump interrupts the source and stops the thread.
pub struct FramePump {
    frames: Option<Receiver<io::Result<RgbImage>>>,
    interrupt: Option<Interrupt>,
    worker: Option<JoinHandle<()>>,
}

impl FramePump {
    pub fn spawn(device: &str, mut source: Box<dyn FrameSource>) -> io::Result<Self> {
        let interrupt = source.interrupter();
        // One frame in flight: the reader never runs ahead of the consumer.
        let (frame_tx, frame_rx) = mpsc::sync_channel(1);
        let worker = thread::Builder::new()
            .name(format!("dashcam-camera:{device}"))
            .spawn(move || loop {
                let frame = source.read_frame();
                if frame_tx.send(frame).is_err() {
                    break;
                }
            })?;

        Ok(Self {
            frames: Some(frame_rx),
            interrupt,
            worker: Some(worker),
        })
    }

    /// `TimedOut` when the source produced nothing within `deadline`;
    /// `BrokenPipe` once the reader thread has gone.
    pub fn next_frame(&self, deadline: Duration) -> io::Result<RgbImage> {
        let Some(frames) = &self.frames else {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "frame pump closed"));
        };
        match frames.recv_timeout(deadline) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no frame within {} ms", deadline.as_millis()),
            )),
            Err(RecvTimeoutError::Disconnected) => {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "camera reader exited"))
            }
        }
    }
}

impl Drop for FramePump {
    fn drop(&mut self) {
        if let Some(interrupt) = &self.interrupt {
            interrupt();
        }
        self.frames.take();

        let Some(worker) = self.worker.take() else {
            return;
        };
        let deadline = Instant::now() + READER_JOIN_GRACE;
        while !worker.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        if worker.is_finished() {
            let _ = worker.join();
        } else {
            debug!("camera reader still blocked; detaching it");
        }
    }
}

/// Captures through an `ffmpeg` v4l2 input that emits raw RGB24 frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegCameraOpener;

impl CameraOpener for FfmpegCameraOpener {
    fn open(&self, device: &str, config: &CaptureConfig) -> Result<Box<dyn FrameSource>> {
        if !Path::new(device).exists() {
            bail!("device {device} does not exist");
        }

        let child = Command::new(&config.ffmpeg_path)
            .args(["-hide_banner", "-loglevel", "error", "-f", "v4l2"])
            .args(["-framerate", &config.capture_fps.to_string()])
            .args([
                "-video_size",
                &format!("{}x{}", config.capture_width, config.capture_height),
            ])
            .args(["-i", device])
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to spawn capture for {device}"))?;

        let mut camera = FfmpegCamera::attach(child, config.capture_width, config.capture_height)?;

        // A device that cannot deliver one frame in time is not adopted.
        camera
            .prime(FIRST_FRAME_TIMEOUT)
            .with_context(|| format!("camera {device} produced no frame"))?;
        Ok(Box::new(camera))
    }
}

/// Raw frames arrive from the capture process on a reader thread, so a
/// stalled device shows up as a missing frame rather than a hung read.
struct FfmpegCamera {
    child: Arc<Mutex<Child>>,
    frames: Receiver<io::Result<RgbImage>>,
    pending: Option<RgbImage>,
}

impl FfmpegCamera {
    fn attach(mut child: Child, width: u32, height: u32) -> Result<Self> {
        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(anyhow!("capture process has no stdout"));
            }
        };

        let (frame_tx, frame_rx) = mpsc::sync_channel(2);
        if let Err(err) = thread::Builder::new()
            .name("dashcam-v4l2".into())
            .spawn(move || read_raw_frames(stdout, width, height, frame_tx))
        {
            let _ = child.kill();
            let _ = child.wait();
            return Err(anyhow::Error::new(err).context("failed to spawn capture reader"));
        }

        Ok(Self {
            child: Arc::new(Mutex::new(child)),
            frames: frame_rx,
            pending: None,
        })
    }

    fn prime(&mut self, timeout: Duration) -> Result<()> {
        match self.frames.recv_timeout(timeout) {
            Ok(frame) => {
                self.pending = Some(frame?);
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => bail!("no frame within {} ms", timeout.as_millis()),
            Err(RecvTimeoutError::Disconnected) => bail!("capture process exited"),
        }
    }

    fn kill(child: &Mutex<Child>) {
        let mut child = match child.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let _ = child.kill();
    }
}

fn read_raw_frames(
    mut stdout: ChildStdout,
    width: u32,
    height: u32,
    frame_tx: SyncSender<io::Result<RgbImage>>,
) {
    let frame_bytes = width as usize * height as usize * 3;
    loop {
        let mut buffer = vec![0u8; frame_bytes];
        let frame = stdout.read_exact(&mut buffer).and_then(|_| {
            RgbImage::from_raw(width, height, buffer)
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "frame size mismatch"))
        });
        let failed = frame.is_err();
        if frame_tx.send(frame).is_err() || failed {
            return;
        }
    }
}

impl FrameSource for FfmpegCamera {
    fn read_frame(&mut self) -> io::Result<RgbImage> {
        if let Some(frame) = self.pending.take() {
            return Ok(frame);
        }
        match self.frames.recv() {
            Ok(frame) => frame,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "capture process closed its output",
            )),
        }
    }

    fn interrupter(&self) -> Option<Interrupt> {
        let child = Arc::clone(&self.child);
        Some(Box::new(move || FfmpegCamera::kill(&child)))
    }
}

impl Drop for FfmpegCamera {
    fn drop(&mut self) {
        let mut child = match self.child.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let _ = child.kill();
        let _ = child.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Condvar,
    };

    struct ListedOpener {
        working: &'static str,
        attempts: Mutex<Vec<String>>,
    }

    struct BlankSource;

    impl FrameSource for BlankSource {
        fn read_frame(&mut self) -> io::Result<RgbImage> {
            Ok(RgbImage::new(4, 4))
        }
    }

    impl CameraOpener for ListedOpener {
        fn open(&self, device: &str, _config: &CaptureConfig) -> Result<Box<dyn FrameSource>> {
            self.attempts.lock().unwrap().push(device.to_string());
            if device == self.working {
                Ok(Box::new(BlankSource))
            } else {
                bail!("busy")
            }
        }
    }

    /// Delivers one frame, then blocks until interrupted.
    struct HangingSource {
        delivered: bool,
        released: Arc<(Mutex<bool>, Condvar)>,
    }

    impl FrameSource for HangingSource {
        fn read_frame(&mut self) -> io::Result<RgbImage> {
            if !self.delivered {
                self.delivered = true;
                return Ok(RgbImage::new(2, 2));
            }
            let (lock, signal) = &*self.released;
            let mut released = lock.lock().unwrap();
            while !*released {
                released = signal.wait(released).unwrap();
            }
            Err(io::Error::new(io::ErrorKind::Interrupted, "interrupted"))
        }

        fn interrupter(&self) -> Option<Interrupt> {
            let released = Arc::clone(&self.released);
            Some(Box::new(move || {
                let (lock, signal) = &*released;
                *lock.lock().unwrap() = true;
                signal.notify_all();
            }))
        }
    }

    #[test]
    fn falls_through_to_first_working_device() {
        let opener = ListedOpener {
            working: "/dev/video2",
            attempts: Mutex::new(Vec::new()),
        };
        let spec = CameraSpec {
            devices: (0..4).map(|i| format!("/dev/video{i}")).collect(),
        };

        let (device, _) = open_first(&opener, &spec, &CaptureConfig::default()).expect("camera");
        assert_eq!(device, "/dev/video2");
        assert_eq!(opener.attempts.lock().unwrap().len(), 3);
    }

    #[test]
    fn missing_device_is_rejected_before_spawning() {
        let result = FfmpegCameraOpener.open("/dev/does-not-exist", &CaptureConfig::default());
        assert!(result.is_err());
    }

    #[test]
    fn pump_times_out_on_a_stalled_source_and_interrupts_it_on_drop() {
        let released = Arc::new((Mutex::new(false), Condvar::new()));
        let pump = FramePump::spawn(
            "hanging",
            Box::new(HangingSource {
                delivered: false,
                released: Arc::clone(&released),
            }),
        )
        .expect("pump");

        assert!(pump.next_frame(Duration::from_secs(2)).is_ok());
        let started = Instant::now();
        let err = pump
            .next_frame(Duration::from_millis(100))
            .expect_err("stalled source");
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(2));

        drop(pump);
        assert!(*released.0.lock().unwrap());
    }

    #[test]
    fn pump_reads_no_further_ahead_than_one_frame() {
        struct Counting(Arc<AtomicU32>);

        impl FrameSource for Counting {
            fn read_frame(&mut self) -> io::Result<RgbImage> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(RgbImage::new(1, 1))
            }
        }

        let reads = Arc::new(AtomicU32::new(0));
        let pump = FramePump::spawn("counting", Box::new(Counting(Arc::clone(&reads)))).expect("pump");
        thread::sleep(Duration::from_millis(100));
        assert!(reads.load(Ordering::SeqCst) <= 2);
        assert!(pump.next_frame(Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn pump_abandons_a_source_without_interrupter() {
        struct Asleep(Arc<AtomicBool>);

        impl FrameSource for Asleep {
            fn read_frame(&mut self) -> io::Result<RgbImage> {
                self.0.store(true, Ordering::SeqCst);
                thread::sleep(Duration::from_secs(3600));
                Ok(RgbImage::new(1, 1))
            }
        }

        let entered = Arc::new(AtomicBool::new(false));
        let pump = FramePump::spawn("asleep", Box::new(Asleep(Arc::clone(&entered)))).expect("pump");
        assert_eq!(
            pump.next_frame(Duration::from_millis(50)).unwrap_err().kind(),
            io::ErrorKind::TimedOut
        );
        assert!(entered.load(Ordering::SeqCst));

        let started = Instant::now();
        drop(pump);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[cfg(unix)]
    fn silent_process() -> Child {
        Command::new("sleep")
            .arg("60")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()
            .expect("spawn sleep")
    }

    #[cfg(unix)]
    #[test]
    fn capture_process_that_never_writes_is_not_adopted() {
        let mut camera = FfmpegCamera::attach(silent_process(), 4, 4).expect("attach");
        assert!(camera.prime(Duration::from_millis(100)).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn killing_a_stalled_capture_process_ends_the_read() {
        let camera = FfmpegCamera::attach(silent_process(), 4, 4).expect("attach");
        let child = Arc::clone(&camera.child);
        let pump = FramePump::spawn("sleep", Box::new(camera)).expect("pump");

        assert_eq!(
            pump.next_frame(Duration::from_millis(100)).unwrap_err().kind(),
            io::ErrorKind::TimedOut
        );
        drop(pump);

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut exited = false;
        while !exited && Instant::now() < deadline {
            exited = child.lock().unwrap().try_wait().expect("try_wait").is_some();
            thread::sleep(Duration::from_millis(10));
        }
        assert!(exited, "capture process still running");
    }

    #[cfg(unix)]
    #[test]
    fn reads_frames_until_the_process_closes_its_output() {
        // Exactly one 4x4 RGB24 frame, then EOF.
        let child = Command::new("head")
            .args(["-c", "48", "/dev/zero"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()
            .expect("spawn head");
        let mut camera = FfmpegCamera::attach(child, 4, 4).expect("attach");
        camera.prime(Duration::from_secs(5)).expect("first frame");

        assert_eq!(camera.read_frame().expect("primed frame").dimensions(), (4, 4));
        assert!(camera.read_frame().is_err());
    }
}
