use std::{
    thread,
    time::{Duration, Instant},
};

use tokio_util::sync::CancellationToken;

pub mod clock;
pub mod logging;

pub use clock::{Clock, ManualClock, MonotonicClock, SystemClock};
pub use logging::init_logging;

/// Sleeps in short slices so a blocking loop is not held up at shutdown.
/// Returns false if cancelled.
pub fn sleep_cancellable(total: Duration, cancel_token: &CancellationToken) -> bool {
    let slice = Duration::from_millis(50);
    let deadline = Instant::now() + total;
    while Instant::now() < deadline {
        if cancel_token.is_cancelled() {
            return false;
        }
        thread::sleep(slice.min(deadline.saturating_duration_since(Instant::now())));
    }
    !cancel_token.is_cancelled()
}

/// `base * 2^(attempt - 1)`, capped at `max`. Attempt 0 and 1 both give `base`.
pub fn exponential_backoff(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(max)
}

/// Human-readable byte count for log lines.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    for unit in UNITS {
        if value < 1024.0 {
            return format!("{value:.2} {unit}");
        }
        value /= 1024.0;
    }
    format!("{value:.2} PB")
}
