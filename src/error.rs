/// Fault taxonomy shared by the components. Every variant is handled inside
/// the component that observes it; none of them stop the appliance.
#[derive(Debug, thiserror::Error)]
pub enum FaultKind {
    /// Camera, serial port or encoder binary missing. The component degrades.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// A single failed read. Retried with backoff, escalates after a streak.
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    /// The encoder exited while a segment was open.
    #[error("encoder process crashed: {0}")]
    ProcessCrash(String),

    /// Free space still below threshold after a cleanup cycle.
    #[error("disk space exhausted: {free_percent:.1}% free, {target_percent:.1}% required")]
    ResourceExhausted { free_percent: f64, target_percent: f64 },

    /// Malformed sentence or unparseable detection payload. Counted, dropped.
    #[error("corrupt input: {0}")]
    CorruptInput(String),
}

impl FaultKind {
    pub fn is_corrupt_input(&self) -> bool {
        matches!(self, FaultKind::CorruptInput(_))
    }
}
