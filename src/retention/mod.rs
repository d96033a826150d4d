mod disk;
mod manager;

pub use disk::{longest_mount, SpaceProbe, SpaceUsage, SysinfoSpaceProbe};
pub use manager::{CleanupReport, RetentionManager};
