use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::{anyhow, Result};
use serde::Serialize;
use sysinfo::Disks;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SpaceUsage {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

impl SpaceUsage {
    pub fn free_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.available_bytes as f64 * 100.0 / self.total_bytes as f64
    }
}

/// Free space of the filesystem holding a path.
pub trait SpaceProbe: Send + Sync {
    fn usage(&self, path: &Path) -> Result<SpaceUsage>;
}

/// Reads mounted disks through `sysinfo`; the mount point with the longest
/// prefix of the path wins.
pub struct SysinfoSpaceProbe {
    disks: Mutex<Disks>,
}

impl SysinfoSpaceProbe {
    pub fn new() -> Self {
        Self {
            disks: Mutex::new(Disks::new_with_refreshed_list()),
        }
    }
}

impl Default for SysinfoSpaceProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SpaceProbe for SysinfoSpaceProbe {
    fn usage(&self, path: &Path) -> Result<SpaceUsage> {
        let target = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());

        let mut disks = match self.disks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Mounts come and go (USB media); refresh the list, not just the sizes.
        disks.refresh_list();

        let mounts: Vec<PathBuf> = disks
            .list()
            .iter()
            .map(|disk| disk.mount_point().to_path_buf())
            .collect();
        let index = longest_mount(&target, &mounts)
            .ok_or_else(|| anyhow!("no mounted filesystem holds {}", target.display()))?;

        let disk = &disks.list()[index];
        Ok(SpaceUsage {
            total_bytes: disk.total_space(),
            available_bytes: disk.available_space(),
        })
    }
}

/// Index of the mount point that is the longest component-wise prefix of
/// `path`.
pub fn longest_mount(path: &Path, mounts: &[PathBuf]) -> Option<usize> {
    mounts
        .iter()
        .enumerate()
        .filter(|(_, mount)| path.starts_with(mount))
        .max_by_key(|(_, mount)| mount.components().count())
        .map(|(index, _)| index)
}
