use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use log::{debug, warn};
use serde::Serialize;

const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// One output file. Open while `ended_at` is `None`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub filename: String,
    pub path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Segment {
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// `prefix-YYYYMMDD-HHMMSS.ext` in UTC, lexically sortable by start time.
#[derive(Debug, Clone)]
pub struct SegmentNamer {
    prefix: String,
    extension: String,
}

impl SegmentNamer {
    pub fn new(prefix: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            extension: extension.into().trim_start_matches('.').to_string(),
        }
    }

    pub fn file_name(&self, started_at: DateTime<Utc>) -> String {
        format!(
            "{}-{}.{}",
            self.prefix,
            started_at.format(TIMESTAMP_FORMAT),
            self.extension
        )
    }

    fn file_name_with_suffix(&self, started_at: DateTime<Utc>, suffix: u32) -> String {
        format!(
            "{}-{}-{}.{}",
            self.prefix,
            started_at.format(TIMESTAMP_FORMAT),
            suffix,
            self.extension
        )
    }

    /// Start time encoded in a file name produced by this namer.
    pub fn parse(&self, file_name: &str) -> Option<DateTime<Utc>> {
        let stem = file_name
            .strip_prefix(&self.prefix)?
            .strip_prefix('-')?
            .strip_suffix(&self.extension)?
            .strip_suffix('.')?;

        // Optional `-N` collision suffix after the 15-char timestamp.
        let timestamp = stem.get(..15)?;
        let rest = &stem[15..];
        if !rest.is_empty() {
            let suffix = rest.strip_prefix('-')?;
            if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
        }

        NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    }

    /// First free name for a segment starting at `started_at`. `taken`
    /// reports names already claimed but possibly not yet on disk.
    pub fn next_available<F>(&self, dir: &Path, started_at: DateTime<Utc>, taken: F) -> (String, PathBuf)
    where
        F: Fn(&str) -> bool,
    {
        let mut name = self.file_name(started_at);
        let mut suffix = 1;
        while taken(&name) || dir.join(&name).exists() {
            name = self.file_name_with_suffix(started_at, suffix);
            suffix += 1;
        }
        let path = dir.join(&name);
        (name, path)
    }
}

/// Open segment plus closed segments ordered by start time.
#[derive(Debug, Default)]
pub struct SegmentLedger {
    open: Option<Segment>,
    closed: Vec<Segment>,
}

impl SegmentLedger {
    /// Adopt files from earlier runs that match the naming scheme as closed
    /// segments. Their end time is the file's modification time.
    pub fn scan(dir: &Path, namer: &SegmentNamer) -> Result<Self> {
        let mut ledger = SegmentLedger::default();
        let entries = fs::read_dir(dir)
            .with_context(|| format!("failed to list segment directory {}", dir.display()))?;

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("skipping unreadable entry in {}: {err}", dir.display());
                    continue;
                }
            };
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let Some(started_at) = namer.parse(file_name) else {
                continue;
            };
            let ended_at = entry
                .metadata()
                .and_then(|meta| meta.modified())
                .map(DateTime::<Utc>::from)
                .unwrap_or(started_at)
                .max(started_at);

            ledger.closed.push(Segment {
                filename: file_name.to_string(),
                path: entry.path(),
                started_at,
                ended_at: Some(ended_at),
            });
        }

        ledger.sort_closed();
        debug!("adopted {} existing segments from {}", ledger.closed.len(), dir.display());
        Ok(ledger)
    }

    fn sort_closed(&mut self) {
        self.closed
            .sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.filename.cmp(&b.filename)));
    }

    pub fn open_segment(&self) -> Option<&Segment> {
        self.open.as_ref()
    }

    pub fn closed(&self) -> &[Segment] {
        &self.closed
    }

    pub fn contains(&self, filename: &str) -> bool {
        self.open.as_ref().is_some_and(|open| open.filename == filename)
            || self.closed.iter().any(|segment| segment.filename == filename)
    }

    /// Replaces any open segment; callers close first.
    pub fn begin(&mut self, segment: Segment) {
        if let Some(previous) = self.open.take() {
            warn!("segment {} was still open when a new one began", previous.filename);
            self.push_closed(Segment {
                ended_at: Some(previous.started_at),
                ..previous
            });
        }
        self.open = Some(segment);
    }

    /// Close the open segment at `ended_at`. Returns the closed segment.
    pub fn close_open(&mut self, ended_at: DateTime<Utc>) -> Option<Segment> {
        let mut segment = self.open.take()?;
        segment.ended_at = Some(ended_at.max(segment.started_at));
        self.push_closed(segment.clone());
        Some(segment)
    }

    fn push_closed(&mut self, segment: Segment) {
        let needs_sort = self
            .closed
            .last()
            .is_some_and(|last| last.started_at > segment.started_at);
        self.closed.push(segment);
        if needs_sort {
            self.sort_closed();
        }
    }

    /// Forget a closed segment after its file was deleted. The open segment
    /// cannot be removed.
    pub fn remove_closed(&mut self, filename: &str) -> Option<Segment> {
        let index = self.closed.iter().position(|segment| segment.filename == filename)?;
        Some(self.closed.remove(index))
    }
}

/// Ledger shared between the capture thread and its readers.
#[derive(Debug, Clone, Default)]
pub struct SharedLedger {
    inner: Arc<Mutex<SegmentLedger>>,
}

impl SharedLedger {
    pub fn new(ledger: SegmentLedger) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ledger)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, SegmentLedger> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn current(&self) -> Option<Segment> {
        self.lock().open_segment().cloned()
    }

    pub fn closed(&self) -> Vec<Segment> {
        self.lock().closed().to_vec()
    }

    pub fn remove_closed(&self, filename: &str) -> Option<Segment> {
        self.lock().remove_closed(filename)
    }
}
