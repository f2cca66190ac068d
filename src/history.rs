//! Rotating JSON-lines log of tick snapshots.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use log::debug;
use tokio::{fs, io::AsyncWriteExt};

use crate::{config::HistoryCfg, orchestrator::Snapshot};

/// Upper bound on entries returned by one query.
pub const MAX_QUERY_ENTRIES: u64 = 10_000;
/// Slack added to the entry budget of a range.
const EXTRA_ENTRIES: u64 = 10;

/// Time window accepted by history queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HistoryRange {
    OneMinute,
    FiveMinutes,
    #[default]
    ThirtyMinutes,
    OneHour,
    SixHours,
    OneDay,
    OneWeek,
    OneMonth,
}

impl HistoryRange {
    /// Parses a range key such as `5m` or `1w`; unknown keys select the default.
    pub fn from_key(key: &str) -> Self {
        match key {
            "1m" => HistoryRange::OneMinute,
            "5m" => HistoryRange::FiveMinutes,
            "30m" => HistoryRange::ThirtyMinutes,
            "1h" => HistoryRange::OneHour,
            "6h" => HistoryRange::SixHours,
            "1d" => HistoryRange::OneDay,
            "1w" => HistoryRange::OneWeek,
            "1mo" => HistoryRange::OneMonth,
            _ => HistoryRange::default(),
        }
    }

    pub fn duration(self) -> Duration {
        let secs = match self {
            HistoryRange::OneMinute => 60,
            HistoryRange::FiveMinutes => 300,
            HistoryRange::ThirtyMinutes => 1_800,
            HistoryRange::OneHour => 3_600,
            HistoryRange::SixHours => 21_600,
            HistoryRange::OneDay => 86_400,
            HistoryRange::OneWeek => 604_800,
            HistoryRange::OneMonth => 2_592_000,
        };
        Duration::from_secs(secs)
    }

    /// Entry budget for this range at the given logging interval.
    pub fn entry_limit(self, interval: Duration) -> usize {
        let interval = interval.as_secs().max(1);
        (self.duration().as_secs() / interval + EXTRA_ENTRIES).min(MAX_QUERY_ENTRIES) as usize
    }
}

/// History file plus its numbered backups (`.1` is the newest backup).
#[derive(Debug, Clone)]
pub struct HistoryLog {
    path: PathBuf,
    max_bytes: u64,
    backups: usize,
}

impl HistoryLog {
    pub fn new(path: impl Into<PathBuf>, max_bytes: u64, backups: usize) -> Self {
        Self {
            path: path.into(),
            max_bytes,
            backups,
        }
    }

    pub fn from_config(cfg: &HistoryCfg) -> Self {
        Self::new(cfg.path.clone(), cfg.max_bytes, cfg.backups)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{index}"));
        PathBuf::from(name)
    }

    /// Appends one snapshot as a compact JSON line, rotating first when the
    /// line would push the file past `max_bytes`.
    pub async fn append(&self, snapshot: &Snapshot) -> Result<()> {
        let mut line = serde_json::to_string(snapshot).context("Failed to encode snapshot")?;
        line.push('\n');

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let size = match fs::metadata(&self.path).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        if self.max_bytes > 0 && size > 0 && size + line.len() as u64 > self.max_bytes {
            self.rotate().await?;
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Shifts every backup one slot up and moves the live file to `.1`.
    pub async fn rotate(&self) -> Result<()> {
        if self.backups == 0 {
            fs::write(&self.path, b"")
                .await
                .with_context(|| format!("Failed to truncate {}", self.path.display()))?;
            return Ok(());
        }

        for index in (1..self.backups).rev() {
            let from = self.backup_path(index);
            if fs::try_exists(&from).await.unwrap_or(false) {
                fs::rename(&from, self.backup_path(index + 1)).await?;
            }
        }
        fs::rename(&self.path, self.backup_path(1))
            .await
            .with_context(|| format!("Failed to rotate {}", self.path.display()))?;

        debug!("History rotated: {}", self.path.display());
        Ok(())
    }

    /// Returns the newest entries of `range`, oldest first.
    ///
    /// At most [`HistoryRange::entry_limit`] entries are read, newest files
    /// first. Lines that do not parse are skipped.
    pub async fn query(
        &self,
        range: HistoryRange,
        interval: Duration,
        now_ms: u64,
    ) -> Result<Vec<Snapshot>> {
        let limit = range.entry_limit(interval);
        let cutoff = now_ms.saturating_sub(range.duration().as_millis() as u64);

        let files =
            std::iter::once(self.path.clone()).chain((1..=self.backups).map(|i| self.backup_path(i)));

        let mut newest_first = Vec::new();
        'files: for file in files {
            let content = match fs::read_to_string(&file).await {
                Ok(content) => content,
                Err(_) => continue,
            };
            for line in content.lines().rev() {
                if newest_first.len() >= limit {
                    break 'files;
                }
                match serde_json::from_str::<Snapshot>(line.trim()) {
                    Ok(entry) => newest_first.push(entry),
                    Err(e) => debug!("Skipping history line: {e}"),
                }
            }
        }

        Ok(newest_first
            .into_iter()
            .rev()
            .filter(|entry| entry.timestamp >= cutoff)
            .collect())
    }
}
