use crate::config::Config;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Counts from one pass over the upload tree
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Regular files examined
    pub scanned: u64,
    /// Expired files removed
    pub deleted: u64,
    /// Expired files that disappeared before we could remove them
    pub vanished: u64,
    /// Expired files that could not be removed
    pub failed: u64,
}

/// Deletes stored files older than the retention period
///
/// Runs without coordinating with uploads or downloads. Fresh writes are
/// never old enough to match, and a file that disappears while being
/// examined is skipped.
#[derive(Debug, Clone)]
pub struct Reaper {
    root: PathBuf,
    expiration: Duration,
    interval: Duration,
}

impl Reaper {
    pub fn new(root: impl Into<PathBuf>, expiration: Duration, interval: Duration) -> Self {
        Self {
            root: root.into(),
            expiration,
            interval,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.storage.upload_root.clone(),
            config.expiration(),
            config.sweep_interval(),
        )
    }

    /// Sweep once per interval until `shutdown` is cancelled
    ///
    /// The first sweep runs immediately.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            root = %self.root.display(),
            expiration_secs = self.expiration.as_secs(),
            interval_secs = self.interval.as_secs(),
            "Reaper started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.sweep(SystemTime::now()).await;
                    info!(
                        scanned = report.scanned,
                        deleted = report.deleted,
                        vanished = report.vanished,
                        failed = report.failed,
                        "Expiry sweep finished"
                    );
                }
            }
        }

        info!("Reaper stopped");
    }

    /// Walk the whole tree once and delete files that expired before `now`
    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub async fn sweep(&self, now: SystemTime) -> SweepReport {
        let mut report = SweepReport::default();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "Failed to list directory");
                    continue;
                }
            };

            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(dir = %dir.display(), error = %e, "Failed to read directory entry");
                        break;
                    }
                };

                let path = entry.path();
                let metadata = match tokio::fs::symlink_metadata(&path).await {
                    Ok(metadata) => metadata,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Failed to stat file");
                        continue;
                    }
                };

                if metadata.is_dir() {
                    pending.push(path);
                    continue;
                }
                if !metadata.is_file() {
                    continue;
                }

                report.scanned += 1;

                let Ok(modified) = metadata.modified() else {
                    continue;
                };
                if !self.is_expired(modified, now) {
                    continue;
                }

                self.delete(&path, &mut report).await;
            }
        }

        report
    }

    fn is_expired(&self, modified: SystemTime, now: SystemTime) -> bool {
        // Timestamps in the future count as fresh
        now.duration_since(modified)
            .map(|age| age > self.expiration)
            .unwrap_or(false)
    }

    async fn delete(&self, path: &Path, report: &mut SweepReport) {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                report.deleted += 1;
                metrics::counter!("reaper.deleted").increment(1);
                info!(path = %path.display(), "Deleted expired file");
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                report.vanished += 1;
                debug!(path = %path.display(), "Expired file already gone");
            }
            Err(e) => {
                report.failed += 1;
                metrics::counter!("reaper.failed").increment(1);
                warn!(path = %path.display(), error = %e, "Failed to delete expired file");
            }
        }
    }
}
