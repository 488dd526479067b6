use std::{
    fs,
    path::{Path, PathBuf},
    time::SystemTime,
};

use chrono::{DateTime, Local, TimeDelta};
use tracing::{debug, info, warn};
use wallsync_core::{is_artifact_file_name, parse_artifact_timestamp};

pub const DEFAULT_MAX_COUNT: usize = 10;
pub const DEFAULT_MAX_AGE_DAYS: u32 = 7;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub found: usize,
    pub deleted: usize,
    pub failed: usize,
}

impl CleanupReport {
    #[must_use]
    pub fn kept(&self) -> usize {
        self.found - self.deleted
    }
}

/// Count- and age-bounded pruning of the artifact directory.
#[derive(Debug, Clone)]
pub struct RetentionManager {
    dir: PathBuf,
    max_count: usize,
    max_age_days: u32,
}

impl RetentionManager {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_count: DEFAULT_MAX_COUNT,
            max_age_days: DEFAULT_MAX_AGE_DAYS,
        }
    }

    #[must_use]
    pub fn with_limits(mut self, max_count: usize, max_age_days: u32) -> Self {
        self.max_count = max_count;
        self.max_age_days = max_age_days;
        self
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn cleanup(&self) -> CleanupReport {
        self.cleanup_with(self.max_count, self.max_age_days)
    }

    /// Deletes every artifact past position `max_count` (newest first) and every
    /// artifact older than `max_age_days`. Delete failures are logged and skipped.
    pub fn cleanup_with(&self, max_count: usize, max_age_days: u32) -> CleanupReport {
        let mut artifacts = match self.list_artifacts() {
            Some(artifacts) => artifacts,
            None => return CleanupReport::default(),
        };
        artifacts.sort_by(|a, b| b.1.cmp(&a.1));

        let cutoff = Local::now() - TimeDelta::days(i64::from(max_age_days));
        let mut report = CleanupReport {
            found: artifacts.len(),
            ..CleanupReport::default()
        };

        for (index, (path, created)) in artifacts.iter().enumerate() {
            let reason = if index >= max_count {
                "exceeds max count"
            } else if *created < cutoff {
                "older than max age"
            } else {
                continue;
            };

            match fs::remove_file(path) {
                Ok(()) => {
                    report.deleted += 1;
                    debug!(path = %path.display(), reason, "deleted artifact");
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(path = %path.display(), "failed to delete artifact: {err}");
                }
            }
        }

        if report.found > 0 {
            info!(
                found = report.found,
                deleted = report.deleted,
                failed = report.failed,
                kept = report.kept(),
                "artifact cleanup finished"
            );
        }
        report
    }

    fn list_artifacts(&self) -> Option<Vec<(PathBuf, DateTime<Local>)>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) => {
                debug!(dir = %self.dir.display(), "nothing to clean: {err}");
                return None;
            }
        };

        let artifacts = entries
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_ok_and(|t| t.is_file()))
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                if !is_artifact_file_name(&name) {
                    return None;
                }
                let created = parse_artifact_timestamp(&name)
                    .or_else(|| file_time(&entry.path()))?;
                Some((entry.path(), created))
            })
            .collect();
        Some(artifacts)
    }
}

fn file_time(path: &Path) -> Option<DateTime<Local>> {
    let meta = fs::metadata(path).ok()?;
    let time: SystemTime = meta.created().or_else(|_| meta.modified()).ok()?;
    Some(time.into())
}
