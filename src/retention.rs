//! Artifact retention.
//!
//! A background sweep deletes session artifacts (`.csv` logs and `.avi`
//! videos) older than the configured age, keyed on filesystem creation time
//! where available and modification time otherwise. Every failure is logged
//! and skipped; nothing stops the next sweep. The janitor runs on its own
//! cadence, independent of session state.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use crate::sensor_log::nap;
use crate::PipelineError;

/// File extensions the janitor considers session artifacts.
pub const ARTIFACT_EXTENSIONS: [&str; 2] = ["csv", "avi"];

/// Outcome of one sweep.
#[derive(Clone, Copy, Debug, Default)]
pub struct SweepStats {
    pub examined: usize,
    pub deleted: usize,
    pub failed: usize,
}

pub struct RetentionJanitor {
    stop: Arc<AtomicBool>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl RetentionJanitor {
    pub fn spawn(data_dir: PathBuf, max_age: Duration, sweep_interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let join = std::thread::spawn(move || {
            while !thread_stop.load(Ordering::SeqCst) {
                let stats = sweep(&data_dir, max_age);
                if stats.deleted > 0 || stats.failed > 0 {
                    log::info!(
                        "retention sweep: examined={} deleted={} failed={}",
                        stats.examined,
                        stats.deleted,
                        stats.failed
                    );
                }
                nap(sweep_interval, &thread_stop);
            }
        });
        Self {
            stop,
            join: Mutex::new(Some(join)),
        }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Ok(mut join) = self.join.lock() {
            if let Some(handle) = join.take() {
                if handle.join().is_err() {
                    log::error!("retention janitor thread panicked");
                }
            }
        }
    }
}

/// Delete every artifact in `dir` older than `max_age`. Exposed so tests and
/// operators can run a sweep directly.
pub fn sweep(dir: &Path, max_age: Duration) -> SweepStats {
    let mut stats = SweepStats::default();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            log::warn!("retention sweep cannot read {}: {}", dir.display(), err);
            return stats;
        }
    };

    let now = SystemTime::now();
    for entry in entries.flatten() {
        let path = entry.path();
        if !is_artifact(&path) {
            continue;
        }
        stats.examined += 1;
        let Some(age) = artifact_age(&path, now) else {
            continue;
        };
        if age <= max_age {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => {
                stats.deleted += 1;
                log::debug!("retention deleted {} (age {:?})", path.display(), age);
            }
            Err(err) => {
                stats.failed += 1;
                log::warn!(
                    "{}",
                    PipelineError::RetentionDeleteFailure(format!(
                        "{}: {}",
                        path.display(),
                        err
                    ))
                );
            }
        }
    }
    stats
}

fn is_artifact(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ARTIFACT_EXTENSIONS.contains(&ext))
            .unwrap_or(false)
}

/// Creation time where the filesystem records one, modification time as the
/// portable fallback.
fn artifact_age(path: &Path, now: SystemTime) -> Option<Duration> {
    let meta = std::fs::metadata(path).ok()?;
    let stamp = meta.created().or_else(|_| meta.modified()).ok()?;
    now.duration_since(stamp).ok()
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_deletes_stale_artifacts_and_keeps_fresh_ones() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stale_log = dir.path().join("old_sensor_log.csv");
        let stale_video = dir.path().join("old_video.avi");
        std::fs::write(&stale_log, "Timestamp,Comment\n").expect("write");
        std::fs::write(&stale_video, b"RIFF").expect("write");

        std::thread::sleep(Duration::from_millis(1_100));
        let fresh = dir.path().join("new_sensor_log.csv");
        std::fs::write(&fresh, "Timestamp,Comment\n").expect("write");

        let stats = sweep(dir.path(), Duration::from_secs(1));
        assert_eq!(stats.examined, 3);
        assert_eq!(stats.deleted, 2);
        assert_eq!(stats.failed, 0);
        assert!(!stale_log.exists());
        assert!(!stale_video.exists());
        assert!(fresh.exists());
    }

    #[test]
    fn sweep_ignores_unrelated_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let other = dir.path().join("notes.txt");
        std::fs::write(&other, "keep me").expect("write");

        let stats = sweep(dir.path(), Duration::from_secs(0));
        assert_eq!(stats.examined, 0);
        assert!(other.exists());
    }

    #[test]
    fn sweep_of_missing_directory_is_harmless() {
        let stats = sweep(Path::new("/nonexistent/rigcam"), Duration::from_secs(1));
        assert_eq!(stats.examined, 0);
        assert_eq!(stats.deleted, 0);
    }

    #[test]
    fn janitor_thread_stops_cleanly() {
        let dir = tempfile::tempdir().expect("tempdir");
        let janitor = RetentionJanitor::spawn(
            dir.path().to_path_buf(),
            Duration::from_secs(600),
            Duration::from_millis(20),
        );
        std::thread::sleep(Duration::from_millis(60));
        janitor.stop();
    }
}
