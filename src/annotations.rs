//! Annotation batching.
//!
//! `submit` never blocks and never touches the log file: entries go into an
//! unbounded channel and return immediately. A flush thread wakes on a fixed
//! cadence, drains the channel, collapses duplicate timestamps keeping the
//! last value, and asks the sensor log for one atomic merge pass. Entries
//! the merge could not place stay pending: a failed merge requeues
//! everything, and an annotation that raced its row's append lands on the
//! next cycle. The pending set is bounded; past the cap the oldest keys are
//! evicted so bad timestamps cannot grow memory forever.

use crossbeam_channel::{unbounded, Sender};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::sensor_log::{nap, SensorLog};

/// Cap on annotations awaiting a matching log row.
pub const MAX_PENDING: usize = 256;

enum BatchMsg {
    Entry { timestamp: String, text: String },
    /// Session start wipes per-session annotation state.
    Clear,
}

pub struct AnnotationBatcher {
    tx: Sender<BatchMsg>,
    stop: Arc<AtomicBool>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl AnnotationBatcher {
    pub fn spawn(log: Arc<SensorLog>, flush_interval: Duration) -> Self {
        let (tx, rx) = unbounded();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();

        let join = std::thread::spawn(move || {
            let mut pending: BTreeMap<String, String> = BTreeMap::new();
            loop {
                let stopping = thread_stop.load(Ordering::SeqCst);

                while let Ok(msg) = rx.try_recv() {
                    match msg {
                        BatchMsg::Entry { timestamp, text } => {
                            // Last write wins per timestamp.
                            pending.insert(timestamp, text);
                        }
                        BatchMsg::Clear => pending.clear(),
                    }
                }
                while pending.len() > MAX_PENDING {
                    pending.pop_first();
                }

                if !pending.is_empty() {
                    match log.merge_comments(&mut pending) {
                        Ok(0) => {}
                        Ok(merged) => log::debug!("annotation flush merged {} entries", merged),
                        // Entries stay in `pending` for the next cycle.
                        Err(err) => log::warn!("annotation flush failed: {}", err),
                    }
                }

                if stopping {
                    break;
                }
                nap(flush_interval, &thread_stop);
            }
        });

        Self {
            tx,
            stop,
            join: Mutex::new(Some(join)),
        }
    }

    /// Enqueue one annotation. Fire-and-forget: the merge happens on the
    /// next flush cycle. Commas and line breaks in the text are rewritten so
    /// the entry stays one CSV cell.
    pub fn submit(&self, timestamp: &str, text: &str) {
        let msg = BatchMsg::Entry {
            timestamp: timestamp.trim().to_string(),
            text: sanitize_comment(text),
        };
        if self.tx.send(msg).is_err() {
            log::warn!("annotation dropped: batcher is stopped");
        }
    }

    /// Drop every queued and pending annotation. Called at session start.
    pub fn clear_pending(&self) {
        let _ = self.tx.send(BatchMsg::Clear);
    }

    /// Stop the flush thread after one final drain-and-merge attempt.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Ok(mut join) = self.join.lock() {
            if let Some(handle) = join.take() {
                if handle.join().is_err() {
                    log::error!("annotation flush thread panicked");
                }
            }
        }
    }
}

/// Keep an annotation inside a single CSV cell.
fn sanitize_comment(text: &str) -> String {
    text.replace(['\r', '\n'], " ").replace(',', ";")
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comments_are_kept_to_one_cell() {
        assert_eq!(sanitize_comment("a,b\nc"), "a;b c");
        assert_eq!(sanitize_comment("plain"), "plain");
    }

    #[test]
    fn flush_merges_into_the_log() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = SensorLog::new(vec!["Thermistor1".to_string()]);
        let path = dir.path().join("run_sensor_log.csv");
        log.open(&path).expect("open");
        log.append_row("2026-08-24 09:00:00", &[21.0]).expect("row");

        let batcher = AnnotationBatcher::spawn(log.clone(), Duration::from_millis(30));
        batcher.submit("2026-08-24 09:00:00", "first");
        batcher.submit("2026-08-24 09:00:00", "second");
        std::thread::sleep(Duration::from_millis(150));
        batcher.stop();

        let raw = std::fs::read_to_string(&path).expect("read");
        // Duplicate timestamps collapse to the last submitted value.
        assert!(raw.contains("2026-08-24 09:00:00,21.00,second\n"), "{raw}");
        assert!(!raw.contains("first"));
    }

    #[test]
    fn stop_performs_a_final_flush() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = SensorLog::new(vec!["Thermistor1".to_string()]);
        let path = dir.path().join("run_sensor_log.csv");
        log.open(&path).expect("open");
        log.append_row("2026-08-24 09:00:02", &[22.0]).expect("row");

        // Long interval: only the stop-path flush can merge this.
        let batcher = AnnotationBatcher::spawn(log.clone(), Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(30)); // let the first cycle pass
        batcher.submit("2026-08-24 09:00:02", "late note");
        batcher.stop();

        let raw = std::fs::read_to_string(&path).expect("read");
        assert!(raw.contains("late note"), "{raw}");
    }

    #[test]
    fn clear_drops_queued_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = SensorLog::new(vec!["Thermistor1".to_string()]);
        let path = dir.path().join("run_sensor_log.csv");
        log.open(&path).expect("open");
        log.append_row("2026-08-24 09:00:04", &[23.0]).expect("row");

        let batcher = AnnotationBatcher::spawn(log.clone(), Duration::from_secs(60));
        batcher.submit("2026-08-24 09:00:04", "stale");
        batcher.clear_pending();
        batcher.stop();

        let raw = std::fs::read_to_string(&path).expect("read");
        assert!(!raw.contains("stale"));
    }
}
