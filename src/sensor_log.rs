//! Sensor log: CSV layout, row producer, annotation merge, recent-rows query.
//!
//! One CSV per session: header `Timestamp, <channels...>, Comment`, one row
//! per sensor cadence tick, comment column empty until an annotation merge
//! fills it. The comment column is the only cell ever rewritten.
//!
//! All file access for the current log goes through one internal lock, so a
//! driver append never interleaves with a merge rewrite and neither ever
//! observes a torn file. Merges rewrite through a sibling temp file and an
//! atomic rename; an interrupted process leaves the original intact.

use anyhow::{anyhow, Result};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::PipelineError;

/// Timestamp key format for sensor rows and annotations.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Rows returned by the recent-rows query.
pub const RECENT_ROW_COUNT: usize = 10;

struct LogState {
    /// Path of the current session's log, kept after the session stops so
    /// recent-rows and artifact download still work until the next session.
    path: Option<PathBuf>,
}

/// The shared sensor-log handle: layout knowledge plus the per-log lock.
pub struct SensorLog {
    channels: Vec<String>,
    state: Mutex<LogState>,
}

impl SensorLog {
    pub fn new(channels: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            channels,
            state: Mutex::new(LogState { path: None }),
        })
    }

    fn header(&self) -> String {
        let mut columns = Vec::with_capacity(self.channels.len() + 2);
        columns.push("Timestamp".to_string());
        columns.extend(self.channels.iter().cloned());
        columns.push("Comment".to_string());
        columns.join(",")
    }

    /// Total column count including timestamp and comment.
    pub fn column_count(&self) -> usize {
        self.channels.len() + 2
    }

    /// Point the log at a new session file, writing the header if the file
    /// does not exist yet.
    pub fn open(&self, path: &Path) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("sensor log lock poisoned"))?;
        if !path.exists() {
            std::fs::write(path, format!("{}\n", self.header()))?;
        }
        state.path = Some(path.to_path_buf());
        Ok(())
    }

    pub fn current_path(&self) -> Option<PathBuf> {
        self.state.lock().ok().and_then(|state| state.path.clone())
    }

    /// Append one data row with an empty comment column.
    pub fn append_row(&self, timestamp: &str, readings: &[f64]) -> Result<()> {
        let state = self
            .state
            .lock()
            .map_err(|_| anyhow!("sensor log lock poisoned"))?;
        let Some(path) = &state.path else {
            return Err(anyhow!("no active sensor log"));
        };
        let mut line = String::with_capacity(64);
        line.push_str(timestamp);
        for reading in readings {
            line.push(',');
            line.push_str(&format_reading(*reading));
        }
        line.push_str(",\n");

        let mut file = OpenOptions::new().append(true).create(true).open(path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Merge pending annotations into the current log. Rows whose timestamp
    /// key matches a pending entry are padded to header width and get their
    /// comment column replaced; the header and unrelated rows are preserved
    /// byte for byte. Merged keys are removed from `pending`; keys matching
    /// no row stay pending for the next cycle. Returns the merged count.
    ///
    /// A missing or not-yet-open log merges nothing and is not an error. An
    /// I/O failure maps to [`PipelineError::LogMergeFailure`] and leaves
    /// `pending` untouched; the rewrite goes through a sibling temp file and
    /// rename so the log is never left truncated.
    pub fn merge_comments(&self, pending: &mut BTreeMap<String, String>) -> Result<usize> {
        let state = self
            .state
            .lock()
            .map_err(|_| anyhow!("sensor log lock poisoned"))?;
        let Some(path) = &state.path else {
            return Ok(0);
        };
        if !path.exists() {
            return Ok(0);
        }

        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow!(PipelineError::LogMergeFailure(e.to_string())))?;
        let columns = self.column_count();
        let mut merged = Vec::new();
        let mut out = String::with_capacity(raw.len());
        for (i, line) in raw.lines().enumerate() {
            if i == 0 || line.is_empty() {
                out.push_str(line);
                out.push('\n');
                continue;
            }
            let key = line.split(',').next().unwrap_or("");
            if let Some(comment) = pending.get(key) {
                let mut fields: Vec<&str> = line.split(',').collect();
                while fields.len() < columns {
                    fields.push("");
                }
                let keep = fields.len() - 1;
                let mut row: Vec<&str> = fields[..keep].to_vec();
                row.push(comment);
                out.push_str(&row.join(","));
                out.push('\n');
                merged.push(key.to_string());
            } else {
                out.push_str(line);
                out.push('\n');
            }
        }

        if merged.is_empty() {
            return Ok(0);
        }

        let tmp = path.with_extension("csv.tmp");
        std::fs::write(&tmp, out.as_bytes())
            .map_err(|e| anyhow!(PipelineError::LogMergeFailure(e.to_string())))?;
        std::fs::rename(&tmp, path)
            .map_err(|e| anyhow!(PipelineError::LogMergeFailure(e.to_string())))?;

        for key in &merged {
            pending.remove(key);
        }
        Ok(merged.len())
    }

    /// Last `limit` data rows (header excluded), comment column excluded,
    /// numeric fields reformatted to two decimal places, non-numeric fields
    /// passed through unchanged.
    pub fn recent_rows(&self, limit: usize) -> Result<Vec<Vec<String>>> {
        let state = self
            .state
            .lock()
            .map_err(|_| anyhow!("sensor log lock poisoned"))?;
        let Some(path) = &state.path else {
            return Ok(Vec::new());
        };
        if !path.exists() {
            return Ok(Vec::new());
        }

        let raw = std::fs::read_to_string(path)?;
        // Rows without at least a timestamp and one reading are skipped.
        let data_rows: Vec<&str> = raw
            .lines()
            .skip(1)
            .filter(|line| line.contains(','))
            .collect();
        let start = data_rows.len().saturating_sub(limit);
        Ok(data_rows[start..]
            .iter()
            .map(|line| {
                let fields: Vec<&str> = line.split(',').collect();
                // Drop the trailing comment column.
                let keep = fields.len() - 1;
                fields[..keep]
                    .iter()
                    .enumerate()
                    .map(|(i, field)| {
                        if i == 0 {
                            return field.to_string();
                        }
                        match field.parse::<f64>() {
                            Ok(value) => format_reading(value),
                            Err(_) => field.to_string(),
                        }
                    })
                    .collect()
            })
            .collect())
    }
}

// ----------------------------------------------------------------------------
// Sensor driver
// ----------------------------------------------------------------------------

/// Signal surface the recording session drives: begin writing rows to a new
/// log, stop writing rows.
pub trait SensorDriver: Send + Sync {
    fn begin(&self, log_path: &Path) -> Result<()>;
    fn end(&self);
}

/// Deterministic built-in row producer standing in for the external bench
/// hardware: one row per cadence tick while a session is active.
pub struct SyntheticSensorDriver {
    log: Arc<SensorLog>,
    active: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl SyntheticSensorDriver {
    pub fn spawn(log: Arc<SensorLog>, cadence: Duration) -> Arc<Self> {
        let active = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(AtomicBool::new(false));

        let thread_log = log.clone();
        let thread_active = active.clone();
        let thread_stop = stop.clone();
        let channel_count = log.channels.len();
        let join = std::thread::spawn(move || {
            let mut tick = 0u64;
            while !thread_stop.load(Ordering::SeqCst) {
                if thread_active.load(Ordering::SeqCst) {
                    tick += 1;
                    let timestamp = chrono::Local::now().format(TIMESTAMP_FORMAT).to_string();
                    let readings = synthetic_readings(channel_count, tick);
                    if let Err(err) = thread_log.append_row(&timestamp, &readings) {
                        log::warn!("sensor row append failed: {}", err);
                    }
                }
                nap(cadence, &thread_stop);
            }
        });

        Arc::new(Self {
            log,
            active,
            stop,
            join: Mutex::new(Some(join)),
        })
    }

    /// Stop the producer thread. Idempotent; used at pipeline shutdown.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Ok(mut join) = self.join.lock() {
            if let Some(handle) = join.take() {
                if handle.join().is_err() {
                    log::error!("sensor driver thread panicked");
                }
            }
        }
    }
}

impl SensorDriver for SyntheticSensorDriver {
    fn begin(&self, log_path: &Path) -> Result<()> {
        self.log.open(log_path)?;
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn end(&self) {
        // The log path stays set so post-session queries keep working.
        self.active.store(false, Ordering::SeqCst);
    }
}

/// Render a reading with two decimal places, rounding half-up on the
/// decimal digits rather than the binary value: `21.345` becomes `"21.35"`,
/// where `{:.2}` would print `"21.34"` from the nearest-f64 `21.3449…`.
fn format_reading(value: f64) -> String {
    if !value.is_finite() {
        return format!("{:.2}", value);
    }
    // f64 Display is the shortest decimal string that round-trips, so the
    // digits we round are the ones the operator would write.
    round_half_up(&value.to_string(), 2).unwrap_or_else(|| format!("{:.2}", value))
}

fn round_half_up(text: &str, places: usize) -> Option<String> {
    let (sign, digits) = match text.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", text),
    };
    let (int_part, frac_part) = digits.split_once('.').unwrap_or((digits, ""));
    if int_part.is_empty()
        || !int_part.bytes().all(|b| b.is_ascii_digit())
        || !frac_part.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    if frac_part.len() <= places {
        return Some(format!(
            "{}{}.{:0<width$}",
            sign,
            int_part,
            frac_part,
            width = places
        ));
    }
    let mut kept: u128 = format!("{}{}", int_part, &frac_part[..places]).parse().ok()?;
    if frac_part.as_bytes()[places] >= b'5' {
        kept += 1;
    }
    let scaled = format!("{:0>width$}", kept, width = places + 1);
    let split = scaled.len() - places;
    Some(format!("{}{}.{}", sign, &scaled[..split], &scaled[split..]))
}

/// Plausible bench temperatures, fully determined by channel and tick.
fn synthetic_readings(channels: usize, tick: u64) -> Vec<f64> {
    (0..channels)
        .map(|channel| 20.0 + channel as f64 * 0.5 + (tick % 10) as f64 * 0.15)
        .collect()
}

/// Sleep `total` in short naps so a stop request is honored promptly.
pub(crate) fn nap(total: Duration, stop: &AtomicBool) {
    let step = Duration::from_millis(50);
    let mut remaining = total;
    while !remaining.is_zero() && !stop.load(Ordering::SeqCst) {
        let slice = remaining.min(step);
        std::thread::sleep(slice);
        remaining = remaining.saturating_sub(slice);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_log() -> (tempfile::TempDir, Arc<SensorLog>, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = SensorLog::new(vec!["Thermistor1".to_string(), "Thermocouple".to_string()]);
        let path = dir.path().join("run_sensor_log.csv");
        log.open(&path).expect("open");
        (dir, log, path)
    }

    #[test]
    fn open_writes_header_once() {
        let (_dir, log, path) = test_log();
        log.open(&path).expect("reopen");
        let raw = std::fs::read_to_string(&path).expect("read");
        assert_eq!(raw, "Timestamp,Thermistor1,Thermocouple,Comment\n");
    }

    #[test]
    fn appended_rows_have_empty_comment() {
        let (_dir, log, path) = test_log();
        log.append_row("2026-08-24 12:00:00", &[21.345, 400.0])
            .expect("append");
        let raw = std::fs::read_to_string(&path).expect("read");
        assert!(raw.ends_with("2026-08-24 12:00:00,21.35,400.00,\n"));
    }

    #[test]
    fn merge_sets_only_the_matching_row() {
        let (_dir, log, path) = test_log();
        log.append_row("2026-08-24 12:00:00", &[21.0, 400.0])
            .expect("append");
        log.append_row("2026-08-24 12:00:02", &[22.0, 401.0])
            .expect("append");

        let mut pending = BTreeMap::new();
        pending.insert(
            "2026-08-24 12:00:02".to_string(),
            "catalyst added".to_string(),
        );
        let merged = log.merge_comments(&mut pending).expect("merge");
        assert_eq!(merged, 1);
        assert!(pending.is_empty());

        let raw = std::fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines[0], "Timestamp,Thermistor1,Thermocouple,Comment");
        assert_eq!(lines[1], "2026-08-24 12:00:00,21.00,400.00,");
        assert_eq!(lines[2], "2026-08-24 12:00:02,22.00,401.00,catalyst added");
    }

    #[test]
    fn merge_pads_short_rows_to_header_width() {
        let (_dir, log, path) = test_log();
        // A row the external driver wrote without the trailing comma.
        let mut raw = std::fs::read_to_string(&path).expect("read");
        raw.push_str("2026-08-24 12:00:00,21.00,400.00\n");
        std::fs::write(&path, raw).expect("write");

        let mut pending = BTreeMap::new();
        pending.insert("2026-08-24 12:00:00".to_string(), "note".to_string());
        assert_eq!(log.merge_comments(&mut pending).expect("merge"), 1);

        let raw = std::fs::read_to_string(&path).expect("read");
        assert!(raw.contains("2026-08-24 12:00:00,21.00,400.00,note\n"));
    }

    #[test]
    fn unmatched_annotations_stay_pending() {
        let (_dir, log, _path) = test_log();
        let mut pending = BTreeMap::new();
        pending.insert("2030-01-01 00:00:00".to_string(), "early".to_string());
        assert_eq!(log.merge_comments(&mut pending).expect("merge"), 0);
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn merge_without_a_log_is_not_an_error() {
        let log = SensorLog::new(vec!["Thermistor1".to_string()]);
        let mut pending = BTreeMap::new();
        pending.insert("k".to_string(), "v".to_string());
        assert_eq!(log.merge_comments(&mut pending).expect("merge"), 0);
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn readings_round_half_up_on_decimal_digits() {
        assert_eq!(format_reading(21.345), "21.35");
        assert_eq!(format_reading(2.675), "2.68");
        assert_eq!(format_reading(21.0), "21.00");
        assert_eq!(format_reading(0.1), "0.10");
        assert_eq!(format_reading(-1.005), "-1.01");
        assert_eq!(format_reading(399.999), "400.00");
    }

    #[test]
    fn merge_failure_leaves_pending_untouched() {
        let (_dir, log, path) = test_log();
        log.append_row("2026-08-24 12:00:00", &[21.0, 400.0])
            .expect("append");
        // A directory squatting on the sibling temp path fails the rewrite.
        std::fs::create_dir(path.with_extension("csv.tmp")).expect("block tmp");

        let mut pending = BTreeMap::new();
        pending.insert("2026-08-24 12:00:00".to_string(), "note".to_string());
        let err = log.merge_comments(&mut pending).expect_err("blocked merge");
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::LogMergeFailure(_))
        ));
        assert_eq!(pending.len(), 1);

        let raw = std::fs::read_to_string(&path).expect("read");
        assert!(!raw.contains("note"));
    }

    #[test]
    fn recent_rows_skips_rows_without_readings() {
        let (_dir, log, path) = test_log();
        log.append_row("2026-08-24 12:00:00", &[21.0, 400.0])
            .expect("append");
        let mut raw = std::fs::read_to_string(&path).expect("read");
        raw.push_str("strayline\n");
        std::fs::write(&path, raw).expect("write");

        let rows = log.recent_rows(RECENT_ROW_COUNT).expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0], "2026-08-24 12:00:00");
    }

    #[test]
    fn recent_rows_formats_numbers_and_drops_comment() {
        let (_dir, log, path) = test_log();
        let mut raw = std::fs::read_to_string(&path).expect("read");
        raw.push_str("12:00:00,21.345,bad-value,comment\n");
        std::fs::write(&path, raw).expect("write");

        let rows = log.recent_rows(RECENT_ROW_COUNT).expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0], vec!["12:00:00", "21.35", "bad-value"]);
    }

    #[test]
    fn recent_rows_returns_only_the_tail() {
        let (_dir, log, _path) = test_log();
        for i in 0..15 {
            log.append_row(&format!("12:00:{:02}", i), &[20.0 + i as f64, 0.0])
                .expect("append");
        }
        let rows = log.recent_rows(RECENT_ROW_COUNT).expect("rows");
        assert_eq!(rows.len(), RECENT_ROW_COUNT);
        assert_eq!(rows[0][0], "12:00:05");
        assert_eq!(rows[9][0], "12:00:14");
    }

    #[test]
    fn synthetic_driver_appends_rows_while_active() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = SensorLog::new(vec!["Thermistor1".to_string()]);
        let driver = SyntheticSensorDriver::spawn(log.clone(), Duration::from_millis(20));

        let path = dir.path().join("drv_sensor_log.csv");
        driver.begin(&path).expect("begin");
        std::thread::sleep(Duration::from_millis(120));
        driver.end();
        driver.shutdown();

        let rows = log.recent_rows(RECENT_ROW_COUNT).expect("rows");
        assert!(!rows.is_empty(), "driver should have appended rows");
    }
}
