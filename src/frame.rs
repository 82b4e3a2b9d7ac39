//! Frame values and capture-rate estimation.
//!
//! - `Frame`: one captured image as encoded JPEG bytes plus capture timing.
//!   Immutable once produced; consumers share the buffer through a reference
//!   count, never by copying pixels.
//! - `RateEstimator`: sliding window over recent capture instants, used to
//!   pick the frame rate for a session's video writer.
//!
//! The estimator is owned by the capture thread; every other component sees
//! only the value sampled when a session's writer is created.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

/// Window length for rate estimation.
pub const RATE_WINDOW_FRAMES: usize = 30;

/// Returned while the window holds fewer than two samples.
pub const DEFAULT_FPS: f64 = 30.0;

/// Estimates are clamped to this inclusive range.
pub const MIN_FPS: f64 = 1.0;
pub const MAX_FPS: f64 = 30.0;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One captured frame. The payload is already in the pipeline wire format
/// (JPEG), so fan-out and recording both consume it without re-encoding.
#[derive(Clone, Debug)]
pub struct Frame {
    jpeg: Arc<Vec<u8>>,
    captured_at: Instant,
    wall_clock: SystemTime,
}

impl Frame {
    /// Wrap encoded JPEG bytes captured now. Called only by camera sources.
    pub fn new(jpeg: Vec<u8>) -> Self {
        Self {
            jpeg: Arc::new(jpeg),
            captured_at: Instant::now(),
            wall_clock: SystemTime::now(),
        }
    }

    pub fn jpeg(&self) -> &[u8] {
        &self.jpeg
    }

    /// Monotonic capture instant; feeds the rate estimator.
    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    /// Wall-clock capture time, for operator-facing timestamps.
    pub fn wall_clock(&self) -> SystemTime {
        self.wall_clock
    }

    pub fn byte_len(&self) -> usize {
        self.jpeg.len()
    }
}

// ----------------------------------------------------------------------------
// RateEstimator
// ----------------------------------------------------------------------------

/// Sliding window of the most recent capture instants.
///
/// The window is bounded to [`RATE_WINDOW_FRAMES`] entries with FIFO
/// eviction and stays monotonically non-decreasing: a sample earlier than
/// the newest entry is clamped to it. The window estimates rate only; it
/// carries no frame-ordering guarantee.
#[derive(Debug, Default)]
pub struct RateEstimator {
    window: VecDeque<Instant>,
}

impl RateEstimator {
    pub fn new() -> Self {
        Self {
            window: VecDeque::with_capacity(RATE_WINDOW_FRAMES),
        }
    }

    /// Record one capture instant, evicting the oldest past the window cap.
    pub fn record(&mut self, at: Instant) {
        let at = match self.window.back() {
            Some(&last) if at < last => last,
            _ => at,
        };
        if self.window.len() >= RATE_WINDOW_FRAMES {
            self.window.pop_front();
        }
        self.window.push_back(at);
    }

    /// Effective frames per second over the current window.
    ///
    /// Fewer than two samples yield [`DEFAULT_FPS`]; otherwise the sample
    /// count divided by the window's time span, clamped to
    /// [[`MIN_FPS`], [`MAX_FPS`]]. A zero span clamps to the ceiling.
    pub fn estimate(&self) -> f64 {
        if self.window.len() < 2 {
            return DEFAULT_FPS;
        }
        // Bounds are guaranteed by the length check above.
        let earliest = self.window.front().copied().unwrap_or_else(Instant::now);
        let latest = self.window.back().copied().unwrap_or_else(Instant::now);
        let span = latest.saturating_duration_since(earliest).as_secs_f64();
        let count = self.window.len() as f64;
        (count / span).clamp(MIN_FPS, MAX_FPS)
    }

    pub fn sample_count(&self) -> usize {
        self.window.len()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn estimate_defaults_below_two_samples() {
        let mut est = RateEstimator::new();
        assert_eq!(est.estimate(), DEFAULT_FPS);

        est.record(Instant::now());
        assert_eq!(est.estimate(), DEFAULT_FPS);
    }

    #[test]
    fn estimate_matches_sample_spacing() {
        let mut est = RateEstimator::new();
        let t0 = Instant::now();

        // 10 samples spanning 0.9s -> 10 / 0.9 ~= 11.1 fps
        for i in 0..10 {
            est.record(t0 + Duration::from_millis(i * 100));
        }
        let fps = est.estimate();
        assert!((fps - 10.0 / 0.9).abs() < 0.01, "got {}", fps);
    }

    #[test]
    fn estimate_stays_within_bounds() {
        let mut est = RateEstimator::new();
        let t0 = Instant::now();

        // Very slow capture: 2 samples 10s apart -> 0.2 raw, clamped to 1.0
        est.record(t0);
        est.record(t0 + Duration::from_secs(10));
        assert_eq!(est.estimate(), MIN_FPS);

        // Very fast capture: full window inside 10ms -> clamped to 30.0
        let mut est = RateEstimator::new();
        for i in 0..RATE_WINDOW_FRAMES {
            est.record(t0 + Duration::from_micros(i as u64 * 300));
        }
        assert_eq!(est.estimate(), MAX_FPS);
    }

    #[test]
    fn estimate_handles_zero_span() {
        let mut est = RateEstimator::new();
        let t0 = Instant::now();
        est.record(t0);
        est.record(t0);
        assert_eq!(est.estimate(), MAX_FPS);
    }

    #[test]
    fn window_enforces_capacity() {
        let mut est = RateEstimator::new();
        let t0 = Instant::now();
        for i in 0..(RATE_WINDOW_FRAMES + 25) {
            est.record(t0 + Duration::from_millis(i as u64 * 33));
        }
        assert_eq!(est.sample_count(), RATE_WINDOW_FRAMES);
    }

    #[test]
    fn out_of_order_samples_clamp_to_monotonic() {
        let mut est = RateEstimator::new();
        let t0 = Instant::now();
        est.record(t0 + Duration::from_secs(1));
        est.record(t0); // earlier than the newest entry
        assert_eq!(est.sample_count(), 2);
        // Both entries collapse to the same instant -> zero span -> ceiling.
        assert_eq!(est.estimate(), MAX_FPS);
    }

    #[test]
    fn frames_share_payload_without_copying() {
        let frame = Frame::new(vec![0xFF, 0xD8, 0xFF, 0xD9]);
        let other = frame.clone();
        assert_eq!(frame.jpeg().as_ptr(), other.jpeg().as_ptr());
        assert_eq!(frame.byte_len(), 4);
    }
}
