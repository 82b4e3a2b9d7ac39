//! The capture loop: the single producer thread.
//!
//! Owns the camera source for its whole life. Per iteration: block on the
//! next frame, feed the rate estimator, hand the frame to the recording
//! session (a no-op while Idle), publish to the hub. A read failure is
//! terminal: the active session is force-stopped, the hub closes so viewer
//! streams end, and only a pipeline restart resumes frames. Session start
//! and stop never restart this loop; they only toggle whether frames also
//! reach a video writer.

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::frame::RateEstimator;
use crate::hub::FrameHub;
use crate::ingest::CameraSource;
use crate::session::RecordingSession;

const STATS_LOG_INTERVAL: Duration = Duration::from_secs(5);

pub struct CaptureHandle {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    /// Signal the loop to exit after its current blocking read and join it.
    /// The loop closes the source and the hub on the way out.
    pub fn stop(mut self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("capture thread panicked"))?;
        }
        Ok(())
    }

    /// False once the loop has terminated (failure or shutdown).
    pub fn is_running(&self) -> bool {
        self.join
            .as_ref()
            .map(|join| !join.is_finished())
            .unwrap_or(false)
    }
}

/// Spawn the producer thread. `source` must already be open; the thread owns
/// it exclusively from here on and closes it when the loop ends.
pub fn spawn(
    source: CameraSource,
    session: Arc<RecordingSession>,
    hub: Arc<FrameHub>,
) -> CaptureHandle {
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = stop.clone();
    let join = std::thread::spawn(move || run(source, session, hub, thread_stop));
    CaptureHandle {
        stop,
        join: Some(join),
    }
}

fn run(
    mut source: CameraSource,
    session: Arc<RecordingSession>,
    hub: Arc<FrameHub>,
    stop: Arc<AtomicBool>,
) {
    let mut estimator = RateEstimator::new();
    let mut frames = 0u64;
    let mut last_stats = Instant::now();

    while !stop.load(Ordering::SeqCst) {
        let frame = match source.next_frame() {
            Ok(frame) => frame,
            Err(err) => {
                log::error!("capture loop terminating: {:#}", err);
                session.force_stop("camera read failed");
                break;
            }
        };

        estimator.record(frame.captured_at());
        session.write_frame(&frame, estimator.estimate());
        hub.publish(&frame);
        frames += 1;

        if last_stats.elapsed() >= STATS_LOG_INTERVAL {
            log::info!(
                "capture: frames={} est_fps={:.2} viewers={} healthy={}",
                frames,
                estimator.estimate(),
                hub.viewer_count(),
                source.is_healthy()
            );
            last_stats = Instant::now();
        }
    }

    // Terminal either way: end viewer streams, then release the device.
    hub.close();
    source.close();
    log::info!("capture loop stopped after {} frames", frames);
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
