//! Recording session state machine.
//!
//! Idle -> Armed (start: paths computed, sensor driver signaled) ->
//! Recording (first frame after arming creates the video writer at the
//! frame rate estimated at that instant) -> Idle (stop).
//!
//! One mutex guards every transition and every frame write. `stop` acquires
//! the same lock the capture thread holds during a write, so it blocks until
//! an in-flight write completes and can never release the writer twice.

use anyhow::{anyhow, Result};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::avi::AviWriter;
use crate::frame::Frame;
use crate::sensor_log::SensorDriver;
use crate::{PipelineError, SessionKey};

/// Artifact paths derived from a session key.
#[derive(Clone, Debug)]
pub struct SessionPaths {
    pub key: SessionKey,
    pub video: PathBuf,
    pub log: PathBuf,
}

enum Phase {
    Idle,
    Armed,
    Recording(AviWriter),
}

struct SessionState {
    phase: Phase,
    /// Paths of the active session, or of the last one after stop.
    paths: Option<SessionPaths>,
}

pub struct RecordingSession {
    data_dir: PathBuf,
    width: u32,
    height: u32,
    driver: Arc<dyn SensorDriver>,
    state: Mutex<SessionState>,
}

impl RecordingSession {
    pub fn new(
        data_dir: PathBuf,
        width: u32,
        height: u32,
        driver: Arc<dyn SensorDriver>,
    ) -> Self {
        Self {
            data_dir,
            width,
            height,
            driver,
            state: Mutex::new(SessionState {
                phase: Phase::Idle,
                paths: None,
            }),
        }
    }

    /// Arm a new session. Fails with [`PipelineError::SessionInProgress`]
    /// unless Idle; the existing session is left untouched in that case.
    pub fn start(&self, key: SessionKey) -> Result<SessionPaths> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("session state lock poisoned"))?;
        if !matches!(state.phase, Phase::Idle) {
            return Err(anyhow!(PipelineError::SessionInProgress));
        }

        let paths = SessionPaths {
            video: self.data_dir.join(key.video_file_name()),
            log: self.data_dir.join(key.log_file_name()),
            key,
        };
        self.driver.begin(&paths.log)?;
        log::info!(
            "session {} armed: video={} log={}",
            paths.key,
            paths.video.display(),
            paths.log.display()
        );
        state.phase = Phase::Armed;
        state.paths = Some(paths.clone());
        Ok(paths)
    }

    /// Feed one captured frame. While Armed, the first frame creates the
    /// video writer with `fps_estimate` (frozen for the session) and
    /// transitions to Recording; a writer that cannot be created abandons
    /// this frame only and the session stays Armed. While Recording, the
    /// frame is appended. Idle ignores frames.
    pub fn write_frame(&self, frame: &Frame, fps_estimate: f64) {
        let Ok(mut guard) = self.state.lock() else {
            return;
        };
        let state = &mut *guard;

        if let Phase::Recording(writer) = &mut state.phase {
            if let Err(err) = writer.write_frame(frame.jpeg()) {
                log::warn!("session frame write failed: {}", err);
            }
            return;
        }
        if !matches!(state.phase, Phase::Armed) {
            return;
        }
        let Some(paths) = state.paths.clone() else {
            return;
        };
        match AviWriter::new(&paths.video, self.width, self.height, fps_estimate) {
            Ok(mut writer) => {
                log::info!(
                    "session {} recording at {:.2} fps",
                    paths.key,
                    fps_estimate
                );
                if let Err(err) = writer.write_frame(frame.jpeg()) {
                    log::warn!("session {}: dropped frame: {}", paths.key, err);
                }
                state.phase = Phase::Recording(writer);
            }
            Err(err) => {
                // Stay Armed; the next frame retries writer creation.
                log::warn!("session {}: {}", paths.key, err);
            }
        }
    }

    /// Stop the session: finish the video writer exactly once and signal the
    /// sensor driver to end. A no-op when Idle.
    pub fn stop(&self) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        match std::mem::replace(&mut state.phase, Phase::Idle) {
            Phase::Idle => {}
            Phase::Armed => {
                self.driver.end();
                if let Some(paths) = &state.paths {
                    log::info!("session {} stopped before any frame was recorded", paths.key);
                }
            }
            Phase::Recording(writer) => {
                self.driver.end();
                match writer.finish() {
                    Ok(summary) => log::info!(
                        "session sealed: {} ({} frames, {:.2} fps, {} bytes)",
                        summary.path.display(),
                        summary.frames,
                        summary.fps,
                        summary.bytes
                    ),
                    Err(err) => log::error!("failed to seal session video: {}", err),
                }
            }
        }
    }

    /// Stop driven by pipeline error recovery rather than the operator.
    pub fn force_stop(&self, reason: &str) {
        if self.is_active() {
            log::warn!("session force-stopped: {}", reason);
        }
        self.stop();
    }

    pub fn is_active(&self) -> bool {
        self.state
            .lock()
            .map(|state| !matches!(state.phase, Phase::Idle))
            .unwrap_or(false)
    }

    /// Paths of the active session, or of the last one if stopped.
    pub fn paths(&self) -> Option<SessionPaths> {
        self.state.lock().ok().and_then(|state| state.paths.clone())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingDriver {
        begins: AtomicUsize,
        ends: AtomicUsize,
    }

    impl SensorDriver for RecordingDriver {
        fn begin(&self, _log_path: &std::path::Path) -> Result<()> {
            self.begins.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn end(&self) {
            self.ends.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn session(dir: &std::path::Path) -> (RecordingSession, Arc<RecordingDriver>) {
        let driver = Arc::new(RecordingDriver::default());
        let session = RecordingSession::new(dir.to_path_buf(), 64, 48, driver.clone());
        (session, driver)
    }

    fn key() -> SessionKey {
        SessionKey::from_parts("600W", "water", 2, 30).expect("key")
    }

    #[test]
    fn start_while_active_is_rejected_and_paths_unchanged() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (session, driver) = session(dir.path());

        let paths = session.start(key()).expect("first start");
        let err = session
            .start(SessionKey::new("800W", "oil", "1m_0s").expect("key"))
            .expect_err("second start");
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::SessionInProgress)
        ));
        assert_eq!(session.paths().expect("paths").video, paths.video);
        assert_eq!(driver.begins.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_when_idle_is_a_noop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (session, driver) = session(dir.path());
        session.stop();
        assert_eq!(driver.ends.load(Ordering::SeqCst), 0);
        assert!(!session.is_active());
    }

    #[test]
    fn first_frame_creates_the_video_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (session, driver) = session(dir.path());

        let paths = session.start(key()).expect("start");
        assert!(!paths.video.exists());

        let frame = Frame::new(vec![0xFF, 0xD8, 0xFF, 0xD9]);
        session.write_frame(&frame, 12.0);
        assert!(paths.video.exists());
        session.write_frame(&frame, 25.0); // rate stays frozen at 12

        session.stop();
        session.stop(); // idempotent
        assert_eq!(driver.ends.load(Ordering::SeqCst), 1);

        let bytes = std::fs::read(&paths.video).expect("video bytes");
        assert_eq!(&bytes[0..4], b"RIFF");
        // Sealed with both frames counted.
        assert_eq!(u32::from_le_bytes(bytes[48..52].try_into().unwrap()), 2);
    }

    #[test]
    fn encoder_failure_keeps_the_session_armed_and_retries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data_dir = dir.path().join("missing");
        let driver = Arc::new(RecordingDriver::default());
        let session = RecordingSession::new(data_dir.clone(), 64, 48, driver.clone());

        let paths = session.start(key()).expect("start");
        let frame = Frame::new(vec![0xFF, 0xD8, 0xFF, 0xD9]);

        // Writer creation fails while the directory is missing: the frame is
        // abandoned and the session stays armed.
        session.write_frame(&frame, 10.0);
        assert!(session.is_active());
        assert!(!paths.video.exists());

        // The next frame retries and succeeds once the directory exists.
        std::fs::create_dir_all(&data_dir).expect("create data dir");
        session.write_frame(&frame, 10.0);
        assert!(paths.video.exists());

        session.stop();
        assert_eq!(driver.ends.load(Ordering::SeqCst), 1);
        let bytes = std::fs::read(&paths.video).expect("video bytes");
        // Only the post-recovery frame was recorded.
        assert_eq!(u32::from_le_bytes(bytes[48..52].try_into().unwrap()), 1);
    }

    #[test]
    fn frames_while_idle_are_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (session, _driver) = session(dir.path());
        session.write_frame(&Frame::new(vec![0xFF, 0xD8]), 30.0);
        assert!(session.paths().is_none());
    }

    #[test]
    fn paths_survive_stop_for_artifact_retrieval() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (session, _driver) = session(dir.path());
        session.start(key()).expect("start");
        session.stop();
        let paths = session.paths().expect("last paths");
        assert_eq!(paths.key.file_stem(), "600W_water_2m_30s");
    }
}
