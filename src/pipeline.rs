//! The pipeline context object.
//!
//! One `Pipeline` value, constructed at startup, owns every subsystem: the
//! camera capture thread, the viewer hub, the recording session, the sensor
//! driver, the annotation batcher, and the retention janitor. Callers (the
//! HTTP surface, the bins, tests) hold an `Arc<Pipeline>` and go through its
//! operations; there is no ambient global state anywhere in the crate.

use anyhow::{anyhow, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::annotations::AnnotationBatcher;
use crate::capture::{self, CaptureHandle};
use crate::config::RigcamConfig;
use crate::hub::{FrameHub, FrameStream};
use crate::ingest::{CameraConfig, CameraSource};
use crate::retention::RetentionJanitor;
use crate::sensor_log::{SensorDriver, SensorLog, SyntheticSensorDriver, RECENT_ROW_COUNT};
use crate::session::RecordingSession;
use crate::{PipelineError, SessionKey};

/// Session artifacts retrievable by download.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Artifact {
    SensorLog,
    Video,
}

pub struct Pipeline {
    hub: Arc<FrameHub>,
    session: Arc<RecordingSession>,
    sensor_log: Arc<SensorLog>,
    driver: Arc<SyntheticSensorDriver>,
    batcher: AnnotationBatcher,
    janitor: RetentionJanitor,
    capture: Mutex<Option<CaptureHandle>>,
    shutdown_done: AtomicBool,
}

impl Pipeline {
    /// Open the camera and start every background task. Fails with
    /// [`PipelineError::DeviceUnavailable`] if the camera cannot be opened;
    /// nothing is left running in that case.
    pub fn start(cfg: &RigcamConfig) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&cfg.data_dir).map_err(|e| {
            anyhow!(
                "cannot create data directory {}: {}",
                cfg.data_dir.display(),
                e
            )
        })?;

        let mut source = CameraSource::new(CameraConfig::from(&cfg.camera))?;
        source.open()?;

        let sensor_log = SensorLog::new(cfg.sensor.channels.clone());
        let driver = SyntheticSensorDriver::spawn(sensor_log.clone(), cfg.sensor.cadence);
        let session = Arc::new(RecordingSession::new(
            cfg.data_dir.clone(),
            cfg.camera.width,
            cfg.camera.height,
            driver.clone() as Arc<dyn SensorDriver>,
        ));
        let hub = FrameHub::new();
        let capture = capture::spawn(source, session.clone(), hub.clone());
        let batcher = AnnotationBatcher::spawn(sensor_log.clone(), cfg.annotation_flush_interval);
        let janitor = RetentionJanitor::spawn(
            cfg.data_dir.clone(),
            cfg.retention.max_age,
            cfg.retention.sweep_interval,
        );

        log::info!(
            "pipeline started: camera={} data_dir={}",
            cfg.camera.uri,
            cfg.data_dir.display()
        );
        Ok(Arc::new(Self {
            hub,
            session,
            sensor_log,
            driver,
            batcher,
            janitor,
            capture: Mutex::new(Some(capture)),
            shutdown_done: AtomicBool::new(false),
        }))
    }

    /// Begin a recording session. On success, pending annotation state is
    /// cleared so the new session never inherits the previous one's
    /// comments; a rejected start leaves the active session's annotations
    /// untouched.
    pub fn start_session(&self, key: SessionKey) -> Result<()> {
        self.session.start(key)?;
        self.batcher.clear_pending();
        Ok(())
    }

    /// End the active session. Idempotent.
    pub fn stop_session(&self) {
        self.session.stop();
    }

    pub fn session_active(&self) -> bool {
        self.session.is_active()
    }

    /// Register a live viewer.
    pub fn subscribe(&self) -> FrameStream {
        self.hub.subscribe()
    }

    /// Fire-and-forget annotation submission.
    pub fn submit_annotation(&self, timestamp: &str, text: &str) {
        self.batcher.submit(timestamp, text);
    }

    /// Last rows of the current session's sensor log, formatted for display.
    pub fn recent_rows(&self) -> Result<Vec<Vec<String>>> {
        self.sensor_log.recent_rows(RECENT_ROW_COUNT)
    }

    /// Path of a session artifact, failing with [`PipelineError::NotFound`]
    /// when no session has produced it.
    pub fn artifact_path(&self, artifact: Artifact) -> Result<PathBuf> {
        let paths = self.session.paths().ok_or_else(|| {
            anyhow!(PipelineError::NotFound("no session recorded yet".to_string()))
        })?;
        let path = match artifact {
            Artifact::SensorLog => paths.log,
            Artifact::Video => paths.video,
        };
        if !path.exists() {
            return Err(anyhow!(PipelineError::NotFound(format!(
                "{}",
                path.display()
            ))));
        }
        Ok(path)
    }

    /// True while the capture thread is alive. Stays false forever after a
    /// capture failure; the rest of the pipeline keeps serving.
    pub fn is_capturing(&self) -> bool {
        self.capture
            .lock()
            .ok()
            .and_then(|capture| capture.as_ref().map(CaptureHandle::is_running))
            .unwrap_or(false)
    }

    pub fn viewer_count(&self) -> usize {
        self.hub.viewer_count()
    }

    /// Ordered, idempotent teardown: stop the session, join the capture
    /// thread (it closes the source and hub), flush and stop the batcher,
    /// then stop the janitor and the sensor driver.
    pub fn shutdown(&self) {
        if self.shutdown_done.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("pipeline shutting down");
        self.session.stop();
        let handle = self.capture.lock().ok().and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            if let Err(err) = handle.stop() {
                log::error!("capture shutdown: {}", err);
            }
        }
        self.hub.close();
        self.batcher.stop();
        self.janitor.stop();
        self.driver.shutdown();
        log::info!("pipeline stopped");
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}
