//! rigcam
//!
//! Single-camera capture service for an instrumented lab bench. One capture
//! thread reads frames from the camera and fans them out to live viewers
//! while a recording session, when active, frames the same JPEG stream into
//! a per-session AVI file. A sensor driver appends CSV rows beside the
//! video; operators attach timestamped comments that are batch-merged into
//! the CSV; a janitor reclaims stale artifacts.
//!
//! # Operating rules
//!
//! The pipeline holds six rules by construction:
//!
//! 1. **Single Producer**: exactly one capture thread owns the camera handle
//!    for the lifetime of the pipeline.
//! 2. **Non-Blocking Fan-Out**: publishing a frame never blocks on a viewer;
//!    a saturated viewer loses its own oldest frames only.
//! 3. **Lazy, Frozen Encoder**: the video writer is created on the first
//!    frame after arming, with the frame rate estimated at that instant;
//!    the rate is never renegotiated mid-session.
//! 4. **Idempotent Stop**: stopping a session joins any in-flight frame
//!    write and releases the encoder exactly once; stopping twice is a
//!    no-op.
//! 5. **Atomic Merges**: annotation merges rewrite the sensor log through a
//!    sibling temp file and rename; the log is never left truncated.
//! 6. **Best-Effort Retention**: a failed delete is logged and skipped,
//!    never fatal to the next sweep.
//!
//! # Module structure
//!
//! - `frame`: frame value type and capture-rate estimation
//! - `ingest`: camera sources (synthetic stub, V4L2 behind `ingest-v4l2`)
//! - `hub`: live-viewer fan-out
//! - `avi`: MJPEG-in-AVI muxer
//! - `session`: recording session state machine
//! - `capture`: the producer thread
//! - `sensor_log`: CSV layout, row producer, recent-rows query
//! - `annotations`: comment batching and merge
//! - `retention`: artifact janitor
//! - `pipeline`: the context object wiring everything
//! - `api`: local HTTP surface

use anyhow::{anyhow, Result};
use std::sync::OnceLock;

pub mod annotations;
pub mod api;
pub mod avi;
pub mod capture;
pub mod config;
pub mod frame;
pub mod hub;
pub mod ingest;
pub mod pipeline;
pub mod retention;
pub mod sensor_log;
pub mod session;

pub use annotations::AnnotationBatcher;
pub use avi::{AviSummary, AviWriter};
pub use capture::CaptureHandle;
pub use config::RigcamConfig;
pub use frame::{Frame, RateEstimator};
pub use hub::{FrameHub, FrameStream};
pub use ingest::{CameraConfig, CameraSource};
pub use pipeline::{Artifact, Pipeline};
pub use retention::RetentionJanitor;
pub use sensor_log::{SensorDriver, SensorLog, SyntheticSensorDriver};
pub use session::RecordingSession;

// -------------------- Error Taxonomy --------------------

/// Pipeline failure classes. Carried inside `anyhow::Error`; callers that
/// branch on a class recover it with `downcast_ref::<PipelineError>()`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineError {
    /// The camera could not be opened. Fatal to pipeline startup.
    DeviceUnavailable(String),
    /// A mid-stream read failed. Terminates the capture loop.
    CaptureFailure(String),
    /// The video writer could not be created. The armed session stays armed
    /// and the current frame's write is abandoned.
    EncoderInitFailure(String),
    /// `start` was called while a session was already armed or recording.
    SessionInProgress,
    /// An annotation merge pass failed; entries are requeued.
    LogMergeFailure(String),
    /// A retention delete failed; the sweep continues.
    RetentionDeleteFailure(String),
    /// A requested session artifact does not exist.
    NotFound(String),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::DeviceUnavailable(detail) => {
                write!(f, "device unavailable: {}", detail)
            }
            PipelineError::CaptureFailure(detail) => write!(f, "capture failure: {}", detail),
            PipelineError::EncoderInitFailure(detail) => {
                write!(f, "encoder init failure: {}", detail)
            }
            PipelineError::SessionInProgress => write!(f, "a session is already in progress"),
            PipelineError::LogMergeFailure(detail) => write!(f, "log merge failure: {}", detail),
            PipelineError::RetentionDeleteFailure(detail) => {
                write!(f, "retention delete failure: {}", detail)
            }
            PipelineError::NotFound(what) => write!(f, "not found: {}", what),
        }
    }
}

impl std::error::Error for PipelineError {}

// -------------------- Session Keys --------------------

/// A session-key component MUST be safe to embed in a file name. We enforce
/// a positive allowlist rather than escaping.
///
/// Allowed: "600W", "water", "2m_30s", "k2.variant-b"
/// Disallowed: anything with whitespace, path separators, or a leading dot.
pub fn validate_key_component(component: &str) -> Result<()> {
    // Compile once for hot paths.
    static COMPONENT_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = COMPONENT_RE
        .get_or_init(|| regex::Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,63}$").unwrap());

    if !re.is_match(component) {
        return Err(anyhow!(
            "session key component must match ^[A-Za-z0-9][A-Za-z0-9._-]{{0,63}}$"
        ));
    }
    Ok(())
}

/// Composite key identifying one recording session: power setting, catalyst,
/// and run duration. Deterministically names the session's artifacts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionKey {
    power: String,
    catalyst: String,
    duration: String,
}

impl SessionKey {
    pub fn new(power: &str, catalyst: &str, duration: &str) -> Result<Self> {
        validate_key_component(power)?;
        validate_key_component(catalyst)?;
        validate_key_component(duration)?;
        Ok(Self {
            power: power.to_string(),
            catalyst: catalyst.to_string(),
            duration: duration.to_string(),
        })
    }

    /// Build a key with the duration rendered from minutes and seconds, the
    /// form the bench UI submits.
    pub fn from_parts(power: &str, catalyst: &str, minutes: u32, seconds: u32) -> Result<Self> {
        Self::new(power, catalyst, &format!("{}m_{}s", minutes, seconds))
    }

    pub fn file_stem(&self) -> String {
        format!("{}_{}_{}", self.power, self.catalyst, self.duration)
    }

    pub fn log_file_name(&self) -> String {
        format!("{}_sensor_log.csv", self.file_stem())
    }

    pub fn video_file_name(&self) -> String {
        format!("{}_video.avi", self.file_stem())
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.file_stem())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_components_reject_path_hazards() {
        assert!(validate_key_component("600W").is_ok());
        assert!(validate_key_component("2m_30s").is_ok());
        assert!(validate_key_component("k2.variant-b").is_ok());
        assert!(validate_key_component("").is_err());
        assert!(validate_key_component("a b").is_err());
        assert!(validate_key_component("../etc").is_err());
        assert!(validate_key_component("a/b").is_err());
        assert!(validate_key_component(".hidden").is_err());
    }

    #[test]
    fn key_names_artifacts_deterministically() {
        let key = SessionKey::from_parts("600W", "water", 2, 30).expect("key");
        assert_eq!(key.file_stem(), "600W_water_2m_30s");
        assert_eq!(key.log_file_name(), "600W_water_2m_30s_sensor_log.csv");
        assert_eq!(key.video_file_name(), "600W_water_2m_30s_video.avi");
    }

    #[test]
    fn session_in_progress_downcasts_through_anyhow() {
        let err: anyhow::Error = PipelineError::SessionInProgress.into();
        assert_eq!(
            err.downcast_ref::<PipelineError>(),
            Some(&PipelineError::SessionInProgress)
        );
    }
}
