//! Camera sources.
//!
//! `CameraSource` owns the hardware capture device and hands the capture
//! thread one JPEG frame per `next_frame()` call:
//! - `stub://` URIs select a synthetic source that paces itself to the
//!   configured rate and encodes a moving test pattern.
//! - Any other URI is a V4L2 device path (feature: `ingest-v4l2`), streamed
//!   as MJPG so device frames arrive already in the pipeline wire format.
//!
//! Exactly one live handle exists at a time: the capture thread takes the
//! source by value and closes it on exit. `close()` is idempotent, and a
//! reopen observes a short grace delay so the device can relinquish
//! exclusive access first.

#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;

use anyhow::{anyhow, Result};
use std::time::{Duration, Instant};

use crate::frame::Frame;
use crate::PipelineError;

/// Delay honored between a close and the next open of the same source.
pub const REOPEN_GRACE: Duration = Duration::from_millis(250);

/// Configuration for a camera source.
#[derive(Clone, Debug)]
pub struct CameraConfig {
    /// Device URI: `stub://name` or a V4L2 device path like `/dev/video0`.
    pub uri: String,
    /// Requested frame rate; the synthetic source paces to exactly this.
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            uri: "stub://bench_camera".to_string(),
            target_fps: 15,
            width: 640,
            height: 480,
        }
    }
}

impl From<&crate::config::CameraSettings> for CameraConfig {
    fn from(settings: &crate::config::CameraSettings) -> Self {
        Self {
            uri: settings.uri.clone(),
            target_fps: settings.target_fps,
            width: settings.width,
            height: settings.height,
        }
    }
}

/// Statistics for a camera source.
#[derive(Clone, Debug)]
pub struct CameraStats {
    pub frames_captured: u64,
    pub uri: String,
}

/// The single hardware capture handle.
pub struct CameraSource {
    backend: CameraBackend,
    closed_at: Option<Instant>,
}

enum CameraBackend {
    Synthetic(SyntheticSource),
    #[cfg(feature = "ingest-v4l2")]
    V4l2(v4l2::V4l2Source),
}

impl CameraSource {
    pub fn new(config: CameraConfig) -> Result<Self> {
        let backend = if config.uri.starts_with("stub://") {
            CameraBackend::Synthetic(SyntheticSource::new(config))
        } else {
            #[cfg(feature = "ingest-v4l2")]
            {
                CameraBackend::V4l2(v4l2::V4l2Source::new(config))
            }
            #[cfg(not(feature = "ingest-v4l2"))]
            {
                return Err(anyhow!(PipelineError::DeviceUnavailable(format!(
                    "camera uri '{}' requires the ingest-v4l2 feature",
                    config.uri
                ))));
            }
        };
        Ok(Self {
            backend,
            closed_at: None,
        })
    }

    /// Acquire the capture device. Fails with
    /// [`PipelineError::DeviceUnavailable`] when the device cannot be opened.
    pub fn open(&mut self) -> Result<()> {
        if let Some(closed_at) = self.closed_at.take() {
            let elapsed = closed_at.elapsed();
            if elapsed < REOPEN_GRACE {
                std::thread::sleep(REOPEN_GRACE - elapsed);
            }
        }
        match &mut self.backend {
            CameraBackend::Synthetic(source) => source.open(),
            #[cfg(feature = "ingest-v4l2")]
            CameraBackend::V4l2(source) => source.open(),
        }
    }

    /// Block until the next frame is available. Fails with
    /// [`PipelineError::CaptureFailure`] on a read error or when the source
    /// is not open.
    pub fn next_frame(&mut self) -> Result<Frame> {
        match &mut self.backend {
            CameraBackend::Synthetic(source) => source.next_frame(),
            #[cfg(feature = "ingest-v4l2")]
            CameraBackend::V4l2(source) => source.next_frame(),
        }
    }

    /// Release the device. Safe to call when already closed or never opened.
    pub fn close(&mut self) {
        let was_open = match &mut self.backend {
            CameraBackend::Synthetic(source) => source.close(),
            #[cfg(feature = "ingest-v4l2")]
            CameraBackend::V4l2(source) => source.close(),
        };
        if was_open {
            self.closed_at = Some(Instant::now());
        }
    }

    pub fn is_healthy(&self) -> bool {
        match &self.backend {
            CameraBackend::Synthetic(source) => source.is_healthy(),
            #[cfg(feature = "ingest-v4l2")]
            CameraBackend::V4l2(source) => source.is_healthy(),
        }
    }

    pub fn stats(&self) -> CameraStats {
        match &self.backend {
            CameraBackend::Synthetic(source) => source.stats(),
            #[cfg(feature = "ingest-v4l2")]
            CameraBackend::V4l2(source) => source.stats(),
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://)
// ----------------------------------------------------------------------------

struct SyntheticSource {
    config: CameraConfig,
    open: bool,
    frame_count: u64,
    next_due: Option<Instant>,
    scene_state: u8,
}

impl SyntheticSource {
    fn new(config: CameraConfig) -> Self {
        Self {
            config,
            open: false,
            frame_count: 0,
            next_due: None,
            scene_state: 0,
        }
    }

    fn open(&mut self) -> Result<()> {
        self.open = true;
        self.next_due = None;
        log::info!("CameraSource: opened {} (synthetic)", self.config.uri);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        if !self.open {
            return Err(anyhow!(PipelineError::CaptureFailure(
                "source is not open".to_string()
            )));
        }

        // Pace to the configured rate so capture timing looks like hardware.
        let period = Duration::from_secs(1) / self.config.target_fps.max(1);
        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        if due > now {
            std::thread::sleep(due - now);
        }
        self.next_due = Some(due.max(now) + period);

        self.frame_count += 1;
        let pixels = self.generate_synthetic_pixels();
        let jpeg = encode_jpeg(&pixels, self.config.width, self.config.height)
            .map_err(|e| anyhow!(PipelineError::CaptureFailure(e.to_string())))?;
        Ok(Frame::new(jpeg))
    }

    /// Simple moving test pattern: a gradient with occasional scene shifts so
    /// consecutive frames are distinguishable.
    fn generate_synthetic_pixels(&mut self) -> Vec<u8> {
        let pixel_count = (self.config.width * self.config.height * 3) as usize;
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count + self.scene_state as u64) % 256) as u8;
        }
        pixels
    }

    fn close(&mut self) -> bool {
        let was_open = self.open;
        self.open = false;
        self.next_due = None;
        was_open
    }

    fn is_healthy(&self) -> bool {
        self.open
    }

    fn stats(&self) -> CameraStats {
        CameraStats {
            frames_captured: self.frame_count,
            uri: self.config.uri.clone(),
        }
    }
}

fn encode_jpeg(pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let mut jpeg = Vec::new();
    let mut encoder =
        image::codecs::jpeg::JpegEncoder::new_with_quality(std::io::Cursor::new(&mut jpeg), 80);
    encoder.encode(pixels, width, height, image::ExtendedColorType::Rgb8)?;
    Ok(jpeg)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
