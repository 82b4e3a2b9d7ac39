//! Minimal RIFF/AVI muxer for MJPEG streams.
//!
//! Frames reach the recorder already JPEG-encoded, so writing video is pure
//! framing: each frame becomes one `00dc` chunk, and `finish` seals the
//! container by appending the `idx1` index and backpatching the sizes the
//! header carried as placeholders. No system codec libraries involved.
//!
//! The frame rate is fixed when the writer is created and never changes for
//! the life of the file.

use anyhow::{anyhow, Result};
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::PipelineError;

const AVIF_HASINDEX: u32 = 0x0000_0010;
const AVIIF_KEYFRAME: u32 = 0x0000_0010;

/// Closing summary returned by [`AviWriter::finish`].
#[derive(Clone, Debug)]
pub struct AviSummary {
    pub path: PathBuf,
    pub frames: u32,
    pub fps: f64,
    pub bytes: u64,
}

/// Streaming MJPEG-in-AVI writer. Every written frame is a keyframe.
#[derive(Debug)]
pub struct AviWriter {
    out: BufWriter<File>,
    path: PathBuf,
    fps: f64,
    frames: u32,
    // Patch points recorded while writing the header.
    riff_size_pos: u64,
    total_frames_pos: u64,
    stream_length_pos: u64,
    movi_size_pos: u64,
    /// Position of the `movi` fourcc; index offsets are relative to it.
    movi_start: u64,
    index: Vec<IndexEntry>,
}

#[derive(Debug)]
struct IndexEntry {
    offset: u32,
    size: u32,
}

impl AviWriter {
    /// Create the video file and write the container header. The rate is
    /// frozen here; [`PipelineError::EncoderInitFailure`] covers both a bad
    /// rate and file creation errors.
    pub fn new(path: &Path, width: u32, height: u32, fps: f64) -> Result<Self> {
        if !fps.is_finite() || fps <= 0.0 {
            return Err(anyhow!(PipelineError::EncoderInitFailure(format!(
                "invalid frame rate {}",
                fps
            ))));
        }
        let file = File::create(path).map_err(|e| {
            anyhow!(PipelineError::EncoderInitFailure(format!(
                "create {}: {}",
                path.display(),
                e
            )))
        })?;
        let mut writer = Self {
            out: BufWriter::new(file),
            path: path.to_path_buf(),
            fps,
            frames: 0,
            riff_size_pos: 0,
            total_frames_pos: 0,
            stream_length_pos: 0,
            movi_size_pos: 0,
            movi_start: 0,
            index: Vec::new(),
        };
        writer.write_header(width, height)?;
        Ok(writer)
    }

    fn write_header(&mut self, width: u32, height: u32) -> Result<()> {
        let micro_sec_per_frame = (1_000_000.0 / self.fps).round() as u32;
        // fps as the rational dwRate/dwScale, to three decimal places.
        let scale: u32 = 1_000;
        let rate = (self.fps * scale as f64).round().max(1.0) as u32;

        self.out.write_all(b"RIFF")?;
        self.riff_size_pos = self.out.stream_position()?;
        self.out.write_all(&0u32.to_le_bytes())?;
        self.out.write_all(b"AVI ")?;

        // hdrl list: avih + one strl.
        self.out.write_all(b"LIST")?;
        self.out.write_all(&192u32.to_le_bytes())?;
        self.out.write_all(b"hdrl")?;

        self.out.write_all(b"avih")?;
        self.out.write_all(&56u32.to_le_bytes())?;
        self.out.write_all(&micro_sec_per_frame.to_le_bytes())?;
        self.out.write_all(&0u32.to_le_bytes())?; // dwMaxBytesPerSec
        self.out.write_all(&0u32.to_le_bytes())?; // dwPaddingGranularity
        self.out.write_all(&AVIF_HASINDEX.to_le_bytes())?;
        self.total_frames_pos = self.out.stream_position()?;
        self.out.write_all(&0u32.to_le_bytes())?; // dwTotalFrames (patched)
        self.out.write_all(&0u32.to_le_bytes())?; // dwInitialFrames
        self.out.write_all(&1u32.to_le_bytes())?; // dwStreams
        self.out.write_all(&0u32.to_le_bytes())?; // dwSuggestedBufferSize
        self.out.write_all(&width.to_le_bytes())?;
        self.out.write_all(&height.to_le_bytes())?;
        self.out.write_all(&[0u8; 16])?; // dwReserved

        self.out.write_all(b"LIST")?;
        self.out.write_all(&116u32.to_le_bytes())?;
        self.out.write_all(b"strl")?;

        self.out.write_all(b"strh")?;
        self.out.write_all(&56u32.to_le_bytes())?;
        self.out.write_all(b"vids")?;
        self.out.write_all(b"MJPG")?;
        self.out.write_all(&0u32.to_le_bytes())?; // dwFlags
        self.out.write_all(&0u16.to_le_bytes())?; // wPriority
        self.out.write_all(&0u16.to_le_bytes())?; // wLanguage
        self.out.write_all(&0u32.to_le_bytes())?; // dwInitialFrames
        self.out.write_all(&scale.to_le_bytes())?;
        self.out.write_all(&rate.to_le_bytes())?;
        self.out.write_all(&0u32.to_le_bytes())?; // dwStart
        self.stream_length_pos = self.out.stream_position()?;
        self.out.write_all(&0u32.to_le_bytes())?; // dwLength (patched)
        self.out.write_all(&0u32.to_le_bytes())?; // dwSuggestedBufferSize
        self.out.write_all(&0u32.to_le_bytes())?; // dwQuality
        self.out.write_all(&0u32.to_le_bytes())?; // dwSampleSize
        self.out.write_all(&0u16.to_le_bytes())?; // rcFrame.left
        self.out.write_all(&0u16.to_le_bytes())?; // rcFrame.top
        self.out.write_all(&(width as u16).to_le_bytes())?;
        self.out.write_all(&(height as u16).to_le_bytes())?;

        // strf: BITMAPINFOHEADER.
        self.out.write_all(b"strf")?;
        self.out.write_all(&40u32.to_le_bytes())?;
        self.out.write_all(&40u32.to_le_bytes())?; // biSize
        self.out.write_all(&(width as i32).to_le_bytes())?;
        self.out.write_all(&(height as i32).to_le_bytes())?;
        self.out.write_all(&1u16.to_le_bytes())?; // biPlanes
        self.out.write_all(&24u16.to_le_bytes())?; // biBitCount
        self.out.write_all(b"MJPG")?; // biCompression
        self.out
            .write_all(&(width * height * 3).to_le_bytes())?; // biSizeImage
        self.out.write_all(&[0u8; 16])?; // remaining BITMAPINFOHEADER fields

        self.out.write_all(b"LIST")?;
        self.movi_size_pos = self.out.stream_position()?;
        self.out.write_all(&0u32.to_le_bytes())?; // movi size (patched)
        self.movi_start = self.out.stream_position()?;
        self.out.write_all(b"movi")?;
        Ok(())
    }

    /// Append one JPEG frame as a `00dc` chunk, padded to even length.
    pub fn write_frame(&mut self, jpeg: &[u8]) -> Result<()> {
        let offset = self.out.stream_position()? - self.movi_start;
        self.out.write_all(b"00dc")?;
        self.out.write_all(&(jpeg.len() as u32).to_le_bytes())?;
        self.out.write_all(jpeg)?;
        if jpeg.len() % 2 == 1 {
            self.out.write_all(&[0u8])?;
        }
        self.index.push(IndexEntry {
            offset: offset as u32,
            size: jpeg.len() as u32,
        });
        self.frames += 1;
        Ok(())
    }

    pub fn frames_written(&self) -> u32 {
        self.frames
    }

    /// Seal the container: write the `idx1` index, backpatch the header
    /// sizes, and flush. Consumes the writer so the file handle is released.
    pub fn finish(mut self) -> Result<AviSummary> {
        let movi_end = self.out.stream_position()?;

        self.out.write_all(b"idx1")?;
        self.out
            .write_all(&((self.index.len() as u32) * 16).to_le_bytes())?;
        for entry in &self.index {
            self.out.write_all(b"00dc")?;
            self.out.write_all(&AVIIF_KEYFRAME.to_le_bytes())?;
            self.out.write_all(&entry.offset.to_le_bytes())?;
            self.out.write_all(&entry.size.to_le_bytes())?;
        }
        let file_len = self.out.stream_position()?;

        self.patch_u32(self.riff_size_pos, (file_len - 8) as u32)?;
        self.patch_u32(self.total_frames_pos, self.frames)?;
        self.patch_u32(self.stream_length_pos, self.frames)?;
        self.patch_u32(self.movi_size_pos, (movi_end - self.movi_start) as u32)?;

        self.out.flush()?;
        Ok(AviSummary {
            path: self.path,
            frames: self.frames,
            fps: self.fps,
            bytes: file_len,
        })
    }

    fn patch_u32(&mut self, pos: u64, value: u32) -> Result<()> {
        self.out.seek(SeekFrom::Start(pos))?;
        self.out.write_all(&value.to_le_bytes())?;
        self.out.seek(SeekFrom::End(0))?;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn read_u32(bytes: &[u8], at: usize) -> u32 {
        u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
    }

    #[test]
    fn sealed_file_has_consistent_structure() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("clip.avi");

        let mut writer = AviWriter::new(&path, 640, 480, 12.5)?;
        // Odd-length payload exercises chunk padding.
        writer.write_frame(&[0xFF, 0xD8, 0x01, 0xFF, 0xD9])?;
        writer.write_frame(&[0xFF, 0xD8, 0x02, 0x03, 0xFF, 0xD9])?;
        let summary = writer.finish()?;
        assert_eq!(summary.frames, 2);

        let bytes = std::fs::read(&path)?;
        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"AVI ");
        assert_eq!(read_u32(&bytes, 4) as usize, bytes.len() - 8);
        assert_eq!(summary.bytes as usize, bytes.len());

        // avih dwTotalFrames and strh dwLength both carry the frame count.
        assert_eq!(read_u32(&bytes, 48), 2);
        assert_eq!(read_u32(&bytes, 140), 2);

        // movi list: size covers the fourcc plus both padded chunks.
        assert_eq!(&bytes[220..224], b"movi");
        let chunk_bytes = (8 + 6) + (8 + 6); // 5-byte payload padded to 6
        assert_eq!(read_u32(&bytes, 216) as usize, 4 + chunk_bytes);

        // First chunk sits right after the movi fourcc.
        assert_eq!(&bytes[224..228], b"00dc");
        assert_eq!(read_u32(&bytes, 228), 5);

        // idx1 follows the movi list with one entry per frame.
        let idx_at = 224 + chunk_bytes;
        assert_eq!(&bytes[idx_at..idx_at + 4], b"idx1");
        assert_eq!(read_u32(&bytes, idx_at + 4), 32);
        assert_eq!(read_u32(&bytes, idx_at + 16), 4); // first offset
        assert_eq!(read_u32(&bytes, idx_at + 20), 5); // first size
        Ok(())
    }

    #[test]
    fn rejects_nonpositive_rate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.avi");
        let err = AviWriter::new(&path, 640, 480, 0.0).expect_err("zero fps");
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::EncoderInitFailure(_))
        ));
    }
}
