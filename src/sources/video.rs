//! Video frame extraction source
//!
//! Extracts a poster frame from a video by shelling out to ffmpeg, scaled
//! to the declared height. The render chain registers one instance per
//! resolution tier so small tile requests never pay for a full-resolution
//! extraction. Absent ffmpeg, no video sources are registered and videos
//! simply have no renditions.

use crate::config::Fit;
use crate::error::{SourceError, SourceResult};
use crate::sources::{retry_transient, Declared, ReadSource, SourceMeta};
use crate::types::{CancelToken, ImageId, SharedBytes};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

/// Resolution tiers registered in the render chain, smallest first
pub const VIDEO_TIERS: &[u32] = &[120, 360, 720];

/// Locate ffmpeg on PATH
pub fn find_ffmpeg() -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        for name in ["ffmpeg", "ffmpeg.exe"] {
            let candidate = dir.join(name);
            if candidate.is_file() {
                debug!(path = %candidate.display(), "found ffmpeg");
                return Some(candidate);
            }
        }
    }
    None
}

pub struct VideoFrameSource {
    name: String,
    ffmpeg: PathBuf,
    height: u32,
}

impl VideoFrameSource {
    pub fn new(ffmpeg: PathBuf, height: u32) -> Self {
        Self {
            name: format!("ffmpeg-{}p", height),
            ffmpeg,
            height,
        }
    }

    fn extract_frame(&self, path: &str) -> SourceResult<Vec<u8>> {
        let output = Command::new(&self.ffmpeg)
            .args([
                "-hide_banner",
                "-loglevel",
                "error",
                "-i",
                path,
                "-frames:v",
                "1",
                "-vf",
                &format!("scale=-2:{}", self.height),
                "-f",
                "image2pipe",
                "-c:v",
                "mjpeg",
                "pipe:1",
            ])
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .stdout(Stdio::piped())
            .output()
            .map_err(|e| SourceError::transient(&self.name, e))?;

        if !output.status.success() {
            return Err(SourceError::transient(
                &self.name,
                String::from_utf8_lossy(&output.stderr).trim(),
            ));
        }
        if output.stdout.is_empty() {
            return Err(SourceError::transient(&self.name, "ffmpeg produced no frame"));
        }
        Ok(output.stdout)
    }
}

impl SourceMeta for VideoFrameSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn declared(&self) -> Declared {
        // Width scales with the aspect ratio; the declared box is square on
        // the constrained edge.
        Declared::bounded(self.height * 2, self.height, Fit::Inside)
    }

    fn exists(&self, _id: ImageId, path: &str) -> bool {
        Path::new(path).is_file()
    }
}

impl ReadSource for VideoFrameSource {
    fn read(&self, _ctx: &CancelToken, _id: ImageId, path: &str) -> SourceResult<SharedBytes> {
        if !Path::new(path).is_file() {
            return Err(SourceError::NotFound);
        }
        retry_transient(2, || self.extract_frame(path).map(SharedBytes::from))
    }
}
