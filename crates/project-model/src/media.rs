//! Source media and output resolution presets.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use viralize_common::{ViralizeError, ViralizeResult};

/// Largest accepted upload, in bytes (100 MiB).
pub const MAX_SOURCE_BYTES: u64 = 100 * 1024 * 1024;

/// An uploaded source video.
///
/// Immutable once created; a re-upload replaces it wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMedia {
    /// Location of the video file.
    pub path: PathBuf,

    /// File size in bytes (validated against [`MAX_SOURCE_BYTES`]).
    pub byte_size: u64,

    /// Container format name as reported by the prober.
    #[serde(default)]
    pub container: Option<String>,

    /// Video codec name as reported by the prober.
    #[serde(default)]
    pub video_codec: Option<String>,

    /// Natural frame width in pixels.
    pub width: u32,

    /// Natural frame height in pixels.
    pub height: u32,

    /// Duration in seconds, if the metadata reported one.
    #[serde(default)]
    pub duration_secs: Option<f64>,

    /// Primary audio stream, if any.
    #[serde(default)]
    pub audio: Option<AudioStreamInfo>,
}

/// Audio stream description from the prober.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioStreamInfo {
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u16,
}

impl SourceMedia {
    /// Create a source description, rejecting oversized uploads.
    pub fn new(path: impl Into<PathBuf>, byte_size: u64, width: u32, height: u32) -> ViralizeResult<Self> {
        validate_upload_size(byte_size)?;
        if width == 0 || height == 0 {
            return Err(ViralizeError::validation(format!(
                "video has invalid dimensions {width}x{height}"
            )));
        }
        Ok(Self {
            path: path.into(),
            byte_size,
            container: None,
            video_codec: None,
            width,
            height,
            duration_secs: None,
            audio: None,
        })
    }

    /// Check a file on disk against the upload limit before probing it.
    pub fn check_file(path: &Path) -> ViralizeResult<u64> {
        let metadata = std::fs::metadata(path).map_err(|_| ViralizeError::FileNotFound {
            path: path.to_path_buf(),
        })?;
        validate_upload_size(metadata.len())?;
        Ok(metadata.len())
    }

    /// Duration, if known, finite and positive.
    pub fn valid_duration(&self) -> Option<f64> {
        self.duration_secs.filter(|d| d.is_finite() && *d > 0.0)
    }

    /// Natural aspect ratio (width / height).
    pub fn aspect_ratio(&self) -> f64 {
        self.width as f64 / self.height.max(1) as f64
    }
}

/// Reject uploads larger than [`MAX_SOURCE_BYTES`].
pub fn validate_upload_size(byte_size: u64) -> ViralizeResult<()> {
    if byte_size > MAX_SOURCE_BYTES {
        return Err(ViralizeError::validation(format!(
            "video must be under 100 MB (got {:.1} MB)",
            byte_size as f64 / (1024.0 * 1024.0)
        )));
    }
    Ok(())
}

/// Output resolution preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ReelResolution {
    #[default]
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "1080p")]
    P1080,
}

impl ReelResolution {
    /// Output canvas size (portrait 9:16).
    pub fn dimensions(self) -> (u32, u32) {
        match self {
            ReelResolution::P720 => (720, 1280),
            ReelResolution::P1080 => (1080, 1920),
        }
    }

    /// Source playback rate while capturing.
    ///
    /// The larger preset plays slower so compositing keeps up.
    pub fn playback_rate(self) -> f64 {
        match self {
            ReelResolution::P720 => 1.0,
            ReelResolution::P1080 => 0.75,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ReelResolution::P720 => "720p",
            ReelResolution::P1080 => "1080p",
        }
    }
}

impl fmt::Display for ReelResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ReelResolution {
    type Err = ViralizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "720p" | "720" | "hd" => Ok(ReelResolution::P720),
            "1080p" | "1080" | "fullhd" | "fhd" => Ok(ReelResolution::P1080),
            other => Err(ViralizeError::validation(format!(
                "unknown resolution '{other}' (expected 720p or 1080p)"
            ))),
        }
    }
}
