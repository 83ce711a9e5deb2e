//! Application configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::clock::CadencePolicy;

/// Global application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Directory where exported reels are written.
    pub output_dir: PathBuf,

    /// Path of the preferences store (profiles, quote state).
    pub preferences_path: PathBuf,

    /// Default export parameters.
    pub export: ExportDefaults,

    /// Capture loop tuning.
    pub capture: CaptureTuning,

    /// Font and asset configuration for the compositor.
    pub render: RenderDefaults,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Default export parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportDefaults {
    /// Output resolution label ("720p" or "1080p").
    pub resolution: String,

    /// Output frame rate.
    pub fps: u32,

    /// Target video bitrate in bits per second.
    pub video_bitrate: u32,

    /// Frames between forced keyframes.
    pub keyframe_interval: u64,

    /// ffmpeg executable used for decoding and encoding.
    pub ffmpeg_path: String,

    /// ffprobe executable used for metadata probing.
    pub ffprobe_path: String,
}

/// Tuning knobs for the capture and audio stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureTuning {
    /// Pause playback when the encoder queue exceeds this many frames.
    pub backpressure_high: usize,

    /// Resume playback once the encoder queue drains to this many frames.
    pub backpressure_low: usize,

    /// Poll interval while waiting for the encoder queue to drain.
    pub backpressure_poll_ms: u64,

    /// Restart playback once if no frame was captured within this window.
    pub watchdog_ms: u64,

    /// How long to wait for source metadata before giving up.
    pub metadata_timeout_ms: u64,

    /// Stop capturing within this many seconds of the end.
    /// `None` means 0.1 s.
    pub end_epsilon_secs: Option<f64>,

    /// Behaviour when encoding falls behind playback.
    pub cadence: CadencePolicy,

    /// Audio frames per encoder chunk.
    pub audio_chunk_frames: usize,

    /// Yield to the runtime after this many audio chunks.
    pub audio_yield_every: usize,

    /// Report capture progress every N frames.
    pub progress_every_frames: u64,
}

/// Compositor asset configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderDefaults {
    /// TrueType/OpenType font for body and handle text.
    pub font_regular: Option<PathBuf>,

    /// Bold font for the display name. Falls back to `font_regular`.
    pub font_bold: Option<PathBuf>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "viralize=debug,warn").
    pub level: String,

    /// Whether to output structured JSON logs.
    pub json: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            preferences_path: data_dir().join("preferences.json"),
            export: ExportDefaults::default(),
            capture: CaptureTuning::default(),
            render: RenderDefaults::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ExportDefaults {
    fn default() -> Self {
        Self {
            resolution: "720p".to_string(),
            fps: 60,
            video_bitrate: 12_000_000,
            keyframe_interval: 120,
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
        }
    }
}

impl Default for CaptureTuning {
    fn default() -> Self {
        Self {
            backpressure_high: 10,
            backpressure_low: 2,
            backpressure_poll_ms: 10,
            watchdog_ms: 1_500,
            metadata_timeout_ms: 2_000,
            end_epsilon_secs: None,
            cadence: CadencePolicy::default(),
            audio_chunk_frames: 1024,
            audio_yield_every: 50,
            progress_every_frames: 30,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Load config from the standard location, falling back to defaults.
    pub fn load() -> Self {
        Self::load_from(&config_file_path())
    }

    /// Load config from an explicit path, falling back to defaults.
    pub fn load_from(config_path: &Path) -> Self {
        if config_path.exists() {
            match std::fs::read_to_string(config_path) {
                Ok(content) => match serde_json::from_str(&content) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Failed to parse config at {:?}: {}", config_path, e);
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read config at {:?}: {}", config_path, e);
                }
            }
        }
        Self::default()
    }

    /// Save config to the standard location.
    pub fn save(&self) -> Result<(), std::io::Error> {
        self.save_to(&config_file_path())
    }

    /// Save config to an explicit path.
    pub fn save_to(&self, config_path: &Path) -> Result<(), std::io::Error> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(config_path, json)
    }
}

/// Standard config file location.
pub fn config_file_path() -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"));
    base.join("viralize").join("config.json")
}

fn data_dir() -> PathBuf {
    let base = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local").join("share"));
    base.join("viralize")
}

fn default_output_dir() -> PathBuf {
    home_dir().join("Videos").join("viralize")
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}
