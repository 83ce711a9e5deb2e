//! Export orchestration.
//!
//! An export walks a fixed sequence of stages:
//!
//! ```text
//! Idle → MetadataWait → AudioDecode → EncoderSetup → Capturing → Finalizing → Done
//!                 \____________\_____________\____________\____________\____→ Failed
//! ```
//!
//! Audio problems never fail an export; they degrade it to video-only and
//! are reported as warnings. Whatever happens, playback is restored to its
//! interactive state (start, normal speed, looping, playing) afterwards.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use resvg::tiny_skia::Pixmap;
use tokio::sync::mpsc;
use viralize_common::{AppConfig, CaptureTuning, ViralizeError, ViralizeResult};
use viralize_processing_core::aac_bitrate;
use viralize_project_model::{CompositionState, ReelResolution, SourceMedia};

use crate::audio::encode_audio_track;
use crate::capture::{capture_video, CaptureParams, CaptureStats};
use crate::compositor::FrameCompositor;
use crate::encoder::{
    select_video_codec, AudioDecoder, AudioEncoderConfig, EncoderBackend, VideoCodec,
    VideoEncoderConfig, VIDEO_CODEC_CANDIDATES,
};
use crate::muxer::{AudioTrackConfig, Mp4Muxer, MuxerConfig, VideoTrackConfig};
use crate::playback::{wait_for_metadata, PlaybackSource};
use crate::session::{ExportWarning, RenderSession, RunFlag, CHUNK_CHANNEL_CAPACITY};

/// Progress callback for export rendering.
pub type ProgressCallback = Box<dyn Fn(ExportProgress) + Send + Sync>;

/// Export progress report.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportProgress {
    /// Current stage.
    pub stage: ExportStage,

    /// Current progress [0.0, 1.0].
    pub progress: f64,

    /// Frames captured so far.
    pub frames_rendered: u64,

    /// Expected number of output frames.
    pub total_frames: u64,

    /// Media time reached, in seconds.
    pub media_time_secs: f64,

    /// Encoded frames per wall-clock second.
    pub encode_fps: f64,
}

impl ExportProgress {
    pub fn stage(stage: ExportStage) -> Self {
        let progress = if stage == ExportStage::Done { 1.0 } else { 0.0 };
        Self {
            stage,
            progress,
            frames_rendered: 0,
            total_frames: 0,
            media_time_secs: 0.0,
            encode_fps: 0.0,
        }
    }

    pub fn capturing(
        frames_rendered: u64,
        total_frames: u64,
        media_time_secs: f64,
        duration_secs: f64,
        encode_fps: f64,
    ) -> Self {
        let progress = if duration_secs > 0.0 {
            (media_time_secs / duration_secs).clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            stage: ExportStage::Capturing,
            progress,
            frames_rendered,
            total_frames,
            media_time_secs,
            encode_fps,
        }
    }
}

/// Stages of the export process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportStage {
    Idle,
    MetadataWait,
    AudioDecode,
    EncoderSetup,
    Capturing,
    Finalizing,
    Done,
    Failed,
}

impl ExportStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExportStage::Done | ExportStage::Failed)
    }
}

/// Output settings of an export.
#[derive(Debug, Clone)]
pub struct ExportSettings {
    pub resolution: ReelResolution,
    pub fps: u32,
    pub video_bitrate: u32,
    pub keyframe_interval: u64,
    pub codec_candidates: Vec<VideoCodec>,
    pub tuning: CaptureTuning,
}

impl Default for ExportSettings {
    fn default() -> Self {
        let config = AppConfig::default();
        Self {
            resolution: ReelResolution::default(),
            fps: config.export.fps,
            video_bitrate: config.export.video_bitrate,
            keyframe_interval: config.export.keyframe_interval,
            codec_candidates: VIDEO_CODEC_CANDIDATES.to_vec(),
            tuning: config.capture,
        }
    }
}

impl ExportSettings {
    pub fn from_config(config: &AppConfig) -> ViralizeResult<Self> {
        Ok(Self {
            resolution: config.export.resolution.parse()?,
            fps: config.export.fps,
            video_bitrate: config.export.video_bitrate,
            keyframe_interval: config.export.keyframe_interval,
            codec_candidates: VIDEO_CODEC_CANDIDATES.to_vec(),
            tuning: config.capture.clone(),
        })
    }

    pub fn with_resolution(mut self, resolution: ReelResolution) -> Self {
        self.resolution = resolution;
        self
    }
}

/// An export job ready to be rendered.
#[derive(Debug, Clone)]
pub struct ExportJob {
    pub source: SourceMedia,

    /// Snapshot of the composition taken when the export started.
    pub composition: CompositionState,

    pub settings: ExportSettings,
}

/// A finished export.
#[derive(Debug)]
pub struct ExportOutput {
    pub bytes: Vec<u8>,
    pub codec: VideoCodec,
    pub resolution: ReelResolution,
    pub video_chunks: u64,
    pub audio_chunks: u64,
    pub has_audio: bool,
    pub warnings: Vec<ExportWarning>,
    pub capture: CaptureStats,
    pub suggested_filename: String,
}

impl ExportOutput {
    /// Write the file into `dir` under its suggested name.
    pub fn write_to_dir(&self, dir: &Path) -> ViralizeResult<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(&self.suggested_filename);
        std::fs::write(&path, &self.bytes)?;
        tracing::info!(path = %path.display(), bytes = self.bytes.len(), "Export written");
        Ok(path)
    }
}

/// Download name for an export finished at `now`.
pub fn suggested_filename(now: DateTime<Utc>) -> String {
    format!("viralize-reel-{}.mp4", now.timestamp_millis())
}

fn report(progress: Option<&ProgressCallback>, stage: ExportStage) {
    tracing::debug!(?stage, "Export stage");
    if let Some(cb) = progress {
        cb(ExportProgress::stage(stage));
    }
}

/// Render `job` from `playback` into an MP4.
///
/// `run` is raised for the duration of the export and lowered when it ends;
/// lowering it from outside cancels the export. A flag cancelled before the
/// call fails the export right away.
#[allow(clippy::too_many_arguments)]
pub async fn export_reel<P: PlaybackSource + ?Sized>(
    job: &ExportJob,
    playback: &mut P,
    compositor: &mut FrameCompositor,
    backend: &dyn EncoderBackend,
    audio_decoder: &dyn AudioDecoder,
    run: &RunFlag,
    progress: Option<&ProgressCallback>,
) -> ViralizeResult<ExportOutput> {
    tracing::info!(
        source = %job.source.path.display(),
        resolution = %job.settings.resolution,
        backend = backend.name(),
        "Starting export"
    );
    run.start();

    let result = run_export(job, playback, compositor, backend, audio_decoder, run, progress).await;

    run.stop();
    restore_playback(playback);

    match &result {
        Ok(output) => {
            tracing::info!(
                codec = output.codec.codec_string(),
                frames = output.capture.frames,
                has_audio = output.has_audio,
                bytes = output.bytes.len(),
                warnings = output.warnings.len(),
                "Export complete"
            );
            report(progress, ExportStage::Done);
        }
        Err(e) => {
            tracing::error!(error = %e, "Export failed");
            report(progress, ExportStage::Failed);
        }
    }
    result
}

fn restore_playback<P: PlaybackSource + ?Sized>(playback: &mut P) {
    if let Err(e) = playback.seek(0.0) {
        tracing::warn!(error = %e, "Failed to rewind playback after export");
    }
    playback.set_playback_rate(1.0);
    playback.set_looping(true);
    playback.play();
}

#[allow(clippy::too_many_arguments)]
async fn run_export<P: PlaybackSource + ?Sized>(
    job: &ExportJob,
    playback: &mut P,
    compositor: &mut FrameCompositor,
    backend: &dyn EncoderBackend,
    audio_decoder: &dyn AudioDecoder,
    run: &RunFlag,
    progress: Option<&ProgressCallback>,
) -> ViralizeResult<ExportOutput> {
    if !run.is_running() {
        return Err(ViralizeError::Cancelled);
    }
    let settings = &job.settings;
    let tuning = &settings.tuning;

    report(progress, ExportStage::MetadataWait);
    let duration = wait_for_metadata(
        playback,
        std::time::Duration::from_millis(tuning.metadata_timeout_ms),
    )
    .await?;
    let (width, height) = settings.resolution.dimensions();

    report(progress, ExportStage::AudioDecode);
    let mut warnings = Vec::new();
    let audio = match audio_decoder.decode(&job.source).await {
        Ok(audio) => {
            tracing::debug!(
                sample_rate = audio.sample_rate(),
                channels = audio.channel_count(),
                secs = audio.duration_secs(),
                "Audio decoded"
            );
            Some(audio)
        }
        Err(e) => {
            warnings.push(ExportWarning::AudioUnavailable(e.to_string()));
            None
        }
    };
    if !run.is_running() {
        return Err(ViralizeError::Cancelled);
    }

    report(progress, ExportStage::EncoderSetup);
    let base = VideoEncoderConfig::new(
        VideoCodec::Hevc,
        width,
        height,
        settings.fps,
        settings.video_bitrate,
        u32::try_from(settings.keyframe_interval)
            .map_err(|_| ViralizeError::validation("keyframe interval too large"))?,
    )?;
    let video_config = select_video_codec(backend, &settings.codec_candidates, &base)?;
    let (video_tx, video_rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
    let video_encoder = backend.video_encoder(&video_config, video_tx)?;

    let audio_lane = audio.as_ref().and_then(|audio| {
        let channels = audio.channel_count();
        let setup = AudioEncoderConfig::new(audio.sample_rate(), channels, aac_bitrate(channels))
            .and_then(|config| {
                let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
                backend
                    .audio_encoder(&config, tx)
                    .map(|encoder| (config, encoder, rx))
            });
        match setup {
            Ok(lane) => Some(lane),
            Err(e) => {
                warnings.push(ExportWarning::AudioEncodingFailed(e.to_string()));
                None
            }
        }
    });

    let muxer = Mp4Muxer::new(MuxerConfig {
        video: VideoTrackConfig {
            codec: video_config.codec(),
            width,
            height,
        },
        audio: audio_lane.as_ref().map(|(config, _, _)| AudioTrackConfig {
            sample_rate: config.sample_rate(),
            channels: config.channels(),
            bitrate: config.bitrate(),
        }),
    });
    let mut session = RenderSession::new(video_encoder, video_rx, Box::new(muxer));
    if let Some((_, encoder, rx)) = audio_lane {
        session = session.with_audio(encoder, rx);
    }
    for warning in warnings {
        session.warn(warning);
    }

    if let (Some(audio), true) = (&audio, session.has_audio()) {
        if let Err(e) = encode_audio_track(
            &mut session,
            audio,
            tuning.audio_chunk_frames,
            tuning.audio_yield_every,
            run,
        )
        .await
        {
            session.abort();
            return Err(e);
        }
    }

    report(progress, ExportStage::Capturing);
    let rate = settings.resolution.playback_rate();
    playback.set_looping(false);
    playback.set_playback_rate(rate);
    playback.seek(0.0)?;
    playback.play();

    let mut surface = Pixmap::new(width, height)
        .ok_or_else(|| ViralizeError::render(format!("cannot allocate {width}x{height} surface")))?;
    let params = CaptureParams {
        fps: settings.fps,
        keyframe_interval: settings.keyframe_interval,
        duration_secs: duration,
        playback_rate: rate,
        tuning: tuning.clone(),
    };
    let capture = match capture_video(
        &mut session,
        playback,
        compositor,
        &job.composition,
        &mut surface,
        &params,
        run,
        progress,
    )
    .await
    {
        Ok(stats) => stats,
        Err(e) => {
            session.abort();
            return Err(e);
        }
    };

    report(progress, ExportStage::Finalizing);
    run.stop();
    let finished = session.finish().await?;

    Ok(ExportOutput {
        bytes: finished.bytes,
        codec: video_config.codec(),
        resolution: settings.resolution,
        video_chunks: finished.video_chunks,
        audio_chunks: finished.audio_chunks,
        has_audio: finished.has_audio,
        warnings: finished.warnings,
        capture,
        suggested_filename: suggested_filename(Utc::now()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_suggested_filename_uses_millis() {
        let at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        assert_eq!(suggested_filename(at), "viralize-reel-1700000000123.mp4");
    }

    #[test]
    fn test_capture_progress_clamped() {
        let p = ExportProgress::capturing(30, 300, 6.0, 5.0, 60.0);
        assert_eq!(p.progress, 1.0);
        assert_eq!(p.stage, ExportStage::Capturing);
        assert!(ExportStage::Done.is_terminal());
        assert!(!ExportStage::Capturing.is_terminal());
    }

    #[test]
    fn test_settings_from_config() {
        let mut config = AppConfig::default();
        config.export.resolution = "1080p".into();
        let settings = ExportSettings::from_config(&config).unwrap();
        assert_eq!(settings.resolution, ReelResolution::P1080);
        assert_eq!(settings.fps, 60);
        assert_eq!(settings.keyframe_interval, 120);

        config.export.resolution = "4k".into();
        assert!(ExportSettings::from_config(&config).is_err());
    }

    #[test]
    fn test_write_to_dir_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let output = ExportOutput {
            bytes: vec![0, 0, 0, 8, b'f', b'r', b'e', b'e'],
            codec: VideoCodec::Avc,
            resolution: ReelResolution::P720,
            video_chunks: 1,
            audio_chunks: 0,
            has_audio: false,
            warnings: Vec::new(),
            capture: CaptureStats::default(),
            suggested_filename: "viralize-reel-1.mp4".to_string(),
        };

        let path = output.write_to_dir(&dir.path().join("reels")).unwrap();
        assert_eq!(path, dir.path().join("reels").join("viralize-reel-1.mp4"));
        assert_eq!(std::fs::read(&path).unwrap(), output.bytes);
    }
}
