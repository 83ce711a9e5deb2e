//! Video capture loop.
//!
//! Samples the playing source at a fixed output rate, composites each frame
//! and hands it to the video encoder. Playback runs in real time (scaled by
//! the playback rate), so capture pauses it whenever the encoders fall
//! behind and resumes once they catch up.

use std::time::Duration;

use resvg::tiny_skia::Pixmap;
use tokio::time::Instant;
use viralize_common::{
    frame_duration_us, secs_to_us, CadenceDecision, CaptureTuning, FrameCadence, ViralizeError,
    ViralizeResult,
};
use viralize_project_model::CompositionState;

use crate::compositor::FrameCompositor;
use crate::encoder::VideoFrame;
use crate::export::{ExportProgress, ProgressCallback};
use crate::playback::PlaybackSource;
use crate::session::{RenderSession, RunFlag};

/// Longest sleep between loop iterations, one display refresh.
pub const DISPLAY_TICK: Duration = Duration::from_micros(16_667);

const MIN_SLEEP: Duration = Duration::from_millis(1);

/// Default distance from the end of the source at which capture stops.
pub const DEFAULT_END_EPSILON_SECS: f64 = 0.1;

/// Fixed parameters of one capture run.
#[derive(Debug, Clone)]
pub struct CaptureParams {
    pub fps: u32,
    pub keyframe_interval: u64,
    pub duration_secs: f64,
    pub playback_rate: f64,
    pub tuning: CaptureTuning,
}

impl CaptureParams {
    /// Capture stops once media time is within this distance of the end.
    pub fn end_epsilon_secs(&self) -> f64 {
        self.tuning
            .end_epsilon_secs
            .filter(|e| e.is_finite() && *e >= 0.0)
            .unwrap_or(DEFAULT_END_EPSILON_SECS)
    }

    fn total_frames(&self) -> u64 {
        (self.duration_secs * self.fps as f64).ceil() as u64
    }
}

/// One pause-for-backpressure episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackpressureEvent {
    pub frame_index: u64,
    pub paused_at_depth: usize,
    pub resumed_at_depth: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaptureStats {
    pub frames: u64,
    pub keyframes: u64,
    pub resyncs: u64,
    pub skipped_slots: u64,
    pub watchdog_restarts: u32,
    pub backpressure: Vec<BackpressureEvent>,
    pub first_timestamp_us: Option<i64>,
    pub last_timestamp_us: Option<i64>,
}

/// Run the capture loop until the source ends.
///
/// Any error clears `run` before it is returned so sibling loops stop too.
#[allow(clippy::too_many_arguments)]
pub async fn capture_video<P: PlaybackSource + ?Sized>(
    session: &mut RenderSession,
    playback: &mut P,
    compositor: &mut FrameCompositor,
    composition: &CompositionState,
    surface: &mut Pixmap,
    params: &CaptureParams,
    run: &RunFlag,
    progress: Option<&ProgressCallback>,
) -> ViralizeResult<CaptureStats> {
    let result = capture_loop(
        session,
        playback,
        compositor,
        composition,
        surface,
        params,
        run,
        progress,
    )
    .await;
    if let Err(e) = &result {
        tracing::error!(error = %e, "Capture failed");
        run.stop();
    }
    result
}

#[allow(clippy::too_many_arguments)]
async fn capture_loop<P: PlaybackSource + ?Sized>(
    session: &mut RenderSession,
    playback: &mut P,
    compositor: &mut FrameCompositor,
    composition: &CompositionState,
    surface: &mut Pixmap,
    params: &CaptureParams,
    run: &RunFlag,
    progress: Option<&ProgressCallback>,
) -> ViralizeResult<CaptureStats> {
    let tuning = &params.tuning;
    let end_at = params.duration_secs - params.end_epsilon_secs();
    let frame_duration = frame_duration_us(params.fps) as i64;
    let watchdog = Duration::from_millis(tuning.watchdog_ms);
    let poll = Duration::from_millis(tuning.backpressure_poll_ms.max(1));
    let keyframe_interval = params.keyframe_interval.max(1);
    let progress_every = tuning.progress_every_frames.max(1);

    let mut cadence = FrameCadence::new(params.fps, tuning.cadence);
    let mut stats = CaptureStats::default();
    let started = Instant::now();
    let wall_clock = std::time::Instant::now();
    let mut watchdog_armed = true;

    tracing::info!(
        duration_secs = params.duration_secs,
        fps = params.fps,
        rate = params.playback_rate,
        end_at,
        "Capture started"
    );

    loop {
        if !run.is_running() {
            return Err(ViralizeError::Cancelled);
        }
        session.drain()?;

        let t = playback.current_time();
        if playback.is_ended() || t >= end_at {
            break;
        }

        if watchdog_armed && stats.frames == 0 && started.elapsed() >= watchdog {
            watchdog_armed = false;
            stats.watchdog_restarts += 1;
            tracing::warn!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                "No frame captured yet, restarting playback"
            );
            playback.seek(0.0)?;
            playback.play();
            cadence.reset_to(0.0);
            continue;
        }

        if playback.current_frame()?.is_none() {
            tokio::time::sleep(DISPLAY_TICK).await;
            continue;
        }

        match cadence.poll(t) {
            CadenceDecision::Wait => {
                sleep_until_due(&cadence, t, params.playback_rate).await;
                continue;
            }
            CadenceDecision::Resynced { skipped_frames } => {
                stats.resyncs += 1;
                stats.skipped_slots += skipped_frames;
                tracing::debug!(t, skipped_frames, "Capture fell behind, resynchronised cadence");
            }
            CadenceDecision::Capture => {}
        }

        let depth = session.queue_depth().max();
        if depth > tuning.backpressure_high {
            playback.pause();
            loop {
                tokio::time::sleep(poll).await;
                session.drain()?;
                if !run.is_running() {
                    return Err(ViralizeError::Cancelled);
                }
                if session.queue_depth().max() <= tuning.backpressure_low {
                    break;
                }
            }
            let event = BackpressureEvent {
                frame_index: stats.frames,
                paused_at_depth: depth,
                resumed_at_depth: session.queue_depth().max(),
            };
            tracing::debug!(?event, "Encoder backpressure released");
            stats.backpressure.push(event);
            playback.play();
        }

        let frame = playback.current_frame()?;
        compositor.draw(surface, composition, frame);

        let timestamp_us = secs_to_us(t);
        let key = stats.frames % keyframe_interval == 0;
        session.encode_video(
            VideoFrame {
                timestamp_us,
                duration_us: frame_duration,
                image: surface.clone(),
            },
            key,
        )?;

        stats.frames += 1;
        if key {
            stats.keyframes += 1;
        }
        stats.first_timestamp_us.get_or_insert(timestamp_us);
        stats.last_timestamp_us = Some(timestamp_us);

        if stats.frames % progress_every == 0 {
            let elapsed = wall_clock.elapsed().as_secs_f64();
            let encode_fps = if elapsed > 0.0 {
                stats.frames as f64 / elapsed
            } else {
                0.0
            };
            tracing::debug!(
                frames = stats.frames,
                media_secs = t,
                video_queue = session.queue_depth().video,
                audio_queue = session.queue_depth().audio,
                "Capture progress"
            );
            if let Some(cb) = progress {
                cb(ExportProgress::capturing(
                    stats.frames,
                    params.total_frames(),
                    t,
                    params.duration_secs,
                    encode_fps,
                ));
            }
        }

        sleep_until_due(&cadence, playback.current_time(), params.playback_rate).await;
    }

    tracing::info!(
        frames = stats.frames,
        keyframes = stats.keyframes,
        resyncs = stats.resyncs,
        backpressure_pauses = stats.backpressure.len(),
        "Capture finished"
    );
    Ok(stats)
}

/// Sleep until the next frame is due, at most one display tick.
async fn sleep_until_due(cadence: &FrameCadence, now_secs: f64, rate: f64) {
    let media_wait = (cadence.next_due_secs() - now_secs).max(0.0);
    let wall = Duration::from_secs_f64(media_wait / rate.max(f64::EPSILON));
    tokio::time::sleep(wall.clamp(MIN_SLEEP, DISPLAY_TICK)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(end_epsilon_secs: Option<f64>) -> CaptureParams {
        CaptureParams {
            fps: 60,
            keyframe_interval: 120,
            duration_secs: 5.0,
            playback_rate: 1.0,
            tuning: CaptureTuning {
                end_epsilon_secs,
                ..CaptureTuning::default()
            },
        }
    }

    #[test]
    fn test_end_epsilon_defaults_to_a_tenth_of_a_second() {
        assert_eq!(params(None).end_epsilon_secs(), 0.1);
        assert_eq!(params(Some(0.02)).end_epsilon_secs(), 0.02);
        assert_eq!(params(Some(-1.0)).end_epsilon_secs(), DEFAULT_END_EPSILON_SECS);
        assert_eq!(params(None).total_frames(), 300);
    }
}
