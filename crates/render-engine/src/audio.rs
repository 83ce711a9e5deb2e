//! Audio stage: feeds the decoded track to the audio encoder.
//!
//! The whole track is submitted before video capture starts. The stage
//! yields to the runtime every few chunks and drains encoder output at
//! those points, so a long track never starves other tasks.

use viralize_common::{ViralizeError, ViralizeResult};
use viralize_processing_core::DecodedAudio;

use crate::session::{RenderSession, RunFlag};

/// Outcome of the audio stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AudioStageStats {
    pub chunks_submitted: u64,
    pub yields: u64,
}

/// Submit `audio` to the session's audio encoder in planar chunks.
///
/// Encoder failures drop the audio track (recorded as a session warning);
/// only cancellation and video-side failures surfaced while draining are
/// returned as errors.
pub async fn encode_audio_track(
    session: &mut RenderSession,
    audio: &DecodedAudio,
    chunk_frames: usize,
    yield_every: usize,
    run: &RunFlag,
) -> ViralizeResult<AudioStageStats> {
    let mut stats = AudioStageStats::default();
    let yield_every = yield_every.max(1) as u64;

    for chunk in audio.planar_chunks(chunk_frames) {
        if !run.is_running() {
            return Err(ViralizeError::Cancelled);
        }
        if !session.has_audio() {
            tracing::debug!(submitted = stats.chunks_submitted, "Audio track dropped, stopping audio stage");
            break;
        }

        session.encode_audio(chunk);
        stats.chunks_submitted += 1;

        if stats.chunks_submitted % yield_every == 0 {
            tokio::task::yield_now().await;
            session.drain()?;
            stats.yields += 1;
        }
    }

    session.drain()?;
    tracing::debug!(
        chunks = stats.chunks_submitted,
        frames = audio.frames(),
        sample_rate = audio.sample_rate(),
        "Audio submitted"
    );
    Ok(stats)
}
