//! Render session: encoders, their output channels and the muxer.
//!
//! Encoders push chunks on bounded channels. The session drains those
//! channels into the muxer from the capture task, so the muxer has a single
//! owner and never needs locking.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use viralize_common::{ViralizeError, ViralizeResult};
use viralize_processing_core::PlanarChunk;

use crate::encoder::{AudioEncoder, EncoderEvent, VideoEncoder, VideoFrame};
use crate::muxer::Muxer;

/// Capacity of each encoder output channel.
pub const CHUNK_CHANNEL_CAPACITY: usize = 64;

/// Shared "session is running" flag. Clearing it stops every loop.
///
/// `cancel` latches: a flag cancelled before `start` never starts.
#[derive(Debug, Clone, Default)]
pub struct RunFlag {
    running: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
}

impl RunFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        if self.cancelled.load(Ordering::SeqCst) {
            self.running.store(false, Ordering::SeqCst);
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Stop now and refuse any later `start`.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Non-fatal problems collected during an export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportWarning {
    /// Audio could not be decoded; the file has no audio track.
    AudioUnavailable(String),
    /// The audio encoder failed; the file has no audio track.
    AudioEncodingFailed(String),
    /// Flushing audio failed; whatever was encoded was kept.
    AudioFlushFailed(String),
}

impl fmt::Display for ExportWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportWarning::AudioUnavailable(e) => write!(f, "audio unavailable, exporting without sound: {e}"),
            ExportWarning::AudioEncodingFailed(e) => write!(f, "audio encoding failed, exporting without sound: {e}"),
            ExportWarning::AudioFlushFailed(e) => write!(f, "audio flush failed: {e}"),
        }
    }
}

/// Current encoder backlog.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    pub video: usize,
    pub audio: usize,
}

impl QueueDepth {
    pub fn max(&self) -> usize {
        self.video.max(self.audio)
    }
}

struct AudioLane {
    encoder: Box<dyn AudioEncoder>,
    output: mpsc::Receiver<EncoderEvent>,
}

/// Everything a running export writes through.
pub struct RenderSession {
    video: Box<dyn VideoEncoder>,
    video_output: mpsc::Receiver<EncoderEvent>,
    audio: Option<AudioLane>,
    muxer: Box<dyn Muxer>,
    video_chunks: u64,
    audio_chunks: u64,
    warnings: Vec<ExportWarning>,
}

/// Result of a finished session.
#[derive(Debug)]
pub struct FinishedSession {
    pub bytes: Vec<u8>,
    pub video_chunks: u64,
    pub audio_chunks: u64,
    pub has_audio: bool,
    pub warnings: Vec<ExportWarning>,
}

impl RenderSession {
    pub fn new(
        video: Box<dyn VideoEncoder>,
        video_output: mpsc::Receiver<EncoderEvent>,
        muxer: Box<dyn Muxer>,
    ) -> Self {
        Self {
            video,
            video_output,
            audio: None,
            muxer,
            video_chunks: 0,
            audio_chunks: 0,
            warnings: Vec::new(),
        }
    }

    pub fn with_audio(
        mut self,
        encoder: Box<dyn AudioEncoder>,
        output: mpsc::Receiver<EncoderEvent>,
    ) -> Self {
        self.audio = Some(AudioLane { encoder, output });
        self
    }

    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    pub fn warn(&mut self, warning: ExportWarning) {
        tracing::warn!(%warning, "Export warning");
        self.warnings.push(warning);
    }

    pub fn warnings(&self) -> &[ExportWarning] {
        &self.warnings
    }

    pub fn video_chunks(&self) -> u64 {
        self.video_chunks
    }

    pub fn audio_chunks(&self) -> u64 {
        self.audio_chunks
    }

    pub fn encode_video(&mut self, frame: VideoFrame, key_frame: bool) -> ViralizeResult<()> {
        self.video.encode(frame, key_frame)
    }

    /// Submit audio. A failure drops the audio track and is not an error.
    pub fn encode_audio(&mut self, chunk: PlanarChunk) {
        let Some(lane) = self.audio.as_mut() else {
            return;
        };
        if let Err(e) = lane.encoder.encode(chunk) {
            self.abandon_audio(ExportWarning::AudioEncodingFailed(e.to_string()));
        }
    }

    pub fn queue_depth(&self) -> QueueDepth {
        QueueDepth {
            video: self.video.queue_size(),
            audio: self.audio.as_ref().map_or(0, |a| a.encoder.queue_size()),
        }
    }

    /// Close the audio encoder and remove the audio track from the output.
    pub fn abandon_audio(&mut self, warning: ExportWarning) {
        if let Some(mut lane) = self.audio.take() {
            lane.encoder.close();
            self.muxer.discard_audio();
            self.audio_chunks = 0;
            self.warn(warning);
        }
    }

    /// Move every chunk already emitted into the muxer.
    ///
    /// A video encoder error is fatal; an audio encoder error drops audio.
    pub fn drain(&mut self) -> ViralizeResult<()> {
        loop {
            match self.video_output.try_recv() {
                Ok(event) => self.route_video(event)?,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        while let Some(lane) = self.audio.as_mut() {
            match lane.output.try_recv() {
                Ok(event) => self.route_audio(event)?,
                Err(_) => break,
            }
        }
        Ok(())
    }

    fn route_video(&mut self, event: EncoderEvent) -> ViralizeResult<()> {
        match event {
            EncoderEvent::Chunk(chunk) => {
                self.muxer.add_video_chunk(chunk)?;
                self.video_chunks += 1;
                Ok(())
            }
            EncoderEvent::Error(e) => Err(e),
        }
    }

    fn route_audio(&mut self, event: EncoderEvent) -> ViralizeResult<()> {
        match event {
            EncoderEvent::Chunk(chunk) => {
                self.muxer.add_audio_chunk(chunk)?;
                self.audio_chunks += 1;
            }
            EncoderEvent::Error(e) => {
                self.abandon_audio(ExportWarning::AudioEncodingFailed(e.to_string()));
            }
        }
        Ok(())
    }

    async fn flush_video(&mut self) -> ViralizeResult<()> {
        {
            let Self {
                video,
                video_output,
                muxer,
                video_chunks,
                ..
            } = &mut *self;
            let mut flush = video.flush();

            loop {
                tokio::select! {
                    biased;
                    result = &mut flush => {
                        result?;
                        break;
                    }
                    event = video_output.recv() => match event {
                        Some(EncoderEvent::Chunk(chunk)) => {
                            muxer.add_video_chunk(chunk)?;
                            *video_chunks += 1;
                        }
                        Some(EncoderEvent::Error(e)) => return Err(e),
                        None => {
                            (&mut flush).await?;
                            break;
                        }
                    },
                }
            }
        }
        self.drain()
    }

    async fn flush_audio(&mut self) -> ViralizeResult<()> {
        let (flushed, failure, routed) = {
            let Some(lane) = self.audio.as_mut() else {
                return Ok(());
            };
            let AudioLane { encoder, output } = lane;
            let muxer = &mut self.muxer;
            let mut routed = 0u64;
            let mut failure = None;

            let mut flush = encoder.flush();
            let flushed = loop {
                tokio::select! {
                    biased;
                    result = &mut flush => break result,
                    event = output.recv() => match event {
                        Some(EncoderEvent::Chunk(chunk)) => {
                            muxer.add_audio_chunk(chunk)?;
                            routed += 1;
                        }
                        Some(EncoderEvent::Error(e)) => failure = Some(e),
                        None => break (&mut flush).await,
                    },
                }
            };
            (flushed, failure, routed)
        };
        self.audio_chunks += routed;

        match (flushed, failure) {
            (Err(e), _) | (Ok(()), Some(e)) => {
                self.warn(ExportWarning::AudioFlushFailed(e.to_string()));
                Ok(())
            }
            (Ok(()), None) => self.drain(),
        }
    }

    /// Flush both encoders and write the container.
    ///
    /// A video flush failure is fatal. Audio flush failures are recorded as
    /// warnings. A session that produced no video frames is an error.
    pub async fn finish(mut self) -> ViralizeResult<FinishedSession> {
        self.flush_video().await?;
        self.flush_audio().await?;

        if let Some(lane) = self.audio.as_mut() {
            lane.encoder.close();
        }
        self.video.close();

        if self.video_chunks == 0 {
            return Err(ViralizeError::encode("no frames were processed"));
        }

        let has_audio = self.muxer.has_audio() && self.audio_chunks > 0;
        let bytes = self.muxer.finalize().map_err(friendly_mux_error)?;
        Ok(FinishedSession {
            bytes,
            video_chunks: self.video_chunks,
            audio_chunks: self.audio_chunks,
            has_audio,
            warnings: self.warnings,
        })
    }

    /// Stop both encoders without writing anything.
    pub fn abort(mut self) {
        self.video.close();
        if let Some(mut lane) = self.audio.take() {
            lane.encoder.close();
        }
    }
}

/// Replace colour-metadata failures with an actionable message.
fn friendly_mux_error(e: ViralizeError) -> ViralizeError {
    let text = e.to_string();
    let lower = text.to_ascii_lowercase();
    if lower.contains("colorspace") || lower.contains("colour") || lower.contains("color space") {
        ViralizeError::mux(format!(
            "the video's colour metadata could not be written; try re-encoding the source ({text})"
        ))
    } else {
        e
    }
}
