//! In-process stand-ins for media decoding and encoding.
//!
//! These produce structurally valid streams without any external tools, so
//! the whole pipeline can run headless and deterministically. They back the
//! `selftest` command and the integration tests.

use std::f32::consts::TAU;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use viralize_common::{ViralizeError, ViralizeResult};
use viralize_processing_core::{DecodedAudio, PlanarChunk};
use viralize_project_model::SourceMedia;

use crate::compositor::solid_pixmap;
use crate::encoder::{
    AudioDecoder, AudioEncoder, AudioEncoderConfig, ChunkKind, DecoderConfig, EncodedChunk,
    EncoderBackend, EncoderEvent, EncoderOutput, VideoCodec, VideoEncoder, VideoEncoderConfig,
    VideoFrame,
};
use crate::playback::{DecodedFrame, FrameDecoder};

/// Upper bound on frames produced by a source of unknown length.
const UNBOUNDED_FRAME_LIMIT: u64 = 60 * 60 * 60;

/// Procedurally generated video: one solid colour per frame.
#[derive(Debug, Clone)]
pub struct SyntheticVideo {
    width: u32,
    height: u32,
    fps: f64,
    duration: Option<f64>,
    next_index: u64,
    stall_seeks: u32,
}

impl SyntheticVideo {
    pub fn new(width: u32, height: u32, fps: f64, duration: Option<f64>) -> Self {
        Self {
            width,
            height,
            fps,
            duration,
            next_index: 0,
            stall_seeks: 0,
        }
    }

    /// A source that yields nothing until it has been seeked `seeks` times.
    pub fn stalled_until_seek(mut self, seeks: u32) -> Self {
        self.stall_seeks = seeks;
        self
    }

    fn frame_count(&self) -> u64 {
        match self.duration {
            Some(d) => (d * self.fps).ceil() as u64,
            None => UNBOUNDED_FRAME_LIMIT,
        }
    }

    fn color(index: u64) -> [u8; 3] {
        [
            (index * 7 % 256) as u8,
            (index * 13 % 256) as u8,
            (200 - (index * 3 % 150)) as u8,
        ]
    }
}

impl FrameDecoder for SyntheticVideo {
    fn natural_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn duration_secs(&self) -> Option<f64> {
        self.duration
    }

    fn next_frame(&mut self) -> ViralizeResult<Option<DecodedFrame>> {
        if self.stall_seeks > 0 || self.next_index >= self.frame_count() {
            return Ok(None);
        }
        let index = self.next_index;
        self.next_index += 1;
        Ok(Some(DecodedFrame {
            pts_secs: index as f64 / self.fps,
            image: solid_pixmap(self.width, self.height, Self::color(index))?,
        }))
    }

    fn seek(&mut self, secs: f64) -> ViralizeResult<()> {
        self.stall_seeks = self.stall_seeks.saturating_sub(1);
        self.next_index = (secs.max(0.0) * self.fps + 1e-9).floor() as u64;
        Ok(())
    }
}

/// Sine-wave audio for any source, or a forced failure.
#[derive(Debug, Clone)]
pub struct SyntheticAudioDecoder {
    sample_rate: u32,
    channels: u16,
    failure: Option<String>,
}

impl SyntheticAudioDecoder {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            failure: None,
        }
    }

    /// Decoder that always fails, like a source whose audio cannot be read.
    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            sample_rate: 44_100,
            channels: 2,
            failure: Some(reason.into()),
        }
    }
}

#[async_trait]
impl AudioDecoder for SyntheticAudioDecoder {
    async fn decode(&self, source: &SourceMedia) -> ViralizeResult<DecodedAudio> {
        if let Some(reason) = &self.failure {
            return Err(ViralizeError::audio(reason.clone()));
        }
        let duration = source
            .valid_duration()
            .ok_or_else(|| ViralizeError::audio("source has no duration"))?;
        let frames = (duration * self.sample_rate as f64).round() as usize;
        let channels = (0..self.channels)
            .map(|ch| {
                let freq = 220.0 * (ch + 1) as f32;
                (0..frames)
                    .map(|i| (TAU * freq * i as f32 / self.sample_rate as f32).sin() * 0.25)
                    .collect()
            })
            .collect();
        DecodedAudio::new(self.sample_rate, channels)
    }
}

enum Job {
    Work {
        timestamp_us: i64,
        duration_us: i64,
        key: bool,
        fingerprint: u32,
    },
    Flush(oneshot::Sender<()>),
}

/// Shared worker behind both synthetic encoders.
struct SyntheticWorker {
    jobs: mpsc::UnboundedSender<Job>,
    pending: Arc<AtomicUsize>,
    closed: bool,
}

impl SyntheticWorker {
    fn spawn<F>(output: EncoderOutput, latency: Duration, fail_after: Option<u64>, make: F) -> Self
    where
        F: Fn(i64, i64, bool, u32) -> EncodedChunk + Send + 'static,
    {
        let (jobs, mut rx) = mpsc::unbounded_channel::<Job>();
        let pending = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pending);

        tokio::spawn(async move {
            let mut produced = 0u64;
            while let Some(job) = rx.recv().await {
                match job {
                    Job::Work {
                        timestamp_us,
                        duration_us,
                        key,
                        fingerprint,
                    } => {
                        if !latency.is_zero() {
                            tokio::time::sleep(latency).await;
                        }
                        let event = if fail_after.is_some_and(|n| produced >= n) {
                            EncoderEvent::Error(ViralizeError::encode("synthetic encoder failure"))
                        } else {
                            EncoderEvent::Chunk(make(timestamp_us, duration_us, key, fingerprint))
                        };
                        produced += 1;
                        counter.fetch_sub(1, Ordering::SeqCst);
                        if output.send(event).await.is_err() {
                            break;
                        }
                    }
                    Job::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });

        Self {
            jobs,
            pending,
            closed: false,
        }
    }

    fn submit(&mut self, timestamp_us: i64, duration_us: i64, key: bool, fingerprint: u32) -> ViralizeResult<()> {
        if self.closed {
            return Err(ViralizeError::encode("encoder is closed"));
        }
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.jobs
            .send(Job::Work {
                timestamp_us,
                duration_us,
                key,
                fingerprint,
            })
            .map_err(|_| {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                ViralizeError::encode("encoder worker stopped")
            })
    }

    fn queue_size(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    async fn flush(&mut self) -> ViralizeResult<()> {
        if self.closed {
            return Err(ViralizeError::encode("encoder is closed"));
        }
        let (tx, rx) = oneshot::channel();
        self.jobs
            .send(Job::Flush(tx))
            .map_err(|_| ViralizeError::encode("encoder worker stopped"))?;
        rx.await
            .map_err(|_| ViralizeError::encode("encoder worker stopped during flush"))
    }
}

fn avc_chunk(timestamp_us: i64, duration_us: i64, key: bool, fingerprint: u32) -> EncodedChunk {
    let sps = vec![0x67, 0x4d, 0x40, 0x28, 0x95, 0xa0];
    let pps = vec![0x68, 0xee, 0x3c, 0x80];
    let mut data = Vec::new();
    if key {
        push_nal(&mut data, &sps);
        push_nal(&mut data, &pps);
    }
    let mut slice = vec![if key { 0x65 } else { 0x41 }];
    slice.extend(payload_bytes(timestamp_us, fingerprint));
    push_nal(&mut data, &slice);

    EncodedChunk {
        kind: if key { ChunkKind::Key } else { ChunkKind::Delta },
        timestamp_us,
        duration_us,
        data: Bytes::from(data),
        decoder_config: key.then(|| DecoderConfig::Avc { sps, pps }),
    }
}

/// Main profile, level 3.1, 720x1280, 4:2:0, 8-bit.
const HEVC_SPS: [u8; 24] = [
    0x42, 0x01, 0x01, 0x01, 0x60, 0x00, 0x00, 0x03, 0x00, 0x90, 0x00, 0x00, 0x03, 0x00, 0x00, 0x03,
    0x00, 0x5d, 0xa0, 0x05, 0xa2, 0x00, 0x50, 0x17,
];

pub(crate) fn hevc_chunk(timestamp_us: i64, duration_us: i64, key: bool, fingerprint: u32) -> EncodedChunk {
    let vps = vec![0x40, 0x01, 0x0c, 0x01, 0xff, 0xff, 0x01, 0x60];
    let sps = HEVC_SPS.to_vec();
    let pps = vec![0x44, 0x01, 0xc1, 0x72, 0xb4, 0x62, 0x40];
    let mut data = Vec::new();
    if key {
        push_nal(&mut data, &vps);
        push_nal(&mut data, &sps);
        push_nal(&mut data, &pps);
    }
    // IDR_W_RADL (19) or TRAIL_R (1).
    let mut slice = if key { vec![0x26, 0x01] } else { vec![0x02, 0x01] };
    slice.extend(payload_bytes(timestamp_us, fingerprint));
    push_nal(&mut data, &slice);

    EncodedChunk {
        kind: if key { ChunkKind::Key } else { ChunkKind::Delta },
        timestamp_us,
        duration_us,
        data: Bytes::from(data),
        decoder_config: key.then(|| DecoderConfig::Hevc { vps, sps, pps }),
    }
}

fn push_nal(out: &mut Vec<u8>, nal: &[u8]) {
    out.extend_from_slice(&[0, 0, 0, 1]);
    out.extend_from_slice(nal);
}

/// Payload bytes with the high bit set so no start code can appear.
fn payload_bytes(timestamp_us: i64, fingerprint: u32) -> Vec<u8> {
    timestamp_us
        .to_be_bytes()
        .iter()
        .chain(fingerprint.to_be_bytes().iter())
        .map(|b| b | 0x80)
        .collect()
}

/// Cheap content fingerprint over a sparse sample of pixels.
fn fingerprint(data: &[u8]) -> u32 {
    data.iter()
        .step_by(997)
        .fold(0x811c_9dc5u32, |h, b| (h ^ *b as u32).wrapping_mul(0x0100_0193))
}

pub struct SyntheticVideoEncoder {
    worker: SyntheticWorker,
    frames: u64,
}

#[async_trait]
impl VideoEncoder for SyntheticVideoEncoder {
    fn encode(&mut self, frame: VideoFrame, key_frame: bool) -> ViralizeResult<()> {
        // Decoders need a key frame to start.
        let key = key_frame || self.frames == 0;
        self.frames += 1;
        self.worker.submit(
            frame.timestamp_us,
            frame.duration_us,
            key,
            fingerprint(frame.image.data()),
        )
    }

    fn queue_size(&self) -> usize {
        self.worker.queue_size()
    }

    async fn flush(&mut self) -> ViralizeResult<()> {
        self.worker.flush().await
    }

    fn close(&mut self) {
        self.worker.closed = true;
    }
}

pub struct SyntheticAudioEncoder {
    worker: SyntheticWorker,
}

#[async_trait]
impl AudioEncoder for SyntheticAudioEncoder {
    fn encode(&mut self, chunk: PlanarChunk) -> ViralizeResult<()> {
        let sample = chunk.data.iter().step_by(61).fold(0u32, |h, s| h.wrapping_add(s.to_bits()));
        self.worker
            .submit(chunk.timestamp_us, chunk.duration_us(), true, sample)
    }

    fn queue_size(&self) -> usize {
        self.worker.queue_size()
    }

    async fn flush(&mut self) -> ViralizeResult<()> {
        self.worker.flush().await
    }

    fn close(&mut self) {
        self.worker.closed = true;
    }
}

/// Encoder backend whose encoders run as tokio tasks with configurable latency.
#[derive(Debug, Clone)]
pub struct SyntheticEncoderBackend {
    codecs: Vec<VideoCodec>,
    video_latency: Duration,
    audio_latency: Duration,
    fail_audio_setup: bool,
    fail_video_after: Option<u64>,
    fail_audio_after: Option<u64>,
}

impl Default for SyntheticEncoderBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticEncoderBackend {
    pub fn new() -> Self {
        Self {
            codecs: vec![VideoCodec::Hevc, VideoCodec::Avc],
            video_latency: Duration::from_millis(2),
            audio_latency: Duration::ZERO,
            fail_audio_setup: false,
            fail_video_after: None,
            fail_audio_after: None,
        }
    }

    pub fn with_codecs(mut self, codecs: &[VideoCodec]) -> Self {
        self.codecs = codecs.to_vec();
        self
    }

    pub fn with_video_latency(mut self, latency: Duration) -> Self {
        self.video_latency = latency;
        self
    }

    pub fn with_audio_latency(mut self, latency: Duration) -> Self {
        self.audio_latency = latency;
        self
    }

    pub fn failing_audio_setup(mut self) -> Self {
        self.fail_audio_setup = true;
        self
    }

    /// Emit an encoder error after `frames` successful chunks.
    pub fn failing_video_after(mut self, frames: u64) -> Self {
        self.fail_video_after = Some(frames);
        self
    }

    pub fn failing_audio_after(mut self, chunks: u64) -> Self {
        self.fail_audio_after = Some(chunks);
        self
    }
}

impl EncoderBackend for SyntheticEncoderBackend {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn supports_video(&self, config: &VideoEncoderConfig) -> bool {
        self.codecs.contains(&config.codec())
    }

    fn video_encoder(
        &self,
        config: &VideoEncoderConfig,
        output: EncoderOutput,
    ) -> ViralizeResult<Box<dyn VideoEncoder>> {
        if !self.supports_video(config) {
            return Err(ViralizeError::unsupported(format!(
                "synthetic backend cannot encode {}",
                config.codec()
            )));
        }
        let make = match config.codec() {
            VideoCodec::Avc => avc_chunk,
            VideoCodec::Hevc => hevc_chunk,
        };
        Ok(Box::new(SyntheticVideoEncoder {
            worker: SyntheticWorker::spawn(output, self.video_latency, self.fail_video_after, make),
            frames: 0,
        }))
    }

    fn audio_encoder(
        &self,
        config: &AudioEncoderConfig,
        output: EncoderOutput,
    ) -> ViralizeResult<Box<dyn AudioEncoder>> {
        if self.fail_audio_setup {
            return Err(ViralizeError::audio("synthetic audio encoder unavailable"));
        }
        let config = config.clone();
        let make = move |timestamp_us: i64, duration_us: i64, _key: bool, fingerprint: u32| {
            let mut data = vec![0x21, 0x10];
            data.extend(fingerprint.to_be_bytes());
            EncodedChunk {
                kind: ChunkKind::Key,
                timestamp_us,
                duration_us,
                data: Bytes::from(data),
                decoder_config: Some(DecoderConfig::Aac {
                    sample_rate: config.sample_rate(),
                    channels: config.channels(),
                }),
            }
        };
        Ok(Box::new(SyntheticAudioEncoder {
            worker: SyntheticWorker::spawn(output, self.audio_latency, self.fail_audio_after, make),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitstream::is_keyframe;
    use crate::compositor::solid_pixmap;

    #[test]
    fn test_synthetic_video_frames_and_seek() {
        let mut video = SyntheticVideo::new(16, 16, 30.0, Some(1.0));
        let mut count = 0;
        while video.next_frame().unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 30);

        video.seek(0.5).unwrap();
        let frame = video.next_frame().unwrap().unwrap();
        assert!((frame.pts_secs - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_stalled_until_seek() {
        let mut video = SyntheticVideo::new(16, 16, 30.0, Some(1.0)).stalled_until_seek(2);
        assert!(video.next_frame().unwrap().is_none());
        video.seek(0.0).unwrap();
        assert!(video.next_frame().unwrap().is_none());
        video.seek(0.0).unwrap();
        assert!(video.next_frame().unwrap().is_some());
    }

    #[test]
    fn test_chunks_are_parseable() {
        let key = hevc_chunk(0, 16_667, true, 0);
        assert!(is_keyframe(VideoCodec::Hevc, &key.data));
        let delta = avc_chunk(16_667, 16_667, false, 0x0000_0100);
        assert!(!is_keyframe(VideoCodec::Avc, &delta.data));
        assert!(!delta.data[5..].windows(3).any(|w| w == [0, 0, 1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_encoder_queue_drains_on_flush() {
        let backend = SyntheticEncoderBackend::new().with_video_latency(Duration::from_millis(5));
        let config = VideoEncoderConfig::new(VideoCodec::Avc, 16, 16, 60, 1_000_000, 120).unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        let mut encoder = backend.video_encoder(&config, tx).unwrap();

        for i in 0..4 {
            let frame = VideoFrame {
                timestamp_us: i * 16_667,
                duration_us: 16_667,
                image: solid_pixmap(16, 16, [1, 2, 3]).unwrap(),
            };
            encoder.encode(frame, false).unwrap();
        }
        assert_eq!(encoder.queue_size(), 4);

        encoder.flush().await.unwrap();
        assert_eq!(encoder.queue_size(), 0);

        let mut kinds = Vec::new();
        while let Ok(EncoderEvent::Chunk(chunk)) = rx.try_recv() {
            kinds.push(chunk.kind);
        }
        assert_eq!(kinds, vec![ChunkKind::Key, ChunkKind::Delta, ChunkKind::Delta, ChunkKind::Delta]);
    }
}
