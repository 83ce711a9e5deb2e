//! Encoder seams: configuration, chunk types and backend traits.
//!
//! Encoders are asynchronous. Frames go in through `encode`, finished
//! chunks come out on an `mpsc` channel handed over at construction, and
//! `queue_size` reports how much work is still in flight so the capture
//! loop can apply backpressure.

use async_trait::async_trait;
use bytes::Bytes;
use resvg::tiny_skia::Pixmap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use viralize_common::{ViralizeError, ViralizeResult};
use viralize_processing_core::{DecodedAudio, PlanarChunk};
use viralize_project_model::SourceMedia;

/// Output video codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    Hevc,
    Avc,
}

impl VideoCodec {
    /// Codec string as written in the sample entry.
    pub fn codec_string(&self) -> &'static str {
        match self {
            VideoCodec::Hevc => "hev1.1.6.L120.90",
            VideoCodec::Avc => "avc1.4D4028",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            VideoCodec::Hevc => "H.265/HEVC",
            VideoCodec::Avc => "H.264/AVC",
        }
    }
}

impl std::fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.codec_string())
    }
}

/// Codecs tried in order: HEVC first, AVC as the fallback.
pub const VIDEO_CODEC_CANDIDATES: [VideoCodec; 2] = [VideoCodec::Hevc, VideoCodec::Avc];

pub const AAC_CODEC_STRING: &str = "mp4a.40.2";

/// Sample rates an AAC encoder accepts.
pub const AAC_SAMPLE_RATES: [u32; 12] = [
    96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025, 8_000,
];

/// Validated video encoder settings.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoEncoderConfig {
    codec: VideoCodec,
    width: u32,
    height: u32,
    fps: u32,
    bitrate: u32,
    keyframe_interval: u32,
}

impl VideoEncoderConfig {
    pub fn new(
        codec: VideoCodec,
        width: u32,
        height: u32,
        fps: u32,
        bitrate: u32,
        keyframe_interval: u32,
    ) -> ViralizeResult<Self> {
        if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
            return Err(ViralizeError::validation(format!(
                "encoder dimensions must be even and non-zero, got {width}x{height}"
            )));
        }
        if fps == 0 {
            return Err(ViralizeError::validation("frame rate must be positive"));
        }
        if bitrate == 0 {
            return Err(ViralizeError::validation("bitrate must be positive"));
        }
        if keyframe_interval == 0 {
            return Err(ViralizeError::validation("keyframe interval must be positive"));
        }
        Ok(Self {
            codec,
            width,
            height,
            fps,
            bitrate,
            keyframe_interval,
        })
    }

    pub fn codec(&self) -> VideoCodec {
        self.codec
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    pub fn bitrate(&self) -> u32 {
        self.bitrate
    }

    pub fn keyframe_interval(&self) -> u32 {
        self.keyframe_interval
    }

    pub fn with_codec(&self, codec: VideoCodec) -> Self {
        Self {
            codec,
            ..self.clone()
        }
    }
}

/// Validated AAC encoder settings.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioEncoderConfig {
    sample_rate: u32,
    channels: u16,
    bitrate: u32,
}

impl AudioEncoderConfig {
    pub fn new(sample_rate: u32, channels: u16, bitrate: u32) -> ViralizeResult<Self> {
        if !AAC_SAMPLE_RATES.contains(&sample_rate) {
            return Err(ViralizeError::audio(format!(
                "unsupported AAC sample rate {sample_rate}"
            )));
        }
        if !(1..=8).contains(&channels) {
            return Err(ViralizeError::audio(format!(
                "unsupported channel count {channels}"
            )));
        }
        if bitrate == 0 {
            return Err(ViralizeError::audio("bitrate must be positive"));
        }
        Ok(Self {
            sample_rate,
            channels,
            bitrate,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn bitrate(&self) -> u32 {
        self.bitrate
    }

    pub fn codec_string(&self) -> &'static str {
        AAC_CODEC_STRING
    }
}

/// A composited frame ready for encoding.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub timestamp_us: i64,
    pub duration_us: i64,
    pub image: Pixmap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Key,
    Delta,
}

/// Out-of-band decoder configuration carried by the first key chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecoderConfig {
    Avc { sps: Vec<u8>, pps: Vec<u8> },
    Hevc { vps: Vec<u8>, sps: Vec<u8>, pps: Vec<u8> },
    Aac { sample_rate: u32, channels: u16 },
}

/// One compressed access unit (video) or frame (audio).
///
/// Video data is Annex-B; audio data is raw AAC without ADTS headers.
#[derive(Debug, Clone)]
pub struct EncodedChunk {
    pub kind: ChunkKind,
    pub timestamp_us: i64,
    pub duration_us: i64,
    pub data: Bytes,
    pub decoder_config: Option<DecoderConfig>,
}

impl EncodedChunk {
    pub fn is_key(&self) -> bool {
        self.kind == ChunkKind::Key
    }
}

/// What an encoder emits on its output channel.
#[derive(Debug)]
pub enum EncoderEvent {
    Chunk(EncodedChunk),
    Error(ViralizeError),
}

pub type EncoderOutput = mpsc::Sender<EncoderEvent>;

#[async_trait]
pub trait VideoEncoder: Send {
    /// Queue one frame. Never blocks on the encoder itself.
    fn encode(&mut self, frame: VideoFrame, key_frame: bool) -> ViralizeResult<()>;

    /// Frames submitted but not yet emitted.
    fn queue_size(&self) -> usize;

    /// Drain every pending frame to the output channel.
    async fn flush(&mut self) -> ViralizeResult<()>;

    fn close(&mut self);
}

#[async_trait]
pub trait AudioEncoder: Send {
    fn encode(&mut self, chunk: PlanarChunk) -> ViralizeResult<()>;

    fn queue_size(&self) -> usize;

    async fn flush(&mut self) -> ViralizeResult<()>;

    fn close(&mut self);
}

/// Factory for the platform's encoders.
pub trait EncoderBackend: Send + Sync {
    fn name(&self) -> &str;

    fn supports_video(&self, config: &VideoEncoderConfig) -> bool;

    fn video_encoder(
        &self,
        config: &VideoEncoderConfig,
        output: EncoderOutput,
    ) -> ViralizeResult<Box<dyn VideoEncoder>>;

    fn audio_encoder(
        &self,
        config: &AudioEncoderConfig,
        output: EncoderOutput,
    ) -> ViralizeResult<Box<dyn AudioEncoder>>;
}

/// Decodes a source's whole audio track up front.
#[async_trait]
pub trait AudioDecoder: Send + Sync {
    async fn decode(&self, source: &SourceMedia) -> ViralizeResult<DecodedAudio>;
}

/// First codec in `candidates` the backend accepts with `base`'s settings.
pub fn select_video_codec(
    backend: &dyn EncoderBackend,
    candidates: &[VideoCodec],
    base: &VideoEncoderConfig,
) -> ViralizeResult<VideoEncoderConfig> {
    for codec in candidates {
        let config = base.with_codec(*codec);
        if backend.supports_video(&config) {
            tracing::info!(
                codec = codec.codec_string(),
                backend = backend.name(),
                "Selected video codec"
            );
            return Ok(config);
        }
        tracing::debug!(codec = codec.codec_string(), "Video codec not supported");
    }

    Err(ViralizeError::unsupported(format!(
        "{} supports none of: {}",
        backend.name(),
        candidates
            .iter()
            .map(VideoCodec::codec_string)
            .collect::<Vec<_>>()
            .join(", ")
    )))
}
