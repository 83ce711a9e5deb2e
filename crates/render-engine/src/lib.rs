//! Viralize Render Engine
//!
//! Composites a source video under a social-post header and exports it as a
//! vertical MP4 reel. The same compositor drives the live preview and the
//! export, so what the user sees is what gets encoded.
//!
//! # Pipeline Architecture
//!
//! ```text
//!                       ┌──────────────────┐
//! CompositionEditor ──▶ │ CompositionState │ ◀── (watch) ── Preview Loop ──▶ PreviewSink
//!                       └──────────────────┘                    │
//!                                 │                             │
//! source.mp4 ── PlaybackSource ───┼──── FrameCompositor ◀───────┘
//!      │                          ▼
//!      │                   Capture Loop ── VideoEncoder ──┐  (bounded mpsc)
//!      │                     (cadence,                     │
//!      │                      backpressure,                ▼
//!      └── AudioDecoder ── Audio Stage ── AudioEncoder ── Mp4Muxer ──▶ reel.mp4
//! ```
//!
//! [`export::export_reel`] sequences the stages; [`studio::ReelStudio`]
//! wraps source, preview and export behind one handle.

pub mod audio;
pub mod bitstream;
pub mod capture;
pub mod compositor;
pub mod encoder;
pub mod export;
pub mod ffmpeg;
pub mod muxer;
pub mod playback;
pub mod preview;
pub mod session;
pub mod state;
pub mod studio;
pub mod synthetic;
pub mod text;

pub use capture::{BackpressureEvent, CaptureParams, CaptureStats, DEFAULT_END_EPSILON_SECS};
pub use compositor::{save_png, FrameCompositor, FrameLayout};
pub use encoder::{AudioDecoder, EncoderBackend, VideoCodec, VIDEO_CODEC_CANDIDATES};
pub use export::*;
pub use ffmpeg::{probe_source, FfmpegAudioDecoder, FfmpegEncoderBackend, FfmpegFrameDecoder, FfmpegTools};
pub use playback::{ClockedPlayback, FrameDecoder, PlaybackSource};
pub use preview::{LatestFrame, PreviewHandle, PreviewSink, PREVIEW_HEIGHT, PREVIEW_WIDTH};
pub use session::{ExportWarning, RunFlag};
pub use state::{CompositionEditor, CompositionReader};
pub use studio::ReelStudio;
pub use text::{text_renderer_from_config, BlockGlyphs, FontdueText, TextRenderer};
