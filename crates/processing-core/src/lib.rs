//! Viralize Processing Core
//!
//! Pure computation used by the render pipeline:
//! - **Layout:** Greedy caption wrapping behind a single-slot cache
//! - **Audio:** Decoded PCM buffers split into timestamped planar chunks
//!
//! No I/O and no rendering backend; text measurement is injected.

pub mod audio;
pub mod layout;

pub use audio::{aac_bitrate, DecodedAudio, PlanarChunk, DEFAULT_CHUNK_FRAMES};
pub use layout::{wrap_lines, LayoutCache, LayoutCacheStats, TextMeasure};
