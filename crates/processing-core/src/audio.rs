//! Decoded audio buffers and planar chunking.
//!
//! Audio encoders take fixed-size planar blocks: every sample of channel 0,
//! then every sample of channel 1, and so on. Each block is stamped with the
//! media time of its first sample.

use viralize_common::{samples_to_us, ViralizeError, ViralizeResult};

/// Default frames per encoder chunk.
pub const DEFAULT_CHUNK_FRAMES: usize = 1024;

/// A fully decoded audio track.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    sample_rate: u32,
    channels: Vec<Vec<f32>>,
}

impl DecodedAudio {
    /// Wrap per-channel sample arrays. All channels must have equal length.
    pub fn new(sample_rate: u32, channels: Vec<Vec<f32>>) -> ViralizeResult<Self> {
        if sample_rate == 0 {
            return Err(ViralizeError::audio("sample rate must be positive"));
        }
        if channels.is_empty() {
            return Err(ViralizeError::audio("decoded audio has no channels"));
        }
        let frames = channels[0].len();
        if channels.iter().any(|c| c.len() != frames) {
            return Err(ViralizeError::audio("channel lengths differ"));
        }
        Ok(Self {
            sample_rate,
            channels,
        })
    }

    /// Split interleaved samples into channels.
    pub fn from_interleaved(sample_rate: u32, channel_count: u16, samples: &[f32]) -> ViralizeResult<Self> {
        let count = channel_count as usize;
        if count == 0 {
            return Err(ViralizeError::audio("decoded audio has no channels"));
        }
        let frames = samples.len() / count;
        let mut channels = vec![Vec::with_capacity(frames); count];
        for frame in samples.chunks_exact(count) {
            for (channel, sample) in channels.iter_mut().zip(frame) {
                channel.push(*sample);
            }
        }
        Self::new(sample_rate, channels)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> u16 {
        self.channels.len() as u16
    }

    /// Samples per channel.
    pub fn frames(&self) -> usize {
        self.channels[0].len()
    }

    pub fn duration_secs(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        self.channels.get(index).map(Vec::as_slice)
    }

    /// Iterate encoder-ready planar chunks of `chunk_frames` frames.
    pub fn planar_chunks(&self, chunk_frames: usize) -> PlanarChunks<'_> {
        PlanarChunks {
            audio: self,
            chunk_frames: chunk_frames.max(1),
            offset: 0,
        }
    }
}

/// One planar block of audio.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanarChunk {
    /// Media time of the first frame, in microseconds.
    pub timestamp_us: i64,
    /// Offset of the first frame within the track.
    pub frame_offset: u64,
    pub frames: usize,
    pub channels: u16,
    pub sample_rate: u32,
    /// `channels * frames` samples, channel-major.
    pub data: Vec<f32>,
}

impl PlanarChunk {
    pub fn duration_us(&self) -> i64 {
        samples_to_us(self.frames as u64, self.sample_rate)
    }

    /// Samples of one channel within this chunk.
    pub fn plane(&self, channel: usize) -> &[f32] {
        let start = channel * self.frames;
        &self.data[start..start + self.frames]
    }
}

/// Iterator returned by [`DecodedAudio::planar_chunks`].
pub struct PlanarChunks<'a> {
    audio: &'a DecodedAudio,
    chunk_frames: usize,
    offset: usize,
}

impl Iterator for PlanarChunks<'_> {
    type Item = PlanarChunk;

    fn next(&mut self) -> Option<Self::Item> {
        let total = self.audio.frames();
        if self.offset >= total {
            return None;
        }

        let frames = self.chunk_frames.min(total - self.offset);
        let mut data = Vec::with_capacity(frames * self.audio.channels.len());
        for channel in &self.audio.channels {
            data.extend_from_slice(&channel[self.offset..self.offset + frames]);
        }

        let chunk = PlanarChunk {
            timestamp_us: samples_to_us(self.offset as u64, self.audio.sample_rate),
            frame_offset: self.offset as u64,
            frames,
            channels: self.audio.channel_count(),
            sample_rate: self.audio.sample_rate,
            data,
        };
        self.offset += frames;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.audio.frames().saturating_sub(self.offset);
        let n = remaining.div_ceil(self.chunk_frames);
        (n, Some(n))
    }
}

/// Target AAC bitrate for a channel count: 64 kbps per channel, at least 128 kbps.
pub fn aac_bitrate(channels: u16) -> u32 {
    (channels as u32 * 64_000).max(128_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo_ramp(frames: usize) -> DecodedAudio {
        let left = (0..frames).map(|i| i as f32).collect();
        let right = (0..frames).map(|i| -(i as f32)).collect();
        DecodedAudio::new(44_100, vec![left, right]).unwrap()
    }

    #[test]
    fn test_rejects_ragged_channels() {
        assert!(DecodedAudio::new(48_000, vec![vec![0.0; 4], vec![0.0; 3]]).is_err());
        assert!(DecodedAudio::new(0, vec![vec![0.0; 4]]).is_err());
        assert!(DecodedAudio::new(48_000, vec![]).is_err());
    }

    #[test]
    fn test_chunks_are_planar_and_timestamped() {
        let audio = stereo_ramp(2500);
        let chunks: Vec<_> = audio.planar_chunks(1024).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].frames, 452);

        let second = &chunks[1];
        assert_eq!(second.frame_offset, 1024);
        assert_eq!(second.timestamp_us, (1024.0f64 / 44_100.0 * 1e6).round() as i64);
        assert_eq!(second.plane(0)[0], 1024.0);
        assert_eq!(second.plane(1)[0], -1024.0);
        assert_eq!(second.data.len(), 2048);
    }

    #[test]
    fn test_from_interleaved() {
        let audio = DecodedAudio::from_interleaved(48_000, 2, &[1.0, -1.0, 2.0, -2.0]).unwrap();
        assert_eq!(audio.frames(), 2);
        assert_eq!(audio.channel(1), Some(&[-1.0, -2.0][..]));
    }

    #[test]
    fn test_size_hint_matches_count() {
        let audio = stereo_ramp(4096);
        let iter = audio.planar_chunks(1024);
        assert_eq!(iter.size_hint(), (4, Some(4)));
        assert_eq!(iter.count(), 4);
    }

    #[test]
    fn test_aac_bitrate_floor() {
        assert_eq!(aac_bitrate(1), 128_000);
        assert_eq!(aac_bitrate(2), 128_000);
        assert_eq!(aac_bitrate(6), 384_000);
    }
}
