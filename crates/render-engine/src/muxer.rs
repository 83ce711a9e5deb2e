//! MP4 muxer.
//!
//! Chunks are buffered in memory and the whole container is written in one
//! pass at finalize. Each track is shifted so its first timestamp is zero.
//! The last video frame is held until the audio track ends.
//!
//! The `mp4` crate writes an empty `hvcC` box for HEVC tracks, so the full
//! decoder configuration record is spliced into the finished file.

use std::io::Cursor;

use bytes::Bytes;
use mp4::{
    AacConfig, AudioObjectType, AvcConfig, ChannelConfig, FourCC, HevcConfig, MediaConfig,
    Mp4Config, Mp4Sample, Mp4Writer, SampleFreqIndex, TrackConfig, TrackType,
};
use viralize_common::{ViralizeError, ViralizeResult};

use crate::bitstream::{extract_parameter_sets, hevc_decoder_configuration_record, to_length_prefixed};
use crate::encoder::{DecoderConfig, EncodedChunk, VideoCodec};

/// Timescale of the video track (ticks per second).
pub const VIDEO_TIMESCALE: u32 = 90_000;

const MOVIE_TIMESCALE: u32 = 1_000;

/// Sink for encoded chunks of one output file.
pub trait Muxer: Send {
    fn add_video_chunk(&mut self, chunk: EncodedChunk) -> ViralizeResult<()>;

    fn add_audio_chunk(&mut self, chunk: EncodedChunk) -> ViralizeResult<()>;

    /// Forget the audio track; the file will be video-only.
    fn discard_audio(&mut self);

    fn has_audio(&self) -> bool;

    /// Write the container and return its bytes.
    fn finalize(self: Box<Self>) -> ViralizeResult<Vec<u8>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoTrackConfig {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioTrackConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub bitrate: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MuxerConfig {
    pub video: VideoTrackConfig,
    /// Only present when audio was decoded successfully.
    pub audio: Option<AudioTrackConfig>,
}

/// In-memory MP4 writer.
pub struct Mp4Muxer {
    config: MuxerConfig,
    video: Vec<EncodedChunk>,
    audio: Vec<EncodedChunk>,
}

impl Mp4Muxer {
    pub fn new(config: MuxerConfig) -> Self {
        Self {
            config,
            video: Vec::new(),
            audio: Vec::new(),
        }
    }

    /// Parameter sets of the first key frame that carries them.
    fn decoder_config(&self) -> Option<DecoderConfig> {
        let codec = self.config.video.codec;
        self.video
            .iter()
            .filter(|c| c.is_key())
            .find_map(|c| {
                c.decoder_config
                    .clone()
                    .or_else(|| extract_parameter_sets(codec, &c.data))
            })
    }

    fn video_media_config(&self) -> ViralizeResult<MediaConfig> {
        let v = &self.config.video;
        let width = dimension(v.width)?;
        let height = dimension(v.height)?;

        match v.codec {
            VideoCodec::Avc => {
                let (sps, pps) = match self.decoder_config() {
                    Some(DecoderConfig::Avc { sps, pps }) => (sps, pps),
                    _ => return Err(ViralizeError::mux("video stream carries no H.264 parameter sets")),
                };
                if sps.len() < 4 {
                    return Err(ViralizeError::mux("H.264 sequence parameter set is truncated"));
                }
                Ok(MediaConfig::AvcConfig(AvcConfig {
                    width,
                    height,
                    seq_param_set: sps,
                    pic_param_set: pps,
                }))
            }
            // The record is patched in by `replace_hvcc` after writing.
            VideoCodec::Hevc => Ok(MediaConfig::HevcConfig(HevcConfig {
                width,
                height,
                ..Default::default()
            })),
        }
    }

    fn hevc_record(&self) -> ViralizeResult<Vec<u8>> {
        let (vps, sps, pps) = match self.decoder_config() {
            Some(DecoderConfig::Hevc { vps, sps, pps }) => (vps, sps, pps),
            _ => return Err(ViralizeError::mux("video stream carries no HEVC parameter sets")),
        };
        hevc_decoder_configuration_record(&vps, &sps, &pps)
            .ok_or_else(|| ViralizeError::mux("HEVC sequence parameter set could not be parsed"))
    }

    /// Video end, in video ticks, needed to cover the audio track.
    fn audio_end_ticks(&self) -> Option<u64> {
        self.config.audio.as_ref()?;
        let first = self.audio.first()?;
        let last = self.audio.last()?;
        let end_us = last.timestamp_us + last.duration_us - first.timestamp_us;
        Some(us_to_ticks(end_us, VIDEO_TIMESCALE))
    }

    fn audio_media_config(audio: &AudioTrackConfig) -> ViralizeResult<MediaConfig> {
        Ok(MediaConfig::AacConfig(AacConfig {
            bitrate: audio.bitrate,
            profile: AudioObjectType::AacLowComplexity,
            freq_index: freq_index(audio.sample_rate)?,
            chan_conf: channel_config(audio.channels)?,
        }))
    }
}

impl Muxer for Mp4Muxer {
    fn add_video_chunk(&mut self, chunk: EncodedChunk) -> ViralizeResult<()> {
        if self.video.is_empty() && !chunk.is_key() {
            return Err(ViralizeError::mux("first video chunk must be a key frame"));
        }
        if let Some(last) = self.video.last() {
            if chunk.timestamp_us < last.timestamp_us {
                return Err(ViralizeError::mux(format!(
                    "video timestamps went backwards: {} after {}",
                    chunk.timestamp_us, last.timestamp_us
                )));
            }
        }
        self.video.push(chunk);
        Ok(())
    }

    fn add_audio_chunk(&mut self, chunk: EncodedChunk) -> ViralizeResult<()> {
        if self.config.audio.is_none() {
            return Err(ViralizeError::mux("muxer has no audio track"));
        }
        self.audio.push(chunk);
        Ok(())
    }

    fn discard_audio(&mut self) {
        self.config.audio = None;
        self.audio.clear();
    }

    fn has_audio(&self) -> bool {
        self.config.audio.is_some()
    }

    fn finalize(self: Box<Self>) -> ViralizeResult<Vec<u8>> {
        if self.video.is_empty() {
            return Err(ViralizeError::mux("no video samples to write"));
        }

        let codec = self.config.video.codec;
        let hvcc = match codec {
            VideoCodec::Hevc => Some(self.hevc_record()?),
            VideoCodec::Avc => None,
        };
        let brand = |s: &str| {
            s.parse::<FourCC>()
                .map_err(|e| ViralizeError::mux(format!("invalid brand {s}: {e}")))
        };
        let codec_brand = match codec {
            VideoCodec::Avc => "avc1",
            VideoCodec::Hevc => "hev1",
        };
        let mp4_config = Mp4Config {
            major_brand: brand("isom")?,
            minor_version: 512,
            compatible_brands: vec![brand("isom")?, brand("iso2")?, brand(codec_brand)?, brand("mp41")?],
            timescale: MOVIE_TIMESCALE,
        };

        let mut writer = Mp4Writer::write_start(Cursor::new(Vec::new()), &mp4_config).map_err(mux_err)?;

        writer
            .add_track(&TrackConfig {
                track_type: TrackType::Video,
                timescale: VIDEO_TIMESCALE,
                language: "und".to_string(),
                media_conf: self.video_media_config()?,
            })
            .map_err(mux_err)?;
        let video_track = 1;

        let audio_track = match &self.config.audio {
            Some(audio) if !self.audio.is_empty() => {
                writer
                    .add_track(&TrackConfig {
                        track_type: TrackType::Audio,
                        timescale: audio.sample_rate,
                        language: "und".to_string(),
                        media_conf: Self::audio_media_config(audio)?,
                    })
                    .map_err(mux_err)?;
                Some((2, audio.sample_rate))
            }
            Some(_) => {
                tracing::warn!("Audio track configured but no audio chunks arrived");
                None
            }
            None => None,
        };

        let video_samples = build_samples(&self.video, VIDEO_TIMESCALE, self.audio_end_ticks(), |chunk| {
            Bytes::from(to_length_prefixed(codec, &chunk.data))
        });
        for sample in &video_samples {
            writer.write_sample(video_track, sample).map_err(mux_err)?;
        }

        if let Some((track, timescale)) = audio_track {
            let audio_samples = build_samples(&self.audio, timescale, None, |chunk| chunk.data.clone());
            for sample in &audio_samples {
                writer.write_sample(track, sample).map_err(mux_err)?;
            }
        }

        writer.write_end().map_err(mux_err)?;
        let mut bytes = writer.into_writer().into_inner();
        if let Some(record) = hvcc {
            bytes = replace_hvcc(bytes, &record)?;
        }
        tracing::debug!(
            bytes = bytes.len(),
            video_samples = video_samples.len(),
            audio_samples = self.audio.len(),
            "MP4 finalized"
        );
        Ok(bytes)
    }
}

fn mux_err(e: mp4::Error) -> ViralizeError {
    ViralizeError::mux(e.to_string())
}

fn dimension(v: u32) -> ViralizeResult<u16> {
    u16::try_from(v).map_err(|_| ViralizeError::mux(format!("dimension {v} too large for MP4")))
}

fn us_to_ticks(us: i64, timescale: u32) -> u64 {
    ((us.max(0) as f64) * timescale as f64 / 1e6).round() as u64
}

/// Turn chunks into samples on a zero-based timeline.
///
/// Each sample lasts until the next one starts. The last keeps its own
/// duration, stretched to reach `end_at` ticks when given.
fn build_samples<F>(chunks: &[EncodedChunk], timescale: u32, end_at: Option<u64>, payload: F) -> Vec<Mp4Sample>
where
    F: Fn(&EncodedChunk) -> Bytes,
{
    let Some(first) = chunks.first() else {
        return Vec::new();
    };
    let origin = first.timestamp_us;

    let starts: Vec<u64> = chunks
        .iter()
        .map(|c| us_to_ticks(c.timestamp_us - origin, timescale))
        .collect();

    chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let duration = match starts.get(i + 1) {
                Some(next) => next.saturating_sub(starts[i]),
                None => us_to_ticks(chunk.duration_us, timescale)
                    .max(end_at.unwrap_or(0).saturating_sub(starts[i])),
            };
            Mp4Sample {
                start_time: starts[i],
                duration: duration.clamp(1, u32::MAX as u64) as u32,
                rendering_offset: 0,
                is_sync: chunk.is_key(),
                bytes: payload(chunk),
            }
        })
        .collect()
}

const BOX_HEADER: usize = 8;

/// Boxes from the top level down to the first track's `hvcC`, each with the
/// bytes between its header and its first child.
const HVCC_PATH: [(&[u8; 4], usize); 8] = [
    (b"moov", 0),
    (b"trak", 0),
    (b"mdia", 0),
    (b"minf", 0),
    (b"stbl", 0),
    (b"stsd", 8),
    (b"hev1", 78),
    (b"hvcC", 0),
];

/// Replace the `hvcC` box of the video track with `record` and grow every
/// enclosing box to match. `moov` must follow `mdat` so chunk offsets hold.
fn replace_hvcc(mut file: Vec<u8>, record: &[u8]) -> ViralizeResult<Vec<u8>> {
    let mdat = find_box(&file, 0..file.len(), b"mdat")?;
    let mut path = Vec::with_capacity(HVCC_PATH.len());
    let mut range = 0..file.len();
    for (name, skip) in HVCC_PATH {
        let start = find_box(&file, range.clone(), name)?;
        let end = start + box_size(&file, start)?;
        path.push(start);
        range = (start + BOX_HEADER + skip).min(end)..end;
    }
    if path[0] < mdat {
        return Err(ViralizeError::mux("moov precedes mdat, cannot resize it"));
    }

    let Some(hvcc) = path.pop() else {
        return Err(ViralizeError::mux("hvcC box not found"));
    };
    let old_size = box_size(&file, hvcc)?;
    let new_size = BOX_HEADER + record.len();
    let grow = new_size
        .checked_sub(old_size)
        .ok_or_else(|| ViralizeError::mux("hvcC record is smaller than the box it replaces"))?;

    let mut replacement = Vec::with_capacity(new_size);
    replacement.extend_from_slice(&box_size_bytes(new_size)?);
    replacement.extend_from_slice(b"hvcC");
    replacement.extend_from_slice(record);
    file.splice(hvcc..hvcc + old_size, replacement);

    for start in path {
        let size = box_size(&file, start)? + grow;
        file[start..start + 4].copy_from_slice(&box_size_bytes(size)?);
    }
    Ok(file)
}

fn find_box(file: &[u8], range: std::ops::Range<usize>, name: &[u8; 4]) -> ViralizeResult<usize> {
    let mut pos = range.start;
    while pos + BOX_HEADER <= range.end {
        if &file[pos + 4..pos + 8] == name {
            return Ok(pos);
        }
        pos += box_size(file, pos)?;
    }
    Err(ViralizeError::mux(format!(
        "{} box not found",
        String::from_utf8_lossy(name)
    )))
}

/// Size of the box at `pos`; 64-bit and open-ended boxes are rejected.
fn box_size(file: &[u8], pos: usize) -> ViralizeResult<usize> {
    let bytes: [u8; 4] = file
        .get(pos..pos + 4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| ViralizeError::mux("truncated MP4 box header"))?;
    let size = u32::from_be_bytes(bytes) as usize;
    if size < BOX_HEADER || pos + size > file.len() {
        return Err(ViralizeError::mux(format!("unsupported MP4 box size {size} at {pos}")));
    }
    Ok(size)
}

fn box_size_bytes(size: usize) -> ViralizeResult<[u8; 4]> {
    u32::try_from(size)
        .map(u32::to_be_bytes)
        .map_err(|_| ViralizeError::mux("MP4 box too large"))
}

fn freq_index(sample_rate: u32) -> ViralizeResult<SampleFreqIndex> {
    Ok(match sample_rate {
        96_000 => SampleFreqIndex::Freq96000,
        88_200 => SampleFreqIndex::Freq88200,
        64_000 => SampleFreqIndex::Freq64000,
        48_000 => SampleFreqIndex::Freq48000,
        44_100 => SampleFreqIndex::Freq44100,
        32_000 => SampleFreqIndex::Freq32000,
        24_000 => SampleFreqIndex::Freq24000,
        22_050 => SampleFreqIndex::Freq22050,
        16_000 => SampleFreqIndex::Freq16000,
        12_000 => SampleFreqIndex::Freq12000,
        11_025 => SampleFreqIndex::Freq11025,
        8_000 => SampleFreqIndex::Freq8000,
        other => return Err(ViralizeError::mux(format!("unsupported AAC sample rate {other}"))),
    })
}

fn channel_config(channels: u16) -> ViralizeResult<ChannelConfig> {
    Ok(match channels {
        1 => ChannelConfig::Mono,
        2 => ChannelConfig::Stereo,
        3 => ChannelConfig::Three,
        4 => ChannelConfig::Four,
        5 => ChannelConfig::Five,
        6 => ChannelConfig::FiveOne,
        8 => ChannelConfig::SevenOne,
        other => {
            return Err(ViralizeError::mux(format!(
                "no AAC channel configuration for {other} channels"
            )))
        }
    })
}
