//! Elementary stream helpers: Annex-B NAL units, access units and ADTS.

use crate::encoder::{DecoderConfig, VideoCodec};

pub const AVC_NAL_IDR: u8 = 5;
pub const AVC_NAL_SPS: u8 = 7;
pub const AVC_NAL_PPS: u8 = 8;
pub const AVC_NAL_AUD: u8 = 9;

pub const HEVC_NAL_VPS: u8 = 32;
pub const HEVC_NAL_SPS: u8 = 33;
pub const HEVC_NAL_PPS: u8 = 34;
pub const HEVC_NAL_AUD: u8 = 35;

/// NAL unit type for `codec`.
pub fn nal_type(codec: VideoCodec, nal: &[u8]) -> Option<u8> {
    let header = *nal.first()?;
    Some(match codec {
        VideoCodec::Avc => header & 0x1f,
        VideoCodec::Hevc => (header >> 1) & 0x3f,
    })
}

fn is_aud(codec: VideoCodec, nal: &[u8]) -> bool {
    let aud = match codec {
        VideoCodec::Avc => AVC_NAL_AUD,
        VideoCodec::Hevc => HEVC_NAL_AUD,
    };
    nal_type(codec, nal) == Some(aud)
}

fn is_random_access(codec: VideoCodec, nal: &[u8]) -> bool {
    match (codec, nal_type(codec, nal)) {
        (VideoCodec::Avc, Some(t)) => t == AVC_NAL_IDR,
        // BLA, IDR and CRA pictures.
        (VideoCodec::Hevc, Some(t)) => (16..=21).contains(&t),
        _ => false,
    }
}

/// Byte offsets of every start code: `(start_code_pos, payload_pos)`.
fn start_codes(data: &[u8]) -> Vec<(usize, usize)> {
    let mut found = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            let begin = if i > 0 && data[i - 1] == 0 { i - 1 } else { i };
            found.push((begin, i + 3));
            i += 3;
        } else {
            i += 1;
        }
    }
    found
}

/// Split an Annex-B buffer into NAL unit payloads (start codes removed).
pub fn split_nal_units(data: &[u8]) -> Vec<&[u8]> {
    let codes = start_codes(data);
    codes
        .iter()
        .enumerate()
        .map(|(n, &(_, payload))| {
            let end = codes.get(n + 1).map_or(data.len(), |&(next, _)| next);
            trim_trailing_zeros(&data[payload..end])
        })
        .filter(|nal| !nal.is_empty())
        .collect()
}

fn trim_trailing_zeros(nal: &[u8]) -> &[u8] {
    let end = nal.iter().rposition(|b| *b != 0).map_or(0, |p| p + 1);
    &nal[..end]
}

/// Whether an access unit contains a random-access picture.
pub fn is_keyframe(codec: VideoCodec, access_unit: &[u8]) -> bool {
    split_nal_units(access_unit)
        .iter()
        .any(|nal| is_random_access(codec, nal))
}

/// Parameter sets found in an access unit, if it carries a complete set.
pub fn extract_parameter_sets(codec: VideoCodec, access_unit: &[u8]) -> Option<DecoderConfig> {
    let nals = split_nal_units(access_unit);
    let find = |wanted: u8| {
        nals.iter()
            .find(|nal| nal_type(codec, nal) == Some(wanted))
            .map(|nal| nal.to_vec())
    };
    match codec {
        VideoCodec::Avc => Some(DecoderConfig::Avc {
            sps: find(AVC_NAL_SPS)?,
            pps: find(AVC_NAL_PPS)?,
        }),
        VideoCodec::Hevc => Some(DecoderConfig::Hevc {
            vps: find(HEVC_NAL_VPS)?,
            sps: find(HEVC_NAL_SPS)?,
            pps: find(HEVC_NAL_PPS)?,
        }),
    }
}

/// Convert an Annex-B access unit to 4-byte length-prefixed NAL units.
///
/// Access unit delimiters are always dropped. For AVC the parameter sets are
/// dropped too since they travel in the sample entry; HEVC keeps them in-band.
pub fn to_length_prefixed(codec: VideoCodec, access_unit: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(access_unit.len() + 16);
    for nal in split_nal_units(access_unit) {
        let skip = match (codec, nal_type(codec, nal)) {
            (VideoCodec::Avc, Some(t)) => matches!(t, AVC_NAL_SPS | AVC_NAL_PPS | AVC_NAL_AUD),
            (VideoCodec::Hevc, Some(t)) => t == HEVC_NAL_AUD,
            _ => true,
        };
        if skip {
            continue;
        }
        out.extend_from_slice(&(nal.len() as u32).to_be_bytes());
        out.extend_from_slice(nal);
    }
    out
}

/// Drop emulation prevention bytes (`00 00 03`) from a NAL unit payload.
pub fn unescape_rbsp(nal: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nal.len());
    let mut zeros = 0;
    for &b in nal {
        if zeros >= 2 && b == 3 {
            zeros = 0;
            continue;
        }
        zeros = if b == 0 { zeros + 1 } else { 0 };
        out.push(b);
    }
    out
}

/// MSB-first bit reader with Exp-Golomb support.
struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bit(&mut self) -> Option<u32> {
        let byte = *self.data.get(self.pos / 8)?;
        let bit = (byte >> (7 - self.pos % 8)) & 1;
        self.pos += 1;
        Some(bit as u32)
    }

    fn bits(&mut self, n: u32) -> Option<u32> {
        (0..n).try_fold(0u32, |acc, _| Some((acc << 1) | self.bit()?))
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        self.pos += n;
        (self.pos <= self.data.len() * 8).then_some(())
    }

    fn ue(&mut self) -> Option<u32> {
        let mut zeros = 0;
        while self.bit()? == 0 {
            zeros += 1;
            if zeros > 31 {
                return None;
            }
        }
        let value = (1u64 << zeros) - 1 + self.bits(zeros)? as u64;
        u32::try_from(value).ok()
    }
}

/// HEVC sequence parameter set fields carried in an `hvcC` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HevcSpsInfo {
    /// General profile, tier and level exactly as coded (12 bytes).
    pub profile_tier_level: [u8; 12],
    pub max_sub_layers: u8,
    pub temporal_id_nested: bool,
    pub chroma_format_idc: u8,
    pub bit_depth_luma: u8,
    pub bit_depth_chroma: u8,
}

/// Parse the leading fields of an HEVC SPS NAL unit (header included).
pub fn parse_hevc_sps(nal: &[u8]) -> Option<HevcSpsInfo> {
    if nal_type(VideoCodec::Hevc, nal)? != HEVC_NAL_SPS {
        return None;
    }
    let rbsp = unescape_rbsp(nal.get(2..)?);
    let mut r = BitReader::new(&rbsp);

    r.bits(4)?; // sps_video_parameter_set_id
    let sub_layers_minus1 = r.bits(3)? as usize;
    if sub_layers_minus1 > 6 {
        return None;
    }
    let temporal_id_nested = r.bit()? == 1;

    let mut profile_tier_level = [0u8; 12];
    for byte in &mut profile_tier_level {
        *byte = r.bits(8)? as u8;
    }

    let mut present = [(false, false); 6];
    for flags in present.iter_mut().take(sub_layers_minus1) {
        *flags = (r.bit()? == 1, r.bit()? == 1);
    }
    if sub_layers_minus1 > 0 {
        r.skip(2 * (8 - sub_layers_minus1))?;
    }
    for &(profile, level) in present.iter().take(sub_layers_minus1) {
        if profile {
            r.skip(88)?;
        }
        if level {
            r.skip(8)?;
        }
    }

    r.ue()?; // sps_seq_parameter_set_id
    let chroma_format_idc = r.ue()?;
    if chroma_format_idc > 3 {
        return None;
    }
    if chroma_format_idc == 3 {
        r.bit()?; // separate_colour_plane_flag
    }
    r.ue()?; // pic_width_in_luma_samples
    r.ue()?; // pic_height_in_luma_samples
    if r.bit()? == 1 {
        for _ in 0..4 {
            r.ue()?; // conformance window offsets
        }
    }
    let luma_minus8 = r.ue()?;
    let chroma_minus8 = r.ue()?;
    if luma_minus8 > 7 || chroma_minus8 > 7 {
        return None;
    }

    Some(HevcSpsInfo {
        profile_tier_level,
        max_sub_layers: sub_layers_minus1 as u8 + 1,
        temporal_id_nested,
        chroma_format_idc: chroma_format_idc as u8,
        bit_depth_luma: luma_minus8 as u8 + 8,
        bit_depth_chroma: chroma_minus8 as u8 + 8,
    })
}

/// Size of the fixed part of an HEVCDecoderConfigurationRecord.
pub const HVCC_HEADER_LEN: usize = 23;

/// Build an HEVCDecoderConfigurationRecord (ISO/IEC 14496-15 8.3.3) holding
/// one VPS, SPS and PPS. NAL units use 4-byte length prefixes.
pub fn hevc_decoder_configuration_record(vps: &[u8], sps: &[u8], pps: &[u8]) -> Option<Vec<u8>> {
    let info = parse_hevc_sps(sps)?;
    let mut out = Vec::with_capacity(HVCC_HEADER_LEN + 15 + vps.len() + sps.len() + pps.len());

    out.push(1); // configurationVersion
    out.extend_from_slice(&info.profile_tier_level);
    out.extend_from_slice(&[0xf0, 0x00]); // min_spatial_segmentation_idc = 0
    out.push(0xfc); // parallelismType unknown
    out.push(0xfc | info.chroma_format_idc);
    out.push(0xf8 | (info.bit_depth_luma - 8));
    out.push(0xf8 | (info.bit_depth_chroma - 8));
    out.extend_from_slice(&[0, 0]); // avgFrameRate unspecified
    out.push((info.max_sub_layers << 3) | (u8::from(info.temporal_id_nested) << 2) | 0x03);

    let arrays = [(HEVC_NAL_VPS, vps), (HEVC_NAL_SPS, sps), (HEVC_NAL_PPS, pps)];
    out.push(arrays.len() as u8);
    for (kind, nal) in arrays {
        // array_completeness = 0: hev1 also carries the sets in-band.
        out.push(kind & 0x3f);
        out.extend_from_slice(&1u16.to_be_bytes());
        out.extend_from_slice(&u16::try_from(nal.len()).ok()?.to_be_bytes());
        out.extend_from_slice(nal);
    }
    Some(out)
}

/// Incremental splitter of an Annex-B byte stream into access units.
///
/// The stream must carry an access unit delimiter at the start of every
/// access unit.
#[derive(Debug)]
pub struct AccessUnitSplitter {
    codec: VideoCodec,
    buf: Vec<u8>,
}

impl AccessUnitSplitter {
    pub fn new(codec: VideoCodec) -> Self {
        Self {
            codec,
            buf: Vec::new(),
        }
    }

    /// Feed bytes; returns every access unit completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(bytes);

        let boundaries: Vec<usize> = start_codes(&self.buf)
            .into_iter()
            .filter(|&(_, payload)| is_aud(self.codec, &self.buf[payload..]))
            .map(|(begin, _)| begin)
            .collect();

        let mut units = Vec::new();
        let Some(&last) = boundaries.last() else {
            return units;
        };
        // Data before the first delimiter belongs to no access unit.
        let mut start = boundaries[0];
        for &next in &boundaries[1..] {
            units.push(self.buf[start..next].to_vec());
            start = next;
        }
        self.buf.drain(..last);
        units
    }

    /// Remaining bytes as the final access unit.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        let rest = std::mem::take(&mut self.buf);
        (!split_nal_units(&rest).is_empty()).then_some(rest)
    }
}

/// One AAC frame with its ADTS header removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdtsFrame {
    pub sample_rate_index: u8,
    pub channel_config: u8,
    pub payload: Vec<u8>,
}

/// Incremental ADTS demuxer.
#[derive(Debug, Default)]
pub struct AdtsParser {
    buf: Vec<u8>,
}

impl AdtsParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<AdtsFrame> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();
        let mut pos = 0;

        while pos + 7 <= self.buf.len() {
            let h = &self.buf[pos..];
            if h[0] != 0xff || h[1] & 0xf0 != 0xf0 {
                pos += 1;
                continue;
            }
            let protection_absent = h[1] & 0x01 == 1;
            let header_len = if protection_absent { 7 } else { 9 };
            let frame_len =
                (((h[3] & 0x03) as usize) << 11) | ((h[4] as usize) << 3) | ((h[5] as usize) >> 5);
            if frame_len < header_len {
                pos += 1;
                continue;
            }
            if pos + frame_len > self.buf.len() {
                break;
            }
            frames.push(AdtsFrame {
                sample_rate_index: (h[2] >> 2) & 0x0f,
                channel_config: ((h[2] & 0x01) << 2) | (h[3] >> 6),
                payload: h[header_len..frame_len].to_vec(),
            });
            pos += frame_len;
        }

        self.buf.drain(..pos);
        frames
    }
}
