//! ffmpeg-backed media collaborators.
//!
//! Everything here drives `ffmpeg`/`ffprobe` child processes over pipes:
//! metadata probing, raw RGBA frame decoding for playback, whole-track audio
//! decoding, and the H.264/H.265/AAC encoders behind [`EncoderBackend`].

use std::collections::{HashSet, VecDeque};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::oneshot;
use viralize_common::{samples_to_us, ExportDefaults, ViralizeError, ViralizeResult};
use viralize_processing_core::{DecodedAudio, PlanarChunk};
use viralize_project_model::{AudioStreamInfo, SourceMedia};

use crate::bitstream::{extract_parameter_sets, is_keyframe, AccessUnitSplitter, AdtsParser};
use crate::compositor::rgba_to_pixmap;
use crate::encoder::{
    AudioDecoder, AudioEncoder, AudioEncoderConfig, ChunkKind, DecoderConfig, EncodedChunk,
    EncoderBackend, EncoderEvent, EncoderOutput, VideoCodec, VideoEncoder, VideoEncoderConfig,
    VideoFrame,
};
use crate::playback::{DecodedFrame, FrameDecoder};

/// Samples per AAC frame.
const AAC_FRAME_SAMPLES: u64 = 1024;

/// Leading frames of ffmpeg's AAC output that only hold encoder delay.
const AAC_PRIMING_FRAMES: u64 = 1;

const READ_BUFFER_BYTES: usize = 64 * 1024;

/// Locations of the ffmpeg executables.
#[derive(Debug, Clone)]
pub struct FfmpegTools {
    pub ffmpeg: String,
    pub ffprobe: String,
}

impl Default for FfmpegTools {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
        }
    }
}

impl FfmpegTools {
    pub fn from_config(export: &ExportDefaults) -> Self {
        Self {
            ffmpeg: export.ffmpeg_path.clone(),
            ffprobe: export.ffprobe_path.clone(),
        }
    }

    /// Whether both executables can be found.
    pub fn available(&self) -> bool {
        command_exists(&self.ffmpeg) && command_exists(&self.ffprobe)
    }

    /// First line of `ffmpeg -version`.
    pub fn version(&self) -> ViralizeResult<String> {
        let output = Command::new(&self.ffmpeg)
            .arg("-version")
            .output()
            .map_err(|e| ViralizeError::unsupported(format!("cannot run {}: {e}", self.ffmpeg)))?;
        let text = String::from_utf8_lossy(&output.stdout);
        Ok(text.lines().next().unwrap_or_default().trim().to_string())
    }
}

pub fn command_exists(binary: &str) -> bool {
    Command::new("sh")
        .arg("-c")
        .arg(format!("command -v {binary} >/dev/null 2>&1"))
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Probing
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    sample_rate: Option<String>,
    channels: Option<u16>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    format_name: Option<String>,
    duration: Option<String>,
}

fn parse_secs(raw: Option<&str>) -> Option<f64> {
    raw.and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0)
}

/// Probe a file on disk into a [`SourceMedia`].
pub fn probe_source(tools: &FfmpegTools, path: &Path) -> ViralizeResult<SourceMedia> {
    let byte_size = SourceMedia::check_file(path)?;
    let output = Command::new(&tools.ffprobe)
        .args([
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path)
        .output()
        .map_err(|e| ViralizeError::decode(format!("Failed to start ffprobe: {e}")))?;

    if !output.status.success() {
        return Err(ViralizeError::decode(format!(
            "ffprobe failed (status {}): {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let source = parse_probe_json(path, byte_size, &String::from_utf8_lossy(&output.stdout))?;
    tracing::info!(
        path = %path.display(),
        width = source.width,
        height = source.height,
        duration = ?source.duration_secs,
        has_audio = source.audio.is_some(),
        "Probed source"
    );
    Ok(source)
}

/// Build a [`SourceMedia`] from `ffprobe -print_format json` output.
pub fn parse_probe_json(path: &Path, byte_size: u64, json: &str) -> ViralizeResult<SourceMedia> {
    let probe: ProbeOutput = serde_json::from_str(json)
        .map_err(|e| ViralizeError::decode(format!("unreadable ffprobe output: {e}")))?;

    let video = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| ViralizeError::decode("source has no video stream"))?;

    let mut source = SourceMedia::new(
        path,
        byte_size,
        video.width.unwrap_or(0),
        video.height.unwrap_or(0),
    )?;
    source.video_codec = video.codec_name.clone();
    source.container = probe.format.as_ref().and_then(|f| f.format_name.clone());
    source.duration_secs = probe
        .format
        .as_ref()
        .and_then(|f| parse_secs(f.duration.as_deref()))
        .or_else(|| parse_secs(video.duration.as_deref()));

    source.audio = probe
        .streams
        .iter()
        .filter(|s| s.codec_type.as_deref() == Some("audio"))
        .find_map(|s| {
            let sample_rate = s.sample_rate.as_deref()?.parse::<u32>().ok()?;
            let channels = s.channels.filter(|c| *c > 0)?;
            Some(AudioStreamInfo {
                codec: s.codec_name.clone().unwrap_or_default(),
                sample_rate,
                channels,
            })
        });

    Ok(source)
}

// ---------------------------------------------------------------------------
// Frame decoding
// ---------------------------------------------------------------------------

struct FrameStream {
    child: Child,
    stdout: BufReader<ChildStdout>,
    start_secs: f64,
    index: u64,
}

impl Drop for FrameStream {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Decodes a source into RGBA frames at a fixed rate through `ffmpeg`.
pub struct FfmpegFrameDecoder {
    ffmpeg: String,
    path: PathBuf,
    width: u32,
    height: u32,
    duration: Option<f64>,
    fps: f64,
    stream: Option<FrameStream>,
}

impl FfmpegFrameDecoder {
    pub fn open(tools: &FfmpegTools, source: &SourceMedia, fps: f64) -> ViralizeResult<Self> {
        if !(fps.is_finite() && fps > 0.0) {
            return Err(ViralizeError::validation(format!("invalid decode rate {fps}")));
        }
        let mut decoder = Self {
            ffmpeg: tools.ffmpeg.clone(),
            path: source.path.clone(),
            width: source.width,
            height: source.height,
            duration: source.valid_duration(),
            fps,
            stream: None,
        };
        decoder.stream = Some(decoder.spawn(0.0)?);
        Ok(decoder)
    }

    fn spawn(&self, start_secs: f64) -> ViralizeResult<FrameStream> {
        let mut child = Command::new(&self.ffmpeg)
            .args(["-v", "error", "-ss"])
            .arg(format!("{start_secs:.6}"))
            .arg("-i")
            .arg(&self.path)
            .args(["-an", "-vf"])
            .arg(format!("fps={}", self.fps))
            .args(["-f", "rawvideo", "-pix_fmt", "rgba", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| ViralizeError::decode(format!("Failed to start ffmpeg decoder: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ViralizeError::decode("Failed to capture ffmpeg stdout"))?;

        tracing::debug!(pid = child.id(), start_secs, "Frame decoder started");
        Ok(FrameStream {
            child,
            stdout: BufReader::with_capacity(READ_BUFFER_BYTES, stdout),
            start_secs,
            index: 0,
        })
    }
}

impl FrameDecoder for FfmpegFrameDecoder {
    fn natural_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn duration_secs(&self) -> Option<f64> {
        self.duration
    }

    fn next_frame(&mut self) -> ViralizeResult<Option<DecodedFrame>> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };

        let mut buf = vec![0u8; self.width as usize * self.height as usize * 4];
        match stream.stdout.read_exact(&mut buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                self.stream = None;
                return Ok(None);
            }
            Err(e) => return Err(ViralizeError::decode(format!("frame read failed: {e}"))),
        }

        let pts_secs = stream.start_secs + stream.index as f64 / self.fps;
        stream.index += 1;
        Ok(Some(DecodedFrame {
            pts_secs,
            image: rgba_to_pixmap(self.width, self.height, &buf)?,
        }))
    }

    fn seek(&mut self, secs: f64) -> ViralizeResult<()> {
        self.stream = None;
        self.stream = Some(self.spawn(secs.max(0.0))?);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Audio decoding
// ---------------------------------------------------------------------------

/// Decodes a source's first audio stream to planar f32.
#[derive(Debug, Clone)]
pub struct FfmpegAudioDecoder {
    ffmpeg: String,
}

impl FfmpegAudioDecoder {
    pub fn new(tools: &FfmpegTools) -> Self {
        Self {
            ffmpeg: tools.ffmpeg.clone(),
        }
    }
}

#[async_trait]
impl AudioDecoder for FfmpegAudioDecoder {
    async fn decode(&self, source: &SourceMedia) -> ViralizeResult<DecodedAudio> {
        let info = source
            .audio
            .clone()
            .ok_or_else(|| ViralizeError::audio("source has no audio stream"))?;
        let ffmpeg = self.ffmpeg.clone();
        let path = source.path.clone();

        tokio::task::spawn_blocking(move || decode_audio_blocking(&ffmpeg, &path, &info))
            .await
            .map_err(|e| ViralizeError::audio(format!("audio decode task failed: {e}")))?
    }
}

fn decode_audio_blocking(
    ffmpeg: &str,
    path: &Path,
    info: &AudioStreamInfo,
) -> ViralizeResult<DecodedAudio> {
    let started = std::time::Instant::now();
    let output = Command::new(ffmpeg)
        .args(["-v", "error", "-i"])
        .arg(path)
        .args(["-vn", "-f", "f32le", "-acodec", "pcm_f32le", "-ac"])
        .arg(info.channels.to_string())
        .arg("-ar")
        .arg(info.sample_rate.to_string())
        .arg("pipe:1")
        .output()
        .map_err(|e| ViralizeError::audio(format!("Failed to start ffmpeg: {e}")))?;

    if !output.status.success() {
        return Err(ViralizeError::audio(format!(
            "ffmpeg audio decode failed (status {}): {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let samples: Vec<f32> = output
        .stdout
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    if samples.is_empty() {
        return Err(ViralizeError::audio("audio stream decoded to no samples"));
    }

    let audio = DecodedAudio::from_interleaved(info.sample_rate, info.channels, &samples)?;
    tracing::debug!(
        frames = audio.frames(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Audio decoded with ffmpeg"
    );
    Ok(audio)
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encoders available through a local ffmpeg build.
#[derive(Debug, Clone)]
pub struct FfmpegEncoderBackend {
    tools: FfmpegTools,
    encoders: HashSet<String>,
}

impl FfmpegEncoderBackend {
    /// Ask ffmpeg which encoders it was built with.
    pub fn probe(tools: &FfmpegTools) -> ViralizeResult<Self> {
        let output = Command::new(&tools.ffmpeg)
            .args(["-hide_banner", "-encoders"])
            .output()
            .map_err(|e| ViralizeError::unsupported(format!("cannot run {}: {e}", tools.ffmpeg)))?;
        if !output.status.success() {
            return Err(ViralizeError::unsupported(format!(
                "ffmpeg -encoders failed (status {})",
                output.status
            )));
        }
        let encoders = parse_encoder_list(&String::from_utf8_lossy(&output.stdout));
        tracing::debug!(count = encoders.len(), "Probed ffmpeg encoders");
        Ok(Self::with_encoders(tools, encoders))
    }

    pub fn with_encoders(tools: &FfmpegTools, encoders: HashSet<String>) -> Self {
        Self {
            tools: tools.clone(),
            encoders,
        }
    }

    pub fn has_encoder(&self, name: &str) -> bool {
        self.encoders.contains(name)
    }
}

/// Encoder names from `ffmpeg -encoders` output.
pub fn parse_encoder_list(text: &str) -> HashSet<String> {
    text.lines()
        .skip_while(|line| !line.trim_start().starts_with("---"))
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let flags = parts.next()?;
            let name = parts.next()?;
            (flags.len() == 6).then(|| name.to_string())
        })
        .collect()
}

pub fn encoder_name(codec: VideoCodec) -> &'static str {
    match codec {
        VideoCodec::Hevc => "libx265",
        VideoCodec::Avc => "libx264",
    }
}

/// ffmpeg arguments for a raw RGBA → Annex-B video encoder.
pub fn video_encoder_args(config: &VideoEncoderConfig) -> Vec<String> {
    let gop = config.keyframe_interval().to_string();
    let mut args: Vec<String> = [
        "-v", "error", "-f", "rawvideo", "-pix_fmt", "rgba", "-s",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.push(format!("{}x{}", config.width(), config.height()));
    args.extend(["-r".to_string(), config.fps().to_string()]);
    args.extend(["-i", "pipe:0", "-an", "-c:v", encoder_name(config.codec())].map(String::from));
    args.extend(["-preset", "veryfast", "-tune", "zerolatency"].map(String::from));
    args.extend(["-b:v".to_string(), config.bitrate().to_string()]);
    args.extend(["-g".to_string(), gop.clone(), "-bf".to_string(), "0".to_string()]);

    match config.codec() {
        VideoCodec::Avc => {
            args.extend(["-keyint_min".to_string(), gop, "-sc_threshold".into(), "0".into()]);
            args.extend(["-profile:v", "main", "-x264-params", "aud=1"].map(String::from));
            args.extend(["-pix_fmt", "yuv420p", "-f", "h264", "pipe:1"].map(String::from));
        }
        VideoCodec::Hevc => {
            args.push("-x265-params".into());
            args.push(format!("aud=1:min-keyint={gop}:scenecut=0:log-level=error"));
            args.extend(["-pix_fmt", "yuv420p", "-f", "hevc", "pipe:1"].map(String::from));
        }
    }
    args
}

/// ffmpeg arguments for an interleaved f32 → ADTS AAC encoder.
pub fn audio_encoder_args(config: &AudioEncoderConfig) -> Vec<String> {
    let mut args: Vec<String> = ["-v", "error", "-f", "f32le", "-ar"].map(String::from).to_vec();
    args.push(config.sample_rate().to_string());
    args.extend(["-ac".to_string(), config.channels().to_string()]);
    args.extend(["-i", "pipe:0", "-c:a", "aac", "-b:a"].map(String::from));
    args.push(config.bitrate().to_string());
    args.extend(["-f", "adts", "pipe:1"].map(String::from));
    args
}

impl EncoderBackend for FfmpegEncoderBackend {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    fn supports_video(&self, config: &VideoEncoderConfig) -> bool {
        // 4:2:0 output needs even dimensions.
        self.has_encoder(encoder_name(config.codec()))
            && config.width() % 2 == 0
            && config.height() % 2 == 0
    }

    fn video_encoder(
        &self,
        config: &VideoEncoderConfig,
        output: EncoderOutput,
    ) -> ViralizeResult<Box<dyn VideoEncoder>> {
        if !self.supports_video(config) {
            return Err(ViralizeError::unsupported(format!(
                "{} is not available",
                encoder_name(config.codec())
            )));
        }
        let timestamps = Arc::new(Mutex::new(VecDeque::new()));
        let parser = VideoStreamParser {
            codec: config.codec(),
            splitter: AccessUnitSplitter::new(config.codec()),
            timestamps: Arc::clone(&timestamps),
            last: (0, 0),
        };
        let worker = ProcessWorker::spawn(
            "video",
            &self.tools.ffmpeg,
            &video_encoder_args(config),
            Box::new(parser),
            output,
        )?;
        Ok(Box::new(FfmpegVideoEncoder {
            worker,
            timestamps,
            frame_bytes: config.width() as usize * config.height() as usize * 4,
        }))
    }

    fn audio_encoder(
        &self,
        config: &AudioEncoderConfig,
        output: EncoderOutput,
    ) -> ViralizeResult<Box<dyn AudioEncoder>> {
        if !self.has_encoder("aac") {
            return Err(ViralizeError::unsupported("aac encoder is not available"));
        }
        let parser = AudioStreamParser {
            adts: AdtsParser::new(),
            sample_rate: config.sample_rate(),
            channels: config.channels(),
            seen: 0,
        };
        let worker = ProcessWorker::spawn(
            "audio",
            &self.tools.ffmpeg,
            &audio_encoder_args(config),
            Box::new(parser),
            output,
        )?;
        Ok(Box::new(FfmpegAudioEncoder {
            worker,
            pending_samples: 0,
        }))
    }
}

/// Turns an encoder's stdout into chunks.
trait StreamParser: Send {
    fn push(&mut self, bytes: &[u8]) -> Vec<EncodedChunk>;
    fn finish(&mut self) -> Vec<EncodedChunk>;
}

struct VideoStreamParser {
    codec: VideoCodec,
    splitter: AccessUnitSplitter,
    timestamps: Arc<Mutex<VecDeque<(i64, i64)>>>,
    last: (i64, i64),
}

impl VideoStreamParser {
    fn chunk(&mut self, access_unit: Vec<u8>) -> EncodedChunk {
        let next = self.timestamps.lock().ok().and_then(|mut q| q.pop_front());
        let (timestamp_us, duration_us) =
            next.unwrap_or((self.last.0 + self.last.1, self.last.1));
        self.last = (timestamp_us, duration_us);

        let key = is_keyframe(self.codec, &access_unit);
        EncodedChunk {
            kind: if key { ChunkKind::Key } else { ChunkKind::Delta },
            timestamp_us,
            duration_us,
            decoder_config: if key {
                extract_parameter_sets(self.codec, &access_unit)
            } else {
                None
            },
            data: Bytes::from(access_unit),
        }
    }
}

impl StreamParser for VideoStreamParser {
    fn push(&mut self, bytes: &[u8]) -> Vec<EncodedChunk> {
        self.splitter
            .push(bytes)
            .into_iter()
            .map(|au| self.chunk(au))
            .collect()
    }

    fn finish(&mut self) -> Vec<EncodedChunk> {
        self.splitter
            .finish()
            .map(|au| self.chunk(au))
            .into_iter()
            .collect()
    }
}

struct AudioStreamParser {
    adts: AdtsParser,
    sample_rate: u32,
    channels: u16,
    /// ADTS frames seen so far, priming included.
    seen: u64,
}

impl StreamParser for AudioStreamParser {
    /// Priming frames are dropped so the first kept frame starts at zero,
    /// in step with the first video frame.
    fn push(&mut self, bytes: &[u8]) -> Vec<EncodedChunk> {
        let mut chunks = Vec::new();
        for frame in self.adts.push(bytes) {
            let index = self.seen;
            self.seen += 1;
            let Some(kept) = index.checked_sub(AAC_PRIMING_FRAMES) else {
                continue;
            };
            chunks.push(EncodedChunk {
                kind: ChunkKind::Key,
                timestamp_us: samples_to_us(kept * AAC_FRAME_SAMPLES, self.sample_rate),
                duration_us: samples_to_us(AAC_FRAME_SAMPLES, self.sample_rate),
                data: Bytes::from(frame.payload),
                decoder_config: (kept == 0).then_some(DecoderConfig::Aac {
                    sample_rate: self.sample_rate,
                    channels: self.channels,
                }),
            });
        }
        chunks
    }

    fn finish(&mut self) -> Vec<EncodedChunk> {
        Vec::new()
    }
}

/// One encoder child process with a writer and a reader thread.
struct ProcessWorker {
    label: &'static str,
    input: Option<crossbeam_channel::Sender<Vec<u8>>>,
    pending: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
    child: Arc<Mutex<Child>>,
    done: Option<oneshot::Receiver<ViralizeResult<()>>>,
}

impl ProcessWorker {
    fn spawn(
        label: &'static str,
        ffmpeg: &str,
        args: &[String],
        mut parser: Box<dyn StreamParser>,
        output: EncoderOutput,
    ) -> ViralizeResult<Self> {
        tracing::debug!(label, args = ?args, "Starting ffmpeg encoder");
        let mut child = Command::new(ffmpeg)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ViralizeError::encode(format!("Failed to start ffmpeg {label} encoder: {e}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ViralizeError::encode("Failed to capture ffmpeg stdin"))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| ViralizeError::encode("Failed to capture ffmpeg stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ViralizeError::encode("Failed to capture ffmpeg stderr"))?;

        tracing::info!(label, pid = child.id(), "ffmpeg encoder started");
        let child = Arc::new(Mutex::new(child));
        let pending = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicBool::new(false));
        let (input, jobs) = crossbeam_channel::unbounded::<Vec<u8>>();
        let (done_tx, done) = oneshot::channel();

        std::thread::spawn(move || {
            for buf in jobs {
                if stdin.write_all(&buf).is_err() {
                    break;
                }
            }
        });

        // Drain stderr concurrently so ffmpeg never blocks on a full pipe.
        let stderr_task = std::thread::spawn(move || -> String {
            let mut reader = BufReader::new(stderr);
            let mut text = String::new();
            match reader.read_to_string(&mut text) {
                Ok(_) => text,
                Err(err) => format!("<failed to read ffmpeg stderr: {err}>"),
            }
        });

        let reader_child = Arc::clone(&child);
        let reader_pending = Arc::clone(&pending);
        let reader_closed = Arc::clone(&closed);
        std::thread::spawn(move || {
            let mut buf = vec![0u8; READ_BUFFER_BYTES];
            let forward = |chunks: Vec<EncodedChunk>| -> bool {
                for chunk in chunks {
                    let _ = reader_pending.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                        Some(n.saturating_sub(1))
                    });
                    if output.blocking_send(EncoderEvent::Chunk(chunk)).is_err() {
                        return false;
                    }
                }
                true
            };

            let mut read_error = None;
            loop {
                match stdout.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if !forward(parser.push(&buf[..n])) {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        read_error = Some(e.to_string());
                        break;
                    }
                }
            }
            forward(parser.finish());

            let status = reader_child.lock().ok().and_then(|mut c| c.wait().ok());
            let stderr_output = stderr_task
                .join()
                .unwrap_or_else(|_| "<failed to join stderr reader>".to_string());

            let failure = match (status, read_error) {
                (_, Some(e)) => Some(format!("ffmpeg {label} output read failed: {e}")),
                (Some(status), None) if !status.success() => Some(format!(
                    "ffmpeg {label} encoder failed (status {}): {}",
                    status,
                    stderr_output.trim()
                )),
                (None, None) => Some(format!("ffmpeg {label} encoder could not be awaited")),
                _ => None,
            };

            let result = match failure {
                Some(message) if !reader_closed.load(Ordering::SeqCst) => {
                    let _ = output.blocking_send(EncoderEvent::Error(ViralizeError::encode(
                        message.clone(),
                    )));
                    Err(ViralizeError::encode(message))
                }
                _ => Ok(()),
            };
            let _ = done_tx.send(result);
        });

        Ok(Self {
            label,
            input: Some(input),
            pending,
            closed,
            child,
            done: Some(done),
        })
    }

    fn submit(&mut self, bytes: Vec<u8>, units: usize) -> ViralizeResult<()> {
        let label = self.label;
        let input = self
            .input
            .as_ref()
            .ok_or_else(|| ViralizeError::encode(format!("{label} encoder is closed")))?;
        self.pending.fetch_add(units, Ordering::SeqCst);
        input.send(bytes).map_err(|_| {
            self.pending.fetch_sub(units, Ordering::SeqCst);
            ViralizeError::encode(format!("ffmpeg {label} encoder stopped"))
        })
    }

    fn queue_size(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Close stdin and wait for every remaining chunk to be emitted.
    async fn flush(&mut self) -> ViralizeResult<()> {
        self.input = None;
        let done = self
            .done
            .take()
            .ok_or_else(|| ViralizeError::encode(format!("{} encoder already flushed", self.label)))?;
        done.await
            .map_err(|_| ViralizeError::encode(format!("ffmpeg {} reader stopped", self.label)))?
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.input = None;
        if let Ok(mut child) = self.child.lock() {
            let _ = child.kill();
        }
    }
}

impl Drop for ProcessWorker {
    fn drop(&mut self) {
        if self.done.is_some() {
            self.close();
        }
    }
}

struct FfmpegVideoEncoder {
    worker: ProcessWorker,
    timestamps: Arc<Mutex<VecDeque<(i64, i64)>>>,
    frame_bytes: usize,
}

#[async_trait]
impl VideoEncoder for FfmpegVideoEncoder {
    fn encode(&mut self, frame: VideoFrame, _key_frame: bool) -> ViralizeResult<()> {
        // Key frames come from the fixed GOP, which matches the capture interval.
        let rgba = frame.image.take();
        if rgba.len() != self.frame_bytes {
            return Err(ViralizeError::encode(format!(
                "frame is {} bytes, encoder expects {}",
                rgba.len(),
                self.frame_bytes
            )));
        }
        if let Ok(mut q) = self.timestamps.lock() {
            q.push_back((frame.timestamp_us, frame.duration_us));
        }
        self.worker.submit(rgba, 1)
    }

    fn queue_size(&self) -> usize {
        self.worker.queue_size()
    }

    async fn flush(&mut self) -> ViralizeResult<()> {
        self.worker.flush().await
    }

    fn close(&mut self) {
        self.worker.close();
    }
}

struct FfmpegAudioEncoder {
    worker: ProcessWorker,
    pending_samples: u64,
}

#[async_trait]
impl AudioEncoder for FfmpegAudioEncoder {
    fn encode(&mut self, chunk: PlanarChunk) -> ViralizeResult<()> {
        let channels = chunk.channels as usize;
        let mut bytes = Vec::with_capacity(chunk.data.len() * 4);
        for i in 0..chunk.frames {
            for c in 0..channels {
                bytes.extend_from_slice(&chunk.plane(c)[i].to_le_bytes());
            }
        }

        // Pending work is counted in whole AAC frames.
        let before = self.pending_samples / AAC_FRAME_SAMPLES;
        self.pending_samples += chunk.frames as u64;
        let units = (self.pending_samples / AAC_FRAME_SAMPLES - before) as usize;
        self.worker.submit(bytes, units)
    }

    fn queue_size(&self) -> usize {
        self.worker.queue_size()
    }

    async fn flush(&mut self) -> ViralizeResult<()> {
        self.worker.flush().await
    }

    fn close(&mut self) {
        self.worker.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROBE: &str = r#"{
        "streams": [
            {"index": 0, "codec_name": "h264", "codec_type": "video", "width": 1920, "height": 1080, "duration": "12.500000"},
            {"index": 1, "codec_name": "aac", "codec_type": "audio", "sample_rate": "48000", "channels": 2}
        ],
        "format": {"format_name": "mov,mp4,m4a,3gp,3g2,mj2", "duration": "12.512000"}
    }"#;

    #[test]
    fn test_parse_probe_json() {
        let source = parse_probe_json(Path::new("/tmp/in.mp4"), 1024, PROBE).unwrap();
        assert_eq!((source.width, source.height), (1920, 1080));
        assert_eq!(source.duration_secs, Some(12.512));
        assert_eq!(source.video_codec.as_deref(), Some("h264"));
        let audio = source.audio.unwrap();
        assert_eq!(audio.sample_rate, 48_000);
        assert_eq!(audio.channels, 2);
    }

    #[test]
    fn test_probe_without_duration_or_audio() {
        let json = r#"{"streams": [{"codec_type": "video", "width": 640, "height": 360, "duration": "N/A"}],
                       "format": {"duration": "N/A"}}"#;
        let source = parse_probe_json(Path::new("a.webm"), 10, json).unwrap();
        assert_eq!(source.duration_secs, None);
        assert!(source.audio.is_none());
    }

    #[test]
    fn test_probe_rejects_audio_only() {
        let json = r#"{"streams": [{"codec_type": "audio", "sample_rate": "44100", "channels": 1}]}"#;
        let err = parse_probe_json(Path::new("a.m4a"), 10, json).unwrap_err();
        assert!(err.to_string().contains("no video stream"));
    }

    #[test]
    fn test_parse_encoder_list() {
        let text = "Encoders:\n V..... = Video\n A..... = Audio\n ------\n \
                    V....D libx264              libx264 H.264 / AVC\n \
                    V....D libx265              libx265 H.265 / HEVC\n \
                    A....D aac                  AAC (Advanced Audio Coding)\n";
        let encoders = parse_encoder_list(text);
        assert!(encoders.contains("libx264"));
        assert!(encoders.contains("libx265"));
        assert!(encoders.contains("aac"));
        assert!(!encoders.contains("="));
    }

    #[test]
    fn test_backend_support_follows_encoder_list() {
        let tools = FfmpegTools::default();
        let backend =
            FfmpegEncoderBackend::with_encoders(&tools, ["libx264".to_string()].into_iter().collect());
        let config =
            VideoEncoderConfig::new(VideoCodec::Hevc, 720, 1280, 60, 12_000_000, 120).unwrap();
        assert!(!backend.supports_video(&config));
        assert!(backend.supports_video(&config.with_codec(VideoCodec::Avc)));
    }

    #[test]
    fn test_video_args_fix_gop_and_delimiters() {
        let config =
            VideoEncoderConfig::new(VideoCodec::Avc, 720, 1280, 60, 12_000_000, 120).unwrap();
        let args = video_encoder_args(&config);
        let joined = args.join(" ");
        assert!(joined.contains("-s 720x1280"));
        assert!(joined.contains("-g 120"));
        assert!(joined.contains("aud=1"));
        assert!(joined.ends_with("-f h264 pipe:1"));

        let hevc = video_encoder_args(&config.with_codec(VideoCodec::Hevc)).join(" ");
        assert!(hevc.contains("libx265"));
        assert!(hevc.contains("min-keyint=120"));
    }

    #[test]
    fn test_audio_parser_drops_priming_frame() {
        let mut parser = AudioStreamParser {
            adts: AdtsParser::new(),
            sample_rate: 48_000,
            channels: 2,
            seen: 0,
        };
        // Minimal ADTS frames (7-byte header + 2-byte payload).
        let frame = [0xff, 0xf1, 0x4c, 0x80, 0x01, 0x3f, 0xfc, 0xaa, 0xbb];
        assert!(parser.push(&frame).is_empty());

        let mut stream = frame.to_vec();
        stream.extend_from_slice(&frame);
        let chunks = parser.push(&stream);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].timestamp_us, 0);
        assert_eq!(chunks[1].timestamp_us, samples_to_us(1024, 48_000));
        assert!(chunks[0].decoder_config.is_some());
        assert!(chunks[1].decoder_config.is_none());
    }
}
