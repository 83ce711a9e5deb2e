use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mp4::{ChannelConfig, MediaType, Mp4Reader, TrackType};
use viralize_common::ViralizeError;
use viralize_project_model::{CompositionState, ReelResolution, SourceMedia};
use viralize_render_engine::export::{
    export_reel, ExportJob, ExportOutput, ExportProgress, ExportSettings, ExportStage,
    ProgressCallback,
};
use viralize_render_engine::synthetic::{
    SyntheticAudioDecoder, SyntheticEncoderBackend, SyntheticVideo,
};
use viralize_render_engine::{
    BlockGlyphs, ClockedPlayback, ExportWarning, FrameCompositor, LatestFrame, PlaybackSource,
    ReelStudio, RunFlag, VideoCodec, DEFAULT_END_EPSILON_SECS,
};

const FPS: f64 = 60.0;
const KEY_INTERVAL: u32 = 120;

/// A 1280x720, 30 fps landscape source.
const SOURCE_WIDTH: u32 = 1280;
const SOURCE_HEIGHT: u32 = 720;
const SOURCE_FPS: f64 = 30.0;

fn source(duration: Option<f64>) -> SourceMedia {
    let mut source =
        SourceMedia::new("/synthetic/source.mp4", 4_000_000, SOURCE_WIDTH, SOURCE_HEIGHT).unwrap();
    source.duration_secs = duration;
    source
}

fn video(duration: Option<f64>) -> SyntheticVideo {
    SyntheticVideo::new(SOURCE_WIDTH, SOURCE_HEIGHT, SOURCE_FPS, duration)
}

fn playback(duration: Option<f64>) -> ClockedPlayback<SyntheticVideo> {
    ClockedPlayback::new(video(duration))
}

/// Frames captured from a source of `secs` before the end threshold.
fn expected_frames(secs: f64) -> u64 {
    ((secs - DEFAULT_END_EPSILON_SECS) * FPS).ceil() as u64
}

fn assert_frames_near(frames: u64, secs: f64) {
    let expected = expected_frames(secs);
    assert!(
        frames <= expected + 1 && frames + 10 >= expected,
        "{frames} frames, expected about {expected}"
    );
}

fn job(duration: Option<f64>) -> ExportJob {
    let mut composition = CompositionState::default();
    composition.caption = Some("Ninguém te conta isso sobre edição de vídeo".to_string());
    ExportJob {
        source: source(duration),
        composition,
        settings: ExportSettings::default(),
    }
}

fn compositor() -> FrameCompositor {
    FrameCompositor::new(Arc::new(BlockGlyphs))
}

async fn run_export(
    job: &ExportJob,
    playback: &mut ClockedPlayback<SyntheticVideo>,
    backend: &SyntheticEncoderBackend,
    audio: &SyntheticAudioDecoder,
) -> Result<ExportOutput, ViralizeError> {
    let mut compositor = compositor();
    let run = RunFlag::new();
    export_reel(job, playback, &mut compositor, backend, audio, &run, None).await
}

struct TrackSummary {
    kind: TrackType,
    duration_secs: f64,
    samples: u32,
}

fn read_tracks(bytes: &[u8]) -> (Mp4Reader<Cursor<&[u8]>>, Vec<(u32, TrackSummary)>) {
    let reader = Mp4Reader::read_header(Cursor::new(bytes), bytes.len() as u64).unwrap();
    let mut tracks: Vec<(u32, TrackSummary)> = reader
        .tracks()
        .iter()
        .map(|(id, track)| {
            (
                *id,
                TrackSummary {
                    kind: track.track_type().unwrap(),
                    duration_secs: track.duration().as_secs_f64(),
                    samples: track.sample_count(),
                },
            )
        })
        .collect();
    tracks.sort_by_key(|(id, _)| *id);
    (reader, tracks)
}

/// Parameter-set arrays of the first `hvcC` record: `(nal_type, units)`.
fn hvcc_arrays(file: &[u8]) -> Vec<(u8, Vec<Vec<u8>>)> {
    let at = file.windows(4).position(|w| w == b"hvcC").expect("no hvcC box") - 4;
    let size = u32::from_be_bytes(file[at..at + 4].try_into().unwrap()) as usize;
    let record = &file[at + 8..at + size];
    assert!(record.len() >= 23, "hvcC record truncated: {} bytes", record.len());
    assert_eq!(record[0], 1, "configurationVersion");
    assert_eq!(record[21] & 0x03, 3, "4-byte NAL lengths");

    let read_u16 = |pos: usize| u16::from_be_bytes([record[pos], record[pos + 1]]) as usize;
    let mut pos = 23;
    let mut arrays = Vec::new();
    for _ in 0..record[22] {
        let kind = record[pos] & 0x3f;
        let count = read_u16(pos + 1);
        pos += 3;
        let mut units = Vec::new();
        for _ in 0..count {
            let len = read_u16(pos);
            units.push(record[pos + 2..pos + 2 + len].to_vec());
            pos += 2 + len;
        }
        arrays.push((kind, units));
    }
    assert_eq!(pos, record.len(), "trailing bytes in hvcC");
    arrays
}

#[tokio::test(start_paused = true)]
async fn five_second_export_has_matching_audio_and_video() {
    let job = job(Some(5.0));
    let mut playback = playback(Some(5.0));
    let backend = SyntheticEncoderBackend::new();
    let audio = SyntheticAudioDecoder::new(44_100, 2);

    let output = run_export(&job, &mut playback, &backend, &audio).await.unwrap();

    assert!(output.has_audio);
    assert!(output.warnings.is_empty(), "{:?}", output.warnings);
    assert_eq!(output.codec, VideoCodec::Hevc);
    assert!(output.suggested_filename.starts_with("viralize-reel-"));
    assert_frames_near(output.capture.frames, 5.0);

    let (mut reader, tracks) = read_tracks(&output.bytes);
    assert_eq!(tracks.len(), 2);
    let video = tracks.iter().find(|(_, t)| t.kind == TrackType::Video).unwrap();
    let audio = tracks.iter().find(|(_, t)| t.kind == TrackType::Audio).unwrap();

    let frame = 1.0 / FPS;
    assert!((video.1.duration_secs - 5.0).abs() <= frame + 0.001, "video {}", video.1.duration_secs);
    assert!(
        (video.1.duration_secs - audio.1.duration_secs).abs() <= frame + 0.001,
        "video {} vs audio {}",
        video.1.duration_secs,
        audio.1.duration_secs
    );
    assert_eq!(video.1.samples as u64, output.capture.frames);

    // Key frames every 120 captured frames, starting with the first.
    let video_id = video.0;
    for sample_id in 1..=video.1.samples {
        let sample = reader.read_sample(video_id, sample_id).unwrap().unwrap();
        assert_eq!(sample.is_sync, (sample_id - 1) % KEY_INTERVAL == 0, "sample {sample_id}");
    }
    assert_eq!(output.capture.keyframes, output.capture.frames.div_ceil(KEY_INTERVAL as u64));
}

#[tokio::test(start_paused = true)]
async fn exported_container_is_well_formed() {
    let job = job(Some(2.0));
    let mut playback = playback(Some(2.0));
    let backend = SyntheticEncoderBackend::new();
    let audio = SyntheticAudioDecoder::new(44_100, 2);

    let output = run_export(&job, &mut playback, &backend, &audio).await.unwrap();
    let (mut reader, tracks) = read_tracks(&output.bytes);
    assert_eq!(tracks.len(), 2);

    let (video_id, _) = tracks.iter().find(|(_, t)| t.kind == TrackType::Video).unwrap();
    let (audio_id, _) = tracks.iter().find(|(_, t)| t.kind == TrackType::Audio).unwrap();

    let video_track = &reader.tracks()[video_id];
    assert_eq!(video_track.media_type().unwrap(), MediaType::H265);
    assert_eq!((video_track.width(), video_track.height()), (720, 1280));

    let audio_track = &reader.tracks()[audio_id];
    assert_eq!(audio_track.media_type().unwrap(), MediaType::AAC);
    assert_eq!(audio_track.sample_freq_index().unwrap().freq(), 44_100);
    assert_eq!(audio_track.channel_config().unwrap(), ChannelConfig::Stereo);

    // One VPS, SPS and PPS, each a NAL unit of the matching type.
    let arrays = hvcc_arrays(&output.bytes);
    let kinds: Vec<u8> = arrays.iter().map(|(kind, _)| *kind).collect();
    assert_eq!(kinds, vec![32, 33, 34]);
    for (kind, units) in &arrays {
        assert_eq!(units.len(), 1);
        assert_eq!((units[0][0] >> 1) & 0x3f, *kind);
    }

    for id in [*video_id, *audio_id] {
        let first = reader.read_sample(id, 1).unwrap().unwrap();
        assert_eq!(first.start_time, 0, "track {id}");
        assert!(first.is_sync);
    }
}

#[tokio::test(start_paused = true)]
async fn audio_decode_failure_exports_video_only() {
    let job = job(Some(2.0));
    let mut playback = playback(Some(2.0));
    let backend = SyntheticEncoderBackend::new();
    let audio = SyntheticAudioDecoder::failing("unsupported audio codec");

    let output = run_export(&job, &mut playback, &backend, &audio).await.unwrap();

    assert!(!output.has_audio);
    assert!(matches!(
        output.warnings.as_slice(),
        [ExportWarning::AudioUnavailable(reason)] if reason.contains("unsupported audio codec")
    ));
    let (_, tracks) = read_tracks(&output.bytes);
    assert_eq!(tracks.len(), 1);
    assert_eq!(tracks[0].1.kind, TrackType::Video);
}

#[tokio::test(start_paused = true)]
async fn audio_encoder_failures_degrade_to_video_only() {
    for backend in [
        SyntheticEncoderBackend::new().failing_audio_setup(),
        SyntheticEncoderBackend::new().failing_audio_after(10),
    ] {
        let job = job(Some(1.0));
        let mut playback = playback(Some(1.0));
        let audio = SyntheticAudioDecoder::new(48_000, 1);

        let output = run_export(&job, &mut playback, &backend, &audio).await.unwrap();

        assert!(!output.has_audio);
        assert!(matches!(
            output.warnings.as_slice(),
            [ExportWarning::AudioEncodingFailed(_)]
        ));
        let (_, tracks) = read_tracks(&output.bytes);
        assert_eq!(tracks.len(), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn unknown_duration_fails_and_restores_playback() {
    let job = job(None);
    let mut playback = playback(None);
    let backend = SyntheticEncoderBackend::new();
    let audio = SyntheticAudioDecoder::new(44_100, 2);

    let stages = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&stages);
    let progress: ProgressCallback = Box::new(move |p: ExportProgress| {
        seen.lock().unwrap().push(p.stage);
    });
    let run = RunFlag::new();
    let mut compositor = compositor();

    let err = export_reel(
        &job,
        &mut playback,
        &mut compositor,
        &backend,
        &audio,
        &run,
        Some(&progress),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, ViralizeError::Validation { .. }), "{err}");
    assert!(err.to_string().contains("duration"));
    assert!(!run.is_running());
    assert!(!playback.is_paused());
    assert_eq!(playback.playback_rate(), 1.0);
    assert_eq!(
        stages.lock().unwrap().as_slice(),
        &[ExportStage::MetadataWait, ExportStage::Failed]
    );
}

#[tokio::test(start_paused = true)]
async fn slow_encoder_pauses_playback_without_extra_frames() {
    let job = job(Some(2.0));
    let mut playback = playback(Some(2.0));
    let backend = SyntheticEncoderBackend::new().with_video_latency(Duration::from_millis(40));
    let audio = SyntheticAudioDecoder::new(44_100, 2);

    let output = run_export(&job, &mut playback, &backend, &audio).await.unwrap();
    let tuning = &job.settings.tuning;

    let capture = &output.capture;
    assert!(!capture.backpressure.is_empty());
    for event in &capture.backpressure {
        assert!(event.paused_at_depth > tuning.backpressure_high);
        assert!(event.resumed_at_depth <= tuning.backpressure_low);
    }
    assert_frames_near(capture.frames, 2.0);

    // Sample start times must be strictly increasing.
    let (mut reader, tracks) = read_tracks(&output.bytes);
    let (video_id, video) = tracks.iter().find(|(_, t)| t.kind == TrackType::Video).unwrap();
    let mut last = None;
    for sample_id in 1..=video.samples {
        let sample = reader.read_sample(*video_id, sample_id).unwrap().unwrap();
        if let Some(prev) = last {
            assert!(sample.start_time > prev);
        }
        last = Some(sample.start_time);
    }
}

#[tokio::test(start_paused = true)]
async fn stalled_source_is_restarted_once() {
    let job = job(Some(3.0));
    let mut playback = ClockedPlayback::new(video(Some(3.0)).stalled_until_seek(2));
    let backend = SyntheticEncoderBackend::new();
    let audio = SyntheticAudioDecoder::new(44_100, 2);

    let output = run_export(&job, &mut playback, &backend, &audio).await.unwrap();

    assert_eq!(output.capture.watchdog_restarts, 1);
    assert!(output.capture.first_timestamp_us.unwrap() < 50_000);
    assert!(output.capture.frames + 10 >= expected_frames(3.0));
}

#[tokio::test(start_paused = true)]
async fn source_that_never_produces_frames_fails() {
    let job = job(Some(2.0));
    let mut playback = ClockedPlayback::new(video(Some(2.0)).stalled_until_seek(100));
    let backend = SyntheticEncoderBackend::new();
    let audio = SyntheticAudioDecoder::new(44_100, 2);

    let err = run_export(&job, &mut playback, &backend, &audio).await.unwrap_err();
    assert!(err.to_string().contains("no frames were processed"), "{err}");
}

#[tokio::test(start_paused = true)]
async fn falls_back_to_avc_and_fails_without_any_codec() {
    let job = job(Some(1.0));
    let audio = SyntheticAudioDecoder::new(44_100, 2);

    let avc_only = SyntheticEncoderBackend::new().with_codecs(&[VideoCodec::Avc]);
    let mut playback_a = playback(Some(1.0));
    let output = run_export(&job, &mut playback_a, &avc_only, &audio).await.unwrap();
    assert_eq!(output.codec, VideoCodec::Avc);
    let (reader, tracks) = read_tracks(&output.bytes);
    let (video_id, _) = tracks.iter().find(|(_, t)| t.kind == TrackType::Video).unwrap();
    assert_eq!(reader.tracks()[video_id].media_type().unwrap(), MediaType::H264);

    let none = SyntheticEncoderBackend::new().with_codecs(&[]);
    let mut playback_b = playback(Some(1.0));
    let err = run_export(&job, &mut playback_b, &none, &audio).await.unwrap_err();
    assert!(matches!(err, ViralizeError::Unsupported { .. }), "{err}");
}

#[tokio::test(start_paused = true)]
async fn full_hd_export_slows_playback_but_keeps_frame_rate() {
    let mut job = job(Some(1.0));
    job.settings = ExportSettings::default().with_resolution(ReelResolution::P1080);
    let mut playback = playback(Some(1.0));
    let backend = SyntheticEncoderBackend::new();
    let audio = SyntheticAudioDecoder::new(44_100, 2);

    let started = tokio::time::Instant::now();
    let output = run_export(&job, &mut playback, &backend, &audio).await.unwrap();

    // 0.9 s of media at 0.75x.
    assert!(started.elapsed() >= Duration::from_millis(1150));
    assert_frames_near(output.capture.frames, 1.0);
    let (reader, tracks) = read_tracks(&output.bytes);
    let (video_id, _) = tracks.iter().find(|(_, t)| t.kind == TrackType::Video).unwrap();
    let track = &reader.tracks()[video_id];
    assert_eq!((track.width(), track.height()), (1080, 1920));
}

#[tokio::test(start_paused = true)]
async fn video_encoder_error_is_fatal() {
    let job = job(Some(2.0));
    let mut playback = playback(Some(2.0));
    let backend = SyntheticEncoderBackend::new().failing_video_after(30);
    let audio = SyntheticAudioDecoder::new(44_100, 2);

    let err = run_export(&job, &mut playback, &backend, &audio).await.unwrap_err();
    assert!(matches!(err, ViralizeError::Encode { .. }), "{err}");
}

#[tokio::test(start_paused = true)]
async fn cancelling_stops_the_export() {
    let job = job(Some(5.0));
    let mut playback = playback(Some(5.0));
    let backend = SyntheticEncoderBackend::new();
    let audio = SyntheticAudioDecoder::new(44_100, 2);
    let run = RunFlag::new();
    let mut compositor = compositor();

    let cancel = {
        let run = run.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            run.stop();
        }
    };
    let (result, ()) = tokio::join!(
        export_reel(&job, &mut playback, &mut compositor, &backend, &audio, &run, None),
        cancel
    );

    assert!(matches!(result, Err(ViralizeError::Cancelled)));
    assert!(!playback.is_paused());
    assert!(playback.current_time() < 0.1);
}

#[tokio::test(start_paused = true)]
async fn cancel_before_start_is_not_lost() {
    let job = job(Some(2.0));
    let mut playback = playback(Some(2.0));
    let backend = SyntheticEncoderBackend::new();
    let audio = SyntheticAudioDecoder::new(44_100, 2);
    let run = RunFlag::new();
    run.cancel();
    let mut compositor = compositor();

    let result = export_reel(&job, &mut playback, &mut compositor, &backend, &audio, &run, None).await;
    assert!(matches!(result, Err(ViralizeError::Cancelled)));
    assert!(!run.is_running());
}

#[tokio::test(start_paused = true)]
async fn progress_walks_every_stage_in_order() {
    let job = job(Some(1.0));
    let mut playback = playback(Some(1.0));
    let backend = SyntheticEncoderBackend::new();
    let audio = SyntheticAudioDecoder::new(44_100, 2);

    let reports = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&reports);
    let progress: ProgressCallback = Box::new(move |p: ExportProgress| {
        seen.lock().unwrap().push(p);
    });
    let run = RunFlag::new();
    let mut compositor = compositor();
    export_reel(&job, &mut playback, &mut compositor, &backend, &audio, &run, Some(&progress))
        .await
        .unwrap();

    let reports = reports.lock().unwrap();
    let mut stages: Vec<ExportStage> = reports.iter().map(|p| p.stage).collect();
    stages.dedup();
    assert_eq!(
        stages,
        vec![
            ExportStage::MetadataWait,
            ExportStage::AudioDecode,
            ExportStage::EncoderSetup,
            ExportStage::Capturing,
            ExportStage::Finalizing,
            ExportStage::Done,
        ]
    );
    let capturing: Vec<&ExportProgress> = reports
        .iter()
        .filter(|p| p.stage == ExportStage::Capturing && p.frames_rendered > 0)
        .collect();
    assert!(!capturing.is_empty());
    assert!(capturing.iter().all(|p| p.frames_rendered % 30 == 0));
    assert!(capturing.windows(2).all(|w| w[0].progress <= w[1].progress));
}

fn studio(duration: f64) -> (ReelStudio<ClockedPlayback<SyntheticVideo>>, viralize_render_engine::CompositionEditor) {
    ReelStudio::new(
        source(Some(duration)),
        playback(Some(duration)),
        Arc::new(BlockGlyphs),
        Arc::new(SyntheticEncoderBackend::new()),
        Arc::new(SyntheticAudioDecoder::new(44_100, 2)),
        ExportSettings::default(),
    )
}

#[tokio::test(start_paused = true)]
async fn studio_requires_a_caption() {
    let (studio, _editor) = studio(1.0);
    let err = studio.export(None).await.unwrap_err();
    assert!(matches!(err, ViralizeError::Validation { .. }));
    assert!(!studio.is_exporting());
}

#[tokio::test(start_paused = true)]
async fn studio_allows_one_export_and_restarts_preview() {
    let (studio, mut editor) = studio(1.0);
    editor.set_caption(Some("Headline escolhida".into()));
    let latest = LatestFrame::new();
    studio.start_preview(Box::new(latest.clone())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (first, second) = tokio::join!(studio.export(None), async {
        tokio::task::yield_now().await;
        studio.export(None).await
    });

    let output = first.unwrap();
    assert!(output.has_audio);
    let err = second.unwrap_err();
    assert!(err.to_string().contains("already in progress"), "{err}");
    assert!(!studio.is_exporting());
    assert!(studio.is_previewing().await);
    assert!(latest.latest().is_some());
    assert!(studio.stop_preview().await.is_some());
}

#[tokio::test(start_paused = true)]
async fn replacing_the_source_clears_the_caption() {
    let (mut studio, mut editor) = studio(1.0);
    editor.set_caption(Some("Antiga".into()));
    studio
        .replace_source(&mut editor, source(Some(2.0)), playback(Some(2.0)))
        .await;
    assert_eq!(studio.composition().caption, None);
    assert_eq!(studio.source().duration_secs, Some(2.0));
    assert!(!studio.cancel_export());
}

#[tokio::test(start_paused = true)]
async fn studio_cancel_during_preview_shutdown_stops_the_export() {
    let (studio, mut editor) = studio(2.0);
    editor.set_caption(Some("Cancelada cedo".into()));
    studio.start_preview(Box::new(LatestFrame::new())).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The export yields while the preview shuts down; cancel lands there.
    let (result, cancelled) = tokio::join!(studio.export(None), async { studio.cancel_export() });

    assert!(cancelled);
    assert!(matches!(result, Err(ViralizeError::Cancelled)), "{result:?}");
    assert!(!studio.is_exporting());
    assert!(studio.is_previewing().await);
    assert!(!studio.cancel_export());
}
