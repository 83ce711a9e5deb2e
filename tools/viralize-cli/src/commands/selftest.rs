//! Run the export pipeline on synthetic media, no ffmpeg required.

use std::path::PathBuf;
use std::sync::Arc;

use viralize_common::AppConfig;
use viralize_project_model::{ReelResolution, SourceMedia};
use viralize_render_engine::synthetic::{SyntheticAudioDecoder, SyntheticEncoderBackend, SyntheticVideo};
use viralize_render_engine::{
    text_renderer_from_config, ClockedPlayback, ExportSettings, ReelStudio,
    DEFAULT_END_EPSILON_SECS,
};

use super::console_progress;

pub async fn run(
    config: &AppConfig,
    seconds: f64,
    resolution: String,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    if !(seconds > 0.0 && seconds.is_finite()) {
        anyhow::bail!("--seconds must be positive");
    }
    let resolution: ReelResolution = resolution.parse()?;
    let settings = ExportSettings::from_config(config)?.with_resolution(resolution);

    let mut source = SourceMedia::new("synthetic://selftest", 0, 1280, 720)?;
    source.duration_secs = Some(seconds);
    let video = SyntheticVideo::new(1280, 720, 30.0, Some(seconds));

    println!("Viralize Self-Test");
    println!("{}", "=".repeat(50));
    println!("  {seconds:.1}s synthetic source -> {resolution}");

    let fps = settings.fps;
    let keyframe_interval = settings.keyframe_interval;
    let (studio, mut editor) = ReelStudio::new(
        source,
        ClockedPlayback::new(video),
        text_renderer_from_config(&config.render),
        Arc::new(SyntheticEncoderBackend::new()),
        Arc::new(SyntheticAudioDecoder::new(44_100, 2)),
        settings,
    );
    editor.set_caption(Some("Self-test: header, caption and video in one frame".to_string()));

    let result = studio.export(Some(console_progress())).await?;

    let end_epsilon = config
        .capture
        .end_epsilon_secs
        .unwrap_or(DEFAULT_END_EPSILON_SECS);
    let expected = ((seconds - end_epsilon).max(0.0) * fps as f64).ceil() as u64;
    let frames = result.capture.frames;
    let mut failures = Vec::new();

    if frames + 2 < expected || frames > expected + 1 {
        failures.push(format!("captured {frames} frames, expected about {expected}"));
    }
    let expected_keys = frames.div_ceil(keyframe_interval.max(1));
    if result.capture.keyframes != expected_keys {
        failures.push(format!(
            "{} key frames, expected {expected_keys}",
            result.capture.keyframes
        ));
    }
    if !result.has_audio {
        failures.push("output has no audio track".to_string());
    }
    if result.bytes.is_empty() {
        failures.push("output is empty".to_string());
    }

    println!();
    println!(
        "  {} frames ({} key), {} audio chunks, {} bytes, codec {}",
        frames,
        result.capture.keyframes,
        result.audio_chunks,
        result.bytes.len(),
        result.codec
    );
    for warning in &result.warnings {
        println!("  [WARN] {warning}");
    }

    if let Some(dir) = output {
        let path = result.write_to_dir(&dir)?;
        println!("  Written: {}", path.display());
    }

    if failures.is_empty() {
        println!("[OK] Self-test passed");
        Ok(())
    } else {
        for failure in &failures {
            println!("[FAIL] {failure}");
        }
        anyhow::bail!("self-test failed ({} checks)", failures.len())
    }
}
