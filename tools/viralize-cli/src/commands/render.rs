//! Export a reel from a source video.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use viralize_common::AppConfig;
use viralize_project_model::ReelResolution;
use viralize_render_engine::{
    probe_source, text_renderer_from_config, ClockedPlayback, ExportSettings, FfmpegAudioDecoder,
    FfmpegEncoderBackend, FfmpegFrameDecoder, FfmpegTools, ReelStudio,
};

use super::{composition_from_args, console_progress, FramingArgs, IdentityArgs};

pub async fn run(
    config: &AppConfig,
    input: PathBuf,
    caption: String,
    resolution: Option<String>,
    output: Option<PathBuf>,
    identity: &IdentityArgs,
    framing: &FramingArgs,
) -> anyhow::Result<()> {
    let tools = FfmpegTools::from_config(&config.export);
    if !tools.available() {
        anyhow::bail!("ffmpeg/ffprobe not found; run `viralize check`");
    }

    let mut settings = ExportSettings::from_config(config)?;
    if let Some(resolution) = resolution {
        let resolution: ReelResolution = resolution
            .parse()
            .with_context(|| format!("invalid resolution '{resolution}'"))?;
        settings = settings.with_resolution(resolution);
    }

    let source = probe_source(&tools, &input)?;
    let decoder = FfmpegFrameDecoder::open(&tools, &source, settings.fps as f64)?;
    let backend = FfmpegEncoderBackend::probe(&tools)?;
    let (width, height) = settings.resolution.dimensions();

    println!("Rendering reel from {}", input.display());
    println!(
        "  {} ({width}x{height} @ {} fps), playback rate {}x",
        settings.resolution,
        settings.fps,
        settings.resolution.playback_rate()
    );

    let (studio, mut editor) = ReelStudio::new(
        source,
        ClockedPlayback::new(decoder),
        text_renderer_from_config(&config.render),
        Arc::new(backend),
        Arc::new(FfmpegAudioDecoder::new(&tools)),
        settings,
    );
    editor.replace(composition_from_args(config, Some(caption), identity, framing));

    let start = Instant::now();
    let result = studio.export(Some(console_progress())).await?;

    for warning in &result.warnings {
        println!("  [WARN] {warning}");
    }

    let dir = output.unwrap_or_else(|| config.output_dir.clone());
    let path = result.write_to_dir(&dir)?;

    println!();
    println!("Export complete: {}", path.display());
    println!(
        "  {} video chunks, {} audio chunks, codec {}, {:.1} MB in {:.1}s",
        result.video_chunks,
        result.audio_chunks,
        result.codec,
        result.bytes.len() as f64 / (1024.0 * 1024.0),
        start.elapsed().as_secs_f64()
    );
    if result.capture.resyncs > 0 || result.capture.watchdog_restarts > 0 {
        println!(
            "  {} cadence resyncs, {} watchdog restarts",
            result.capture.resyncs, result.capture.watchdog_restarts
        );
    }

    Ok(())
}
