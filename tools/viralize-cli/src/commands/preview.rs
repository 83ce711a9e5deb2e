//! Run the live preview briefly and save what it last drew.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use viralize_common::AppConfig;
use viralize_project_model::{CompositionState, SourceMedia};
use viralize_render_engine::synthetic::{SyntheticAudioDecoder, SyntheticEncoderBackend, SyntheticVideo};
use viralize_render_engine::{
    probe_source, save_png, text_renderer_from_config, ClockedPlayback, ExportSettings,
    FfmpegFrameDecoder, FfmpegTools, LatestFrame, PlaybackSource, ReelStudio,
};

use super::{composition_from_args, FramingArgs, IdentityArgs};

pub async fn run(
    config: &AppConfig,
    input: Option<PathBuf>,
    caption: Option<String>,
    seconds: f64,
    output: PathBuf,
    identity: &IdentityArgs,
    framing: &FramingArgs,
) -> anyhow::Result<()> {
    let composition = composition_from_args(config, caption, identity, framing);
    let settings = ExportSettings::from_config(config)?;
    let duration = Duration::from_secs_f64(seconds.max(0.1));

    match input {
        Some(input) => {
            let tools = FfmpegTools::from_config(&config.export);
            let source = probe_source(&tools, &input)?;
            let decoder = FfmpegFrameDecoder::open(&tools, &source, settings.fps as f64)?;
            snapshot(config, source, ClockedPlayback::new(decoder), composition, settings, duration, &output)
                .await
        }
        None => {
            let mut source = SourceMedia::new("synthetic://preview", 0, 1280, 720)?;
            source.duration_secs = Some(10.0);
            let video = SyntheticVideo::new(1280, 720, settings.fps as f64, source.duration_secs);
            snapshot(config, source, ClockedPlayback::new(video), composition, settings, duration, &output)
                .await
        }
    }
}

async fn snapshot<P: PlaybackSource + 'static>(
    config: &AppConfig,
    source: SourceMedia,
    playback: P,
    composition: CompositionState,
    settings: ExportSettings,
    duration: Duration,
    output: &Path,
) -> anyhow::Result<()> {
    let (studio, mut editor) = ReelStudio::new(
        source,
        playback,
        text_renderer_from_config(&config.render),
        Arc::new(SyntheticEncoderBackend::new()),
        Arc::new(SyntheticAudioDecoder::new(44_100, 2)),
        settings,
    );
    editor.replace(composition);

    let latest = LatestFrame::new();
    studio.start_preview(Box::new(latest.clone())).await?;
    tokio::time::sleep(duration).await;
    studio.stop_preview().await;

    let frame = latest
        .latest()
        .ok_or_else(|| anyhow::anyhow!("preview produced no frames"))?;
    save_png(&frame, output)?;

    let stats = studio.layout_stats().await;
    println!("Preview saved: {}", output.display());
    println!(
        "  {}x{}, layout cache {} hits / {} recomputes",
        frame.width(),
        frame.height(),
        stats.hits,
        stats.recomputes
    );
    Ok(())
}
