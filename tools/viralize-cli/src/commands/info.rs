//! Show source video information.

use std::path::PathBuf;

use viralize_common::AppConfig;
use viralize_project_model::ReelResolution;
use viralize_render_engine::{probe_source, FfmpegTools};

pub fn run(config: &AppConfig, input: PathBuf) -> anyhow::Result<()> {
    let tools = FfmpegTools::from_config(&config.export);
    let source = probe_source(&tools, &input)?;

    println!("Source: {}", source.path.display());
    println!("{}", "=".repeat(50));
    println!("Size:       {:.1} MB", source.byte_size as f64 / (1024.0 * 1024.0));
    if let Some(container) = &source.container {
        println!("Container:  {container}");
    }
    println!(
        "Video:      {}x{} {}",
        source.width,
        source.height,
        source.video_codec.as_deref().unwrap_or("unknown codec")
    );
    match source.valid_duration() {
        Some(d) => println!("Duration:   {d:.2}s"),
        None => println!("Duration:   unknown (cannot be exported)"),
    }
    match &source.audio {
        Some(audio) => println!(
            "Audio:      {} {} Hz, {} ch",
            audio.codec, audio.sample_rate, audio.channels
        ),
        None => println!("Audio:      none"),
    }

    if let Some(duration) = source.valid_duration() {
        println!();
        println!("Export estimates ({} fps):", config.export.fps);
        for resolution in [ReelResolution::P720, ReelResolution::P1080] {
            let (w, h) = resolution.dimensions();
            let frames = (duration * config.export.fps as f64).ceil() as u64;
            let wall = duration / resolution.playback_rate();
            println!(
                "  {:<6} {w}x{h}  ~{frames} frames, ~{wall:.1}s capture",
                resolution.label()
            );
        }
    }

    Ok(())
}
