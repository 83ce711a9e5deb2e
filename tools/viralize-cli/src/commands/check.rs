//! Check system capabilities.

use viralize_common::AppConfig;
use viralize_render_engine::ffmpeg::encoder_name;
use viralize_render_engine::{FfmpegEncoderBackend, FfmpegTools, FontdueText, VIDEO_CODEC_CANDIDATES};

pub fn run(config: &AppConfig) -> anyhow::Result<()> {
    println!("Viralize System Check");
    println!("{}", "=".repeat(50));

    let tools = FfmpegTools::from_config(&config.export);
    let mut ready = true;

    if tools.available() {
        match tools.version() {
            Ok(version) => println!("[OK] {version}"),
            Err(e) => println!("[WARN] ffmpeg found but version query failed: {e}"),
        }
    } else {
        ready = false;
        println!(
            "[FAIL] ffmpeg/ffprobe not found (looked for {} and {})",
            tools.ffmpeg, tools.ffprobe
        );
        println!("       Install ffmpeg or set export.ffmpeg_path in the config file");
    }

    if tools.available() {
        match FfmpegEncoderBackend::probe(&tools) {
            Ok(backend) => {
                let mut any_video = false;
                for codec in VIDEO_CODEC_CANDIDATES {
                    let name = encoder_name(codec);
                    if backend.has_encoder(name) {
                        any_video = true;
                        println!("[OK] Video encoder: {name} ({codec})");
                    } else {
                        println!("[WARN] Video encoder missing: {name} ({codec})");
                    }
                }
                if !any_video {
                    ready = false;
                }
                if backend.has_encoder("aac") {
                    println!("[OK] Audio encoder: aac");
                } else {
                    println!("[WARN] Audio encoder missing: aac (reels will be silent)");
                }
            }
            Err(e) => {
                ready = false;
                println!("[FAIL] Could not list encoders: {e}");
            }
        }
    }

    match (&config.render.font_regular, FontdueText::discover()) {
        (Some(path), _) if path.exists() => println!("[OK] Font: {}", path.display()),
        (Some(path), _) => println!("[WARN] Configured font missing: {}", path.display()),
        (None, Some(_)) => println!("[OK] Font: system font found"),
        (None, None) => println!("[WARN] No font found; captions render as block glyphs"),
    }

    println!();
    println!("Config:      {}", viralize_common::config::config_file_path().display());
    println!("Preferences: {}", config.preferences_path.display());
    println!("Output dir:  {}", config.output_dir.display());

    println!();
    if ready {
        println!("All required capabilities are available. Viralize is ready.");
    } else {
        println!("Some required capabilities are missing. See above for fixes.");
    }

    Ok(())
}
