pub mod check;
pub mod headline;
pub mod info;
pub mod preview;
pub mod profile;
pub mod render;
pub mod selftest;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use viralize_common::AppConfig;
use viralize_project_model::{CompositionState, PreferenceStore, VideoTransform};
use viralize_render_engine::{ExportProgress, ExportStage, ProgressCallback};

/// Header identity overrides. Unset fields come from the saved profile.
#[derive(Args, Debug, Clone, Default)]
pub struct IdentityArgs {
    /// Display name in the header
    #[arg(long)]
    pub name: Option<String>,

    /// Handle in the header
    #[arg(long)]
    pub handle: Option<String>,

    /// Avatar image
    #[arg(long)]
    pub avatar: Option<PathBuf>,

    /// Hide the verified badge
    #[arg(long)]
    pub unverified: bool,
}

/// Pan/zoom of the video inside its region, in preview pixels.
#[derive(Args, Debug, Clone)]
pub struct FramingArgs {
    #[arg(long, default_value = "0", allow_hyphen_values = true)]
    pub pan_x: f64,

    #[arg(long, default_value = "0", allow_hyphen_values = true)]
    pub pan_y: f64,

    #[arg(long, default_value = "1.0")]
    pub zoom: f64,
}

/// Build the composition from saved preferences and command-line overrides.
pub fn composition_from_args(
    config: &AppConfig,
    caption: Option<String>,
    identity: &IdentityArgs,
    framing: &FramingArgs,
) -> CompositionState {
    let store = PreferenceStore::open(&config.preferences_path);
    let mut who = store.reel_profile().to_identity();
    if let Some(name) = &identity.name {
        who.display_name = name.clone();
    }
    if let Some(handle) = &identity.handle {
        who.handle = handle.clone();
    }
    if let Some(avatar) = &identity.avatar {
        who.avatar = Some(avatar.clone());
    }
    who.verified = !identity.unverified;

    CompositionState {
        transform: VideoTransform::new(framing.pan_x, framing.pan_y, framing.zoom),
        caption,
        identity: who,
    }
}

/// Progress printer: a single rewritten line while capturing.
pub fn console_progress() -> ProgressCallback {
    let last_stage = Arc::new(std::sync::Mutex::new(ExportStage::Idle));
    Box::new(move |p: ExportProgress| {
        if let Ok(mut last) = last_stage.lock() {
            if *last == ExportStage::Capturing && p.stage != ExportStage::Capturing {
                println!();
            }
            if *last != p.stage && p.stage != ExportStage::Capturing {
                println!("  {:?}", p.stage);
            }
            *last = p.stage;
        }
        if p.stage == ExportStage::Capturing {
            print!(
                "\r  Capturing: {:5.1}% ({}/{} frames, {:.1}s, {:.0} fps)",
                p.progress * 100.0,
                p.frames_rendered,
                p.total_frames,
                p.media_time_secs,
                p.encode_fps
            );
            let _ = std::io::Write::flush(&mut std::io::stdout());
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use viralize_project_model::ReelProfile;

    fn framing() -> FramingArgs {
        FramingArgs {
            pan_x: 10.0,
            pan_y: -5.0,
            zoom: 2.0,
        }
    }

    #[test]
    fn test_composition_uses_saved_profile() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            preferences_path: dir.path().join("prefs.json"),
            ..AppConfig::default()
        };
        let mut store = PreferenceStore::open(&config.preferences_path);
        store
            .save_reel_profile(&ReelProfile {
                name: "Canal X".to_string(),
                username: "canalx".to_string(),
                logo: None,
            })
            .unwrap();

        let state = composition_from_args(&config, Some("Oi".into()), &IdentityArgs::default(), &framing());
        assert_eq!(state.identity.display_name, "Canal X");
        assert_eq!(state.identity.handle, "canalx");
        assert!(state.identity.verified);
        assert_eq!(state.transform.scale, 2.0);
        assert_eq!(state.transform.y, -5.0);
    }

    #[test]
    fn test_flags_override_profile() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            preferences_path: dir.path().join("prefs.json"),
            ..AppConfig::default()
        };
        let identity = IdentityArgs {
            name: Some("Outro".to_string()),
            handle: None,
            avatar: None,
            unverified: true,
        };

        let state = composition_from_args(&config, None, &identity, &framing());
        assert_eq!(state.identity.display_name, "Outro");
        assert!(!state.identity.verified);
        assert!(!state.has_caption());
    }
}
