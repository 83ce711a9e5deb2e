//! Manage the saved header profile.

use viralize_common::AppConfig;
use viralize_project_model::{PreferenceStore, REEL_PROFILE_KEY};

use crate::ProfileAction;

pub fn run(config: &AppConfig, action: ProfileAction) -> anyhow::Result<()> {
    let mut store = PreferenceStore::open(&config.preferences_path);

    match action {
        ProfileAction::Show => {
            let profile = store.reel_profile();
            println!("Profile ({})", store.path().display());
            println!("  Name:   {}", profile.name);
            println!("  Handle: {}", profile.to_identity().handle_label());
            println!("  Avatar: {}", profile.logo.as_deref().unwrap_or("(none)"));
        }
        ProfileAction::Set { name, handle, avatar } => {
            let mut profile = store.reel_profile();
            if let Some(name) = name {
                profile.name = name;
            }
            if let Some(handle) = handle {
                profile.username = handle;
            }
            if let Some(avatar) = avatar {
                if !avatar.exists() {
                    anyhow::bail!("avatar not found: {}", avatar.display());
                }
                profile.logo = Some(avatar.to_string_lossy().into_owned());
            }
            store.save_reel_profile(&profile)?;
            println!("Profile saved: {} ({})", profile.name, profile.to_identity().handle_label());
        }
        ProfileAction::Clear => {
            store.remove(REEL_PROFILE_KEY)?;
            println!("Profile cleared");
        }
    }

    Ok(())
}
