//! Single-writer composition state.
//!
//! The editor is the only handle that can change the composition. Preview
//! and export hold readers and work from snapshots, so a frame is always
//! drawn from one consistent state.

use tokio::sync::watch;
use viralize_project_model::{CompositionState, GestureTracker, Identity, Interaction};

/// The one writable handle to the composition.
#[derive(Debug)]
pub struct CompositionEditor {
    tx: watch::Sender<CompositionState>,
    gestures: GestureTracker,
}

/// Read-only view of the composition.
#[derive(Debug, Clone)]
pub struct CompositionReader {
    rx: watch::Receiver<CompositionState>,
}

impl CompositionEditor {
    pub fn new(initial: CompositionState) -> (Self, CompositionReader) {
        let (tx, rx) = watch::channel(initial);
        (
            Self {
                tx,
                gestures: GestureTracker::new(),
            },
            CompositionReader { rx },
        )
    }

    pub fn reader(&self) -> CompositionReader {
        CompositionReader {
            rx: self.tx.subscribe(),
        }
    }

    pub fn snapshot(&self) -> CompositionState {
        self.tx.borrow().clone()
    }

    pub fn set_caption(&mut self, caption: Option<String>) {
        self.tx.send_modify(|state| state.caption = caption);
    }

    pub fn set_identity(&mut self, identity: Identity) {
        self.tx.send_modify(|state| state.identity = identity);
    }

    /// Replace everything, e.g. after loading a saved composition.
    pub fn replace(&mut self, state: CompositionState) {
        self.gestures = GestureTracker::new();
        self.tx.send_replace(state);
    }

    /// Apply a gesture made on a surface `surface_width` pixels wide.
    pub fn apply_interaction(&mut self, interaction: Interaction, surface_width: f64) -> bool {
        let gestures = &mut self.gestures;
        self.tx.send_if_modified(|state| {
            gestures.apply(&mut state.transform, interaction, surface_width)
        })
    }
}

impl CompositionReader {
    pub fn snapshot(&self) -> CompositionState {
        self.rx.borrow().clone()
    }

    pub fn has_changed(&self) -> bool {
        self.rx.has_changed().unwrap_or(false)
    }

    /// Snapshot and mark the current version as seen.
    pub fn snapshot_and_mark_seen(&mut self) -> CompositionState {
        self.rx.borrow_and_update().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use viralize_project_model::INTERACTION_REFERENCE_WIDTH;

    #[test]
    fn test_readers_see_latest_state() {
        let (mut editor, reader) = CompositionEditor::new(CompositionState::default());
        let second = editor.reader();
        editor.set_caption(Some("Headline".into()));
        assert_eq!(reader.snapshot().caption.as_deref(), Some("Headline"));
        assert_eq!(second.snapshot().caption.as_deref(), Some("Headline"));
        assert!(reader.has_changed());
    }

    #[test]
    fn test_drag_is_scaled_to_reference_width() {
        let (mut editor, reader) = CompositionEditor::new(CompositionState::default());
        let width = INTERACTION_REFERENCE_WIDTH * 2.0;
        assert!(!editor.apply_interaction(Interaction::DragStart { x: 10.0, y: 10.0 }, width));
        assert!(editor.apply_interaction(Interaction::DragMove { x: 30.0, y: 50.0 }, width));
        editor.apply_interaction(Interaction::DragEnd, width);

        let t = reader.snapshot().transform;
        assert!((t.x - 10.0).abs() < 1e-9);
        assert!((t.y - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_ignored_gesture_does_not_notify() {
        let (mut editor, mut reader) = CompositionEditor::new(CompositionState::default());
        reader.snapshot_and_mark_seen();
        editor.apply_interaction(Interaction::DragMove { x: 5.0, y: 5.0 }, 360.0);
        assert!(!reader.has_changed());
        editor.apply_interaction(Interaction::Wheel { delta_y: -100.0 }, 360.0);
        assert!(reader.has_changed());
        assert!((reader.snapshot().transform.scale - 1.5).abs() < 1e-9);
    }
}
