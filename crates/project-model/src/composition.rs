//! Composition state: everything the user adjusts before rendering a reel.
//!
//! The composition is read by both the preview loop and the export path,
//! so nothing in here knows which of the two is drawing.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::geometry::INTERACTION_REFERENCE_WIDTH;

/// Smallest allowed video zoom.
pub const MIN_ZOOM: f64 = 0.1;

/// Largest allowed video zoom.
pub const MAX_ZOOM: f64 = 10.0;

/// Zoom change per wheel delta unit.
pub const WHEEL_ZOOM_FACTOR: f64 = -0.005;

/// Zoom change per pixel of pinch distance change.
pub const PINCH_ZOOM_FACTOR: f64 = 0.01;

/// Caption drawn in the preview while none has been chosen.
pub const PLACEHOLDER_CAPTION: &str = "Sua headline vai aparecer aqui...";

/// User pan/zoom applied on top of the cover-fit video placement.
///
/// `x`/`y` are in interaction units: pixels of a 360 px wide preview.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VideoTransform {
    pub x: f64,
    pub y: f64,
    pub scale: f64,
}

impl VideoTransform {
    /// No pan, no zoom.
    pub const IDENTITY: VideoTransform = VideoTransform {
        x: 0.0,
        y: 0.0,
        scale: 1.0,
    };

    /// Create a transform, clamping the zoom into bounds.
    pub fn new(x: f64, y: f64, scale: f64) -> Self {
        Self {
            x,
            y,
            scale: clamp_zoom(scale),
        }
    }

    /// Add `delta` to the zoom, clamped to `[MIN_ZOOM, MAX_ZOOM]`.
    pub fn zoom_by(&mut self, delta: f64) {
        self.scale = clamp_zoom(self.scale + delta);
    }

    /// Shift the pan offset by interaction units.
    pub fn pan_by(&mut self, dx: f64, dy: f64) {
        self.x += dx;
        self.y += dy;
    }
}

impl Default for VideoTransform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Clamp a requested zoom into the supported range. NaN maps to 1.0.
pub fn clamp_zoom(scale: f64) -> f64 {
    if scale.is_nan() {
        return 1.0;
    }
    scale.clamp(MIN_ZOOM, MAX_ZOOM)
}

/// Who the reel header claims to be.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    /// Name drawn in bold next to the avatar.
    pub display_name: String,

    /// Handle, with or without a leading `@`.
    pub handle: String,

    /// Avatar image on disk. `None` draws a placeholder disc.
    #[serde(default)]
    pub avatar: Option<PathBuf>,

    /// Whether the verified badge is drawn after the name.
    #[serde(default = "default_verified")]
    pub verified: bool,
}

fn default_verified() -> bool {
    true
}

impl Identity {
    /// Handle as displayed: `@` followed by the handle with its first `@` removed.
    pub fn handle_label(&self) -> String {
        format!("@{}", self.handle.replacen('@', "", 1))
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self {
            display_name: "Nome do Usuário".to_string(),
            handle: "usuario".to_string(),
            avatar: None,
            verified: true,
        }
    }
}

/// The complete user-editable composition for one reel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompositionState {
    pub transform: VideoTransform,

    /// Selected or edited caption. `None` until the user picks one.
    #[serde(default)]
    pub caption: Option<String>,

    pub identity: Identity,
}

impl CompositionState {
    /// Caption to draw, falling back to the placeholder.
    pub fn caption_text(&self) -> &str {
        match self.caption.as_deref() {
            Some(text) if !text.trim().is_empty() => text,
            _ => PLACEHOLDER_CAPTION,
        }
    }

    /// Whether a non-blank caption has been chosen.
    pub fn has_caption(&self) -> bool {
        self.caption
            .as_deref()
            .is_some_and(|text| !text.trim().is_empty())
    }
}

/// A pointer or touch gesture over the preview surface.
///
/// Coordinates are in preview-surface pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Interaction {
    DragStart { x: f64, y: f64 },
    DragMove { x: f64, y: f64 },
    DragEnd,
    Wheel { delta_y: f64 },
    PinchStart { distance: f64 },
    PinchMove { distance: f64 },
    PinchEnd,
}

/// Turns gesture streams into transform updates.
#[derive(Debug, Clone, Default)]
pub struct GestureTracker {
    drag: Option<DragAnchor>,
    pinch_distance: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
struct DragAnchor {
    pointer_x: f64,
    pointer_y: f64,
    origin: VideoTransform,
}

impl GestureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one gesture to `transform`.
    ///
    /// Drag deltas are rescaled from `surface_width` pixels to interaction
    /// units so a drag covers the same fraction of the frame at any preview
    /// size. Returns `true` when the transform changed.
    pub fn apply(
        &mut self,
        transform: &mut VideoTransform,
        interaction: Interaction,
        surface_width: f64,
    ) -> bool {
        let units_per_px = if surface_width > 0.0 {
            INTERACTION_REFERENCE_WIDTH / surface_width
        } else {
            1.0
        };

        match interaction {
            Interaction::DragStart { x, y } => {
                self.drag = Some(DragAnchor {
                    pointer_x: x,
                    pointer_y: y,
                    origin: *transform,
                });
                false
            }
            Interaction::DragMove { x, y } => match self.drag {
                Some(anchor) => {
                    transform.x = anchor.origin.x + (x - anchor.pointer_x) * units_per_px;
                    transform.y = anchor.origin.y + (y - anchor.pointer_y) * units_per_px;
                    true
                }
                None => false,
            },
            Interaction::DragEnd => {
                self.drag = None;
                false
            }
            Interaction::Wheel { delta_y } => {
                transform.zoom_by(delta_y * WHEEL_ZOOM_FACTOR);
                true
            }
            Interaction::PinchStart { distance } => {
                self.drag = None;
                self.pinch_distance = Some(distance);
                false
            }
            Interaction::PinchMove { distance } => match self.pinch_distance {
                Some(previous) => {
                    transform.zoom_by((distance - previous) * PINCH_ZOOM_FACTOR);
                    self.pinch_distance = Some(distance);
                    true
                }
                None => false,
            },
            Interaction::PinchEnd => {
                self.pinch_distance = None;
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zoom_clamps_to_bounds() {
        let mut t = VideoTransform::IDENTITY;
        t.zoom_by(-5.0);
        assert_eq!(t.scale, MIN_ZOOM);
        t.zoom_by(100.0);
        assert_eq!(t.scale, MAX_ZOOM);
        assert_eq!(VideoTransform::new(0.0, 0.0, 0.01).scale, MIN_ZOOM);
        assert_eq!(VideoTransform::new(0.0, 0.0, 42.0).scale, MAX_ZOOM);
        assert_eq!(clamp_zoom(f64::NAN), 1.0);
    }

    #[test]
    fn test_handle_label_strips_first_at() {
        let mut id = Identity::default();
        id.handle = "@creator".to_string();
        assert_eq!(id.handle_label(), "@creator");
        id.handle = "creator".to_string();
        assert_eq!(id.handle_label(), "@creator");
        id.handle = "@@x".to_string();
        assert_eq!(id.handle_label(), "@@x");
    }

    #[test]
    fn test_caption_placeholder() {
        let mut state = CompositionState::default();
        assert_eq!(state.caption_text(), PLACEHOLDER_CAPTION);
        assert!(!state.has_caption());

        state.caption = Some("   ".to_string());
        assert!(!state.has_caption());

        state.caption = Some("Hello world".to_string());
        assert_eq!(state.caption_text(), "Hello world");
        assert!(state.has_caption());
    }

    #[test]
    fn test_drag_normalised_to_reference_width() {
        let mut tracker = GestureTracker::new();
        let mut t = VideoTransform::IDENTITY;

        tracker.apply(&mut t, Interaction::DragStart { x: 10.0, y: 10.0 }, 720.0);
        assert!(tracker.apply(&mut t, Interaction::DragMove { x: 30.0, y: 50.0 }, 720.0));
        // 720 px surface is twice the reference, so deltas halve.
        assert!((t.x - 10.0).abs() < 1e-9);
        assert!((t.y - 20.0).abs() < 1e-9);

        tracker.apply(&mut t, Interaction::DragEnd, 720.0);
        assert!(!tracker.apply(&mut t, Interaction::DragMove { x: 99.0, y: 99.0 }, 720.0));
        assert!((t.x - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_wheel_and_pinch_zoom() {
        let mut tracker = GestureTracker::new();
        let mut t = VideoTransform::IDENTITY;

        tracker.apply(&mut t, Interaction::Wheel { delta_y: -100.0 }, 360.0);
        assert!((t.scale - 1.5).abs() < 1e-9);

        tracker.apply(&mut t, Interaction::PinchStart { distance: 100.0 }, 360.0);
        tracker.apply(&mut t, Interaction::PinchMove { distance: 150.0 }, 360.0);
        assert!((t.scale - 2.0).abs() < 1e-9);
        tracker.apply(&mut t, Interaction::PinchMove { distance: 50.0 }, 360.0);
        assert!((t.scale - 1.0).abs() < 1e-9);

        tracker.apply(&mut t, Interaction::PinchMove { distance: -10_000.0 }, 360.0);
        assert_eq!(t.scale, MIN_ZOOM);
    }
}
