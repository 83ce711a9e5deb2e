//! Reel frame geometry.
//!
//! All layout constants are defined against a 720 px wide canvas and
//! multiplied by `s = W / 720` for the actual canvas width `W`.

use serde::{Deserialize, Serialize};

use crate::composition::VideoTransform;

/// Canvas width the header layout constants are expressed in.
pub const REFERENCE_WIDTH: f32 = 720.0;

/// Preview width that pan offsets are expressed in.
pub const INTERACTION_REFERENCE_WIDTH: f64 = 360.0;

/// Axis-aligned rectangle in canvas pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
        Self { x, y, w, h }
    }

    pub fn right(&self) -> f32 {
        self.x + self.w
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.h
    }

    pub fn is_empty(&self) -> bool {
        !(self.w > 0.0 && self.h > 0.0)
    }

    /// Whether `self` fully covers `other`, within `eps` pixels.
    pub fn covers(&self, other: &Rect, eps: f32) -> bool {
        self.x <= other.x + eps
            && self.y <= other.y + eps
            && self.right() + eps >= other.right()
            && self.bottom() + eps >= other.bottom()
    }
}

/// Place a `src_w`×`src_h` frame so it covers `region`, cropping the excess.
///
/// A source wider than the region is height-limited and centred
/// horizontally; otherwise it is width-limited and centred vertically.
pub fn cover_fit(src_w: f32, src_h: f32, region: Rect) -> Rect {
    if src_w <= 0.0 || src_h <= 0.0 || region.is_empty() {
        return Rect::new(region.x, region.y, 0.0, 0.0);
    }

    let src_ratio = src_w / src_h;
    let target_ratio = region.w / region.h;

    if src_ratio > target_ratio {
        let h = region.h;
        let w = h * src_ratio;
        Rect::new(region.x + (region.w - w) / 2.0, region.y, w, h)
    } else {
        let w = region.w;
        let h = w / src_ratio;
        Rect::new(region.x, region.y + (region.h - h) / 2.0, w, h)
    }
}

/// Apply the user's pan/zoom on top of a cover-fit placement.
///
/// Pan is rescaled from interaction units to canvas pixels. Zoom grows the
/// rectangle from its top-left corner.
pub fn apply_pan_zoom(placement: Rect, transform: &VideoTransform, canvas_width: f32) -> Rect {
    let pan_scale = canvas_width / INTERACTION_REFERENCE_WIDTH as f32;
    let zoom = transform.scale as f32;
    Rect::new(
        placement.x + transform.x as f32 * pan_scale,
        placement.y + transform.y as f32 * pan_scale,
        placement.w * zoom,
        placement.h * zoom,
    )
}

/// Header bar layout for one canvas width.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeaderMetrics {
    /// `W / REFERENCE_WIDTH`.
    pub scale: f32,
    pub canvas_width: f32,
    /// Empty band at the top kept clear of platform UI.
    pub safe_zone_top: f32,
    pub name_size: f32,
    pub handle_size: f32,
    pub body_size: f32,
    pub line_height: f32,
    /// Width available to caption lines.
    pub max_text_width: f32,
    pub avatar_x: f32,
    pub avatar_y: f32,
    pub avatar_size: f32,
    /// Left edge of the name and handle.
    pub text_x: f32,
    /// Top of the name.
    pub text_y: f32,
    pub handle_y: f32,
    pub badge_size: f32,
    pub badge_gap: f32,
    pub badge_y: f32,
    /// Left edge of caption lines.
    pub body_x: f32,
    /// Top of the first caption line.
    pub body_y: f32,
    header_content_height: f32,
    bottom_padding: f32,
}

impl HeaderMetrics {
    pub fn for_canvas(canvas_width: f32) -> Self {
        let s = canvas_width / REFERENCE_WIDTH;
        let safe_zone_top = 220.0 * s;
        let avatar_x = 50.0 * s;
        let avatar_y = safe_zone_top + 20.0 * s;
        let avatar_size = 80.0 * s;
        let text_x = avatar_x + avatar_size + 16.0 * s;
        let text_y = avatar_y + 12.0 * s;

        Self {
            scale: s,
            canvas_width,
            safe_zone_top,
            name_size: 25.0 * s,
            handle_size: 24.0 * s,
            body_size: 32.0 * s,
            line_height: 42.0 * s,
            max_text_width: canvas_width - 100.0 * s,
            avatar_x,
            avatar_y,
            avatar_size,
            text_x,
            text_y,
            handle_y: text_y + 32.0 * s,
            badge_size: 28.0 * s,
            badge_gap: 6.0 * s,
            badge_y: text_y - 1.0 * s,
            body_x: 50.0 * s,
            body_y: avatar_y + avatar_size + 30.0 * s,
            header_content_height: 120.0 * s,
            bottom_padding: 20.0 * s,
        }
    }

    /// Total opaque header height for a caption of `line_count` lines.
    pub fn bar_height(&self, line_count: usize) -> f32 {
        self.safe_zone_top
            + self.header_content_height
            + line_count as f32 * self.line_height
            + self.bottom_padding
    }

    /// Top of caption line `index`.
    pub fn line_y(&self, index: usize) -> f32 {
        self.body_y + index as f32 * self.line_height
    }

    /// Region below the header where the video is drawn.
    pub fn video_region(&self, canvas_height: f32, line_count: usize) -> Rect {
        let top = self.bar_height(line_count);
        Rect::new(0.0, top, self.canvas_width, (canvas_height - top).max(0.0))
    }

    /// Badge left edge for a name of the given measured width.
    pub fn badge_x(&self, name_width: f32) -> f32 {
        self.text_x + name_width + self.badge_gap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_header_metrics_at_reference_width() {
        let m = HeaderMetrics::for_canvas(720.0);
        assert_eq!(m.scale, 1.0);
        assert_eq!(m.avatar_y, 240.0);
        assert_eq!(m.text_x, 146.0);
        assert_eq!(m.text_y, 252.0);
        assert_eq!(m.handle_y, 284.0);
        assert_eq!(m.body_y, 350.0);
        assert_eq!(m.max_text_width, 620.0);
        assert_eq!(m.bar_height(2), 220.0 + 120.0 + 84.0 + 20.0);
        assert_eq!(m.badge_x(100.0), 252.0);
    }

    #[test]
    fn test_header_metrics_scale_with_width() {
        let small = HeaderMetrics::for_canvas(360.0);
        let large = HeaderMetrics::for_canvas(1080.0);
        assert!((small.bar_height(3) * 3.0 - large.bar_height(3)).abs() < 1e-3);
        assert!((large.body_size - 48.0).abs() < 1e-4);
    }

    #[test]
    fn test_cover_fit_wide_source() {
        let region = Rect::new(0.0, 400.0, 720.0, 880.0);
        let r = cover_fit(1280.0, 720.0, region);
        assert_eq!(r.h, 880.0);
        assert_eq!(r.y, 400.0);
        assert!(r.w > 720.0);
        assert!((r.x + r.w / 2.0 - 360.0).abs() < 1e-3);
    }

    #[test]
    fn test_cover_fit_tall_source() {
        let region = Rect::new(0.0, 400.0, 720.0, 200.0);
        let r = cover_fit(720.0, 1280.0, region);
        assert_eq!(r.x, 0.0);
        assert_eq!(r.w, 720.0);
        assert!(r.h > 200.0);
        assert!((r.y + r.h / 2.0 - 500.0).abs() < 1e-3);
    }

    #[test]
    fn test_pan_scaled_by_canvas_width() {
        let placement = Rect::new(0.0, 100.0, 720.0, 400.0);
        let t = VideoTransform::new(10.0, -5.0, 2.0);
        let r = apply_pan_zoom(placement, &t, 720.0);
        assert_eq!(r.x, 20.0);
        assert_eq!(r.y, 90.0);
        assert_eq!(r.w, 1440.0);
        assert_eq!(r.h, 800.0);
    }

    proptest! {
        #[test]
        fn prop_cover_fit_never_leaves_gaps(
            src_w in 16.0f32..4096.0,
            src_h in 16.0f32..4096.0,
            canvas_w in prop::sample::select(vec![360.0f32, 720.0, 1080.0]),
            lines in 1usize..8,
            zoom in 1.0f64..10.0,
        ) {
            let canvas_h = canvas_w * 16.0 / 9.0;
            let metrics = HeaderMetrics::for_canvas(canvas_w);
            let region = metrics.video_region(canvas_h, lines);
            prop_assume!(!region.is_empty());

            let placement = cover_fit(src_w, src_h, region);
            prop_assert!(placement.covers(&region, 0.5));

            let t = VideoTransform::new(0.0, 0.0, zoom);
            let drawn = apply_pan_zoom(placement, &t, canvas_w);
            prop_assert!(drawn.covers(&region, 0.5));
        }
    }
}
