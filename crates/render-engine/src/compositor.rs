//! Frame compositor: paints one reel frame onto a surface.
//!
//! The same routine serves the interactive preview and the export, so both
//! produce identical pixels for identical inputs. Paint order is fixed:
//!
//! 1. black background
//! 2. the video frame, cover-fitted below the header and clipped to it
//! 3. the opaque header bar
//! 4. avatar (or placeholder disc), name, verified badge, handle
//! 5. the wrapped caption

use std::path::{Path, PathBuf};
use std::sync::Arc;

use resvg::tiny_skia::{
    Color, ColorU8, FillRule, FilterQuality, IntSize, Mask, Paint, PathBuilder, Pixmap,
    PixmapPaint, Rect as SkRect, Transform,
};
use viralize_common::{ViralizeError, ViralizeResult};
use viralize_processing_core::LayoutCache;
use viralize_project_model::{apply_pan_zoom, cover_fit, CompositionState, HeaderMetrics, Rect};

use crate::text::{FontWeight, TextRenderer};

const VERIFIED_BADGE_SVG: &str = include_str!("../assets/verified-badge.svg");

const NAME_COLOR: ColorU8 = ColorU8::from_rgba(255, 255, 255, 255);
const HANDLE_COLOR: ColorU8 = ColorU8::from_rgba(0x71, 0x71, 0x7a, 255);
const CAPTION_COLOR: ColorU8 = ColorU8::from_rgba(255, 255, 255, 255);
const AVATAR_PLACEHOLDER: [u8; 3] = [0x33, 0x33, 0x33];

/// Geometry of the last painted frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameLayout {
    pub canvas_width: u32,
    pub canvas_height: u32,
    pub bar_height: f32,
    pub lines: Vec<String>,
    /// Where the video was drawn, before clipping. `None` when no frame was available.
    pub video_rect: Option<Rect>,
}

struct AvatarSlot {
    path: PathBuf,
    size: u32,
    image: Option<Pixmap>,
}

/// Stateful frame painter.
///
/// Holds the caption layout cache and rasterised badge/avatar images, so a
/// compositor should live as long as the preview or export that uses it.
pub struct FrameCompositor {
    text: Arc<dyn TextRenderer>,
    layout: LayoutCache,
    badge: Option<(u32, Pixmap)>,
    avatar: Option<AvatarSlot>,
    clip: Option<((u32, u32, u32), Mask)>,
}

impl FrameCompositor {
    pub fn new(text: Arc<dyn TextRenderer>) -> Self {
        Self {
            text,
            layout: LayoutCache::new(),
            badge: None,
            avatar: None,
            clip: None,
        }
    }

    pub fn layout_cache(&self) -> &LayoutCache {
        &self.layout
    }

    pub fn text_renderer(&self) -> &Arc<dyn TextRenderer> {
        &self.text
    }

    /// Allocate a surface and paint one frame onto it.
    pub fn render(
        &mut self,
        width: u32,
        height: u32,
        composition: &CompositionState,
        frame: Option<&Pixmap>,
    ) -> ViralizeResult<Pixmap> {
        let mut surface = Pixmap::new(width, height).ok_or_else(|| {
            ViralizeError::render(format!("cannot allocate {width}x{height} surface"))
        })?;
        self.draw(&mut surface, composition, frame);
        Ok(surface)
    }

    /// Paint one frame onto `surface`, replacing its contents.
    pub fn draw(
        &mut self,
        surface: &mut Pixmap,
        composition: &CompositionState,
        frame: Option<&Pixmap>,
    ) -> FrameLayout {
        let canvas_w = surface.width();
        let canvas_h = surface.height();
        surface.fill(Color::BLACK);

        let metrics = HeaderMetrics::for_canvas(canvas_w as f32);
        let text = Arc::clone(&self.text);
        let body_size = metrics.body_size;
        let measure = |s: &str| text.measure(s, body_size, FontWeight::Regular);
        let lines = self
            .layout
            .caption_lines(composition, &metrics, &measure)
            .to_vec();

        let bar_height = metrics.bar_height(lines.len());
        let video_rect = frame.and_then(|frame| {
            self.draw_video(surface, frame, composition, &metrics, lines.len())
        });

        fill_rect(surface, 0.0, 0.0, canvas_w as f32, bar_height, [0, 0, 0]);
        self.draw_identity(surface, composition, &metrics);

        for (i, line) in lines.iter().enumerate() {
            self.text.draw(
                surface,
                line,
                metrics.body_x,
                metrics.line_y(i),
                metrics.body_size,
                FontWeight::Regular,
                CAPTION_COLOR,
            );
        }

        FrameLayout {
            canvas_width: canvas_w,
            canvas_height: canvas_h,
            bar_height,
            lines,
            video_rect,
        }
    }

    fn draw_video(
        &mut self,
        surface: &mut Pixmap,
        frame: &Pixmap,
        composition: &CompositionState,
        metrics: &HeaderMetrics,
        line_count: usize,
    ) -> Option<Rect> {
        let region = metrics.video_region(surface.height() as f32, line_count);
        if region.is_empty() {
            return None;
        }

        let placement = cover_fit(frame.width() as f32, frame.height() as f32, region);
        let drawn = apply_pan_zoom(placement, &composition.transform, metrics.canvas_width);
        if drawn.is_empty() {
            return None;
        }

        let mask = self.video_clip(surface.width(), surface.height(), region)?;
        let transform = Transform::from_scale(
            drawn.w / frame.width() as f32,
            drawn.h / frame.height() as f32,
        )
        .post_translate(drawn.x, drawn.y);
        let paint = PixmapPaint {
            quality: FilterQuality::Bilinear,
            ..PixmapPaint::default()
        };
        surface.draw_pixmap(0, 0, frame.as_ref(), &paint, transform, Some(mask));
        Some(drawn)
    }

    fn video_clip(&mut self, width: u32, height: u32, region: Rect) -> Option<&Mask> {
        let key = (width, height, region.y.to_bits());
        if self.clip.as_ref().map(|(k, _)| *k) != Some(key) {
            let mut mask = Mask::new(width, height)?;
            let rect = SkRect::from_xywh(region.x, region.y, region.w, region.h)?;
            mask.fill_path(
                &PathBuilder::from_rect(rect),
                FillRule::Winding,
                false,
                Transform::identity(),
            );
            self.clip = Some((key, mask));
        }
        self.clip.as_ref().map(|(_, mask)| mask)
    }

    fn draw_identity(
        &mut self,
        surface: &mut Pixmap,
        composition: &CompositionState,
        metrics: &HeaderMetrics,
    ) {
        let identity = &composition.identity;
        let avatar_px = metrics.avatar_size.round().max(1.0) as u32;

        let avatar = identity
            .avatar
            .as_deref()
            .and_then(|path| self.avatar_image(path, avatar_px));
        match avatar {
            Some(image) => surface.draw_pixmap(
                metrics.avatar_x.round() as i32,
                metrics.avatar_y.round() as i32,
                image.as_ref(),
                &PixmapPaint::default(),
                Transform::identity(),
                None,
            ),
            None => {
                let r = metrics.avatar_size / 2.0;
                fill_circle(
                    surface,
                    metrics.avatar_x + r,
                    metrics.avatar_y + r,
                    r,
                    AVATAR_PLACEHOLDER,
                );
            }
        }

        let name_width = self
            .text
            .measure(&identity.display_name, metrics.name_size, FontWeight::Bold);
        self.text.draw(
            surface,
            &identity.display_name,
            metrics.text_x,
            metrics.text_y,
            metrics.name_size,
            FontWeight::Bold,
            NAME_COLOR,
        );

        if identity.verified {
            let badge_px = metrics.badge_size.round().max(1.0) as u32;
            if let Some(badge) = self.badge_image(badge_px) {
                surface.draw_pixmap(
                    metrics.badge_x(name_width).round() as i32,
                    metrics.badge_y.round() as i32,
                    badge.as_ref(),
                    &PixmapPaint::default(),
                    Transform::identity(),
                    None,
                );
            }
        }

        self.text.draw(
            surface,
            &identity.handle_label(),
            metrics.text_x,
            metrics.handle_y,
            metrics.handle_size,
            FontWeight::Regular,
            HANDLE_COLOR,
        );
    }

    fn badge_image(&mut self, size: u32) -> Option<&Pixmap> {
        if self.badge.as_ref().map(|(s, _)| *s) != Some(size) {
            match rasterize_svg(VERIFIED_BADGE_SVG, size) {
                Ok(pixmap) => self.badge = Some((size, pixmap)),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to rasterize verified badge");
                    return None;
                }
            }
        }
        self.badge.as_ref().map(|(_, p)| p)
    }

    fn avatar_image(&mut self, path: &Path, size: u32) -> Option<&Pixmap> {
        let stale = self
            .avatar
            .as_ref()
            .map_or(true, |slot| slot.path != path || slot.size != size);
        if stale {
            let image = match load_round_avatar(path, size) {
                Ok(image) => Some(image),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Avatar unavailable, using placeholder");
                    None
                }
            };
            self.avatar = Some(AvatarSlot {
                path: path.to_path_buf(),
                size,
                image,
            });
        }
        self.avatar.as_ref().and_then(|slot| slot.image.as_ref())
    }
}

/// Render an SVG document into a `size`×`size` pixmap.
pub fn rasterize_svg(svg: &str, size: u32) -> ViralizeResult<Pixmap> {
    let tree = resvg::usvg::Tree::from_str(svg, &resvg::usvg::Options::default())
        .map_err(|e| ViralizeError::render(format!("invalid SVG: {e}")))?;
    let mut pixmap = Pixmap::new(size, size)
        .ok_or_else(|| ViralizeError::render("cannot allocate SVG surface"))?;
    let tree_size = tree.size();
    let transform = Transform::from_scale(
        size as f32 / tree_size.width(),
        size as f32 / tree_size.height(),
    );
    resvg::render(&tree, transform, &mut pixmap.as_mut());
    Ok(pixmap)
}

/// Decode an image file into a premultiplied pixmap.
pub fn load_image(path: &Path) -> ViralizeResult<Pixmap> {
    let rgba = image::open(path)
        .map_err(|e| ViralizeError::decode(format!("{}: {e}", path.display())))?
        .to_rgba8();
    rgba_to_pixmap(rgba.width(), rgba.height(), rgba.as_raw())
}

/// Wrap straight-alpha RGBA bytes as a premultiplied pixmap.
pub fn rgba_to_pixmap(width: u32, height: u32, rgba: &[u8]) -> ViralizeResult<Pixmap> {
    let mut pixmap = Pixmap::new(width, height)
        .ok_or_else(|| ViralizeError::render(format!("cannot allocate {width}x{height} image")))?;
    if rgba.len() != pixmap.data().len() {
        return Err(ViralizeError::render("image buffer size mismatch"));
    }
    for (dst, src) in pixmap.pixels_mut().iter_mut().zip(rgba.chunks_exact(4)) {
        *dst = ColorU8::from_rgba(src[0], src[1], src[2], src[3]).premultiply();
    }
    Ok(pixmap)
}

/// Write a pixmap to disk as PNG.
pub fn save_png(pixmap: &Pixmap, path: &Path) -> ViralizeResult<()> {
    let mut rgba = Vec::with_capacity(pixmap.data().len());
    for pixel in pixmap.pixels() {
        let c = pixel.demultiply();
        rgba.extend_from_slice(&[c.red(), c.green(), c.blue(), c.alpha()]);
    }
    let buffer = image::RgbaImage::from_raw(pixmap.width(), pixmap.height(), rgba)
        .ok_or_else(|| ViralizeError::render("image buffer size mismatch"))?;
    buffer
        .save_with_format(path, image::ImageFormat::Png)
        .map_err(|e| ViralizeError::render(format!("{}: {e}", path.display())))
}

fn load_round_avatar(path: &Path, size: u32) -> ViralizeResult<Pixmap> {
    let source = load_image(path)?;
    let mut avatar = Pixmap::new(size, size)
        .ok_or_else(|| ViralizeError::render("cannot allocate avatar surface"))?;
    let r = size as f32 / 2.0;
    let mut mask = Mask::new(size, size)
        .ok_or_else(|| ViralizeError::render("cannot allocate avatar mask"))?;
    if let Some(circle) = PathBuilder::from_circle(r, r, r) {
        mask.fill_path(&circle, FillRule::Winding, true, Transform::identity());
    }

    let transform = Transform::from_scale(
        size as f32 / source.width() as f32,
        size as f32 / source.height() as f32,
    );
    let paint = PixmapPaint {
        quality: FilterQuality::Bilinear,
        ..PixmapPaint::default()
    };
    avatar.draw_pixmap(0, 0, source.as_ref(), &paint, transform, Some(&mask));
    Ok(avatar)
}

fn fill_rect(surface: &mut Pixmap, x: f32, y: f32, w: f32, h: f32, rgb: [u8; 3]) {
    if let Some(rect) = SkRect::from_xywh(x, y, w, h) {
        let mut paint = Paint::default();
        paint.set_color_rgba8(rgb[0], rgb[1], rgb[2], 255);
        surface.fill_rect(rect, &paint, Transform::identity(), None);
    }
}

fn fill_circle(surface: &mut Pixmap, cx: f32, cy: f32, r: f32, rgb: [u8; 3]) {
    if let Some(circle) = PathBuilder::from_circle(cx, cy, r) {
        let mut paint = Paint::default();
        paint.set_color_rgba8(rgb[0], rgb[1], rgb[2], 255);
        paint.anti_alias = true;
        surface.fill_path(&circle, &paint, FillRule::Winding, Transform::identity(), None);
    }
}

/// Solid-colour pixmap, used for synthetic sources and tests.
pub fn solid_pixmap(width: u32, height: u32, rgb: [u8; 3]) -> ViralizeResult<Pixmap> {
    let size = IntSize::from_wh(width, height)
        .ok_or_else(|| ViralizeError::render(format!("invalid size {width}x{height}")))?;
    let mut data = Vec::with_capacity(size.width() as usize * size.height() as usize * 4);
    for _ in 0..(width as usize * height as usize) {
        data.extend_from_slice(&[rgb[0], rgb[1], rgb[2], 255]);
    }
    Pixmap::from_vec(data, size).ok_or_else(|| ViralizeError::render("invalid pixmap buffer"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text::BlockGlyphs;
    use viralize_project_model::{Identity, VideoTransform};

    fn compositor() -> FrameCompositor {
        FrameCompositor::new(Arc::new(BlockGlyphs))
    }

    fn composition(caption: &str) -> CompositionState {
        CompositionState {
            transform: VideoTransform::IDENTITY,
            caption: Some(caption.to_string()),
            identity: Identity::default(),
        }
    }

    fn pixel(p: &Pixmap, x: u32, y: u32) -> (u8, u8, u8) {
        let c = p.pixel(x, y).unwrap();
        (c.red(), c.green(), c.blue())
    }

    #[test]
    fn test_video_fills_region_below_header() {
        let frame = solid_pixmap(1280, 720, [200, 0, 0]).unwrap();
        let mut c = compositor();
        let mut out = Pixmap::new(720, 1280).unwrap();
        let layout = c.draw(&mut out, &composition("short caption"), Some(&frame));

        let below = layout.bar_height.ceil() as u32 + 2;
        for (x, y) in [(5, below), (715, 1279), (360, 900)] {
            let (r, g, b) = pixel(&out, x, y);
            assert!(r >= 195 && g <= 5 && b <= 5, "({x},{y}) = {:?}", (r, g, b));
        }
        // Header stays opaque black above the video.
        assert_eq!(pixel(&out, 700, 10), (0, 0, 0));
        assert!(layout.video_rect.unwrap().w > 720.0);
    }

    #[test]
    fn test_no_frame_leaves_black_background() {
        let mut c = compositor();
        let out = c.render(360, 640, &composition("caption"), None).unwrap();
        assert_eq!(pixel(&out, 180, 630), (0, 0, 0));
    }

    #[test]
    fn test_placeholder_disc_when_no_avatar() {
        let mut c = compositor();
        let out = c.render(720, 1280, &composition("x"), None).unwrap();
        let m = HeaderMetrics::for_canvas(720.0);
        let cx = (m.avatar_x + m.avatar_size / 2.0) as u32;
        let cy = (m.avatar_y + m.avatar_size / 2.0) as u32;
        assert_eq!(pixel(&out, cx, cy), (0x33, 0x33, 0x33));
    }

    #[test]
    fn test_render_is_deterministic() {
        let frame = solid_pixmap(640, 360, [10, 120, 30]).unwrap();
        let mut state = composition("the same caption every time");
        state.transform = VideoTransform::new(12.0, -4.0, 1.6);

        let a = compositor().render(720, 1280, &state, Some(&frame)).unwrap();
        let b = compositor().render(720, 1280, &state, Some(&frame)).unwrap();
        assert_eq!(a.data(), b.data());
    }

    #[test]
    fn test_layout_cache_reused_across_frames() {
        let mut c = compositor();
        let state = composition("caption reused between frames");
        for _ in 0..5 {
            c.render(360, 640, &state, None).unwrap();
        }
        let stats = c.layout_cache().stats();
        assert_eq!(stats.recomputes, 1);
        assert_eq!(stats.hits, 4);
    }

    #[test]
    fn test_badge_rasterizes() {
        let badge = rasterize_svg(VERIFIED_BADGE_SVG, 28).unwrap();
        assert!(badge.pixels().iter().any(|p| p.alpha() > 0));
    }

    #[test]
    fn test_missing_avatar_falls_back() {
        let mut c = compositor();
        let mut state = composition("x");
        state.identity.avatar = Some(PathBuf::from("/nonexistent/avatar.png"));
        let out = c.render(720, 1280, &state, None).unwrap();
        let m = HeaderMetrics::for_canvas(720.0);
        let cx = (m.avatar_x + m.avatar_size / 2.0) as u32;
        let cy = (m.avatar_y + m.avatar_size / 2.0) as u32;
        assert_eq!(pixel(&out, cx, cy), (0x33, 0x33, 0x33));
    }
}
