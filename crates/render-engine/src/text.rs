//! Text measurement and rasterisation onto tiny-skia surfaces.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use fontdue::{Font, FontSettings};
use resvg::tiny_skia::{ColorU8, Paint, Pixmap, PremultipliedColorU8, Rect, Transform};
use viralize_common::{RenderDefaults, ViralizeError, ViralizeResult};

/// Font weight used by the reel header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FontWeight {
    Regular,
    Bold,
}

/// Draws single lines of text with a top baseline.
///
/// `y` is the top of the em box, so a line drawn at `y` with size `s`
/// occupies roughly `[y, y + s]`.
pub trait TextRenderer: Send + Sync {
    fn measure(&self, text: &str, size: f32, weight: FontWeight) -> f32;

    #[allow(clippy::too_many_arguments)]
    fn draw(
        &self,
        surface: &mut Pixmap,
        text: &str,
        x: f32,
        y: f32,
        size: f32,
        weight: FontWeight,
        color: ColorU8,
    );

    fn name(&self) -> &str;
}

/// Well-known font locations tried when none is configured.
const SYSTEM_FONT_CANDIDATES: &[(&str, &str)] = &[
    (
        "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
        "/usr/share/fonts/truetype/dejavu/DejaVuSans-Bold.ttf",
    ),
    (
        "/usr/share/fonts/dejavu/DejaVuSans.ttf",
        "/usr/share/fonts/dejavu/DejaVuSans-Bold.ttf",
    ),
    (
        "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
        "/usr/share/fonts/truetype/liberation/LiberationSans-Bold.ttf",
    ),
    (
        "/usr/share/fonts/liberation-sans/LiberationSans-Regular.ttf",
        "/usr/share/fonts/liberation-sans/LiberationSans-Bold.ttf",
    ),
    (
        "/System/Library/Fonts/Supplemental/Arial.ttf",
        "/System/Library/Fonts/Supplemental/Arial Bold.ttf",
    ),
    ("C:\\Windows\\Fonts\\arial.ttf", "C:\\Windows\\Fonts\\arialbd.ttf"),
];

/// Pick a text renderer from configuration.
///
/// Configured fonts win, then well-known system fonts, then the built-in
/// block glyphs.
pub fn text_renderer_from_config(render: &RenderDefaults) -> Arc<dyn TextRenderer> {
    if let Some(regular) = &render.font_regular {
        match FontdueText::from_files(regular, render.font_bold.as_deref()) {
            Ok(text) => return Arc::new(text),
            Err(e) => tracing::warn!(error = %e, "Configured font unusable, falling back"),
        }
    }

    if let Some(text) = FontdueText::discover() {
        return Arc::new(text);
    }

    tracing::warn!("No usable font found; captions will render as block glyphs");
    Arc::new(BlockGlyphs)
}

/// TrueType/OpenType rasteriser backed by fontdue.
pub struct FontdueText {
    regular: Font,
    bold: Option<Font>,
    label: String,
}

impl FontdueText {
    pub fn from_bytes(regular: &[u8], bold: Option<&[u8]>) -> ViralizeResult<Self> {
        let regular = Font::from_bytes(regular, FontSettings::default())
            .map_err(|e| ViralizeError::render(format!("invalid font: {e}")))?;
        let bold = bold
            .map(|b| Font::from_bytes(b, FontSettings::default()))
            .transpose()
            .map_err(|e| ViralizeError::render(format!("invalid bold font: {e}")))?;
        Ok(Self {
            regular,
            bold,
            label: "fontdue".to_string(),
        })
    }

    pub fn from_files(regular: &Path, bold: Option<&Path>) -> ViralizeResult<Self> {
        let regular_bytes = read_font(regular)?;
        let bold_bytes = bold.map(read_font).transpose()?;
        let mut text = Self::from_bytes(&regular_bytes, bold_bytes.as_deref())?;
        text.label = format!("fontdue:{}", regular.display());
        Ok(text)
    }

    /// Load the first installed font from [`SYSTEM_FONT_CANDIDATES`].
    pub fn discover() -> Option<Self> {
        SYSTEM_FONT_CANDIDATES.iter().find_map(|(regular, bold)| {
            let regular = PathBuf::from(regular);
            if !regular.exists() {
                return None;
            }
            let bold = PathBuf::from(bold);
            let bold = bold.exists().then_some(bold);
            match Self::from_files(&regular, bold.as_deref()) {
                Ok(text) => {
                    tracing::debug!(font = %regular.display(), "Using system font");
                    Some(text)
                }
                Err(e) => {
                    tracing::debug!(font = %regular.display(), error = %e, "Skipping system font");
                    None
                }
            }
        })
    }

    fn face(&self, weight: FontWeight) -> (&Font, bool) {
        match (weight, &self.bold) {
            (FontWeight::Bold, Some(bold)) => (bold, false),
            (FontWeight::Bold, None) => (&self.regular, true),
            (FontWeight::Regular, _) => (&self.regular, false),
        }
    }
}

fn read_font(path: &Path) -> ViralizeResult<Vec<u8>> {
    std::fs::read(path).map_err(|_| ViralizeError::FileNotFound {
        path: path.to_path_buf(),
    })
}

/// Horizontal offset used to embolden a regular face.
fn faux_bold_offset(size: f32) -> f32 {
    (size / 24.0).max(1.0)
}

impl TextRenderer for FontdueText {
    fn measure(&self, text: &str, size: f32, weight: FontWeight) -> f32 {
        let (font, faux_bold) = self.face(weight);
        let width: f32 = text
            .chars()
            .map(|ch| font.metrics(ch, size).advance_width)
            .sum();
        if faux_bold && !text.is_empty() {
            width + faux_bold_offset(size)
        } else {
            width
        }
    }

    fn draw(
        &self,
        surface: &mut Pixmap,
        text: &str,
        x: f32,
        y: f32,
        size: f32,
        weight: FontWeight,
        color: ColorU8,
    ) {
        let (font, faux_bold) = self.face(weight);
        let ascent = font
            .horizontal_line_metrics(size)
            .map(|m| m.ascent)
            .unwrap_or(size * 0.8);
        let baseline = (y + ascent).round() as i32;
        let color = color.premultiply();

        let passes: &[f32] = if faux_bold {
            &[0.0, faux_bold_offset(size)]
        } else {
            &[0.0]
        };

        for dx in passes {
            let mut pen_x = x + dx;
            for ch in text.chars() {
                let (metrics, bitmap) = font.rasterize(ch, size);
                let left = pen_x.round() as i32 + metrics.xmin;
                let top = baseline - (metrics.height as i32 + metrics.ymin);
                blit_coverage(surface, left, top, metrics.width, metrics.height, &bitmap, color);
                pen_x += metrics.advance_width;
            }
        }
    }

    fn name(&self) -> &str {
        &self.label
    }
}

/// Blend an 8-bit coverage mask onto `surface` in `color` (source-over).
fn blit_coverage(
    surface: &mut Pixmap,
    left: i32,
    top: i32,
    width: usize,
    height: usize,
    coverage: &[u8],
    color: PremultipliedColorU8,
) {
    let surface_w = surface.width() as i32;
    let surface_h = surface.height() as i32;
    let pixels = surface.pixels_mut();

    for gy in 0..height {
        let py = top + gy as i32;
        if py < 0 || py >= surface_h {
            continue;
        }
        for gx in 0..width {
            let px = left + gx as i32;
            if px < 0 || px >= surface_w {
                continue;
            }
            let c = coverage[gy * width + gx] as u32;
            if c == 0 {
                continue;
            }
            let idx = (py * surface_w + px) as usize;
            pixels[idx] = blend_over(pixels[idx], color, c);
        }
    }
}

fn blend_over(dst: PremultipliedColorU8, src: PremultipliedColorU8, coverage: u32) -> PremultipliedColorU8 {
    let scale = |v: u8, f: u32| (v as u32 * f + 127) / 255;
    let sa = scale(src.alpha(), coverage);
    let inv = 255 - sa;
    let r = scale(src.red(), coverage) + scale(dst.red(), inv);
    let g = scale(src.green(), coverage) + scale(dst.green(), inv);
    let b = scale(src.blue(), coverage) + scale(dst.blue(), inv);
    let a = sa + scale(dst.alpha(), inv);
    PremultipliedColorU8::from_rgba(
        r.min(255) as u8,
        g.min(255) as u8,
        b.min(255) as u8,
        a.min(255) as u8,
    )
    .unwrap_or(dst)
}

/// Font-free fallback: every visible character is a solid block.
///
/// Metrics are proportional to the size so layout behaves like a real
/// font, and output is identical on every machine.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockGlyphs;

impl BlockGlyphs {
    fn advance(ch: char, size: f32, weight: FontWeight) -> f32 {
        let base = if ch.is_whitespace() { 0.3 } else { 0.55 };
        let bold = if weight == FontWeight::Bold { 0.05 } else { 0.0 };
        size * (base + bold)
    }
}

impl TextRenderer for BlockGlyphs {
    fn measure(&self, text: &str, size: f32, weight: FontWeight) -> f32 {
        text.chars().map(|ch| Self::advance(ch, size, weight)).sum()
    }

    fn draw(
        &self,
        surface: &mut Pixmap,
        text: &str,
        x: f32,
        y: f32,
        size: f32,
        weight: FontWeight,
        color: ColorU8,
    ) {
        let mut paint = Paint::default();
        paint.set_color_rgba8(color.red(), color.green(), color.blue(), color.alpha());
        paint.anti_alias = false;

        let mut pen_x = x;
        for ch in text.chars() {
            let advance = Self::advance(ch, size, weight);
            if !ch.is_whitespace() {
                let glyph_h = if ch.is_uppercase() || ch.is_ascii_digit() { 0.72 } else { 0.55 };
                let top = y + size * (0.9 - glyph_h);
                if let Some(rect) = Rect::from_xywh(pen_x.round(), top.round(), (advance * 0.8).round().max(1.0), (size * glyph_h).round().max(1.0)) {
                    surface.fill_rect(rect, &paint, Transform::identity(), None);
                }
            }
            pen_x += advance;
        }
    }

    fn name(&self) -> &str {
        "block-glyphs"
    }
}
