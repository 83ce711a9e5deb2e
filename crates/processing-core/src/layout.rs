//! Caption layout: greedy word wrapping with a single-slot cache.
//!
//! Measuring text is the expensive part of compositing a frame, and the
//! caption rarely changes between frames. The cache keeps exactly one
//! result, keyed by caption text and canvas width.

use viralize_project_model::{CompositionState, HeaderMetrics};

/// Something that can report the rendered width of a string.
pub trait TextMeasure {
    fn measure(&self, text: &str) -> f32;
}

impl<F> TextMeasure for F
where
    F: Fn(&str) -> f32,
{
    fn measure(&self, text: &str) -> f32 {
        self(text)
    }
}

/// Wrap `text` into lines no wider than `max_width`.
///
/// Words are separated by single spaces and never broken, so a word wider
/// than `max_width` gets a line of its own. The last line is always emitted,
/// which means empty input yields one empty line.
pub fn wrap_lines<M: TextMeasure + ?Sized>(text: &str, max_width: f32, measure: &M) -> Vec<String> {
    let mut lines = Vec::new();
    let mut line = String::new();

    for (n, word) in text.split(' ').enumerate() {
        let candidate = format!("{line}{word} ");
        if n > 0 && measure.measure(&candidate) > max_width {
            lines.push(finish_line(&line));
            line = format!("{word} ");
        } else {
            line = candidate;
        }
    }
    lines.push(finish_line(&line));

    lines
}

fn finish_line(line: &str) -> String {
    line.strip_suffix(' ').unwrap_or(line).to_string()
}

#[derive(Debug, Clone)]
struct CachedLayout {
    text: String,
    canvas_width: u32,
    lines: Vec<String>,
}

/// Hit/miss counters for a [`LayoutCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LayoutCacheStats {
    pub hits: u64,
    pub recomputes: u64,
}

/// Single-slot memo of the last wrapped caption.
#[derive(Debug, Clone, Default)]
pub struct LayoutCache {
    slot: Option<CachedLayout>,
    stats: LayoutCacheStats,
}

impl LayoutCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrapped lines for `text` on a canvas `canvas_width` pixels wide.
    ///
    /// Reuses the cached lines only when both text and canvas width match the
    /// previous call; otherwise wraps again and replaces the slot.
    pub fn lines_for<M: TextMeasure + ?Sized>(
        &mut self,
        text: &str,
        canvas_width: u32,
        max_width: f32,
        measure: &M,
    ) -> &[String] {
        let hit = self
            .slot
            .as_ref()
            .is_some_and(|c| c.canvas_width == canvas_width && c.text == text);

        if hit {
            self.stats.hits += 1;
        } else {
            self.stats.recomputes += 1;
            tracing::trace!(canvas_width, chars = text.len(), "Recomputing caption layout");
            self.slot = Some(CachedLayout {
                text: text.to_string(),
                canvas_width,
                lines: wrap_lines(text, max_width, measure),
            });
        }

        self.slot.as_ref().map(|c| c.lines.as_slice()).unwrap_or(&[])
    }

    /// Wrapped caption of `composition` for the canvas described by `metrics`.
    pub fn caption_lines<M: TextMeasure + ?Sized>(
        &mut self,
        composition: &CompositionState,
        metrics: &HeaderMetrics,
        measure: &M,
    ) -> &[String] {
        self.lines_for(
            composition.caption_text(),
            metrics.canvas_width.round() as u32,
            metrics.max_text_width,
            measure,
        )
    }

    pub fn stats(&self) -> LayoutCacheStats {
        self.stats
    }

    /// Drop the cached entry.
    pub fn invalidate(&mut self) {
        self.slot = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn mono(text: &str) -> f32 {
        text.chars().count() as f32 * 10.0
    }

    #[test]
    fn test_wrap_breaks_on_overflow() {
        let lines = wrap_lines("aaa bbb ccc ddd", 80.0, &mono);
        assert_eq!(lines, vec!["aaa bbb", "ccc ddd"]);
    }

    #[test]
    fn test_long_word_gets_own_line() {
        let lines = wrap_lines("a supercalifragilistic b", 60.0, &mono);
        assert_eq!(lines, vec!["a", "supercalifragilistic", "b"]);
    }

    #[test]
    fn test_first_word_never_breaks() {
        let lines = wrap_lines("enormous", 10.0, &mono);
        assert_eq!(lines, vec!["enormous"]);
    }

    #[test]
    fn test_empty_text_yields_single_empty_line() {
        assert_eq!(wrap_lines("", 100.0, &mono), vec![String::new()]);
    }

    #[test]
    fn test_cache_reuses_on_identical_key() {
        let mut cache = LayoutCache::new();
        cache.lines_for("hello world", 720, 620.0, &mono);
        cache.lines_for("hello world", 720, 620.0, &mono);
        assert_eq!(cache.stats(), LayoutCacheStats { hits: 1, recomputes: 1 });
    }

    #[test]
    fn test_cache_recomputes_when_text_changes_at_same_width() {
        let mut cache = LayoutCache::new();
        let first = cache.lines_for("one two three", 360, 60.0, &mono).to_vec();
        let second = cache.lines_for("four five", 360, 60.0, &mono).to_vec();
        assert_eq!(cache.stats().recomputes, 2);
        assert_eq!(cache.stats().hits, 0);
        assert_ne!(first, second);
        assert_eq!(second, vec!["four", "five"]);
    }

    #[test]
    fn test_cache_recomputes_when_width_changes() {
        let mut cache = LayoutCache::new();
        cache.lines_for("same text", 360, 300.0, &mono);
        cache.lines_for("same text", 720, 600.0, &mono);
        assert_eq!(cache.stats().recomputes, 2);

        cache.invalidate();
        cache.lines_for("same text", 720, 600.0, &mono);
        assert_eq!(cache.stats().recomputes, 3);
    }

    proptest! {
        #[test]
        fn prop_lines_fit_unless_single_word(
            text in "[a-z]{1,14}( [a-z]{1,14}){0,40}",
            max_width in 20.0f32..400.0,
        ) {
            let lines = wrap_lines(&text, max_width, &mono);
            for line in &lines {
                let single_word = !line.contains(' ');
                prop_assert!(single_word || mono(line) <= max_width, "{line:?} exceeds {max_width}");
            }
            prop_assert_eq!(lines.join(" "), text);
        }
    }
}
