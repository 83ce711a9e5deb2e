//! Interactive preview loop.
//!
//! Redraws the composition at a small fixed size once per display tick,
//! whether or not anything changed. The loop runs only while no export is
//! active; [`PreviewHandle::stop`] ends it and hands the sink back.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use resvg::tiny_skia::Pixmap;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use viralize_common::{ViralizeError, ViralizeResult};

use crate::capture::DISPLAY_TICK;
use crate::compositor::FrameCompositor;
use crate::playback::PlaybackSource;
use crate::state::CompositionReader;

pub const PREVIEW_WIDTH: u32 = 360;
pub const PREVIEW_HEIGHT: u32 = 640;

/// Receives every preview frame.
pub trait PreviewSink: Send + 'static {
    fn present(&mut self, frame: &Pixmap);
}

/// Keeps a copy of the most recent frame.
#[derive(Debug, Clone, Default)]
pub struct LatestFrame {
    frame: Arc<std::sync::Mutex<Option<Pixmap>>>,
}

impl LatestFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> Option<Pixmap> {
        self.frame.lock().ok().and_then(|f| f.clone())
    }
}

impl PreviewSink for LatestFrame {
    fn present(&mut self, frame: &Pixmap) {
        if let Ok(mut slot) = self.frame.lock() {
            match slot.as_mut() {
                Some(existing) if existing.width() == frame.width() && existing.height() == frame.height() => {
                    existing.data_mut().copy_from_slice(frame.data());
                }
                _ => *slot = Some(frame.clone()),
            }
        }
    }
}

/// A running preview loop.
pub struct PreviewHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<Box<dyn PreviewSink>>,
    frames: Arc<AtomicU64>,
}

impl PreviewHandle {
    /// Frames presented so far.
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Stop scheduling redraws and return the sink.
    pub async fn stop(mut self) -> Option<Box<dyn PreviewSink>> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        match (&mut self.task).await {
            Ok(sink) => {
                tracing::debug!(frames = self.frames(), "Preview stopped");
                Some(sink)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Preview task ended abnormally");
                None
            }
        }
    }
}

/// Start the preview loop on the current runtime.
pub fn spawn_preview<P>(
    playback: Arc<Mutex<P>>,
    reader: CompositionReader,
    compositor: Arc<Mutex<FrameCompositor>>,
    mut sink: Box<dyn PreviewSink>,
) -> ViralizeResult<PreviewHandle>
where
    P: PlaybackSource + 'static,
{
    let mut surface = Pixmap::new(PREVIEW_WIDTH, PREVIEW_HEIGHT)
        .ok_or_else(|| ViralizeError::render("cannot allocate preview surface"))?;
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let frames = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&frames);

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(DISPLAY_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::debug!(width = PREVIEW_WIDTH, height = PREVIEW_HEIGHT, "Preview started");

        loop {
            tokio::select! {
                biased;
                _ = &mut stop_rx => break,
                _ = ticker.tick() => {}
            }

            let state = reader.snapshot();
            {
                let mut playback = playback.lock().await;
                let mut compositor = compositor.lock().await;
                let frame = match playback.current_frame() {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!(error = %e, "Preview frame unavailable");
                        None
                    }
                };
                compositor.draw(&mut surface, &state, frame);
            }
            sink.present(&surface);
            counter.fetch_add(1, Ordering::Relaxed);
        }
        sink
    });

    Ok(PreviewHandle {
        stop: Some(stop_tx),
        task,
        frames,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::ClockedPlayback;
    use crate::state::CompositionEditor;
    use crate::synthetic::SyntheticVideo;
    use crate::text::BlockGlyphs;
    use std::time::Duration;
    use viralize_project_model::CompositionState;

    #[tokio::test(start_paused = true)]
    async fn test_preview_redraws_each_tick_and_tracks_state() {
        let mut playback = ClockedPlayback::new(SyntheticVideo::new(320, 240, 30.0, Some(10.0)));
        playback.play();
        let playback = Arc::new(Mutex::new(playback));
        let compositor = Arc::new(Mutex::new(FrameCompositor::new(Arc::new(BlockGlyphs))));
        let (mut editor, reader) = CompositionEditor::new(CompositionState::default());
        let latest = LatestFrame::new();

        let handle = spawn_preview(
            Arc::clone(&playback),
            reader,
            Arc::clone(&compositor),
            Box::new(latest.clone()),
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        editor.set_caption(Some("A much longer caption that wraps onto several lines".into()));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let frames = handle.frames();
        assert!(frames >= 10, "only {frames} preview frames");
        assert!(handle.stop().await.is_some());

        let frame = latest.latest().unwrap();
        assert_eq!((frame.width(), frame.height()), (PREVIEW_WIDTH, PREVIEW_HEIGHT));
        let stats = compositor.lock().await.layout_cache().stats();
        assert!(stats.hits > 0);
        assert_eq!(stats.recomputes, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_preview_draws_nothing_more() {
        let playback = Arc::new(Mutex::new(ClockedPlayback::new(SyntheticVideo::new(
            64, 64, 30.0, Some(1.0),
        ))));
        let compositor = Arc::new(Mutex::new(FrameCompositor::new(Arc::new(BlockGlyphs))));
        let (_editor, reader) = CompositionEditor::new(CompositionState::default());
        let handle = spawn_preview(playback, reader, compositor, Box::new(LatestFrame::new())).unwrap();
        let frames = Arc::clone(&handle.frames);

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.stop().await;
        let after_stop = frames.load(Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(frames.load(Ordering::Relaxed), after_stop);
    }
}
