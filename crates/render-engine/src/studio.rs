//! Studio facade: one source, one composition, one preview, at most one export.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use viralize_common::{ViralizeError, ViralizeResult};
use viralize_processing_core::LayoutCacheStats;
use viralize_project_model::{CompositionState, SourceMedia};

use crate::compositor::FrameCompositor;
use crate::encoder::{AudioDecoder, EncoderBackend};
use crate::export::{export_reel, ExportJob, ExportOutput, ExportSettings, ProgressCallback};
use crate::playback::PlaybackSource;
use crate::preview::{spawn_preview, PreviewHandle, PreviewSink};
use crate::session::RunFlag;
use crate::state::{CompositionEditor, CompositionReader};
use crate::text::TextRenderer;

/// Clears the "export active" flag however the export ends.
struct ActiveExport<'a>(&'a AtomicBool);

impl Drop for ActiveExport<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct ReelStudio<P> {
    source: SourceMedia,
    playback: Arc<Mutex<P>>,
    compositor: Arc<Mutex<FrameCompositor>>,
    reader: CompositionReader,
    backend: Arc<dyn EncoderBackend>,
    audio_decoder: Arc<dyn AudioDecoder>,
    settings: ExportSettings,
    exporting: AtomicBool,
    current_run: std::sync::Mutex<Option<RunFlag>>,
    preview: Mutex<Option<PreviewHandle>>,
}

impl<P: PlaybackSource + 'static> ReelStudio<P> {
    /// Create a studio and the composition editor that alone may change it.
    pub fn new(
        source: SourceMedia,
        mut playback: P,
        text: Arc<dyn TextRenderer>,
        backend: Arc<dyn EncoderBackend>,
        audio_decoder: Arc<dyn AudioDecoder>,
        settings: ExportSettings,
    ) -> (Self, CompositionEditor) {
        playback.set_looping(true);
        playback.play();
        let (editor, reader) = CompositionEditor::new(CompositionState::default());
        let studio = Self {
            source,
            playback: Arc::new(Mutex::new(playback)),
            compositor: Arc::new(Mutex::new(FrameCompositor::new(text))),
            reader,
            backend,
            audio_decoder,
            settings,
            exporting: AtomicBool::new(false),
            current_run: std::sync::Mutex::new(None),
            preview: Mutex::new(None),
        };
        (studio, editor)
    }

    pub fn source(&self) -> &SourceMedia {
        &self.source
    }

    pub fn settings(&self) -> &ExportSettings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: ExportSettings) {
        self.settings = settings;
    }

    pub fn composition(&self) -> CompositionState {
        self.reader.snapshot()
    }

    pub fn is_exporting(&self) -> bool {
        self.exporting.load(Ordering::SeqCst)
    }

    pub async fn is_previewing(&self) -> bool {
        self.preview.lock().await.is_some()
    }

    /// Caption layout cache counters of the shared compositor.
    pub async fn layout_stats(&self) -> LayoutCacheStats {
        self.compositor.lock().await.layout_cache().stats()
    }

    pub async fn start_preview(&self, sink: Box<dyn PreviewSink>) -> ViralizeResult<()> {
        let mut slot = self.preview.lock().await;
        if slot.is_some() {
            return Err(ViralizeError::validation("preview is already running"));
        }
        *slot = Some(spawn_preview(
            Arc::clone(&self.playback),
            self.reader.clone(),
            Arc::clone(&self.compositor),
            sink,
        )?);
        Ok(())
    }

    /// Stop the preview, returning its sink if it was running.
    pub async fn stop_preview(&self) -> Option<Box<dyn PreviewSink>> {
        let handle = self.preview.lock().await.take()?;
        handle.stop().await
    }

    /// Swap in a newly uploaded source. The caption is cleared.
    pub async fn replace_source(&mut self, editor: &mut CompositionEditor, source: SourceMedia, mut playback: P) {
        playback.set_looping(true);
        playback.play();
        *self.playback.lock().await = playback;
        tracing::info!(path = %source.path.display(), "Source replaced");
        self.source = source;
        editor.set_caption(None);
    }

    /// Cancel the running export, if any. An export that has not reached
    /// capture yet stops as soon as it starts.
    pub fn cancel_export(&self) -> bool {
        match self.current_run.lock().ok().and_then(|run| run.clone()) {
            Some(run) => {
                tracing::info!("Export cancellation requested");
                run.cancel();
                true
            }
            None => false,
        }
    }

    /// Export the current composition.
    ///
    /// Fails fast when another export is running or no caption is chosen.
    /// The preview is suspended for the duration and restarted afterwards.
    pub async fn export(&self, progress: Option<ProgressCallback>) -> ViralizeResult<ExportOutput> {
        if self
            .exporting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ViralizeError::validation("an export is already in progress"));
        }
        let _active = ActiveExport(&self.exporting);

        let composition = self.reader.snapshot();
        if !composition.has_caption() {
            return Err(ViralizeError::validation("choose a headline before exporting"));
        }

        let run = RunFlag::new();
        if let Ok(mut current) = self.current_run.lock() {
            *current = Some(run.clone());
        }
        let sink = self.stop_preview().await;

        let job = ExportJob {
            source: self.source.clone(),
            composition,
            settings: self.settings.clone(),
        };
        let result = {
            let mut playback = self.playback.lock().await;
            let mut compositor = self.compositor.lock().await;
            export_reel(
                &job,
                &mut *playback,
                &mut compositor,
                self.backend.as_ref(),
                self.audio_decoder.as_ref(),
                &run,
                progress.as_ref(),
            )
            .await
        };

        if let Ok(mut current) = self.current_run.lock() {
            *current = None;
        }
        if let Some(sink) = sink {
            if let Err(e) = self.start_preview(sink).await {
                tracing::warn!(error = %e, "Failed to restart preview after export");
            }
        }
        result
    }
}
