//! Media playback: a clock-driven source that yields the current video frame.
//!
//! Capture and preview never step through frames themselves; they sample
//! whatever picture the playback clock is showing, the same way a browser
//! video element is sampled from a drawing loop.

use std::time::Duration;

use resvg::tiny_skia::Pixmap;
use tokio::time::Instant;
use viralize_common::{ViralizeError, ViralizeResult};

/// One decoded source picture.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    /// Presentation time in seconds from the start of the source.
    pub pts_secs: f64,
    pub image: Pixmap,
}

/// Sequential frame decoder for one source.
pub trait FrameDecoder: Send {
    fn natural_size(&self) -> (u32, u32);

    /// Total duration, when the container reports one.
    fn duration_secs(&self) -> Option<f64>;

    /// Next frame in presentation order, `None` at end of stream.
    fn next_frame(&mut self) -> ViralizeResult<Option<DecodedFrame>>;

    /// Restart decoding at (or just before) `secs`.
    fn seek(&mut self, secs: f64) -> ViralizeResult<()>;
}

/// A playing video as seen by the drawing loops.
pub trait PlaybackSource: Send {
    /// `None` until metadata is known, or when the source has no finite duration.
    fn duration(&self) -> Option<f64>;
    fn natural_size(&self) -> (u32, u32);
    fn current_time(&self) -> f64;
    fn is_ended(&self) -> bool;
    fn is_paused(&self) -> bool;

    fn play(&mut self);
    fn pause(&mut self);
    fn seek(&mut self, secs: f64) -> ViralizeResult<()>;
    fn set_playback_rate(&mut self, rate: f64);
    fn playback_rate(&self) -> f64;
    fn set_looping(&mut self, looping: bool);

    /// Picture for the current media time, decoding forward as needed.
    fn current_frame(&mut self) -> ViralizeResult<Option<&Pixmap>>;
}

/// Playback clock over a [`FrameDecoder`].
///
/// Media time is `anchor + elapsed * rate` while playing. With looping on,
/// time wraps to zero at the end and the decoder is rewound.
pub struct ClockedPlayback<D> {
    decoder: D,
    duration: Option<f64>,
    anchor_media: f64,
    anchor_wall: Option<Instant>,
    rate: f64,
    looping: bool,
    /// Loop iteration the decoder is positioned in.
    decoded_lap: u64,
    current: Option<DecodedFrame>,
    pending: Option<DecodedFrame>,
    exhausted: bool,
}

impl<D: FrameDecoder> ClockedPlayback<D> {
    pub fn new(decoder: D) -> Self {
        let duration = decoder.duration_secs().filter(|d| d.is_finite() && *d > 0.0);
        Self {
            decoder,
            duration,
            anchor_media: 0.0,
            anchor_wall: None,
            rate: 1.0,
            looping: true,
            decoded_lap: 0,
            current: None,
            pending: None,
            exhausted: false,
        }
    }

    pub fn decoder(&self) -> &D {
        &self.decoder
    }

    /// Unwrapped media time: keeps growing across loop iterations.
    fn raw_time(&self) -> f64 {
        match self.anchor_wall {
            Some(wall) => self.anchor_media + wall.elapsed().as_secs_f64() * self.rate,
            None => self.anchor_media,
        }
    }

    fn lap_and_time(&self) -> (u64, f64) {
        let raw = self.raw_time();
        match self.duration {
            Some(d) if self.looping && raw >= d => {
                let lap = (raw / d).floor();
                (lap as u64, raw - lap * d)
            }
            Some(d) => (0, raw.min(d)),
            None => (0, raw),
        }
    }

    /// Fold the running clock into the anchor.
    fn rebase(&mut self) {
        let (_, t) = self.lap_and_time();
        self.anchor_media = t;
        if self.anchor_wall.is_some() {
            self.anchor_wall = Some(Instant::now());
        }
    }

    fn rewind_decoder(&mut self, secs: f64) -> ViralizeResult<()> {
        self.decoder.seek(secs)?;
        self.current = None;
        self.pending = None;
        self.exhausted = false;
        Ok(())
    }
}

impl<D: FrameDecoder> PlaybackSource for ClockedPlayback<D> {
    fn duration(&self) -> Option<f64> {
        self.duration
    }

    fn natural_size(&self) -> (u32, u32) {
        self.decoder.natural_size()
    }

    fn current_time(&self) -> f64 {
        self.lap_and_time().1
    }

    fn is_ended(&self) -> bool {
        !self.looping && self.duration.is_some_and(|d| self.raw_time() >= d)
    }

    fn is_paused(&self) -> bool {
        self.anchor_wall.is_none()
    }

    fn play(&mut self) {
        if self.is_ended() {
            self.anchor_media = 0.0;
            if let Err(e) = self.rewind_decoder(0.0) {
                tracing::warn!(error = %e, "Failed to rewind decoder on replay");
            }
        } else {
            self.anchor_media = self.current_time();
        }
        self.anchor_wall = Some(Instant::now());
        self.decoded_lap = 0;
    }

    fn pause(&mut self) {
        if self.anchor_wall.is_some() {
            self.anchor_media = self.current_time();
            self.anchor_wall = None;
            self.decoded_lap = 0;
        }
    }

    fn seek(&mut self, secs: f64) -> ViralizeResult<()> {
        if !secs.is_finite() || secs < 0.0 {
            return Err(ViralizeError::playback(format!("invalid seek target {secs}")));
        }
        let target = self.duration.map_or(secs, |d| secs.min(d));
        self.anchor_media = target;
        self.decoded_lap = 0;
        if self.anchor_wall.is_some() {
            self.anchor_wall = Some(Instant::now());
        }
        self.rewind_decoder(target)
    }

    fn set_playback_rate(&mut self, rate: f64) {
        if rate.is_finite() && rate > 0.0 {
            self.rebase();
            self.decoded_lap = 0;
            self.rate = rate;
        }
    }

    fn playback_rate(&self) -> f64 {
        self.rate
    }

    fn set_looping(&mut self, looping: bool) {
        self.rebase();
        self.decoded_lap = 0;
        self.looping = looping;
    }

    fn current_frame(&mut self) -> ViralizeResult<Option<&Pixmap>> {
        let (lap, t) = self.lap_and_time();
        if lap != self.decoded_lap {
            tracing::trace!(lap, "Playback looped, rewinding decoder");
            self.rewind_decoder(0.0)?;
            self.decoded_lap = lap;
        }

        // A frame is shown from its pts until the next frame's pts.
        if self.current.as_ref().is_some_and(|f| f.pts_secs > t + 1e-6) {
            self.rewind_decoder(t)?;
        }
        loop {
            if self.pending.is_none() && !self.exhausted {
                self.pending = self.decoder.next_frame()?;
                self.exhausted = self.pending.is_none();
            }
            match self.pending.take() {
                Some(next) if self.current.is_none() || next.pts_secs <= t + 1e-6 => {
                    self.current = Some(next);
                }
                other => {
                    self.pending = other;
                    break;
                }
            }
        }

        Ok(self.current.as_ref().map(|f| &f.image))
    }
}

/// Wait until `playback` reports a usable duration.
///
/// Fails with a validation error when metadata never arrives within
/// `timeout`, mirroring a source whose length cannot be determined.
pub async fn wait_for_metadata<P: PlaybackSource + ?Sized>(
    playback: &mut P,
    timeout: Duration,
) -> ViralizeResult<f64> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(d) = playback.duration().filter(|d| d.is_finite() && *d > 0.0) {
            return Ok(d);
        }
        if Instant::now() >= deadline {
            return Err(ViralizeError::validation(
                "could not determine the video duration",
            ));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
